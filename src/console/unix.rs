//! Terminal input queue on Unix.
//!
//! The closest thing a Unix terminal has to a console input buffer is the
//! tty input queue, which `TIOCSTI` appends to. Terminals carry no key-up
//! events, so a release is counted as written once its press was.
//!
//! Newer Linux kernels can disable `TIOCSTI` (`dev.tty.legacy_tiocsti=0`);
//! the ioctl then fails with `EIO` and the caller sees `written == 0`.

use std::io;
use std::os::fd::RawFd;

use super::{ConsoleDevice, KeyEvent};

pub struct TerminalInput {
    fd: RawFd,
}

impl TerminalInput {
    pub fn stdin() -> Self {
        Self {
            fd: libc::STDIN_FILENO,
        }
    }

    fn push_byte(&self, byte: u8) -> io::Result<()> {
        // SAFETY: TIOCSTI reads a single byte through the pointer, which is
        // valid for the duration of the call.
        let rc = unsafe { libc::ioctl(self.fd, libc::TIOCSTI, &byte as *const u8) };
        if rc == -1 {
            Err(io::Error::last_os_error())
        } else {
            Ok(())
        }
    }
}

impl ConsoleDevice for TerminalInput {
    fn console_mode(&self) -> io::Result<u32> {
        // SAFETY: termios is plain old data and tcgetattr fully initializes it
        // on success; on failure we never read it.
        let mut termios: libc::termios = unsafe { std::mem::zeroed() };
        let rc = unsafe { libc::tcgetattr(self.fd, &mut termios) };
        if rc == -1 {
            return Err(io::Error::last_os_error());
        }
        Ok(termios.c_lflag as u32)
    }

    fn write_key_events(&self, events: &[KeyEvent]) -> io::Result<usize> {
        let mut written = 0;
        let mut last_press_ok = false;
        for event in events {
            if event.key_down {
                let byte = event.key.char_code() as u8;
                match self.push_byte(byte) {
                    Ok(()) => {
                        last_press_ok = true;
                        written += 1;
                    }
                    Err(e) if written == 0 => return Err(e),
                    Err(_) => break,
                }
            } else if last_press_ok {
                written += 1;
                last_press_ok = false;
            }
        }
        Ok(written)
    }
}
