//! Synthetic keystrokes into a console's input buffer.
//!
//! A child that inherits our console reads its keyboard input from the same
//! buffer we can write to. Appending a key press there is indistinguishable,
//! for the child, from a user typing it. This only works when standard input
//! is a real console device: once input is redirected to a pipe or file the
//! mode query fails and injection is impossible.
//!
//! [`ConsoleInput`] is the one resource object standing for that buffer. It
//! is created explicitly and handed to the supervisor for a single child
//! invocation; nothing here is reachable through global state.

#[cfg(unix)]
mod unix;
#[cfg(windows)]
mod win32;

use std::io;

use tracing::{debug, warn};

/// Virtual key codes we know how to inject.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VirtualKey {
    Enter,
}

impl VirtualKey {
    /// Windows virtual-key code.
    pub fn code(self) -> u16 {
        match self {
            VirtualKey::Enter => 0x0D,
        }
    }

    /// Character the key produces on a terminal.
    pub fn char_code(self) -> u16 {
        match self {
            VirtualKey::Enter => u16::from(b'\r'),
        }
    }
}

/// One half of a keystroke.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KeyEvent {
    pub key: VirtualKey,
    pub key_down: bool,
}

impl KeyEvent {
    /// The press/release pair for a single logical keystroke.
    pub fn stroke(key: VirtualKey) -> [KeyEvent; 2] {
        [
            KeyEvent {
                key,
                key_down: true,
            },
            KeyEvent {
                key,
                key_down: false,
            },
        ]
    }
}

/// Raw access to a console input buffer.
///
/// Implemented per platform; tests substitute their own device.
pub trait ConsoleDevice: Send + Sync {
    /// Query the console mode. Fails when the handle is not a console.
    fn console_mode(&self) -> io::Result<u32>;

    /// Append all `events` to the input buffer in one write.
    ///
    /// Returns how many events the OS reports as written.
    fn write_key_events(&self, events: &[KeyEvent]) -> io::Result<usize>;
}

/// Events requested vs. events the OS accepted for one keystroke.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InjectionCount {
    pub requested: usize,
    pub written: usize,
}

impl InjectionCount {
    pub fn is_complete(&self) -> bool {
        self.written == self.requested
    }
}

/// The input buffer of one console, owned for one child invocation.
pub struct ConsoleInput {
    device: Box<dyn ConsoleDevice>,
}

impl std::fmt::Debug for ConsoleInput {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConsoleInput").finish_non_exhaustive()
    }
}

impl ConsoleInput {
    /// The console attached to this process's standard input.
    ///
    /// Children launched without stdio redirection share this buffer.
    pub fn inherited() -> Self {
        #[cfg(unix)]
        let device: Box<dyn ConsoleDevice> = Box::new(unix::TerminalInput::stdin());
        #[cfg(windows)]
        let device: Box<dyn ConsoleDevice> = Box::new(win32::ConsoleBuffer::stdin());
        #[cfg(not(any(unix, windows)))]
        let device: Box<dyn ConsoleDevice> = Box::new(NoConsole);

        Self { device }
    }

    pub fn with_device(device: impl ConsoleDevice + 'static) -> Self {
        Self {
            device: Box::new(device),
        }
    }

    /// Whether standard input is a real console we can inject into.
    pub fn is_available(&self) -> bool {
        match self.device.console_mode() {
            Ok(mode) => {
                debug!(mode, "console input buffer available");
                true
            }
            Err(e) => {
                debug!(error = %e, "console mode query failed; input is redirected");
                false
            }
        }
    }

    /// Append one key-down and one key-up event for `key`.
    ///
    /// Never fails hard: OS errors show up as `written < requested`.
    pub fn send_key(&self, key: VirtualKey) -> InjectionCount {
        let events = KeyEvent::stroke(key);
        let requested = events.len();
        let written = match self.device.write_key_events(&events) {
            Ok(n) => n.min(requested),
            Err(e) => {
                warn!(error = %e, ?key, "console input write failed");
                0
            }
        };
        if written != requested {
            warn!(written, requested, ?key, "partial console input write");
        }
        InjectionCount { requested, written }
    }
}

#[cfg(not(any(unix, windows)))]
struct NoConsole;

#[cfg(not(any(unix, windows)))]
impl ConsoleDevice for NoConsole {
    fn console_mode(&self) -> io::Result<u32> {
        Err(io::Error::new(
            io::ErrorKind::Unsupported,
            "no console support on this platform",
        ))
    }

    fn write_key_events(&self, _events: &[KeyEvent]) -> io::Result<usize> {
        Ok(0)
    }
}


#[cfg(test)]
mod tests {
    use super::testing::FakeConsole;
    use super::*;

    #[test]
    fn stroke_is_press_then_release() {
        let [down, up] = KeyEvent::stroke(VirtualKey::Enter);
        assert!(down.key_down);
        assert!(!up.key_down);
        assert_eq!(down.key, VirtualKey::Enter);
        assert_eq!(up.key, VirtualKey::Enter);
    }

    #[test]
    fn enter_key_codes() {
        assert_eq!(VirtualKey::Enter.code(), 0x0D);
        assert_eq!(VirtualKey::Enter.char_code(), 13);
    }

    #[test]
    fn send_key_writes_exactly_one_pair() {
        let fake = FakeConsole::default();
        let console = ConsoleInput::with_device(fake.clone());

        let count = console.send_key(VirtualKey::Enter);
        assert_eq!(count, InjectionCount { requested: 2, written: 2 });
        assert!(count.is_complete());
        assert_eq!(fake.events(), KeyEvent::stroke(VirtualKey::Enter).to_vec());
    }

    #[test]
    fn failed_write_is_reported_as_count_not_error() {
        let fake = FakeConsole {
            fail_writes: true,
            ..FakeConsole::default()
        };
        let console = ConsoleInput::with_device(fake.clone());

        let count = console.send_key(VirtualKey::Enter);
        assert_eq!(count.written, 0);
        assert_eq!(count.requested, 2);
        assert!(!count.is_complete());
        assert!(fake.events().is_empty());
    }

    #[test]
    fn redirected_input_is_unavailable() {
        let console = ConsoleInput::with_device(FakeConsole::redirected());
        assert!(!console.is_available());

        let console = ConsoleInput::with_device(FakeConsole::default());
        assert!(console.is_available());
    }
}
