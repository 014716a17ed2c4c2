//! Console input buffer on Windows.

use std::io;

use windows::Win32::Foundation::{BOOL, HANDLE};
use windows::Win32::System::Console::{
    CONSOLE_MODE, GetConsoleMode, GetStdHandle, INPUT_RECORD, INPUT_RECORD_0, KEY_EVENT,
    KEY_EVENT_RECORD, KEY_EVENT_RECORD_0, STD_INPUT_HANDLE, WriteConsoleInputW,
};

use super::{ConsoleDevice, KeyEvent};

pub struct ConsoleBuffer {
    handle: Option<HANDLE>,
}

// SAFETY: a console HANDLE is an opaque kernel object reference usable from
// any thread; we never close it (it belongs to the process's std handles).
unsafe impl Send for ConsoleBuffer {}
unsafe impl Sync for ConsoleBuffer {}

impl ConsoleBuffer {
    pub fn stdin() -> Self {
        // SAFETY: GetStdHandle has no preconditions.
        let handle = unsafe { GetStdHandle(STD_INPUT_HANDLE) }.ok();
        Self { handle }
    }

    fn handle(&self) -> io::Result<HANDLE> {
        self.handle
            .filter(|h| !h.is_invalid())
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, "no standard input handle"))
    }
}

fn key_record(event: &KeyEvent) -> INPUT_RECORD {
    INPUT_RECORD {
        EventType: KEY_EVENT as u16,
        Event: INPUT_RECORD_0 {
            KeyEvent: KEY_EVENT_RECORD {
                bKeyDown: BOOL::from(event.key_down),
                wRepeatCount: 1,
                wVirtualKeyCode: event.key.code(),
                wVirtualScanCode: 0,
                uChar: KEY_EVENT_RECORD_0 {
                    UnicodeChar: event.key.char_code(),
                },
                dwControlKeyState: 0,
            },
        },
    }
}

impl ConsoleDevice for ConsoleBuffer {
    fn console_mode(&self) -> io::Result<u32> {
        let handle = self.handle()?;
        let mut mode = CONSOLE_MODE(0);
        // SAFETY: `mode` is a valid out-pointer for the duration of the call.
        unsafe { GetConsoleMode(handle, &mut mode) }.map_err(io::Error::from)?;
        Ok(mode.0)
    }

    fn write_key_events(&self, events: &[KeyEvent]) -> io::Result<usize> {
        let handle = self.handle()?;
        let records: Vec<INPUT_RECORD> = events.iter().map(key_record).collect();
        let mut written: u32 = 0;
        // SAFETY: `records` outlives the call and `written` is a valid
        // out-pointer.
        unsafe { WriteConsoleInputW(handle, &records, &mut written) }.map_err(io::Error::from)?;
        Ok(written as usize)
    }
}
