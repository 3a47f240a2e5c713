//! Character output.
//!
//! The kernel never touches an output device itself. Applications hand a
//! [`CharSink`] to whatever task prints and serialize access with a kernel
//! mutex. [`Console`] adds `core::fmt::Write` on top of any sink, and
//! [`CmsdkUart`] is the sink for UART0 on the MPS2 boards.

use core::fmt;
use core::ptr;

/// Byte sink. Returns how many bytes were accepted; a blocking sink always
/// accepts all of them.
pub trait CharSink {
    fn write(&mut self, bytes: &[u8]) -> usize;
}

/// `core::fmt::Write` over a [`CharSink`].
pub struct Console<S> {
    sink: S,
}

impl<S: CharSink> Console<S> {
    pub const fn new(sink: S) -> Self {
        Self { sink }
    }

    pub fn into_inner(self) -> S {
        self.sink
    }
}

impl<S: CharSink> fmt::Write for Console<S> {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        let mut rest = s.as_bytes();
        while !rest.is_empty() {
            match self.sink.write(rest) {
                0 => return Err(fmt::Error),
                n => rest = &rest[n.min(rest.len())..],
            }
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// CMSDK APB UART
// ---------------------------------------------------------------------------

/// UART0 base address on MPS2 AN385.
pub const UART0_BASE: usize = 0x4000_4000;

/// Baud divider the MPS2 demos program into UART0.
pub const UART0_BAUD_DIVIDER: u32 = 16;

const DATA: usize = 0x00;
const STATE: usize = 0x04;
const CTRL: usize = 0x08;
const BAUDDIV: usize = 0x10;

const STATE_TX_FULL: u32 = 1 << 0;
const CTRL_TX_ENABLE: u32 = 1 << 0;

/// Polled transmitter of an ARM CMSDK APB UART.
///
/// Copies drive the same device. Tasks sharing one must serialize their
/// writes, normally with a kernel mutex.
#[derive(Debug, Clone, Copy)]
pub struct CmsdkUart {
    base: usize,
}

impl CmsdkUart {
    /// Enable the transmitter with the given baud divider.
    ///
    /// # Safety
    /// `base` must be the address of a CMSDK UART that nothing else drives.
    pub unsafe fn new(base: usize, baud_divider: u32) -> Self {
        let uart = Self { base };
        uart.write_reg(BAUDDIV, baud_divider);
        uart.write_reg(CTRL, CTRL_TX_ENABLE);
        uart
    }

    fn read_reg(&self, offset: usize) -> u32 {
        // Safety: `new` was promised a valid register block.
        unsafe { ptr::read_volatile((self.base + offset) as *const u32) }
    }

    fn write_reg(&self, offset: usize, value: u32) {
        // Safety: as above.
        unsafe { ptr::write_volatile((self.base + offset) as *mut u32, value) }
    }
}

impl CharSink for CmsdkUart {
    fn write(&mut self, bytes: &[u8]) -> usize {
        for &byte in bytes {
            while self.read_reg(STATE) & STATE_TX_FULL != 0 {}
            self.write_reg(DATA, byte as u32);
        }
        bytes.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use core::fmt::Write;

    /// Takes at most `chunk` bytes per call.
    struct Capture {
        out: Vec<u8>,
        chunk: usize,
    }

    impl CharSink for Capture {
        fn write(&mut self, bytes: &[u8]) -> usize {
            let n = bytes.len().min(self.chunk);
            self.out.extend_from_slice(&bytes[..n]);
            n
        }
    }

    #[test]
    fn test_console_formats_into_sink() {
        let mut console = Console::new(Capture {
            out: Vec::new(),
            chunk: usize::MAX,
        });
        write!(console, "Task {} usage: {} out of {}\n", 1, 9400, 10000).unwrap();
        assert_eq!(
            console.into_inner().out,
            b"Task 1 usage: 9400 out of 10000\n".to_vec()
        );
    }

    #[test]
    fn test_short_writes_are_retried() {
        let mut console = Console::new(Capture {
            out: Vec::new(),
            chunk: 3,
        });
        console.write_str("Task 2 is running\r\n").unwrap();
        assert_eq!(console.into_inner().out, b"Task 2 is running\r\n".to_vec());
    }

    #[test]
    fn test_stalled_sink_is_an_error() {
        let mut console = Console::new(Capture {
            out: Vec::new(),
            chunk: 0,
        });
        assert!(console.write_str("x").is_err());
    }
}
