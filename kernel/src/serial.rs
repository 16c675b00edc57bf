//! 16550 UART console on COM1
//!
//! The kernel's only console. Glyph rendering and character input devices
//! are external collaborators; everything the kernel prints goes out the
//! serial line.

use core::fmt;

use spin::Mutex;

/// COM1 base port
const COM1: u16 = 0x3F8;

pub struct SerialPort {
    base: u16,
}

impl SerialPort {
    pub const fn new(base: u16) -> Self {
        Self { base }
    }

    /// Program the UART: 115200 baud, 8N1, FIFOs on.
    pub fn init(&mut self) {
        #[cfg(all(target_arch = "x86", target_os = "none"))]
        {
            use crate::arch::x86::port::outb;
            // SAFETY: writes to the COM1 register block, which is owned by
            // this driver for the lifetime of the kernel.
            unsafe {
                outb(self.base + 1, 0x00); // disable interrupts
                outb(self.base + 3, 0x80); // DLAB on
                outb(self.base, 0x01); // divisor 1 (115200 baud)
                outb(self.base + 1, 0x00);
                outb(self.base + 3, 0x03); // 8 bits, no parity, one stop
                outb(self.base + 2, 0xC7); // FIFO on, 14-byte threshold
                outb(self.base + 4, 0x0B); // RTS/DSR, OUT2
            }
        }
    }

    #[cfg(all(target_arch = "x86", target_os = "none"))]
    fn write_byte(&mut self, byte: u8) {
        use crate::arch::x86::port::{inb, outb};
        // SAFETY: COM1 register block, owned by this driver.
        unsafe {
            while inb(self.base + 5) & 0x20 == 0 {}
            outb(self.base, byte);
        }
    }

    #[cfg(not(all(target_arch = "x86", target_os = "none")))]
    fn write_byte(&mut self, _byte: u8) {
        let _ = self.base;
    }
}

impl fmt::Write for SerialPort {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        for byte in s.bytes() {
            if byte == b'\n' {
                self.write_byte(b'\r');
            }
            self.write_byte(byte);
        }
        Ok(())
    }
}

/// The console, shared by the print macros and the logger.
pub static CONSOLE: Mutex<SerialPort> = Mutex::new(SerialPort::new(COM1));

/// One-time UART programming, called by the boot glue.
pub fn init() {
    CONSOLE.lock().init();
}

#[doc(hidden)]
pub fn _print(args: fmt::Arguments) {
    use core::fmt::Write;
    // Console output is best-effort; a failed write has nowhere to report.
    let _ = CONSOLE.lock().write_fmt(args);
}
