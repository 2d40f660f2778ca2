/*
 * Serial Port Driver (COM1)
 *
 * Minimal 16550 UART driver used for kernel log output. The serial port is
 * the only output channel that works before the console is initialized and
 * keeps working after user tasks own the VGA text buffer.
 */

use core::fmt;
use spin::Mutex;
use x86::io::{inb, outb};

/// COM1 base port
const COM1: u16 = 0x3f8;

/// Global serial writer, shared by all CPUs.
static SERIAL: Mutex<SerialPort> = Mutex::new(SerialPort { base: COM1 });

pub struct SerialPort {
    base: u16,
}

impl SerialPort {
    /// Program the UART for 115200 baud, 8N1, FIFOs enabled.
    fn init(&mut self) {
        unsafe {
            outb(self.base + 1, 0x00); // disable interrupts
            outb(self.base + 3, 0x80); // DLAB on
            outb(self.base + 0, 0x01); // divisor low (115200 baud)
            outb(self.base + 1, 0x00); // divisor high
            outb(self.base + 3, 0x03); // 8 bits, no parity, one stop
            outb(self.base + 2, 0xc7); // enable + clear FIFOs
            outb(self.base + 4, 0x0b); // DTR + RTS + OUT2
        }
    }

    fn write_byte(&mut self, byte: u8) {
        unsafe {
            // Wait for the transmit holding register to drain.
            while inb(self.base + 5) & 0x20 == 0 {
                core::hint::spin_loop();
            }
            outb(self.base, byte);
        }
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

/// Initialize COM1. Called once on the manager CPU before logging starts.
pub fn init() {
    SERIAL.lock().init();
}

/// Print formatted arguments to the serial port.
///
/// Safe to call from any CPU; the writer lock serializes output.
pub fn print(args: fmt::Arguments) {
    use core::fmt::Write;
    let _ = SERIAL.lock().write_fmt(args);
}

#[macro_export]
macro_rules! serial_println {
    () => ($crate::utils::serial::print(format_args!("\n")));
    ($($arg:tt)*) => ($crate::utils::serial::print(format_args!("{}\n", format_args!($($arg)*))));
}
