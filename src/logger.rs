//! Serial-port logger.
//!
//! VMX-root code has no stdout, so the crate's diagnostics go through the
//! `log` facade and, when the embedder wants them on a wire, out of a COM
//! port. Call [`init`] once early; every later call only adjusts the level.

use {
    crate::intel::support::{inb, outb},
    alloc::boxed::Box,
    core::fmt::{self, Write},
    spin::Mutex,
};

const UART_OFFSET_DATA: u16 = 0x0;
const UART_OFFSET_INTERRUPT_ENABLE: u16 = 0x1;
const UART_OFFSET_FIFO_CONTROL: u16 = 0x2;
const UART_OFFSET_LINE_CONTROL: u16 = 0x3;
const UART_OFFSET_MODEM_CONTROL: u16 = 0x4;
const UART_OFFSET_LINE_STATUS: u16 = 0x5;

/// Serial ports the logger can drive.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum SerialPort {
    /// COM1 (0x3F8)
    COM1 = 0x3F8,
    /// COM2 (0x2F8)
    COM2 = 0x2F8,
}

/// Installs a serial logger as the global `log` sink.
///
/// Idempotent: if a logger is already registered, only the maximum level is
/// updated.
pub fn init(port: SerialPort, level: log::LevelFilter) {
    let logger: &'static SerialLogger = Box::leak(Box::new(SerialLogger::new(port)));

    // A second registration fails; logging is not worth dying over.
    let _ = log::set_logger(logger);
    log::set_max_level(level);
}

/// The `log::Log` implementation writing to a UART.
pub struct SerialLogger {
    port: Mutex<Serial>,
}

impl SerialLogger {
    fn new(port: SerialPort) -> Self {
        Self {
            port: Mutex::new(Serial { port, initialized: false }),
        }
    }
}

impl log::Log for SerialLogger {
    fn enabled(&self, metadata: &log::Metadata<'_>) -> bool {
        metadata.level() <= log::max_level()
    }

    fn log(&self, record: &log::Record<'_>) {
        if self.enabled(record.metadata()) {
            let cpu = apic_id();
            let mut serial = self.port.lock();
            let _ = writeln!(&mut *serial, "cpu-{} {}: {}", cpu, record.level(), record.args());
        }
    }

    fn flush(&self) {}
}

struct Serial {
    port: SerialPort,
    initialized: bool,
}

impl Serial {
    fn init(&mut self) {
        let base = self.port as u16;

        // Disable interrupts
        outb(base + UART_OFFSET_INTERRUPT_ENABLE, 0x00);
        // Enable DLAB
        outb(base + UART_OFFSET_LINE_CONTROL, 0x80);
        // Divisor = 3 -> 38400 baud
        outb(base + UART_OFFSET_DATA, 0x03);
        outb(base + UART_OFFSET_INTERRUPT_ENABLE, 0x00);
        // 8 bits, no parity, one stop bit
        outb(base + UART_OFFSET_LINE_CONTROL, 0x03);
        // Enable FIFO, clear, 14-byte threshold
        outb(base + UART_OFFSET_FIFO_CONTROL, 0xC7);
        // IRQs enabled, RTS/DSR set
        outb(base + UART_OFFSET_MODEM_CONTROL, 0x0B);

        self.initialized = true;
    }

    fn write_byte(&mut self, byte: u8) {
        let base = self.port as u16;

        // Wait until the transmitter is empty
        while (inb(base + UART_OFFSET_LINE_STATUS) & 0x20) == 0 {}
        outb(base + UART_OFFSET_DATA, byte);
    }
}

impl fmt::Write for Serial {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        if !self.initialized {
            self.init();
        }

        for byte in s.bytes() {
            if byte == b'\n' {
                self.write_byte(b'\r');
            }
            self.write_byte(byte);
        }

        Ok(())
    }
}

/// APIC id of the running logical CPU, used to tag log lines.
fn apic_id() -> u32 {
    x86::cpuid::cpuid!(0x1).ebx >> 24
}
