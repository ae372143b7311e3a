//! ns16550a UART0 (minimal)
//!
//! Polled transmit for kernel diagnostics plus a receive interrupt that
//! echoes typed characters back to the console.

use core::fmt;
use core::hint;
use core::ptr::{read_volatile, write_volatile};

use super::riscv32::UART0;

// Register offsets (byte-wide registers).
const RHR: usize = 0; // receive holding (read)
const THR: usize = 0; // transmit holding (write)
const DLL: usize = 0; // divisor latch low (DLAB = 1)
const IER: usize = 1; // interrupt enable
const DLM: usize = 1; // divisor latch high (DLAB = 1)
const FCR: usize = 2; // FIFO control (write)
const LCR: usize = 3; // line control
const LSR: usize = 5; // line status

const LCR_DLAB: u8 = 1 << 7;
const LCR_8N1: u8 = 0b11;
const LSR_RX_READY: u8 = 1 << 0;
const LSR_TX_IDLE: u8 = 1 << 5;

#[inline]
fn read(reg: usize) -> u8 {
    // Safety: UART0 is a fixed MMIO block on QEMU virt.
    unsafe { read_volatile((UART0 + reg) as *const u8) }
}

#[inline]
fn write(reg: usize, value: u8) {
    // Safety: UART0 is a fixed MMIO block on QEMU virt.
    unsafe { write_volatile((UART0 + reg) as *mut u8, value) }
}

/// 8N1, 38.4K baud, FIFOs on, receive interrupt enabled.
pub fn init() {
    write(IER, 0x00);
    write(LCR, LCR_DLAB);
    write(DLL, 0x03);
    write(DLM, 0x00);
    write(LCR, LCR_8N1);
    write(FCR, 0x01);
    write(IER, 0x01);
}

pub fn putc(c: u8) {
    while read(LSR) & LSR_TX_IDLE == 0 {
        hint::spin_loop();
    }
    write(THR, c);
}

pub fn puts(s: &str) {
    for byte in s.bytes() {
        if byte == b'\n' {
            putc(b'\r');
        }
        putc(byte);
    }
}

pub fn getc() -> Option<u8> {
    (read(LSR) & LSR_RX_READY != 0).then(|| read(RHR))
}

/// Receive interrupt: drain and echo.
pub fn isr() {
    while let Some(c) = getc() {
        putc(c);
        if c == b'\r' {
            putc(b'\n');
        }
    }
}

/// `core::fmt` sink over UART0.
pub struct UartWriter;

impl fmt::Write for UartWriter {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        puts(s);
        Ok(())
    }
}
