//! UART log sink.
//!
//! Formats `[LEVEL] target: message` lines straight to UART0. Records can be
//! emitted from trap context, so the logger takes no lock and never
//! allocates.

use core::fmt::Write;

use log::{LevelFilter, Log, Metadata, Record, SetLoggerError};

use crate::arch::uart::UartWriter;

pub struct UartLogger;

static LOGGER: UartLogger = UartLogger;

impl Log for UartLogger {
    fn enabled(&self, metadata: &Metadata<'_>) -> bool {
        metadata.level() <= log::max_level()
    }

    fn log(&self, record: &Record<'_>) {
        if self.enabled(record.metadata()) {
            let _ = writeln!(
                UartWriter,
                "[{:<5}] {}: {}",
                record.level(),
                record.target(),
                record.args()
            );
        }
    }

    fn flush(&self) {}
}

/// Install the UART logger at `level`.
pub fn init(level: LevelFilter) -> Result<(), SetLoggerError> {
    log::set_logger(&LOGGER)?;
    log::set_max_level(level);
    Ok(())
}
