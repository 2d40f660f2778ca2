use log::{Level, LevelFilter, Metadata, Record};

use crate::arch::smp;

/// Custom logger implementation for FinchLogger.
struct FinchLogger;

impl log::Log for FinchLogger {
    /// Checks if the given log level is enabled.
    fn enabled(&self, metadata: &Metadata) -> bool {
        metadata.level() <= Level::Info
    }

    /// Logs the record by printing it to the serial port, tagged with the
    /// CPU that issued it.
    fn log(&self, record: &Record) {
        if self.enabled(record.metadata()) {
            serial_println!("[{}][cpu{}] {}", record.level(), smp::cpu_id().0, record.args());
        }
    }

    /// Flushes the logger (no-op in this case).
    fn flush(&self) {}
}

/// The FinchLogger instance used for logging.
static LOGGER: FinchLogger = FinchLogger;

/// Initializes the logger.
///
/// # Panics
///
/// If there is an error initializing the logger, a panic will occur with the
/// corresponding error message.
pub fn init() {
    let logger_init_result =
        log::set_logger(&LOGGER).map(|()| log::set_max_level(LevelFilter::Info));

    match logger_init_result {
        Ok(_) => serial_println!("Logger initialized correctly"),
        Err(err) => panic!("Error with initializing logger: {}", err),
    }
}
