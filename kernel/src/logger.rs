//! Installs the `log`-crate facade over [`crate::serial::SerialLogger`].
//!
//! This kernel has no framebuffer, so the only sink is serial. Level
//! defaults to [`DEFAULT_LEVEL`] and can be overridden at build time with
//! the `KERNEL_LOG_LEVEL` environment variable (`RUST_LOG`-style names:
//! error/warn/info/debug/trace), since `bootloader_api`'s boot info
//! carries no command-line area to read an override from at runtime.

use log::LevelFilter;

use crate::serial::SerialLogger;

const DEFAULT_LEVEL: LevelFilter = LevelFilter::Info;

static LOGGER: SerialLogger = SerialLogger;

fn configured_level() -> LevelFilter {
    match option_env!("KERNEL_LOG_LEVEL") {
        Some("error") => LevelFilter::Error,
        Some("warn") => LevelFilter::Warn,
        Some("info") => LevelFilter::Info,
        Some("debug") => LevelFilter::Debug,
        Some("trace") => LevelFilter::Trace,
        _ => DEFAULT_LEVEL,
    }
}

/// Installs the serial logger as the global `log` sink. Safe to call
/// before interrupts are enabled; the logger itself takes no lock beyond
/// the serial port's.
pub fn init() {
    log::set_logger(&LOGGER).expect("logger already initialized");
    log::set_max_level(configured_level());
}
