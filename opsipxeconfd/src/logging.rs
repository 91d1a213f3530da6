//! Tracing setup with opsi-style numeric levels and SIGHUP reconfiguration.

use std::io;
use std::path::Path;
use std::sync::OnceLock;

use parking_lot::RwLock;
use tracing_appender::non_blocking::{NonBlocking, WorkerGuard};
use tracing_subscriber::filter::LevelFilter;
use tracing_subscriber::fmt::writer::MakeWriter;
use tracing_subscriber::{fmt, prelude::*, reload, Registry};

use opsipxeconfd_shared::{OpsipxeconfdError, OpsipxeconfdResult};

use crate::config::DaemonConfig;

static RELOAD_HANDLE: OnceLock<reload::Handle<LevelFilter, Registry>> = OnceLock::new();
static LOG_TARGET: OnceLock<RwLock<LogTarget>> = OnceLock::new();
// Keeps the background writer thread alive; replaced on reload.
static LOG_GUARD: RwLock<Option<WorkerGuard>> = RwLock::new(None);

enum LogTarget {
    Stderr,
    File(NonBlocking),
}

/// Writer that follows the currently configured log target, so the target
/// can change on reload without re-installing the global subscriber.
struct DynWriter;

impl<'a> MakeWriter<'a> for DynWriter {
    type Writer = Box<dyn io::Write>;

    fn make_writer(&'a self) -> Self::Writer {
        match LOG_TARGET.get().map(|t| t.read()) {
            Some(target) => match &*target {
                LogTarget::Stderr => Box::new(io::stderr()),
                LogTarget::File(non_blocking) => Box::new(non_blocking.clone()),
            },
            None => Box::new(io::stderr()),
        }
    }
}

/// Map the opsi log level (0 = nothing .. 9 = secrets) onto tracing.
pub fn opsi_level_filter(level: u8) -> LevelFilter {
    match level {
        0 => LevelFilter::OFF,
        1..=3 => LevelFilter::ERROR,
        4 => LevelFilter::WARN,
        5 | 6 => LevelFilter::INFO,
        7 => LevelFilter::DEBUG,
        _ => LevelFilter::TRACE,
    }
}

/// Install the global subscriber, or reconfigure it if already installed.
///
/// Logs go to `log file` when configured (non-blocking appender), stderr
/// otherwise. Idempotent; later calls only adjust level and target.
pub fn init_logging(config: &DaemonConfig) -> OpsipxeconfdResult<()> {
    let target = resolve_target(config)?;

    if let (Some(handle), Some(target_slot)) = (RELOAD_HANDLE.get(), LOG_TARGET.get()) {
        *target_slot.write() = target;
        handle
            .reload(opsi_level_filter(config.log_level))
            .map_err(|err| OpsipxeconfdError::Config(format!("log reconfiguration: {}", err)))?;
        return Ok(());
    }

    let _ = LOG_TARGET.set(RwLock::new(target));
    let (filter, handle) = reload::Layer::new(opsi_level_filter(config.log_level));
    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_ansi(false).with_writer(DynWriter))
        .init();
    let _ = RELOAD_HANDLE.set(handle);

    Ok(())
}

fn resolve_target(config: &DaemonConfig) -> OpsipxeconfdResult<LogTarget> {
    let Some(log_file) = &config.log_file else {
        *LOG_GUARD.write() = None;
        return Ok(LogTarget::Stderr);
    };

    let dir = match log_file.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => Path::new("."),
    };
    let file_name = log_file
        .file_name()
        .ok_or_else(|| {
            OpsipxeconfdError::Config(format!("invalid log file '{}'", log_file.display()))
        })?
        .to_owned();
    std::fs::create_dir_all(dir).map_err(|err| {
        OpsipxeconfdError::Config(format!(
            "cannot create log directory '{}': {}",
            dir.display(),
            err
        ))
    })?;

    let appender = tracing_appender::rolling::never(dir, file_name);
    let (non_blocking, guard) = tracing_appender::non_blocking(appender);
    *LOG_GUARD.write() = Some(guard);
    Ok(LogTarget::File(non_blocking))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_level_mapping() {
        assert_eq!(opsi_level_filter(0), LevelFilter::OFF);
        assert_eq!(opsi_level_filter(3), LevelFilter::ERROR);
        assert_eq!(opsi_level_filter(4), LevelFilter::WARN);
        assert_eq!(opsi_level_filter(5), LevelFilter::INFO);
        assert_eq!(opsi_level_filter(6), LevelFilter::INFO);
        assert_eq!(opsi_level_filter(7), LevelFilter::DEBUG);
        assert_eq!(opsi_level_filter(9), LevelFilter::TRACE);
    }
}
