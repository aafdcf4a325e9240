//! Process-wide logger bootstrap.
//!
//! Diagnostics go through the `log` facade as `event=... key=value` lines.
//! Stderr always receives them; a rotating file is added when a log
//! directory is given.

use std::path::{Path, PathBuf};
use std::sync::OnceLock;

use anyhow::{Context, Result, bail};
use flexi_logger::{Cleanup, Criterion, Duplicate, FileSpec, Logger, LoggerHandle, Naming};
use log::info;

const LOG_FILE_BASENAME: &str = "wdarchive";
const MAX_LOG_FILE_SIZE_BYTES: u64 = 10 * 1024 * 1024;
const MAX_LOG_FILES: usize = 5;

static LOGGER: OnceLock<LoggingState> = OnceLock::new();

struct LoggingState {
    log_dir: Option<PathBuf>,
    _handle: LoggerHandle,
}

pub fn normalize_level(level: &str) -> Result<&'static str> {
    match level.trim().to_ascii_lowercase().as_str() {
        "error" => Ok("error"),
        "warn" | "warning" => Ok("warn"),
        "info" => Ok("info"),
        "debug" => Ok("debug"),
        "trace" => Ok("trace"),
        other => bail!("unsupported log level: {other}"),
    }
}

/// Starts logging once; later calls with the same directory are no-ops.
pub fn init_logging(level: &str, log_dir: Option<&Path>) -> Result<()> {
    let level = normalize_level(level)?;
    if let Some(state) = LOGGER.get() {
        if state.log_dir.as_deref() != log_dir {
            bail!("logging already initialized with a different log directory");
        }
        return Ok(());
    }

    let logger = Logger::try_with_env_or_str(level)
        .with_context(|| format!("invalid log level {level}"))?;
    let handle = match log_dir {
        Some(dir) => {
            std::fs::create_dir_all(dir)
                .with_context(|| format!("failed to create log directory {}", dir.display()))?;
            logger
                .log_to_file(FileSpec::default().directory(dir).basename(LOG_FILE_BASENAME))
                .rotate(
                    Criterion::Size(MAX_LOG_FILE_SIZE_BYTES),
                    Naming::Numbers,
                    Cleanup::KeepLogFiles(MAX_LOG_FILES),
                )
                .append()
                .duplicate_to_stderr(Duplicate::All)
                .format_for_files(flexi_logger::detailed_format)
                .start()
        }
        None => logger.log_to_stderr().start(),
    }
    .context("failed to start logger")?;

    let _ = LOGGER.set(LoggingState {
        log_dir: log_dir.map(Path::to_path_buf),
        _handle: handle,
    });
    info!(
        "event=logging_init module=logging status=ok level={level} version={}",
        env!("CARGO_PKG_VERSION")
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::normalize_level;

    #[test]
    fn levels_normalize_and_reject_unknown_values() {
        assert_eq!(normalize_level(" Warning ").expect("level"), "warn");
        assert_eq!(normalize_level("DEBUG").expect("level"), "debug");
        assert!(normalize_level("loud").is_err());
    }
}
