//! Console + file logging for binaries built on this crate.
//!
//! Each run writes to a fresh timestamped file in the log directory; older log
//! files beyond the retention count are removed at startup.

use std::fs;
use std::path::{Path, PathBuf};

use thiserror::Error;

/// Log files kept from earlier runs, besides the one being opened.
pub const DEFAULT_RETAINED_LOGS: usize = 1;

#[derive(Debug, Error)]
pub enum LoggerError {
    #[error("log directory {path:?}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("a global logger is already installed")]
    AlreadyInstalled(#[from] log::SetLoggerError),
}

/// Parses a level name, falling back to `Info` for anything unrecognised.
pub fn parse_level(level: &str) -> log::LevelFilter {
    match level.trim().to_lowercase().as_str() {
        "trace" => log::LevelFilter::Trace,
        "debug" => log::LevelFilter::Debug,
        "warn" => log::LevelFilter::Warn,
        "error" => log::LevelFilter::Error,
        "off" => log::LevelFilter::Off,
        _ => log::LevelFilter::Info,
    }
}

/// Installs the global logger: stdout plus `{prefix}_{timestamp}.log` in
/// `log_dir`. Returns the path of the new log file.
pub fn setup_logging(log_dir: &Path, prefix: &str, level: &str) -> Result<PathBuf, LoggerError> {
    let io_err = |source| LoggerError::Io { path: log_dir.to_path_buf(), source };

    fs::create_dir_all(log_dir).map_err(io_err)?;
    cleanup_old_logs(log_dir, prefix, DEFAULT_RETAINED_LOGS).map_err(io_err)?;

    let log_path = log_dir.join(format!("{}_{}.log", prefix, chrono::Local::now().format("%Y-%m-%d_%H-%M-%S")));
    let file = fern::log_file(&log_path).map_err(io_err)?;

    fern::Dispatch::new()
        .format(|out, message, record| {
            out.finish(format_args!(
                "{}[{}][{}] {}",
                chrono::Local::now().format("[%Y-%m-%d %H:%M:%S]"),
                record.target(),
                record.level(),
                message
            ))
        })
        .level(parse_level(level))
        // The socket library is chatty at debug level.
        .level_for("tungstenite", log::LevelFilter::Warn)
        .level_for("tokio_tungstenite", log::LevelFilter::Warn)
        .chain(std::io::stdout())
        .chain(file)
        .apply()?;

    Ok(log_path)
}

/// Deletes `{prefix}_*.log` files in `log_dir`, keeping the `keep` newest.
/// Returns how many were deleted.
pub fn cleanup_old_logs(log_dir: &Path, prefix: &str, keep: usize) -> std::io::Result<usize> {
    let mut entries: Vec<(std::time::SystemTime, PathBuf)> = fs::read_dir(log_dir)?
        .filter_map(|res| res.ok())
        .map(|e| e.path())
        .filter(|p| p.extension().is_some_and(|ext| ext == "log"))
        .filter(|p| p.file_name().and_then(|n| n.to_str()).is_some_and(|n| n.starts_with(prefix)))
        .filter_map(|p| fs::metadata(&p).and_then(|m| m.modified()).ok().map(|t| (t, p)))
        .collect();

    // Newest first
    entries.sort_by(|a, b| b.0.cmp(&a.0));

    let mut removed = 0;
    for (_, path) in entries.iter().skip(keep) {
        match fs::remove_file(path) {
            Ok(()) => removed += 1,
            Err(e) => log::warn!("Failed to delete old log file {:?}: {}", path, e),
        }
    }
    Ok(removed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::{Duration, SystemTime};

    fn touch(dir: &Path, name: &str, age_secs: u64) {
        let path = dir.join(name);
        let file = fs::File::create(&path).unwrap();
        file.set_modified(SystemTime::now() - Duration::from_secs(age_secs)).unwrap();
    }

    #[test]
    fn keeps_the_newest_matching_logs_only() {
        let dir = tempfile::tempdir().unwrap();
        touch(dir.path(), "signalflow_old.log", 300);
        touch(dir.path(), "signalflow_mid.log", 200);
        touch(dir.path(), "signalflow_new.log", 100);
        touch(dir.path(), "other_app.log", 500);
        touch(dir.path(), "signalflow_notes.txt", 500);

        assert_eq!(cleanup_old_logs(dir.path(), "signalflow", 1).unwrap(), 2);

        let mut left: Vec<String> = fs::read_dir(dir.path())
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
            .collect();
        left.sort();
        assert_eq!(left, vec!["other_app.log", "signalflow_new.log", "signalflow_notes.txt"]);
    }

    #[test]
    fn level_names() {
        assert_eq!(parse_level("DEBUG"), log::LevelFilter::Debug);
        assert_eq!(parse_level(" trace "), log::LevelFilter::Trace);
        assert_eq!(parse_level("verbose"), log::LevelFilter::Info);
    }
}
