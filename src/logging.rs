//! Structured logging: console plus a daily rolling file under `logs/`.

use std::fs;
use std::path::{Path, PathBuf};
use tracing::warn;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::config::CoreConfig;

pub const MAX_LOG_FILES: usize = 10;

const DEFAULT_FILTER: &str = "info,offline_pos_core=debug";
const LOG_PREFIX: &str = "pos";

/// Install the global subscriber. Keep the returned guard alive for the
/// life of the process; dropping it flushes the file writer.
///
/// `RUST_LOG` wins over the configured filter.
pub fn init(config: &CoreConfig) -> WorkerGuard {
    let env_filter = EnvFilter::try_from_default_env()
        .ok()
        .or_else(|| {
            config
                .log_filter
                .as_deref()
                .and_then(|f| EnvFilter::try_new(f).ok())
        })
        .unwrap_or_else(|| EnvFilter::new(DEFAULT_FILTER));

    let log_dir = config.log_dir();
    fs::create_dir_all(&log_dir).ok();
    let pruned = prune_old_logs(&log_dir, MAX_LOG_FILES);

    let file_appender = tracing_appender::rolling::daily(&log_dir, LOG_PREFIX);
    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

    let file_layer = fmt::layer()
        .with_writer(non_blocking)
        .with_ansi(false)
        .with_target(true);
    let console_layer = fmt::layer().with_target(true);
    tracing_subscriber::registry()
        .with(env_filter)
        .with(console_layer)
        .with(file_layer)
        .init();

    if pruned > 0 {
        tracing::debug!(pruned, "Pruned old log files");
    }
    guard
}

/// Remove rolled log files beyond the newest `keep`. Returns how many were removed.
pub fn prune_old_logs(log_dir: &Path, keep: usize) -> usize {
    let mut log_files: Vec<(PathBuf, std::time::SystemTime)> = Vec::new();
    let Ok(entries) = fs::read_dir(log_dir) else {
        return 0;
    };
    for entry in entries.flatten() {
        let path = entry.path();
        if !path.is_file() {
            continue;
        }
        let is_log = path
            .file_name()
            .and_then(|n| n.to_str())
            .is_some_and(|name| name.starts_with("pos."));
        if is_log {
            let modified = entry
                .metadata()
                .ok()
                .and_then(|m| m.modified().ok())
                .unwrap_or(std::time::UNIX_EPOCH);
            log_files.push((path, modified));
        }
    }

    // Newest first
    log_files.sort_by(|a, b| b.1.cmp(&a.1));

    let mut removed = 0;
    for (path, _) in log_files.iter().skip(keep) {
        match fs::remove_file(path) {
            Ok(()) => removed += 1,
            Err(e) => warn!("Failed to prune log file {}: {e}", path.display()),
        }
    }
    removed
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::{Duration, SystemTime};

    #[test]
    fn prune_keeps_newest_logs_only() {
        let dir = tempfile::tempdir().expect("tempdir");
        let base = SystemTime::now() - Duration::from_secs(3600);
        for day in 0..5u64 {
            let path = dir.path().join(format!("pos.2024-01-0{}", day + 1));
            fs::write(&path, "line").expect("write log");
            let file = fs::File::options().write(true).open(&path).expect("open");
            file.set_modified(base + Duration::from_secs(day * 60))
                .expect("set mtime");
        }
        fs::write(dir.path().join("notes.txt"), "keep me").expect("write other");

        assert_eq!(prune_old_logs(dir.path(), 3), 2);
        assert!(!dir.path().join("pos.2024-01-01").exists());
        assert!(!dir.path().join("pos.2024-01-02").exists());
        assert!(dir.path().join("pos.2024-01-05").exists());
        assert!(dir.path().join("notes.txt").exists());
    }

    #[test]
    fn prune_missing_dir_is_a_no_op() {
        let dir = tempfile::tempdir().expect("tempdir");
        assert_eq!(prune_old_logs(&dir.path().join("absent"), 3), 0);
    }
}
