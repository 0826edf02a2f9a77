use crate::config::LoggingConfig;
use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing_appender::non_blocking::{NonBlocking, WorkerGuard};
use tracing_subscriber::fmt::writer::{BoxMakeWriter, MakeWriterExt};
use tracing_subscriber::{fmt, EnvFilter};

/// Keeps the non-blocking file writer alive; drop it last.
pub struct LoggingGuard {
    _file_guard: WorkerGuard,
}

/// Installs the global subscriber. `RUST_LOG` wins over the configured level.
pub fn init_logging(config: &LoggingConfig, log_dir: &Path) -> Result<LoggingGuard, LoggingError> {
    fs::create_dir_all(log_dir).map_err(|source| LoggingError::CreateDirectory {
        path: log_dir.to_path_buf(),
        source,
    })?;

    let env_filter = match EnvFilter::try_from_default_env() {
        Ok(filter) => filter,
        Err(_) => EnvFilter::try_new(config.level.as_filter_directive()).map_err(|source| {
            LoggingError::ParseLevel {
                level: config.level.as_filter_directive().to_string(),
                source,
            }
        })?,
    };

    let (file_writer, file_guard) = build_file_writer(config, log_dir)?;
    let writer = if config.stdout {
        BoxMakeWriter::new(
            std::io::stdout
                .with_max_level(tracing::Level::TRACE)
                .and(file_writer),
        )
    } else {
        BoxMakeWriter::new(file_writer)
    };

    fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .with_ansi(config.stdout)
        .with_writer(writer)
        .try_init()
        .map_err(LoggingError::SubscriberInstall)?;

    Ok(LoggingGuard {
        _file_guard: file_guard,
    })
}

fn build_file_writer(
    config: &LoggingConfig,
    log_dir: &Path,
) -> Result<(NonBlocking, WorkerGuard), LoggingError> {
    let max_files = config.max_log_files.max(1);
    let file_stem = config.file_name.as_deref().unwrap_or("trove-plugins.log");
    cleanup_old_logs(log_dir, file_stem, max_files)?;

    let appender = tracing_appender::rolling::daily(log_dir, file_stem);
    Ok(tracing_appender::non_blocking(appender))
}

fn cleanup_old_logs(dir: &Path, file_stem: &str, max_files: usize) -> Result<(), LoggingError> {
    let mut entries: Vec<_> = fs::read_dir(dir)
        .map_err(|source| LoggingError::ReadDir {
            path: dir.to_path_buf(),
            source,
        })?
        .filter_map(|entry| entry.ok())
        .filter_map(|entry| {
            let name = entry.file_name();
            if !name.to_string_lossy().starts_with(file_stem) {
                return None;
            }
            entry
                .metadata()
                .ok()
                .and_then(|m| m.modified().ok())
                .map(|mtime| (entry.path(), mtime))
        })
        .collect();

    if entries.len() <= max_files {
        return Ok(());
    }
    entries.sort_by_key(|(_, modified)| *modified);

    let remove_count = entries.len() - max_files;
    for (path, _) in entries.into_iter().take(remove_count) {
        fs::remove_file(&path).map_err(|source| LoggingError::Cleanup { path, source })?;
    }

    Ok(())
}

#[derive(Debug, Error)]
pub enum LoggingError {
    #[error("failed to create log directory {path}: {source}")]
    CreateDirectory {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("failed to parse log level {level}: {source}")]
    ParseLevel {
        level: String,
        source: tracing_subscriber::filter::ParseError,
    },
    #[error("failed to install tracing subscriber: {0}")]
    SubscriberInstall(Box<dyn std::error::Error + Send + Sync>),
    #[error("failed to list log directory {path}: {source}")]
    ReadDir {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("failed to remove old log file {path}: {source}")]
    Cleanup {
        path: PathBuf,
        source: std::io::Error,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn old_logs_beyond_limit_are_pruned() {
        let dir = tempfile::tempdir().unwrap();
        for day in 1..=4 {
            fs::write(dir.path().join(format!("trove.log.2024-01-0{day}")), b"x").unwrap();
        }
        fs::write(dir.path().join("unrelated.txt"), b"keep").unwrap();

        cleanup_old_logs(dir.path(), "trove.log", 2).unwrap();

        let left: Vec<_> = fs::read_dir(dir.path())
            .unwrap()
            .filter_map(|e| e.ok())
            .map(|e| e.file_name().to_string_lossy().to_string())
            .collect();
        assert_eq!(left.iter().filter(|n| n.starts_with("trove.log")).count(), 2);
        assert!(left.contains(&"unrelated.txt".to_string()));
    }
}
