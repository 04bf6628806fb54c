use std::io;
use std::path::{Path, PathBuf};

use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

pub const LOG_FILE_ENV: &str = "GRAFT_LOG_FILE";
pub const LOG_ROTATION_ENV: &str = "GRAFT_LOG_ROTATION";
pub const LOG_MAX_FILES_ENV: &str = "GRAFT_LOG_MAX_FILES";

const DEFAULT_MAX_FILES: usize = 3;

/// Maps `minutely`, `hourly`, `daily` or `never` (any case) to a rotation.
pub fn rotation_from_name(name: &str) -> Option<Rotation> {
    match name.trim().to_ascii_lowercase().as_str() {
        "minutely" => Some(Rotation::MINUTELY),
        "hourly" => Some(Rotation::HOURLY),
        "daily" => Some(Rotation::DAILY),
        "never" => Some(Rotation::NEVER),
        _ => None,
    }
}

/// Splits a log file path into the directory the appender writes to and the
/// file name prefix. A bare file name lands in the working directory.
pub fn split_log_path(path: &Path) -> Option<(PathBuf, String)> {
    let file_name = path.file_name()?.to_str()?.to_string();
    let dir = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
        _ => PathBuf::from("."),
    };
    Some((dir, file_name))
}

/// Builds a rolling appender for `path`, keeping at most `max_files` rotated
/// files once rotation is enabled.
pub fn file_appender(
    path: &Path,
    rotation: Rotation,
    max_files: usize,
) -> io::Result<RollingFileAppender> {
    let (dir, prefix) = split_log_path(path).ok_or_else(|| {
        io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("not a log file path: {}", path.display()),
        )
    })?;
    std::fs::create_dir_all(&dir)?;

    RollingFileAppender::builder()
        .rotation(rotation)
        .filename_prefix(prefix)
        .max_log_files(max_files.max(1))
        .build(dir)
        .map_err(io::Error::other)
}

/// Installs the global subscriber: human-readable records on stderr, plus a
/// rolling file when `GRAFT_LOG_FILE` is set. `log` records from the library
/// are bridged in by the subscriber's `try_init`.
///
/// Keep the returned guard alive for the life of the process so buffered
/// file output is flushed on exit.
pub fn init_logging() -> Option<WorkerGuard> {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    let stderr_layer = fmt::layer()
        .with_target(true)
        .with_writer(io::stderr)
        .with_timer(fmt::time::UtcTime::rfc_3339());

    let mut guard = None;
    let file_layer = std::env::var(LOG_FILE_ENV).ok().and_then(|path| {
        let rotation = std::env::var(LOG_ROTATION_ENV)
            .ok()
            .and_then(|name| rotation_from_name(&name))
            .unwrap_or(Rotation::DAILY);
        let max_files = std::env::var(LOG_MAX_FILES_ENV)
            .ok()
            .and_then(|s| s.parse::<usize>().ok())
            .unwrap_or(DEFAULT_MAX_FILES);

        match file_appender(Path::new(&path), rotation, max_files) {
            Ok(appender) => {
                let (writer, file_guard) = tracing_appender::non_blocking(appender);
                guard = Some(file_guard);
                Some(
                    fmt::layer()
                        .with_target(true)
                        .with_ansi(false)
                        .with_writer(writer),
                )
            }
            Err(e) => {
                eprintln!("Failed to open log file {path}: {e}");
                None
            }
        }
    });

    let _ = tracing_subscriber::registry()
        .with(env_filter)
        .with(stderr_layer)
        .with(file_layer)
        .try_init();

    guard
}
