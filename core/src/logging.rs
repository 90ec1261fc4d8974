//! Tracing setup for the host and its tools: stderr output plus an optional rotated log file.

use crate::config::LogSettings;
use chrono::{DateTime, NaiveDateTime, Utc};
use std::fs::{self, OpenOptions};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use thiserror::Error;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter};

#[derive(Error, Debug)]
pub enum LoggingError {
    #[error("Failed to prepare log file {path}: {source}")]
    File {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("Invalid log filter: {0}")]
    Filter(String),
    #[error("Failed to install tracing subscriber: {0}")]
    Install(String),
}

/// Installs the global subscriber. `RUST_LOG` wins over the configured level.
pub fn init(settings: &LogSettings) -> Result<(), LoggingError> {
    let filter = match EnvFilter::try_from_default_env() {
        Ok(filter) => filter,
        Err(_) => EnvFilter::try_new(&settings.level)
            .map_err(|e| LoggingError::Filter(e.to_string()))?,
    };

    let file_layer = match &settings.file {
        Some(path) => {
            let file = open_rotated(path, settings.max_log_files).map_err(|source| {
                LoggingError::File {
                    path: path.clone(),
                    source,
                }
            })?;
            Some(
                fmt::layer()
                    .with_ansi(false)
                    .with_target(true)
                    .with_writer(Mutex::new(file)),
            )
        }
        None => None,
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_writer(io::stderr))
        .with(file_layer)
        .try_init()
        .map_err(|e| LoggingError::Install(e.to_string()))
}

fn open_rotated(path: &Path, max_files: usize) -> io::Result<fs::File> {
    rotate_logs(path, max_files)?;
    OpenOptions::new().create(true).append(true).open(path)
}

/// Moves an existing log file aside as `<stem>_<YYYYmmdd_HHMMSS>_<seq><ext>` and deletes the
/// oldest rotated files beyond `max_files`. Files not named that way are left alone.
pub fn rotate_logs(path: &Path, max_files: usize) -> io::Result<()> {
    let dir = match path.parent() {
        Some(p) if !p.as_os_str().is_empty() => p.to_path_buf(),
        _ => PathBuf::from("."),
    };
    fs::create_dir_all(&dir)?;

    if !path.exists() {
        return Ok(());
    }

    let stem = path
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| "log".to_string());
    let ext = path
        .extension()
        .map(|e| format!(".{}", e.to_string_lossy()))
        .unwrap_or_default();

    let modified: DateTime<Utc> = fs::metadata(path)?.modified()?.into();
    let stamp = modified.format(STAMP_FORMAT).to_string();

    let mut seq = 0u32;
    let mut rotated = dir.join(format!("{stem}_{stamp}_{seq:03}{ext}"));
    while rotated.exists() {
        seq += 1;
        rotated = dir.join(format!("{stem}_{stamp}_{seq:03}{ext}"));
    }
    fs::rename(path, &rotated)?;

    let mut old: Vec<((String, u32), PathBuf)> = fs::read_dir(&dir)?
        .filter_map(|entry| entry.ok().map(|e| e.path()))
        .filter_map(|p| {
            let key = rotation_key(&p.file_name()?.to_string_lossy(), &stem, &ext)?;
            Some((key, p))
        })
        .collect();
    // Newest first
    old.sort_by(|a, b| b.0.cmp(&a.0));

    for (_, stale) in old.into_iter().skip(max_files) {
        if let Err(e) = fs::remove_file(&stale) {
            tracing::warn!(path = %stale.display(), error = %e, "Failed to delete rotated log");
        }
    }
    Ok(())
}

const STAMP_FORMAT: &str = "%Y%m%d_%H%M%S";

/// Timestamp and sequence number of a rotated file name of this log, if `name` is one.
fn rotation_key(name: &str, stem: &str, ext: &str) -> Option<(String, u32)> {
    let middle = name.strip_prefix(stem)?.strip_prefix('_')?.strip_suffix(ext)?;
    let (stamp, seq) = middle.rsplit_once('_')?;
    NaiveDateTime::parse_from_str(stamp, STAMP_FORMAT).ok()?;
    if seq.len() < 3 || !seq.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    Some((stamp.to_string(), seq.parse().ok()?))
}
