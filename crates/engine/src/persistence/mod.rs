//! Persistence - durable session artifacts with atomic replacement
//!
//! All artifacts are JSON (the conversation log is JSON-lines). Writers go
//! through a sibling temp path and rename; readers used on normal session
//! open are fail-soft and return empty containers. The import path (loading
//! a foreign session directory) is strict and rolls back completely on any
//! failure.

mod session;

pub use session::{
    cleanup_backups, import_session, load_session, parse_rule_record, save_session, RuleRecord,
    SessionData, SessionPaths, DEFAULT_PLAYER_KEY,
};

use std::fs;
use std::io::Write;
use std::path::Path;

use serde::de::DeserializeOwned;
use serde::Serialize;
use thiserror::Error;

/// Persistence failures.
#[derive(Debug, Error)]
pub enum PersistenceError {
    #[error("IO error on {path}: {message}")]
    Io { path: String, message: String },

    #[error("Corrupt file {path}: {message}")]
    Corrupt { path: String, message: String },

    #[error("Load rolled back: {0}")]
    RolledBack(String),
}

impl PersistenceError {
    fn io(path: &Path, err: std::io::Error) -> Self {
        Self::Io {
            path: path.display().to_string(),
            message: err.to_string(),
        }
    }

    fn corrupt(path: &Path, message: impl Into<String>) -> Self {
        Self::Corrupt {
            path: path.display().to_string(),
            message: message.into(),
        }
    }
}

/// Fail-soft JSON read: any IO or parse error yields the default value.
pub fn read_json_or_default<T: DeserializeOwned + Default>(path: &Path) -> T {
    match fs::read_to_string(path) {
        Ok(text) => match serde_json::from_str(&text) {
            Ok(value) => value,
            Err(e) => {
                tracing::warn!(path = %path.display(), error = %e, "unreadable JSON, using default");
                T::default()
            }
        },
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => T::default(),
        Err(e) => {
            tracing::warn!(path = %path.display(), error = %e, "unreadable file, using default");
            T::default()
        }
    }
}

/// Strict JSON read used by the import path.
pub fn read_json_strict<T: DeserializeOwned>(path: &Path) -> Result<T, PersistenceError> {
    let text = fs::read_to_string(path).map_err(|e| PersistenceError::io(path, e))?;
    serde_json::from_str(&text).map_err(|e| PersistenceError::corrupt(path, e.to_string()))
}

/// Atomic JSON write: parent directories are created, content lands on a
/// sibling temp path, then a rename makes it visible.
pub fn write_json_atomic<T: Serialize>(path: &Path, value: &T) -> Result<(), PersistenceError> {
    let text = serde_json::to_string_pretty(value)
        .map_err(|e| PersistenceError::corrupt(path, e.to_string()))?;
    write_atomic(path, text.as_bytes())
}

/// Atomic raw write with parent-directory creation.
pub fn write_atomic(path: &Path, bytes: &[u8]) -> Result<(), PersistenceError> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).map_err(|e| PersistenceError::io(parent, e))?;
    }
    let tmp = path.with_extension("tmp");
    {
        let mut file = fs::File::create(&tmp).map_err(|e| PersistenceError::io(&tmp, e))?;
        file.write_all(bytes).map_err(|e| PersistenceError::io(&tmp, e))?;
    }
    fs::rename(&tmp, path).map_err(|e| PersistenceError::io(path, e))
}

/// Read a JSON-lines file leniently: unreadable lines are skipped with a
/// warning, a missing file is an empty list.
pub fn read_json_lines<T: DeserializeOwned>(path: &Path) -> Vec<T> {
    let Ok(text) = fs::read_to_string(path) else {
        return Vec::new();
    };
    text.lines()
        .filter(|line| !line.trim().is_empty())
        .filter_map(|line| match serde_json::from_str(line) {
            Ok(value) => Some(value),
            Err(e) => {
                tracing::warn!(path = %path.display(), error = %e, "skipping unreadable log line");
                None
            }
        })
        .collect()
}

/// Atomic JSON-lines write.
pub fn write_json_lines<T: Serialize>(path: &Path, values: &[T]) -> Result<(), PersistenceError> {
    let mut buffer = String::new();
    for value in values {
        let line = serde_json::to_string(value)
            .map_err(|e| PersistenceError::corrupt(path, e.to_string()))?;
        buffer.push_str(&line);
        buffer.push('\n');
    }
    write_atomic(path, buffer.as_bytes())
}
