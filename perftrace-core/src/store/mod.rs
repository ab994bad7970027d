//! Session store: one SQLite file per monitoring run.
//!
//! - `schema`: table layout and metadata keys
//! - `writer`: the single writer that owns a session file during a run
//! - `reader`: read-only access used by the analysis path

mod reader;
mod schema;
mod writer;

pub use reader::{SessionInfo, StoreReader, StoredTarget};
pub use writer::{SessionMeta, SessionWriter, WriterReport};

use crate::collector::{TargetId, UnknownMetric};
use chrono::{DateTime, Local};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use thiserror::Error;

/// Failures while writing a session.
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Commit failed after {attempts} attempts: {source}")]
    CommitFailed {
        attempts: u32,
        #[source]
        source: rusqlite::Error,
    },

    #[error("Store writer stopped unexpectedly")]
    WriterGone,
}

/// Failures while reading a session for analysis.
#[derive(Debug, Error)]
pub enum DataError {
    #[error("Cannot open store {path}: {source}")]
    Open {
        path: PathBuf,
        #[source]
        source: rusqlite::Error,
    },

    #[error("Store {path} is missing table '{table}'")]
    MissingTable { path: PathBuf, table: String },

    #[error("Store {path} has unsupported schema version {version}")]
    SchemaVersion { path: PathBuf, version: String },

    #[error("Unreadable data: {0}")]
    Unreadable(String),

    #[error("Query failed: {0}")]
    Query(#[from] rusqlite::Error),

    #[error(transparent)]
    UnknownMetric(#[from] UnknownMetric),

    #[error("Unknown target {0}")]
    UnknownTarget(TargetId),
}

/// Why a target stopped being sampled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TargetEventKind {
    /// The process exited (or its pid now belongs to another process).
    Ended,
    /// Repeated read failures exhausted the retry budget.
    Unavailable,
}

impl TargetEventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            TargetEventKind::Ended => "ended",
            TargetEventKind::Unavailable => "unavailable",
        }
    }
}

impl fmt::Display for TargetEventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TargetEventKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "ended" => Ok(TargetEventKind::Ended),
            "unavailable" => Ok(TargetEventKind::Unavailable),
            other => Err(format!("unknown event kind '{}'", other)),
        }
    }
}

/// A recorded per-target error, kept in the session metadata.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TargetEvent {
    pub target: TargetId,
    pub timestamp: i64,
    pub kind: TargetEventKind,
    pub detail: String,
}

/// File name of a session started at `started`, e.g. `20250301_142501.db`.
pub fn session_file_name(started: &DateTime<Local>) -> String {
    format!("{}.db", started.format("%Y%m%d_%H%M%S"))
}

/// Picks a fresh session path inside `dir`, creating the directory if needed.
///
/// Two sessions started within the same second get a numeric suffix.
pub fn create_session_path(dir: &Path, started: &DateTime<Local>) -> Result<PathBuf, StorageError> {
    std::fs::create_dir_all(dir)?;

    let base = started.format("%Y%m%d_%H%M%S").to_string();
    let mut path = dir.join(session_file_name(started));
    let mut suffix = 1;
    while path.exists() {
        path = dir.join(format!("{}_{}.db", base, suffix));
        suffix += 1;
    }

    Ok(path)
}
