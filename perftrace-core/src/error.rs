//! Error taxonomy shared by the monitor and analysis paths.
//!
//! Each layer owns its own error enum (`ConfigError`, `StorageError`,
//! `DataError`, ...). [`Error`] unifies them for callers of the control
//! surface and maps every fatal path to a stable code.

use crate::collector::TargetId;
use crate::scheduler::MonitorState;
use serde::Serialize;
use thiserror::Error;

pub use crate::config::ConfigError;
pub use crate::store::{DataError, StorageError};

/// Platform-level failures. Fatal when raised at startup.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum PlatformError {
    #[error("Unsupported platform: {0}")]
    Unsupported(String),

    #[error("Permission denied: {0}")]
    PermissionDenied(String),
}

/// A monitored process that is missing or stopped responding.
#[derive(Debug, Clone, Error, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TargetError {
    #[error("No running process with PID {0}")]
    PidNotFound(u32),

    #[error("No running process named '{0}'")]
    NameNotFound(String),

    #[error("Target {id} ({name}) exited")]
    Ended { id: TargetId, name: String },

    #[error("Target {id} ({name}) unavailable after {attempts} failed reads: {reason}")]
    Unavailable {
        id: TargetId,
        name: String,
        attempts: u32,
        reason: String,
    },
}

#[derive(Debug, Error)]
pub enum Error {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Platform(#[from] PlatformError),

    #[error(transparent)]
    Target(#[from] TargetError),

    #[error(transparent)]
    Storage(#[from] StorageError),

    #[error(transparent)]
    Data(#[from] DataError),

    #[error("Cannot {action} while the monitor is {state}")]
    InvalidState {
        action: &'static str,
        state: MonitorState,
    },
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// Stable, machine-readable error code.
    pub fn code(&self) -> &'static str {
        match self {
            Error::Config(_) => "config",
            Error::Platform(_) => "platform",
            Error::Target(_) => "target",
            Error::Storage(_) => "storage",
            Error::Data(_) => "data",
            Error::InvalidState { .. } => "state",
        }
    }

    /// Process exit code used by the CLI.
    pub fn exit_code(&self) -> i32 {
        match self {
            Error::Config(_) => 1,
            Error::Platform(_) => 2,
            Error::Target(_) => 3,
            Error::Storage(_) => 4,
            Error::Data(_) => 5,
            Error::InvalidState { .. } => 6,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exit_codes_are_distinct() {
        let errors = [
            Error::from(ConfigError::Invalid("x".into())),
            Error::from(PlatformError::Unsupported("plan9".into())),
            Error::from(TargetError::PidNotFound(1)),
            Error::from(StorageError::WriterGone),
            Error::from(DataError::UnknownTarget(TargetId(3))),
            Error::InvalidState {
                action: "stop",
                state: MonitorState::Idle,
            },
        ];

        let mut codes: Vec<i32> = errors.iter().map(Error::exit_code).collect();
        codes.dedup();
        assert_eq!(codes, vec![1, 2, 3, 4, 5, 6]);

        let names: Vec<&str> = errors.iter().map(Error::code).collect();
        assert_eq!(names, vec!["config", "platform", "target", "storage", "data", "state"]);
    }

    #[test]
    fn test_target_error_message() {
        let err = TargetError::Ended {
            id: TargetId(2),
            name: "postgres".into(),
        };
        assert_eq!(err.to_string(), "Target 2 (postgres) exited");
    }
}
