//! Error types for the execution engine
//!
//! Failures are split by who caused them. `EngineError` is raised to the caller
//! and means the sandbox itself is broken or misused: no backend, a driver that
//! never reported, a corrupt result file, or an invalid request. Failures of
//! the untrusted payload are not errors at this level; they travel inside
//! `SandboxResult::error` as an `ErrorKind` so callers can feed them back into
//! code regeneration.

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum EngineError {
    #[error("No sandbox backend available: {0}")]
    BackendUnavailable(String),
    #[error("Execution unit exited without writing a result file")]
    MissingResult { backend_logs: String },
    #[error("Result file is corrupt: {0}")]
    CorruptResult(String),
    #[error("Driver failed inside the sandbox: {message}")]
    DriverFault {
        message: String,
        backend_logs: String,
    },
    #[error("Invalid request: {0}")]
    InvalidRequest(String),
    #[error("Configuration error: {0}")]
    ConfigError(String),
    #[error("I/O error: {0}")]
    IoError(#[from] std::io::Error),
    #[error("Docker operation failed: {0}")]
    DockerError(#[from] bollard::errors::Error),
}

impl EngineError {
    /// True when the sandbox machinery failed, as opposed to the caller
    /// handing it something unusable.
    pub fn is_engine_fault(&self) -> bool {
        !matches!(
            self,
            EngineError::InvalidRequest(_) | EngineError::ConfigError(_)
        )
    }

    pub fn backend_logs(&self) -> Option<&str> {
        match self {
            EngineError::MissingResult { backend_logs }
            | EngineError::DriverFault { backend_logs, .. } => Some(backend_logs),
            _ => None,
        }
    }
}

// Loading tabular data and materializing query snapshots
#[derive(Error, Debug)]
pub enum DatasetError {
    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Dataset has no header row")]
    MissingHeader,
}

/// Failure kinds reported inside a `SandboxResult`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ErrorKind {
    /// The payload raised a fault while running.
    PayloadFault,
    /// Wall-clock budget exceeded; the execution unit was killed.
    Timeout,
    /// Memory, CPU-time or file-size ceiling breached.
    ResourceExceeded,
    /// Refused before dispatch by the payload guard or the query guard.
    Rejected,
    /// An `EngineError` folded into a result by `ExecutionEngine::try_execute`.
    EngineFault,
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            ErrorKind::PayloadFault => "payload fault",
            ErrorKind::Timeout => "timeout",
            ErrorKind::ResourceExceeded => "resource exceeded",
            ErrorKind::Rejected => "rejected",
            ErrorKind::EngineFault => "engine fault",
        };
        f.write_str(name)
    }
}
