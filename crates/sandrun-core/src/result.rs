use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::errors::ErrorKind;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SandboxError {
    pub kind: ErrorKind,
    pub message: String,
}

impl std::fmt::Display for SandboxError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.kind, self.message)
    }
}

/// Uniform outcome of one execution, whichever backend ran it.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct SandboxResult {
    pub stdout: String,
    pub error: Option<SandboxError>,
    pub return_value: Option<Value>,
    pub artifacts: Vec<PathBuf>,
    pub backend_logs: String,
}

impl SandboxResult {
    pub fn failure(kind: ErrorKind, message: impl Into<String>, backend_logs: String) -> Self {
        Self {
            error: Some(SandboxError {
                kind,
                message: message.into(),
            }),
            backend_logs,
            ..Default::default()
        }
    }

    pub fn is_success(&self) -> bool {
        self.error.is_none()
    }

    pub fn error_kind(&self) -> Option<ErrorKind> {
        self.error.as_ref().map(|e| e.kind)
    }
}
