//! The unit of untrusted work handed to a backend.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::errors::EngineError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Mode {
    /// Free-form script evaluated against a tabular dataset.
    Script,
    /// Single read-only query evaluated against a database snapshot.
    Query,
}

impl Mode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Mode::Script => "script",
            Mode::Query => "query",
        }
    }

    /// File name the payload is written to inside a workspace.
    pub fn payload_file_name(&self) -> &'static str {
        match self {
            Mode::Script => "payload.rhai",
            Mode::Query => "payload.sql",
        }
    }

    /// File name the dataset copy gets inside a workspace.
    pub fn dataset_file_name(&self) -> &'static str {
        match self {
            Mode::Script => "data.csv",
            Mode::Query => "data.db",
        }
    }
}

impl std::str::FromStr for Mode {
    type Err = EngineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "script" => Ok(Mode::Script),
            "query" | "sql" => Ok(Mode::Query),
            other => Err(EngineError::InvalidRequest(format!(
                "unknown mode '{}', expected 'script' or 'query'",
                other
            ))),
        }
    }
}

impl std::fmt::Display for Mode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Resource ceilings for one execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Limits {
    pub memory_bytes: u64,
    pub cpu_seconds: u64,
    pub wall_clock_seconds: u64,
}

impl Limits {
    pub fn new(memory_bytes: u64, cpu_seconds: u64, wall_clock_seconds: u64) -> Self {
        Self {
            memory_bytes,
            cpu_seconds,
            wall_clock_seconds,
        }
    }

    /// A process cannot be CPU-bounded past its wall clock, so a request
    /// asking for that is rejected before anything is allocated.
    pub fn validate(&self) -> Result<(), EngineError> {
        if self.memory_bytes == 0 {
            return Err(EngineError::InvalidRequest(
                "memory limit must be greater than zero".to_string(),
            ));
        }
        if self.cpu_seconds == 0 || self.wall_clock_seconds == 0 {
            return Err(EngineError::InvalidRequest(
                "cpu and wall-clock limits must be greater than zero".to_string(),
            ));
        }
        if self.wall_clock_seconds < self.cpu_seconds {
            return Err(EngineError::InvalidRequest(format!(
                "wall-clock limit ({}s) is below the cpu limit ({}s)",
                self.wall_clock_seconds, self.cpu_seconds
            )));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SandboxRequest {
    pub payload: String,
    pub mode: Mode,
    pub dataset_ref: PathBuf,
    pub limits: Limits,
}

impl SandboxRequest {
    pub fn new(
        payload: impl Into<String>,
        mode: Mode,
        dataset_ref: impl AsRef<Path>,
        limits: Limits,
    ) -> Self {
        Self {
            payload: payload.into(),
            mode,
            dataset_ref: dataset_ref.as_ref().to_path_buf(),
            limits,
        }
    }

    pub fn validate(&self) -> Result<(), EngineError> {
        self.limits.validate()?;
        if !self.dataset_ref.is_file() {
            return Err(EngineError::InvalidRequest(format!(
                "dataset {} does not exist or is not a file",
                self.dataset_ref.display()
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::NamedTempFile;

    #[test]
    fn test_wall_clock_must_cover_cpu() {
        let limits = Limits::new(1 << 20, 10, 5);
        let err = limits.validate().unwrap_err();
        assert!(matches!(err, EngineError::InvalidRequest(_)));
        assert!(err.to_string().contains("below the cpu limit"));

        assert!(Limits::new(1 << 20, 5, 5).validate().is_ok());
    }

    #[test]
    fn test_zero_limits_rejected() {
        assert!(Limits::new(0, 1, 1).validate().is_err());
        assert!(Limits::new(1, 0, 1).validate().is_err());
        assert!(Limits::new(1, 1, 0).validate().is_err());
    }

    #[test]
    fn test_missing_dataset_rejected() {
        let req = SandboxRequest::new(
            "print(1);",
            Mode::Script,
            "/definitely/not/here.csv",
            Limits::new(1 << 20, 1, 1),
        );
        assert!(matches!(req.validate(), Err(EngineError::InvalidRequest(_))));

        let file = NamedTempFile::new().unwrap();
        let req = SandboxRequest::new("print(1);", Mode::Script, file.path(), Limits::new(1 << 20, 1, 1));
        assert!(req.validate().is_ok());
    }

    #[test]
    fn test_mode_parsing() {
        assert_eq!("Script".parse::<Mode>().unwrap(), Mode::Script);
        assert_eq!("sql".parse::<Mode>().unwrap(), Mode::Query);
        assert!("python".parse::<Mode>().is_err());
        assert_eq!(Mode::Query.payload_file_name(), "payload.sql");
    }
}
