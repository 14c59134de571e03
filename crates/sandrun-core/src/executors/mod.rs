//! Isolation backends.
//!
//! Each backend materializes a workspace, runs the driver under its own
//! isolation layer, enforces the wall clock and hands the output directory
//! to the normalizer. Callers never see which backend produced a result
//! except through `SandboxResult::backend_logs`.

use async_trait::async_trait;

use crate::errors::EngineError;
use crate::request::SandboxRequest;
use crate::result::SandboxResult;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackendKind {
    /// Container-based isolation.
    Strong,
    /// Child process with OS resource limits.
    Weak,
}

impl std::fmt::Display for BackendKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BackendKind::Strong => f.write_str("strong (container)"),
            BackendKind::Weak => f.write_str("weak (process)"),
        }
    }
}

#[async_trait]
pub trait SandboxBackend: Send + Sync {
    fn kind(&self) -> BackendKind;

    /// Run one validated request. Payload failures come back inside the
    /// result; only sandbox breakage is an `Err`.
    async fn execute(&self, request: &SandboxRequest) -> Result<SandboxResult, EngineError>;
}

pub mod docker;
#[cfg(unix)]
pub mod process;
pub mod selector;

pub use docker::DockerBackend;
#[cfg(unix)]
pub use process::ProcessBackend;
pub use selector::{select, select_with, Selection};
