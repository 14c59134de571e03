//! Maps the driver's result file into a `SandboxResult`.
//!
//! Fails closed: an unreadable or malformed result file is a `CorruptResult`,
//! never a partial success. Artifacts are copied out of the workspace because
//! the workspace is deleted as soon as the call returns.

use std::fs;
use std::path::{Component, Path, PathBuf};

use uuid::Uuid;

use crate::errors::{EngineError, ErrorKind};
use crate::protocol::{ResultProtocol, RESULT_FILE_NAME};
use crate::result::{SandboxError, SandboxResult};

/// Caller-addressable home for artifacts.
#[derive(Debug, Clone)]
pub struct ArtifactStore {
    dir: PathBuf,
}

impl ArtifactStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    /// Copy `source` into the store under a collision-free name and return
    /// the absolute destination.
    pub fn persist(&self, source: &Path, name: &str) -> Result<PathBuf, EngineError> {
        fs::create_dir_all(&self.dir)?;
        let dest = self.dir.join(format!("{}-{}", Uuid::new_v4(), name));
        fs::copy(source, &dest)?;
        Ok(std::path::absolute(&dest).unwrap_or(dest))
    }
}

pub fn normalize(
    out_dir: &Path,
    backend_logs: String,
    store: &ArtifactStore,
) -> Result<SandboxResult, EngineError> {
    let result_path = out_dir.join(RESULT_FILE_NAME);
    if !result_path.is_file() {
        return Err(EngineError::MissingResult { backend_logs });
    }

    let raw = fs::read(&result_path)
        .map_err(|e| EngineError::CorruptResult(format!("unreadable result file: {}", e)))?;
    let protocol: ResultProtocol = serde_json::from_slice(&raw)
        .map_err(|e| EngineError::CorruptResult(format!("invalid result file: {}", e)))?;

    if let Some(message) = protocol.internal_error() {
        return Err(EngineError::DriverFault {
            message: message.to_string(),
            backend_logs,
        });
    }

    let mut artifacts = Vec::with_capacity(protocol.plots.len());
    for name in &protocol.plots {
        let file_name = plain_file_name(name).ok_or_else(|| {
            EngineError::CorruptResult(format!("artifact '{}' escapes the output directory", name))
        })?;
        let source = out_dir.join(file_name);
        if !source.is_file() {
            log::warn!("Reported artifact '{}' was not found, skipping", name);
            continue;
        }
        artifacts.push(store.persist(&source, file_name)?);
    }

    let error = protocol.has_error().then(|| SandboxError {
        kind: ErrorKind::PayloadFault,
        message: protocol.error.clone(),
    });

    Ok(SandboxResult {
        stdout: protocol.stdout,
        error,
        return_value: protocol.return_obj.filter(|v| !v.is_null()),
        artifacts,
        backend_logs,
    })
}

/// Accept `name` only if it is a bare file name, optionally written as `./name`.
fn plain_file_name(name: &str) -> Option<&str> {
    let mut normal = None;
    for component in Path::new(name).components() {
        match component {
            Component::CurDir => {}
            Component::Normal(part) if normal.is_none() => normal = Some(part),
            _ => return None,
        }
    }
    normal.and_then(|part| part.to_str())
}
