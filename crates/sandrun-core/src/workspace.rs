//! Ephemeral per-call directory holding the payload, a dataset copy and the
//! driver's output area.
//!
//! A workspace belongs to exactly one `execute` call. Backends call
//! [`Workspace::close`] at their single finalization point; dropping an
//! unclosed workspace still removes it, but without reporting failures.

use std::fs;
use std::path::{Path, PathBuf};

use tempfile::{Builder, TempDir};

use crate::errors::EngineError;
use crate::request::SandboxRequest;

const OUT_DIR_NAME: &str = "out";

#[derive(Debug)]
pub struct Workspace {
    dir: Option<TempDir>,
    root: PathBuf,
    payload_path: PathBuf,
    dataset_path: PathBuf,
    out_dir: PathBuf,
}

impl Workspace {
    /// Copy the dataset, write the payload and create the output directory.
    /// Originals are never handed to the sandbox.
    pub fn materialize(
        request: &SandboxRequest,
        parent: Option<&Path>,
    ) -> Result<Self, EngineError> {
        let mut builder = Builder::new();
        builder.prefix("sandrun-");
        let dir = match parent {
            Some(parent) => {
                fs::create_dir_all(parent)?;
                builder.tempdir_in(parent)?
            }
            None => builder.tempdir()?,
        };
        let root = dir.path().to_path_buf();

        let payload_path = root.join(request.mode.payload_file_name());
        fs::write(&payload_path, request.payload.as_bytes())?;

        let dataset_path = root.join(request.mode.dataset_file_name());
        fs::copy(&request.dataset_ref, &dataset_path).map_err(|e| {
            EngineError::IoError(std::io::Error::new(
                e.kind(),
                format!(
                    "failed to copy dataset {}: {}",
                    request.dataset_ref.display(),
                    e
                ),
            ))
        })?;

        let out_dir = root.join(OUT_DIR_NAME);
        fs::create_dir(&out_dir)?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            // The container runs as an unprivileged uid that must write here.
            fs::set_permissions(&out_dir, fs::Permissions::from_mode(0o777))?;
            fs::set_permissions(&root, fs::Permissions::from_mode(0o755))?;
            fs::set_permissions(&payload_path, fs::Permissions::from_mode(0o644))?;
            fs::set_permissions(&dataset_path, fs::Permissions::from_mode(0o644))?;
        }

        log::debug!("Materialized workspace at {}", root.display());

        Ok(Self {
            dir: Some(dir),
            root,
            payload_path,
            dataset_path,
            out_dir,
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn payload_path(&self) -> &Path {
        &self.payload_path
    }

    pub fn dataset_path(&self) -> &Path {
        &self.dataset_path
    }

    pub fn out_dir(&self) -> &Path {
        &self.out_dir
    }

    /// Remove the workspace recursively. Failure is logged and swallowed so it
    /// never masks the outcome of the execution.
    pub fn close(mut self) {
        if let Some(dir) = self.dir.take() {
            if let Err(e) = dir.close() {
                log::warn!(
                    "Failed to remove workspace {}: {}",
                    self.root.display(),
                    e
                );
            }
        }
    }
}
