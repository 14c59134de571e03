//! Chooses the isolation backend once per engine.
//!
//! Strong isolation is preferred. When it cannot be reached, or when
//! `force_weak_backend` is set, the process backend is used instead and the
//! downgrade is logged as a warning.

use std::future::Future;
use std::sync::Arc;

use super::{BackendKind, DockerBackend, SandboxBackend};
use crate::config::EngineConfig;
use crate::errors::EngineError;

#[derive(Clone)]
pub struct Selection {
    pub backend: Arc<dyn SandboxBackend>,
    pub kind: BackendKind,
    /// Human-readable explanation of the choice.
    pub reason: String,
}

impl std::fmt::Debug for Selection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Selection")
            .field("kind", &self.kind)
            .field("reason", &self.reason)
            .finish()
    }
}

pub async fn select(config: &EngineConfig) -> Result<Selection, EngineError> {
    select_with(config, |config| async move {
        let backend = DockerBackend::connect(&config).await?;
        Ok(Arc::new(backend) as Arc<dyn SandboxBackend>)
    })
    .await
}

/// Like [`select`], with the strong backend built by `strong`.
pub async fn select_with<F, Fut>(config: &EngineConfig, strong: F) -> Result<Selection, EngineError>
where
    F: FnOnce(EngineConfig) -> Fut,
    Fut: Future<Output = Result<Arc<dyn SandboxBackend>, EngineError>>,
{
    let strong_failure = if config.force_weak_backend {
        "strong backend disabled by configuration (FORCE_WEAK_BACKEND)".to_string()
    } else {
        match strong(config.clone()).await {
            Ok(backend) => {
                let reason = format!("container engine reachable, image '{}'", config.docker.image);
                log::info!("Using strong isolation backend: {}", reason);
                return Ok(Selection {
                    kind: backend.kind(),
                    backend,
                    reason,
                });
            }
            Err(e) => e.to_string(),
        }
    };

    weak(config, strong_failure)
}

#[cfg(unix)]
fn weak(config: &EngineConfig, strong_failure: String) -> Result<Selection, EngineError> {
    match super::ProcessBackend::new(config) {
        Ok(backend) => {
            log::warn!(
                "Using weak isolation backend (process with resource limits): {}",
                strong_failure
            );
            Ok(Selection {
                backend: Arc::new(backend),
                kind: BackendKind::Weak,
                reason: strong_failure,
            })
        }
        Err(e) => Err(EngineError::BackendUnavailable(format!(
            "{}; weak backend: {}",
            strong_failure, e
        ))),
    }
}

#[cfg(not(unix))]
fn weak(_config: &EngineConfig, strong_failure: String) -> Result<Selection, EngineError> {
    Err(EngineError::BackendUnavailable(format!(
        "{}; weak backend requires a unix host",
        strong_failure
    )))
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::request::SandboxRequest;
    use crate::result::SandboxResult;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicBool, Ordering};
    use tempfile::tempdir;

    struct StubStrong;

    #[async_trait]
    impl SandboxBackend for StubStrong {
        fn kind(&self) -> BackendKind {
            BackendKind::Strong
        }

        async fn execute(&self, _request: &SandboxRequest) -> Result<SandboxResult, EngineError> {
            Ok(SandboxResult::default())
        }
    }

    fn config_with_driver(dir: &std::path::Path) -> EngineConfig {
        let driver = dir.join("driver");
        std::fs::write(&driver, "#!/bin/sh\nexit 0\n").unwrap();
        let mut config = EngineConfig::default();
        config.process.driver_path = Some(driver);
        config
    }

    #[tokio::test]
    async fn test_prefers_strong() {
        let dir = tempdir().unwrap();
        let config = config_with_driver(dir.path());
        let selection = select_with(&config, |_| async {
            Ok(Arc::new(StubStrong) as Arc<dyn SandboxBackend>)
        })
        .await
        .unwrap();
        assert_eq!(selection.kind, BackendKind::Strong);
    }

    #[tokio::test]
    async fn test_falls_back_when_strong_fails() {
        let dir = tempdir().unwrap();
        let config = config_with_driver(dir.path());
        let selection = select_with(&config, |_| async {
            Err(EngineError::BackendUnavailable("daemon not running".into()))
        })
        .await
        .unwrap();
        assert_eq!(selection.kind, BackendKind::Weak);
        assert!(selection.reason.contains("daemon not running"));
    }

    #[tokio::test]
    async fn test_force_weak_skips_probe() {
        let dir = tempdir().unwrap();
        let mut config = config_with_driver(dir.path());
        config.force_weak_backend = true;
        let probed = AtomicBool::new(false);
        let selection = select_with(&config, |_| {
            probed.store(true, Ordering::SeqCst);
            async { Ok(Arc::new(StubStrong) as Arc<dyn SandboxBackend>) }
        })
        .await
        .unwrap();
        assert_eq!(selection.kind, BackendKind::Weak);
        assert!(!probed.load(Ordering::SeqCst));
        assert!(selection.reason.contains("FORCE_WEAK_BACKEND"));
    }

    #[tokio::test]
    async fn test_both_unavailable() {
        let dir = tempdir().unwrap();
        let mut config = EngineConfig::default();
        config.process.driver_path = Some(dir.path().join("missing-driver"));
        let err = select_with(&config, |_| async {
            Err(EngineError::BackendUnavailable("no docker".into()))
        })
        .await
        .unwrap_err();
        match err {
            EngineError::BackendUnavailable(message) => {
                assert!(message.contains("no docker"));
                assert!(message.contains("missing-driver"));
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }
}
