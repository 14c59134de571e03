//! Single entry point for running untrusted payloads.
//!
//! The engine validates a request, applies the pre-dispatch guards and hands
//! it to the backend chosen on first use. The choice is memoized for the
//! engine's lifetime; concurrent first calls share one probe.

use std::path::Path;
use std::sync::Arc;
use std::time::Instant;

use tokio::sync::OnceCell;

use crate::config::EngineConfig;
use crate::errors::{EngineError, ErrorKind};
use crate::executors::{select, SandboxBackend, Selection};
use crate::guard::{validate_read_only, PayloadGuard};
use crate::request::{Limits, Mode, SandboxRequest};
use crate::result::SandboxResult;

pub struct ExecutionEngine {
    config: EngineConfig,
    guard: PayloadGuard,
    selection: OnceCell<Selection>,
}

impl ExecutionEngine {
    pub fn new(config: EngineConfig) -> Result<Self, EngineError> {
        config.validate()?;
        let guard = PayloadGuard::new(&config.payload_guard)?;
        Ok(Self {
            config,
            guard,
            selection: OnceCell::new(),
        })
    }

    /// Skip selection and always use `backend`.
    pub fn with_backend(
        config: EngineConfig,
        backend: Arc<dyn SandboxBackend>,
    ) -> Result<Self, EngineError> {
        let mut engine = Self::new(config)?;
        let selection = Selection {
            kind: backend.kind(),
            backend,
            reason: "backend supplied by caller".to_string(),
        };
        engine.selection = OnceCell::new_with(Some(selection));
        Ok(engine)
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// The backend, selecting it on first call.
    pub async fn backend(&self) -> Result<Arc<dyn SandboxBackend>, EngineError> {
        let selection = self
            .selection
            .get_or_try_init(|| select(&self.config))
            .await?;
        Ok(Arc::clone(&selection.backend))
    }

    /// The memoized choice, if one has been made.
    pub fn selection(&self) -> Option<&Selection> {
        self.selection.get()
    }

    pub async fn execute(
        &self,
        payload: impl Into<String>,
        mode: Mode,
        dataset: impl AsRef<Path>,
        limits: Option<Limits>,
    ) -> Result<SandboxResult, EngineError> {
        let limits = match limits {
            Some(limits) => limits,
            None => self.config.default_limits()?,
        };
        let request = SandboxRequest::new(payload, mode, dataset, limits);
        self.execute_request(&request).await
    }

    pub async fn execute_request(
        &self,
        request: &SandboxRequest,
    ) -> Result<SandboxResult, EngineError> {
        request.validate()?;

        if let Err(reason) = self.pre_dispatch(request) {
            log::info!("Rejected {} payload before dispatch: {}", request.mode, reason);
            return Ok(SandboxResult::failure(
                ErrorKind::Rejected,
                reason,
                String::new(),
            ));
        }

        let backend = self.backend().await?;
        let started = Instant::now();
        let result = backend.execute(request).await;
        match &result {
            Ok(r) => log::debug!(
                "{} execution on {} backend finished in {:?} ({})",
                request.mode,
                backend.kind(),
                started.elapsed(),
                r.error
                    .as_ref()
                    .map(|e| e.kind.to_string())
                    .unwrap_or_else(|| "ok".to_string())
            ),
            Err(e) => log::error!("{} execution failed: {}", request.mode, e),
        }
        result
    }

    /// Like [`execute`](Self::execute), but raised errors come back as an
    /// `EngineFault` inside the result.
    pub async fn try_execute(
        &self,
        payload: impl Into<String>,
        mode: Mode,
        dataset: impl AsRef<Path>,
        limits: Option<Limits>,
    ) -> SandboxResult {
        match self.execute(payload, mode, dataset, limits).await {
            Ok(result) => result,
            Err(e) => {
                let logs = e.backend_logs().unwrap_or_default().to_string();
                SandboxResult::failure(ErrorKind::EngineFault, e.to_string(), logs)
            }
        }
    }

    fn pre_dispatch(&self, request: &SandboxRequest) -> Result<(), String> {
        match request.mode {
            Mode::Query => validate_read_only(&request.payload),
            Mode::Script => self.guard.check(&request.payload),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::executors::BackendKind;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tempfile::NamedTempFile;

    #[derive(Default)]
    struct CountingBackend {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl SandboxBackend for CountingBackend {
        fn kind(&self) -> BackendKind {
            BackendKind::Strong
        }

        async fn execute(&self, request: &SandboxRequest) -> Result<SandboxResult, EngineError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(SandboxResult {
                stdout: request.payload.clone(),
                ..Default::default()
            })
        }
    }

    struct BrokenBackend;

    #[async_trait]
    impl SandboxBackend for BrokenBackend {
        fn kind(&self) -> BackendKind {
            BackendKind::Weak
        }

        async fn execute(&self, _request: &SandboxRequest) -> Result<SandboxResult, EngineError> {
            Err(EngineError::MissingResult {
                backend_logs: "driver vanished".to_string(),
            })
        }
    }

    fn dataset() -> NamedTempFile {
        let file = NamedTempFile::new().unwrap();
        std::fs::write(file.path(), "a\n1\n").unwrap();
        file
    }

    #[tokio::test]
    async fn test_dispatches_to_injected_backend() {
        let backend = Arc::new(CountingBackend::default());
        let engine = ExecutionEngine::with_backend(EngineConfig::default(), backend.clone()).unwrap();
        let data = dataset();

        let result = engine
            .execute("SELECT 1", Mode::Query, data.path(), None)
            .await
            .unwrap();
        assert!(result.is_success());
        assert_eq!(result.stdout, "SELECT 1");
        assert_eq!(backend.calls.load(Ordering::SeqCst), 1);
        assert_eq!(engine.selection().unwrap().kind, BackendKind::Strong);
    }

    #[tokio::test]
    async fn test_rejections_never_reach_backend() {
        let backend = Arc::new(CountingBackend::default());
        let engine = ExecutionEngine::with_backend(EngineConfig::default(), backend.clone()).unwrap();
        let data = dataset();

        let result = engine
            .execute("DROP TABLE data", Mode::Query, data.path(), None)
            .await
            .unwrap();
        assert_eq!(result.error_kind(), Some(ErrorKind::Rejected));

        let result = engine
            .execute("eval(\"1\")", Mode::Script, data.path(), None)
            .await
            .unwrap();
        assert_eq!(result.error_kind(), Some(ErrorKind::Rejected));
        assert_eq!(backend.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_invalid_requests_are_raised() {
        let engine =
            ExecutionEngine::with_backend(EngineConfig::default(), Arc::new(CountingBackend::default()))
                .unwrap();
        let data = dataset();

        let err = engine
            .execute("SELECT 1", Mode::Query, data.path(), Some(Limits::new(1024, 10, 5)))
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::InvalidRequest(_)));

        let err = engine
            .execute("SELECT 1", Mode::Query, "/nonexistent/data.db", None)
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::InvalidRequest(_)));
    }

    #[tokio::test]
    async fn test_try_execute_folds_engine_errors() {
        let engine =
            ExecutionEngine::with_backend(EngineConfig::default(), Arc::new(BrokenBackend)).unwrap();
        let data = dataset();

        let result = engine
            .try_execute("print(1);", Mode::Script, data.path(), None)
            .await;
        assert_eq!(result.error_kind(), Some(ErrorKind::EngineFault));
        assert_eq!(result.backend_logs, "driver vanished");
    }

    #[test]
    fn test_invalid_config_is_refused() {
        let mut config = EngineConfig::default();
        config.query_step_budget = 0;
        assert!(matches!(
            ExecutionEngine::new(config),
            Err(EngineError::ConfigError(_))
        ));
    }
}
