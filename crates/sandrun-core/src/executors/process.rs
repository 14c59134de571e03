// src/executors/process.rs
//
// Degraded isolation: the driver runs as a child process with OS resource
// limits, a scrubbed environment and a watchdog. There is no network or
// filesystem confinement beyond what the driver itself enforces.

use async_trait::async_trait;
use nix::sys::resource::{setrlimit, Resource};
use nix::sys::signal::{killpg, Signal};
use nix::unistd::{setsid, Pid};
use std::os::unix::process::ExitStatusExt;
use std::path::PathBuf;
use std::process::{ExitStatus, Stdio};
use std::time::Duration;
use tokio::process::Command;
use tokio::task::JoinHandle;

use super::{BackendKind, SandboxBackend};
use crate::config::EngineConfig;
use crate::errors::{EngineError, ErrorKind};
use crate::normalizer::{normalize, ArtifactStore};
use crate::output::drain;
use crate::protocol::{
    ENV_DATASET, ENV_DRIVER_LOG, ENV_MODE, ENV_OUT_DIR, ENV_PAYLOAD, ENV_QUERY_STEP_BUDGET,
};
use crate::request::{Limits, SandboxRequest};
use crate::result::SandboxResult;
use crate::workspace::Workspace;

pub const DRIVER_BINARY: &str = "sandrun-driver";
const SAFE_PATH: &str = "/usr/bin:/bin";
const DRAIN_GRACE: Duration = Duration::from_secs(2);

pub struct ProcessBackend {
    driver: PathBuf,
    config: EngineConfig,
    store: ArtifactStore,
}

/// Locate the driver: configured path, next to the running executable, then
/// on PATH.
pub fn resolve_driver(config: &EngineConfig) -> Result<PathBuf, EngineError> {
    if let Some(path) = &config.process.driver_path {
        if path.is_file() {
            return Ok(path.clone());
        }
        return Err(EngineError::BackendUnavailable(format!(
            "configured driver {} does not exist",
            path.display()
        )));
    }

    if let Ok(exe) = std::env::current_exe() {
        let mut dir = exe.parent();
        // Test binaries live one level down, in target/<profile>/deps.
        for _ in 0..2 {
            let Some(current) = dir else { break };
            let candidate = current.join(DRIVER_BINARY);
            if candidate.is_file() {
                return Ok(candidate);
            }
            dir = current.parent();
        }
    }

    which::which(DRIVER_BINARY).map_err(|e| {
        EngineError::BackendUnavailable(format!(
            "{} not found next to the executable or on PATH: {}",
            DRIVER_BINARY, e
        ))
    })
}

impl ProcessBackend {
    pub fn new(config: &EngineConfig) -> Result<Self, EngineError> {
        let driver = resolve_driver(config)?;
        log::debug!("Weak backend uses driver {}", driver.display());
        Ok(Self {
            driver,
            config: config.clone(),
            store: ArtifactStore::new(config.artifact_dir.clone()),
        })
    }

    fn command(&self, workspace: &Workspace, request: &SandboxRequest) -> Command {
        let mut cmd = Command::new(&self.driver);
        cmd.env_clear()
            .env("PATH", SAFE_PATH)
            .env(ENV_MODE, request.mode.as_str())
            .env(ENV_PAYLOAD, workspace.payload_path())
            .env(ENV_DATASET, workspace.dataset_path())
            .env(ENV_OUT_DIR, workspace.out_dir())
            .env(ENV_QUERY_STEP_BUDGET, self.config.query_step_budget.to_string())
            .current_dir(workspace.root())
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Ok(level) = std::env::var(ENV_DRIVER_LOG) {
            cmd.env(ENV_DRIVER_LOG, level);
        }

        let limits = request.limits;
        let max_open_files = self.config.process.max_open_files;
        // SAFETY: runs in the forked child before exec and only calls
        // async-signal-safe functions on copied values.
        unsafe {
            cmd.pre_exec(move || {
                setsid()?;
                apply_limits(&limits, max_open_files)?;
                Ok(())
            });
        }
        cmd
    }

    async fn run_driver(
        &self,
        workspace: &Workspace,
        request: &SandboxRequest,
    ) -> Result<SandboxResult, EngineError> {
        let limits = &request.limits;
        let mut child = self.command(workspace, request).spawn().map_err(|e| {
            EngineError::BackendUnavailable(format!(
                "failed to spawn driver {}: {}",
                self.driver.display(),
                e
            ))
        })?;
        let pid = child.id();

        let max_log_bytes = self.config.max_log_bytes;
        let stdout_task = child
            .stdout
            .take()
            .map(|out| tokio::spawn(drain(out, max_log_bytes)));
        let stderr_task = child
            .stderr
            .take()
            .map(|err| tokio::spawn(drain(err, max_log_bytes)));

        let deadline = Duration::from_secs(
            limits
                .wall_clock_seconds
                .saturating_add(self.config.grace_seconds),
        );
        let waited = tokio::select! {
            status = child.wait() => Some(status?),
            _ = tokio::time::sleep(deadline) => None,
        };

        let status = match waited {
            Some(status) => status,
            None => {
                log::warn!(
                    "Driver exceeded {}s wall clock, killing pid {:?}",
                    limits.wall_clock_seconds,
                    pid
                );
                if let Some(pid) = pid {
                    if let Err(e) = killpg(Pid::from_raw(pid as i32), Signal::SIGKILL) {
                        log::debug!("killpg({}) failed: {}", pid, e);
                    }
                }
                if let Err(e) = child.start_kill() {
                    log::debug!("start_kill failed: {}", e);
                }
                let _ = child.wait().await;
                let backend_logs = join_logs(stderr_task, stdout_task, max_log_bytes).await;
                return Ok(SandboxResult::failure(
                    ErrorKind::Timeout,
                    format!(
                        "execution exceeded the wall-clock limit of {}s",
                        limits.wall_clock_seconds
                    ),
                    backend_logs,
                ));
            }
        };

        let backend_logs = join_logs(stderr_task, stdout_task, max_log_bytes).await;

        if let Some(message) = classify_signal(&status, limits) {
            return Ok(SandboxResult::failure(
                ErrorKind::ResourceExceeded,
                message,
                backend_logs,
            ));
        }
        if !status.success() {
            log::debug!("Driver exited with {}", status);
        }

        normalize(workspace.out_dir(), backend_logs, &self.store)
    }
}

fn apply_limits(limits: &Limits, max_open_files: u64) -> Result<(), nix::Error> {
    setrlimit(Resource::RLIMIT_AS, limits.memory_bytes, limits.memory_bytes)?;
    setrlimit(
        Resource::RLIMIT_CPU,
        limits.cpu_seconds,
        limits.cpu_seconds.saturating_add(1),
    )?;
    setrlimit(Resource::RLIMIT_CORE, 0, 0)?;
    setrlimit(Resource::RLIMIT_NOFILE, max_open_files, max_open_files)?;
    setrlimit(Resource::RLIMIT_FSIZE, limits.memory_bytes, limits.memory_bytes)?;
    Ok(())
}

/// Map a fatal signal to the ceiling it most likely came from. The watchdog
/// handles its own kills before this is consulted.
fn classify_signal(status: &ExitStatus, limits: &Limits) -> Option<String> {
    let signal = Signal::try_from(status.signal()?).ok()?;
    let message = match signal {
        Signal::SIGXCPU => format!(
            "execution exceeded the CPU-time limit of {}s",
            limits.cpu_seconds
        ),
        Signal::SIGKILL => format!(
            "execution was killed, likely for exceeding the CPU-time limit of {}s or the memory limit of {} bytes",
            limits.cpu_seconds, limits.memory_bytes
        ),
        Signal::SIGXFSZ => format!(
            "execution exceeded the file-size limit of {} bytes",
            limits.memory_bytes
        ),
        Signal::SIGSEGV | Signal::SIGABRT | Signal::SIGBUS => format!(
            "execution exceeded the memory limit of {} bytes ({})",
            limits.memory_bytes,
            signal.as_str()
        ),
        _ => return None,
    };
    Some(message)
}

async fn join_logs(
    stderr_task: Option<JoinHandle<String>>,
    stdout_task: Option<JoinHandle<String>>,
    limit: usize,
) -> String {
    let mut parts = Vec::new();
    for task in [stderr_task, stdout_task].into_iter().flatten() {
        match tokio::time::timeout(DRAIN_GRACE, task).await {
            Ok(Ok(text)) if !text.is_empty() => parts.push(text),
            Ok(Ok(_)) => {}
            Ok(Err(e)) => log::debug!("Output reader failed: {}", e),
            Err(_) => log::debug!("Output reader did not finish in time"),
        }
    }
    let mut joined = parts.join("\n");
    if joined.len() > limit {
        let mut cut = limit;
        while !joined.is_char_boundary(cut) {
            cut -= 1;
        }
        joined.truncate(cut);
    }
    joined
}

#[async_trait]
impl SandboxBackend for ProcessBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Weak
    }

    async fn execute(&self, request: &SandboxRequest) -> Result<SandboxResult, EngineError> {
        let workspace =
            Workspace::materialize(request, self.config.workspace_root.as_deref())?;
        let outcome = self.run_driver(&workspace, request).await;
        workspace.close();
        outcome
    }
}
