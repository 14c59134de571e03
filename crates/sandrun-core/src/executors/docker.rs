// src/executors/docker.rs
use async_trait::async_trait;
use bollard::container::LogOutput;
use bollard::models::{ContainerCreateBody, HostConfig, ResourcesUlimits};
use bollard::query_parameters::{
    CreateContainerOptions, InspectContainerOptions, KillContainerOptions, LogsOptions,
    RemoveContainerOptions, StartContainerOptions, WaitContainerOptions,
};
use bollard::Docker;
use futures_util::stream::StreamExt;
use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;
use uuid::Uuid;

use super::{BackendKind, SandboxBackend};
use crate::config::EngineConfig;
use crate::errors::{EngineError, ErrorKind};
use crate::normalizer::{normalize, ArtifactStore};
use crate::output::BoundedBuffer;
use crate::protocol::{
    ENV_DATASET, ENV_MODE, ENV_OUT_DIR, ENV_PAYLOAD, ENV_QUERY_STEP_BUDGET,
};
use crate::request::{Limits, Mode, SandboxRequest};
use crate::result::SandboxResult;
use crate::workspace::Workspace;

const SESSION_MOUNT: &str = "/workspace/session";
const OUT_MOUNT: &str = "/workspace/out";
const OOM_EXIT_CODE: i64 = 137;
// 128 + SIGXCPU
const CPU_LIMIT_EXIT_CODE: i64 = 152;

pub struct DockerBackend {
    docker: Docker,
    config: EngineConfig,
    store: ArtifactStore,
}

/// How the container stopped, before the result file is looked at.
#[derive(Debug)]
enum Termination {
    Exited(i64),
    TimedOut,
}

impl DockerBackend {
    /// Connect and probe. Any failure means the strong backend is unusable.
    pub async fn connect(config: &EngineConfig) -> Result<Self, EngineError> {
        let docker = match &config.docker.socket {
            Some(socket) => Docker::connect_with_unix(
                socket,
                config.docker.connect_timeout_seconds,
                bollard::API_DEFAULT_VERSION,
            ),
            None => Docker::connect_with_local_defaults(),
        }
        .map_err(|e| EngineError::BackendUnavailable(format!("cannot reach Docker: {}", e)))?;

        let probe = tokio::time::timeout(
            Duration::from_secs(config.docker.connect_timeout_seconds),
            docker.ping(),
        )
        .await;
        match probe {
            Ok(Ok(_)) => {}
            Ok(Err(e)) => {
                return Err(EngineError::BackendUnavailable(format!(
                    "Docker did not answer ping: {}",
                    e
                )))
            }
            Err(_) => {
                return Err(EngineError::BackendUnavailable(format!(
                    "Docker ping timed out after {}s",
                    config.docker.connect_timeout_seconds
                )))
            }
        }

        docker
            .inspect_image(&config.docker.image)
            .await
            .map_err(|e| {
                EngineError::BackendUnavailable(format!(
                    "sandbox image '{}' is not available: {}",
                    config.docker.image, e
                ))
            })?;

        Ok(Self {
            docker,
            config: config.clone(),
            store: ArtifactStore::new(config.artifact_dir.clone()),
        })
    }

    async fn run_container(
        &self,
        id: &str,
        workspace: &Workspace,
        limits: &Limits,
    ) -> Result<SandboxResult, EngineError> {
        self.docker
            .start_container(id, None::<StartContainerOptions>)
            .await
            .map_err(|e| {
                EngineError::BackendUnavailable(format!("failed to start container: {}", e))
            })?;

        let mut wait_stream = self.docker.wait_container(id, None::<WaitContainerOptions>);
        let timeout_future = tokio::time::sleep(Duration::from_secs(limits.wall_clock_seconds));

        let termination = tokio::select! {
            res = wait_stream.next() => match res {
                Some(Ok(response)) => Termination::Exited(response.status_code),
                Some(Err(bollard::errors::Error::DockerContainerWaitError { code, .. })) => {
                    Termination::Exited(code)
                }
                Some(Err(e)) => return Err(EngineError::DockerError(e)),
                None => {
                    return Err(EngineError::BackendUnavailable(
                        "container wait stream ended unexpectedly".to_string(),
                    ))
                }
            },
            _ = timeout_future => {
                log::warn!("Execution timed out for container {}", id);
                if let Err(e) = self
                    .docker
                    .kill_container(
                        id,
                        Some(KillContainerOptions {
                            signal: "KILL".to_string(),
                            ..Default::default()
                        }),
                    )
                    .await
                {
                    log::debug!("Kill after timeout failed for {}: {}", id, e);
                }
                Termination::TimedOut
            }
        };

        let backend_logs = self.collect_logs(id).await;

        let exit_code = match termination {
            Termination::TimedOut => {
                return Ok(SandboxResult::failure(
                    ErrorKind::Timeout,
                    format!(
                        "execution exceeded the wall-clock limit of {}s",
                        limits.wall_clock_seconds
                    ),
                    backend_logs,
                ))
            }
            Termination::Exited(code) => code,
        };

        let oom_killed = match self
            .docker
            .inspect_container(id, None::<InspectContainerOptions>)
            .await
        {
            Ok(info) => info.state.and_then(|s| s.oom_killed).unwrap_or(false),
            Err(e) => {
                log::debug!("Could not inspect container {}: {}", id, e);
                false
            }
        };
        if let Some(message) = resource_violation(exit_code, oom_killed, limits) {
            return Ok(SandboxResult::failure(
                ErrorKind::ResourceExceeded,
                message,
                backend_logs,
            ));
        }
        if exit_code != 0 {
            log::debug!("Container {} exited with code {}", id, exit_code);
        }

        normalize(workspace.out_dir(), backend_logs, &self.store)
    }

    async fn collect_logs(&self, id: &str) -> String {
        let mut buffer = BoundedBuffer::new(self.config.max_log_bytes);
        let mut output_stream = self.docker.logs(
            id,
            Some(LogsOptions {
                stdout: true,
                stderr: true,
                ..Default::default()
            }),
        );
        while let Some(log_result) = output_stream.next().await {
            match log_result {
                Ok(LogOutput::StdOut { message }) | Ok(LogOutput::StdErr { message }) => {
                    buffer.push(&message)
                }
                Ok(_) => {}
                Err(e) => {
                    log::debug!("Stopped reading logs of {}: {}", id, e);
                    break;
                }
            }
        }
        if buffer.is_truncated() {
            log::warn!(
                "Logs of {} exceeded {} bytes and were truncated",
                id,
                self.config.max_log_bytes
            );
        }
        buffer.into_string()
    }

    async fn remove(&self, id: &str) {
        let options = RemoveContainerOptions {
            force: true,
            ..Default::default()
        };
        if let Err(e) = self.docker.remove_container(id, Some(options)).await {
            log::warn!("Failed to remove container {}: {}", id, e);
        }
    }
}

fn resource_violation(exit_code: i64, oom_killed: bool, limits: &Limits) -> Option<String> {
    if oom_killed || exit_code == OOM_EXIT_CODE {
        Some(format!(
            "execution exceeded the memory limit of {} bytes",
            limits.memory_bytes
        ))
    } else if exit_code == CPU_LIMIT_EXIT_CODE {
        Some(format!(
            "execution exceeded the CPU-time limit of {}s",
            limits.cpu_seconds
        ))
    } else {
        None
    }
}

fn clamp_i64(value: u64) -> i64 {
    i64::try_from(value).unwrap_or(i64::MAX)
}

/// Container definition for one request. The session mount is read-only in
/// query mode.
fn container_body(
    config: &EngineConfig,
    request: &SandboxRequest,
    workspace_root: &Path,
    out_dir: &Path,
) -> ContainerCreateBody {
    let limits = &request.limits;
    let session_access = match request.mode {
        Mode::Script => "rw",
        Mode::Query => "ro",
    };
    let env = vec![
        format!("{}={}", ENV_MODE, request.mode),
        format!(
            "{}={}/{}",
            ENV_PAYLOAD,
            SESSION_MOUNT,
            request.mode.payload_file_name()
        ),
        format!(
            "{}={}/{}",
            ENV_DATASET,
            SESSION_MOUNT,
            request.mode.dataset_file_name()
        ),
        format!("{}={}", ENV_OUT_DIR, OUT_MOUNT),
        format!("{}={}", ENV_QUERY_STEP_BUDGET, config.query_step_budget),
    ];
    let ulimit = |name: &str, soft: i64, hard: i64| ResourcesUlimits {
        name: Some(name.to_string()),
        soft: Some(soft),
        hard: Some(hard),
    };
    let cpu = clamp_i64(limits.cpu_seconds);
    let nofile = clamp_i64(config.process.max_open_files);

    ContainerCreateBody {
        image: Some(config.docker.image.clone()),
        cmd: Some(vec![config.docker.driver_path.clone()]),
        env: Some(env),
        user: Some(config.docker.user.clone()),
        working_dir: Some(SESSION_MOUNT.to_string()),
        network_disabled: Some(true),
        attach_stdout: Some(true),
        attach_stderr: Some(true),
        host_config: Some(HostConfig {
            binds: Some(vec![
                format!(
                    "{}:{}:{}",
                    workspace_root.display(),
                    SESSION_MOUNT,
                    session_access
                ),
                format!("{}:{}:rw", out_dir.display(), OUT_MOUNT),
            ]),
            network_mode: Some("none".to_string()),
            memory: Some(clamp_i64(limits.memory_bytes)),
            memory_swap: Some(clamp_i64(limits.memory_bytes)),
            nano_cpus: Some((config.docker.cpus * 1_000_000_000.0) as i64),
            pids_limit: Some(config.docker.pids_limit),
            cap_drop: Some(vec!["ALL".to_string()]),
            security_opt: Some(vec!["no-new-privileges".to_string()]),
            readonly_rootfs: Some(true),
            tmpfs: Some(HashMap::from([(
                "/tmp".to_string(),
                "rw,noexec,nosuid,size=16m".to_string(),
            )])),
            ulimits: Some(vec![
                ulimit("cpu", cpu, cpu.saturating_add(1)),
                ulimit("core", 0, 0),
                ulimit("nofile", nofile, nofile),
            ]),
            ..Default::default()
        }),
        ..Default::default()
    }
}

#[async_trait]
impl SandboxBackend for DockerBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Strong
    }

    async fn execute(&self, request: &SandboxRequest) -> Result<SandboxResult, EngineError> {
        let workspace =
            Workspace::materialize(request, self.config.workspace_root.as_deref())?;
        let root = std::path::absolute(workspace.root())?;
        let out_dir = std::path::absolute(workspace.out_dir())?;

        let options = Some(CreateContainerOptions {
            name: Some(format!("sandrun-{}", Uuid::new_v4())),
            ..Default::default()
        });
        let body = container_body(&self.config, request, &root, &out_dir);

        let id = match self.docker.create_container(options, body).await {
            Ok(created) => created.id,
            Err(e) => {
                workspace.close();
                return Err(EngineError::BackendUnavailable(format!(
                    "failed to create container: {}",
                    e
                )));
            }
        };
        log::debug!("Created container {} for {} request", id, request.mode);

        let outcome = self.run_container(&id, &workspace, &request.limits).await;

        self.remove(&id).await;
        workspace.close();
        outcome
    }
}
