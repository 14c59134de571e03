//! Configuration type definitions for the execution engine
//!
//! Every field carries a default so an empty YAML document, or no file at
//! all, yields a working configuration. Environment variables are layered on
//! top by `ConfigLoader`.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

use crate::errors::EngineError;
use crate::request::Limits;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Skip strong-backend probing entirely.
    #[serde(default)]
    pub force_weak_backend: bool,
    #[serde(default)]
    pub limits: LimitsConfig,
    #[serde(default = "default_query_step_budget")]
    pub query_step_budget: u64,
    /// Extra seconds the weak backend's watchdog waits past the wall clock.
    #[serde(default = "default_grace_seconds")]
    pub grace_seconds: u64,
    /// Upper bound on captured backend logs, in bytes.
    #[serde(default = "default_max_log_bytes")]
    pub max_log_bytes: usize,
    /// Where artifacts are copied so they outlive the workspace.
    #[serde(default = "default_artifact_dir")]
    pub artifact_dir: PathBuf,
    /// Parent directory for workspaces. System temp dir when unset.
    #[serde(default)]
    pub workspace_root: Option<PathBuf>,
    /// Regex patterns that reject a script before dispatch.
    #[serde(default = "default_payload_guard")]
    pub payload_guard: Vec<String>,
    #[serde(default)]
    pub docker: DockerConfig,
    #[serde(default)]
    pub process: ProcessConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LimitsConfig {
    /// Memory ceiling, e.g. "2g" or "512m".
    #[serde(default = "default_memory_limit")]
    pub memory: String,
    /// CPU-time ceiling. Defaults to the wall clock.
    #[serde(default)]
    pub cpu_seconds: Option<u64>,
    #[serde(default = "default_wall_clock_seconds")]
    pub wall_clock_seconds: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DockerConfig {
    #[serde(default = "default_image")]
    pub image: String,
    /// Unix socket of the engine. Local defaults (DOCKER_HOST) when unset.
    #[serde(default)]
    pub socket: Option<String>,
    #[serde(default = "default_container_user")]
    pub user: String,
    /// CPU share given to the container, in CPUs.
    #[serde(default = "default_cpus")]
    pub cpus: f64,
    #[serde(default = "default_pids_limit")]
    pub pids_limit: i64,
    #[serde(default = "default_driver_in_container")]
    pub driver_path: String,
    /// Seconds to wait for the engine to answer the availability probe.
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_seconds: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProcessConfig {
    /// Driver binary for the weak backend. Looked up next to the current
    /// executable and then on PATH when unset.
    #[serde(default)]
    pub driver_path: Option<PathBuf>,
    #[serde(default = "default_max_open_files")]
    pub max_open_files: u64,
}

fn default_query_step_budget() -> u64 {
    100_000
}

fn default_grace_seconds() -> u64 {
    2
}

fn default_max_log_bytes() -> usize {
    64 * 1024
}

fn default_artifact_dir() -> PathBuf {
    PathBuf::from("exports/plots")
}

fn default_payload_guard() -> Vec<String> {
    vec![r"\beval\s*\(".to_string(), r"(?m)^\s*import\b".to_string()]
}

fn default_memory_limit() -> String {
    "2g".to_string()
}

fn default_wall_clock_seconds() -> u64 {
    120
}

fn default_image() -> String {
    "sandrun-sandbox:latest".to_string()
}

fn default_container_user() -> String {
    "65534:65534".to_string()
}

fn default_cpus() -> f64 {
    1.0
}

fn default_pids_limit() -> i64 {
    64
}

fn default_driver_in_container() -> String {
    "/usr/local/bin/sandrun-driver".to_string()
}

fn default_connect_timeout() -> u64 {
    5
}

fn default_max_open_files() -> u64 {
    64
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            force_weak_backend: false,
            limits: LimitsConfig::default(),
            query_step_budget: default_query_step_budget(),
            grace_seconds: default_grace_seconds(),
            max_log_bytes: default_max_log_bytes(),
            artifact_dir: default_artifact_dir(),
            workspace_root: None,
            payload_guard: default_payload_guard(),
            docker: DockerConfig::default(),
            process: ProcessConfig::default(),
        }
    }
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            memory: default_memory_limit(),
            cpu_seconds: None,
            wall_clock_seconds: default_wall_clock_seconds(),
        }
    }
}

impl Default for DockerConfig {
    fn default() -> Self {
        Self {
            image: default_image(),
            socket: None,
            user: default_container_user(),
            cpus: default_cpus(),
            pids_limit: default_pids_limit(),
            driver_path: default_driver_in_container(),
            connect_timeout_seconds: default_connect_timeout(),
        }
    }
}

impl Default for ProcessConfig {
    fn default() -> Self {
        Self {
            driver_path: None,
            max_open_files: default_max_open_files(),
        }
    }
}

impl EngineConfig {
    /// Per-call limits used when a request does not carry its own.
    pub fn default_limits(&self) -> Result<Limits, EngineError> {
        let memory_bytes = parse_memory_limit(&self.limits.memory)?;
        let wall = self.limits.wall_clock_seconds;
        let cpu = self.limits.cpu_seconds.unwrap_or(wall);
        Ok(Limits::new(memory_bytes, cpu, wall))
    }

    pub fn validate(&self) -> Result<(), EngineError> {
        self.default_limits()?
            .validate()
            .map_err(|e| EngineError::ConfigError(format!("default limits: {}", e)))?;

        if self.query_step_budget == 0 {
            return Err(EngineError::ConfigError(
                "query_step_budget must be greater than zero".to_string(),
            ));
        }
        if self.docker.image.trim().is_empty() {
            return Err(EngineError::ConfigError(
                "docker.image must not be empty".to_string(),
            ));
        }
        if !(self.docker.cpus > 0.0) {
            return Err(EngineError::ConfigError(
                "docker.cpus must be greater than zero".to_string(),
            ));
        }
        for pattern in &self.payload_guard {
            regex::Regex::new(pattern).map_err(|e| {
                EngineError::ConfigError(format!("invalid payload_guard pattern '{}': {}", pattern, e))
            })?;
        }
        Ok(())
    }
}

/// Parse a docker-style memory size: "2g", "512m", "64k", "1.5g" or plain bytes.
pub fn parse_memory_limit(value: &str) -> Result<u64, EngineError> {
    let trimmed = value.trim().to_ascii_lowercase();
    let trimmed = trimmed.strip_suffix('b').unwrap_or(&trimmed);
    let (number, multiplier) = match trimmed.chars().last() {
        Some('k') => (&trimmed[..trimmed.len() - 1], 1024u64),
        Some('m') => (&trimmed[..trimmed.len() - 1], 1024 * 1024),
        Some('g') => (&trimmed[..trimmed.len() - 1], 1024 * 1024 * 1024),
        Some(c) if c.is_ascii_digit() => (trimmed, 1),
        _ => {
            return Err(EngineError::ConfigError(format!(
                "invalid memory limit '{}'",
                value
            )))
        }
    };

    let amount: f64 = number.trim().parse().map_err(|_| {
        EngineError::ConfigError(format!("invalid memory limit '{}'", value))
    })?;
    if !amount.is_finite() || amount <= 0.0 {
        return Err(EngineError::ConfigError(format!(
            "memory limit '{}' must be positive",
            value
        )));
    }
    Ok((amount * multiplier as f64) as u64)
}
