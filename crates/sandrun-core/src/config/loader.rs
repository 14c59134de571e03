//! Configuration loader for YAML files and environment overrides

use std::env;
use std::path::{Path, PathBuf};

use tokio::fs;

use crate::config::types::*;
use crate::errors::EngineError;

pub const ENV_FORCE_WEAK_BACKEND: &str = "FORCE_WEAK_BACKEND";
pub const ENV_MEMORY_LIMIT: &str = "MEMORY_LIMIT";
pub const ENV_WALL_CLOCK_TIMEOUT: &str = "WALL_CLOCK_TIMEOUT";
pub const ENV_CPU_TIME_LIMIT: &str = "CPU_TIME_LIMIT";
pub const ENV_QUERY_STEP_BUDGET: &str = "QUERY_STEP_BUDGET";
pub const ENV_SANDBOX_IMAGE: &str = "SANDBOX_IMAGE";
pub const ENV_SANDBOX_DRIVER_PATH: &str = "SANDBOX_DRIVER_PATH";
pub const ENV_SANDBOX_ARTIFACT_DIR: &str = "SANDBOX_ARTIFACT_DIR";
pub const ENV_SANDBOX_WORKSPACE_ROOT: &str = "SANDBOX_WORKSPACE_ROOT";
pub const ENV_DOCKER_SOCKET: &str = "DOCKER_SOCKET";

pub struct ConfigLoader;

impl ConfigLoader {
    /// Defaults overlaid with the process environment.
    pub fn from_env() -> Result<EngineConfig, EngineError> {
        let mut config = EngineConfig::default();
        Self::apply_env_with(&mut config, |key| env::var(key).ok())?;
        config.validate()?;
        Ok(config)
    }

    /// A YAML file overlaid with the process environment.
    pub async fn from_file<P: AsRef<Path>>(path: P) -> Result<EngineConfig, EngineError> {
        let path = path.as_ref();
        let content = fs::read_to_string(path).await.map_err(|e| {
            EngineError::ConfigError(format!(
                "Failed to read config file {}: {}",
                path.display(),
                e
            ))
        })?;

        let mut config = Self::parse_yaml(&content)?;
        Self::apply_env_with(&mut config, |key| env::var(key).ok())?;
        config.validate()?;
        Ok(config)
    }

    /// Parse YAML without touching the environment.
    pub fn parse_yaml(content: &str) -> Result<EngineConfig, EngineError> {
        if content.trim().is_empty() {
            return Ok(EngineConfig::default());
        }
        serde_yaml::from_str(content)
            .map_err(|e| EngineError::ConfigError(format!("Failed to parse YAML config: {}", e)))
    }

    /// Overlay values from `lookup`, which maps a variable name to its value.
    pub fn apply_env_with<F>(config: &mut EngineConfig, lookup: F) -> Result<(), EngineError>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(value) = lookup(ENV_FORCE_WEAK_BACKEND) {
            config.force_weak_backend = parse_bool(ENV_FORCE_WEAK_BACKEND, &value)?;
        }
        if let Some(value) = lookup(ENV_MEMORY_LIMIT) {
            parse_memory_limit(&value)?;
            config.limits.memory = value;
        }
        if let Some(value) = lookup(ENV_WALL_CLOCK_TIMEOUT) {
            config.limits.wall_clock_seconds = parse_number(ENV_WALL_CLOCK_TIMEOUT, &value)?;
        }
        if let Some(value) = lookup(ENV_CPU_TIME_LIMIT) {
            config.limits.cpu_seconds = Some(parse_number(ENV_CPU_TIME_LIMIT, &value)?);
        }
        if let Some(value) = lookup(ENV_QUERY_STEP_BUDGET) {
            config.query_step_budget = parse_number(ENV_QUERY_STEP_BUDGET, &value)?;
        }
        if let Some(value) = lookup(ENV_SANDBOX_IMAGE) {
            config.docker.image = value;
        }
        if let Some(value) = lookup(ENV_SANDBOX_DRIVER_PATH) {
            config.process.driver_path = Some(PathBuf::from(value));
        }
        if let Some(value) = lookup(ENV_SANDBOX_ARTIFACT_DIR) {
            config.artifact_dir = PathBuf::from(value);
        }
        if let Some(value) = lookup(ENV_SANDBOX_WORKSPACE_ROOT) {
            config.workspace_root = Some(PathBuf::from(value));
        }
        if let Some(value) = lookup(ENV_DOCKER_SOCKET) {
            config.docker.socket = Some(value);
        }
        Ok(())
    }
}

fn parse_bool(name: &str, value: &str) -> Result<bool, EngineError> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "" | "0" | "false" | "no" | "off" => Ok(false),
        _ => Err(EngineError::ConfigError(format!(
            "{} must be a boolean, got '{}'",
            name, value
        ))),
    }
}

fn parse_number(name: &str, value: &str) -> Result<u64, EngineError> {
    value.trim().parse().map_err(|_| {
        EngineError::ConfigError(format!("{} must be an integer, got '{}'", name, value))
    })
}
