//! Configuration module for the execution engine
//!
//! Configuration comes from an optional YAML file and the environment-style
//! options the engine recognizes (`FORCE_WEAK_BACKEND`, `MEMORY_LIMIT`,
//! `WALL_CLOCK_TIMEOUT`, `QUERY_STEP_BUDGET`, ...). The environment wins.

pub mod loader;
pub mod types;

pub use loader::*;
pub use types::*;


use crate::errors::EngineError;
use std::path::Path;

/// Load a configuration from a YAML file
pub async fn load_config<P: AsRef<Path>>(path: P) -> Result<EngineConfig, EngineError> {
    ConfigLoader::from_file(path).await
}
