//! Sandboxed execution of untrusted scripts and read-only queries.
//!
//! An [`ExecutionEngine`] runs generated payloads against a dataset under
//! memory, CPU-time and wall-clock ceilings and returns a uniform
//! [`SandboxResult`]. Payload failures are reported inside the result;
//! only failures of the sandbox itself are raised as [`EngineError`].
//!
//! # Architecture Overview
//!
//! - **Backends**: container isolation through Docker, with a child-process
//!   fallback governed by OS resource limits
//! - **Driver**: the program run inside either backend; evaluates Rhai
//!   scripts or SQLite queries and writes a result file
//! - **Normalizer**: turns the result file into a `SandboxResult` and copies
//!   artifacts to a caller-visible store
//! - **Guards**: pre-dispatch checks that refuse write queries and banned
//!   script constructs
//! - **Configuration**: YAML file plus environment overrides

pub mod config;
pub mod dataset;
pub mod driver;
pub mod engine;
pub mod errors;
pub mod executors;
pub mod guard;
pub mod normalizer;
pub mod output;
pub mod protocol;
pub mod request;
pub mod result;
pub mod workspace;

pub use config::{ConfigLoader, EngineConfig};
pub use engine::ExecutionEngine;
pub use errors::{DatasetError, EngineError, ErrorKind};
pub use executors::{BackendKind, SandboxBackend, Selection};
pub use request::{Limits, Mode, SandboxRequest};
pub use result::{SandboxError, SandboxResult};
