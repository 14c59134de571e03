//! Driver program logic, run inside whichever isolation layer was selected.
//!
//! The driver reads its inputs from `SANDRUN_*` environment variables, runs
//! the payload and always tries to leave a result file behind. Setup problems
//! are reported through the file's `error` field rather than an exit code so
//! the engine sees one shape of outcome.

pub mod query;
pub mod script;

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use crate::dataset::Table;
use crate::protocol::{
    ResultProtocol, ENV_DATASET, ENV_MODE, ENV_OUT_DIR, ENV_PAYLOAD, ENV_QUERY_STEP_BUDGET,
    RESULT_FILE_NAME,
};
use crate::request::Mode;

pub use query::{run_query, ProgressHook, QueryExecutor, StepBudget};
pub use script::run_script;

const DEFAULT_STEP_BUDGET: u64 = 100_000;

#[derive(Debug, Clone, PartialEq)]
pub struct DriverInput {
    pub mode: Mode,
    pub payload_path: PathBuf,
    pub dataset_path: PathBuf,
    pub out_dir: PathBuf,
    pub query_step_budget: u64,
}

impl DriverInput {
    pub fn from_env() -> Result<Self, String> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> Result<Self, String>
    where
        F: Fn(&str) -> Option<String>,
    {
        let required = |key: &str| {
            lookup(key)
                .filter(|v| !v.is_empty())
                .ok_or_else(|| format!("{} is not set", key))
        };

        let mode = required(ENV_MODE)?
            .parse::<Mode>()
            .map_err(|e| format!("{}: {}", ENV_MODE, e))?;
        let query_step_budget = match lookup(ENV_QUERY_STEP_BUDGET) {
            Some(raw) if !raw.trim().is_empty() => match raw.trim().parse::<u64>() {
                Ok(n) if n > 0 => n,
                _ => return Err(format!("{}: invalid value '{}'", ENV_QUERY_STEP_BUDGET, raw)),
            },
            _ => DEFAULT_STEP_BUDGET,
        };

        Ok(Self {
            mode,
            payload_path: PathBuf::from(required(ENV_PAYLOAD)?),
            dataset_path: PathBuf::from(required(ENV_DATASET)?),
            out_dir: PathBuf::from(required(ENV_OUT_DIR)?),
            query_step_budget,
        })
    }
}

/// The output directory alone, so a result can be written even when the
/// rest of the input is unusable.
pub fn out_dir_from_env() -> Option<PathBuf> {
    std::env::var_os(ENV_OUT_DIR)
        .filter(|v| !v.is_empty())
        .map(PathBuf::from)
}

pub fn error_result(message: impl Into<String>) -> ResultProtocol {
    ResultProtocol {
        stdout: String::new(),
        error: message.into(),
        return_obj: None,
        plots: Vec::new(),
    }
}

pub fn run(input: &DriverInput) -> ResultProtocol {
    let payload = match fs::read_to_string(&input.payload_path) {
        Ok(payload) => payload,
        Err(e) => {
            return error_result(format!(
                "SetupError: cannot read payload {}: {}",
                input.payload_path.display(),
                e
            ))
        }
    };

    match input.mode {
        Mode::Script => match Table::from_csv_path(&input.dataset_path) {
            Ok(table) => {
                log::debug!("Loaded dataset with {} rows", table.len());
                run_script(&payload, table, &input.out_dir)
            }
            Err(e) => error_result(format!(
                "SetupError: cannot load dataset {}: {}",
                input.dataset_path.display(),
                e
            )),
        },
        Mode::Query => run_query(&input.dataset_path, &payload, input.query_step_budget),
    }
}

/// Write `result.json` atomically so a reader never sees half a file.
pub fn write_result(out_dir: &Path, result: &ResultProtocol) -> io::Result<()> {
    let json = serde_json::to_vec(result)?;
    let tmp = out_dir.join(format!(".{}.tmp", RESULT_FILE_NAME));
    fs::write(&tmp, json)?;
    fs::rename(&tmp, out_dir.join(RESULT_FILE_NAME))
}
