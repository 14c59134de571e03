//! Runs one payload inside the isolation layer and writes `result.json`.

use std::panic::{self, AssertUnwindSafe};
use std::process::ExitCode;

use anyhow::{Context, Result};
use log::LevelFilter;
use sandrun_core::driver::{self, DriverInput};
use sandrun_core::protocol::{ENV_DRIVER_LOG, ENV_OUT_DIR, INTERNAL_ERROR_PREFIX};

fn main() -> ExitCode {
    let level = std::env::var(ENV_DRIVER_LOG)
        .ok()
        .and_then(|v| v.parse::<LevelFilter>().ok())
        .unwrap_or(LevelFilter::Warn);
    env_logger::Builder::new()
        .filter_level(level)
        .target(env_logger::Target::Stderr)
        .init();

    match run() {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("sandrun-driver: {:#}", e);
            ExitCode::from(2)
        }
    }
}

fn run() -> Result<()> {
    let out_dir = driver::out_dir_from_env()
        .with_context(|| format!("{} is not set, no result can be written", ENV_OUT_DIR))?;

    let outcome = panic::catch_unwind(AssertUnwindSafe(|| match DriverInput::from_env() {
        Ok(input) => {
            log::debug!("Running {} payload {}", input.mode, input.payload_path.display());
            driver::run(&input)
        }
        Err(message) => driver::error_result(format!("SetupError: {}", message)),
    }));

    let result = outcome.unwrap_or_else(|panic| {
        let message = panic
            .downcast_ref::<&str>()
            .map(|s| s.to_string())
            .or_else(|| panic.downcast_ref::<String>().cloned())
            .unwrap_or_else(|| "unknown panic".to_string());
        log::error!("Driver panicked: {}", message);
        driver::error_result(format!("{}driver panicked: {}", INTERNAL_ERROR_PREFIX, message))
    });

    driver::write_result(&out_dir, &result)
        .with_context(|| format!("failed to write result into {}", out_dir.display()))
}
