use anyhow::{bail, Context, Result};
use clap::{Args, Parser, Subcommand};
use log::LevelFilter;
use sandrun_core::config::{parse_memory_limit, ConfigLoader};
use sandrun_core::dataset::csv_to_sqlite;
use sandrun_core::{EngineConfig, ExecutionEngine, Limits, Mode};
use std::path::{Path, PathBuf};
use std::process::ExitCode;

#[derive(Parser, Debug)]
#[clap(
    name = "sandrun",
    author,
    version,
    about = "Run untrusted scripts and read-only queries in a sandbox"
)]
struct Cli {
    #[clap(subcommand)]
    command: Commands,

    #[clap(
        long,
        short,
        global = true,
        help = "YAML configuration file (defaults to <config dir>/sandrun/config.yaml when present)"
    )]
    config: Option<PathBuf>,

    #[clap(long, short, global = true, default_value = "info")]
    log_level: String,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Execute one payload and print the result as JSON
    Run(RunArgs),
    /// Show which isolation backend would be used, and why
    Probe,
    /// Materialize a CSV file as a SQLite snapshot for query mode
    Snapshot {
        #[clap(long, help = "CSV file with a header row")]
        csv: PathBuf,
        #[clap(long, help = "SQLite file to write; the table 'data' is replaced")]
        db: PathBuf,
    },
}

#[derive(Args, Debug)]
struct RunArgs {
    #[clap(long, help = "Payload kind: script or query")]
    mode: Mode,

    #[clap(long, help = "CSV file (script mode) or SQLite snapshot (query mode)")]
    dataset: PathBuf,

    #[clap(long, conflicts_with = "payload_file", required_unless_present = "payload_file")]
    payload: Option<String>,

    #[clap(long, help = "Read the payload from a file")]
    payload_file: Option<PathBuf>,

    #[clap(long, help = "Memory ceiling, e.g. 512m or 2g")]
    memory: Option<String>,

    #[clap(long, help = "CPU-time ceiling in seconds")]
    cpu: Option<u64>,

    #[clap(long, help = "Wall-clock ceiling in seconds")]
    timeout: Option<u64>,

    #[clap(long, help = "Skip the container backend")]
    force_weak: bool,
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    let cli = Cli::parse();

    let log_level_filter = match cli.log_level.to_lowercase().as_str() {
        "trace" => LevelFilter::Trace,
        "debug" => LevelFilter::Debug,
        "info" => LevelFilter::Info,
        "warn" => LevelFilter::Warn,
        "error" => LevelFilter::Error,
        "off" => LevelFilter::Off,
        _ => LevelFilter::Info,
    };
    env_logger::Builder::new()
        .filter_level(log_level_filter)
        .target(env_logger::Target::Stderr)
        .init();

    match cli.command {
        Commands::Run(args) => {
            let config = load_config(cli.config.as_deref()).await?;
            run_payload(config, args).await
        }
        Commands::Probe => {
            let config = load_config(cli.config.as_deref()).await?;
            probe(config).await
        }
        Commands::Snapshot { csv, db } => {
            let rows = csv_to_sqlite(&csv, &db)
                .with_context(|| format!("failed to snapshot {}", csv.display()))?;
            println!("Wrote {} rows to table 'data' in {}", rows, db.display());
            Ok(ExitCode::SUCCESS)
        }
    }
}

async fn load_config(explicit: Option<&Path>) -> Result<EngineConfig> {
    let path = match explicit {
        Some(path) => Some(path.to_path_buf()),
        None => dirs::config_dir()
            .map(|dir| dir.join("sandrun").join("config.yaml"))
            .filter(|path| path.is_file()),
    };

    let config = match path {
        Some(path) => {
            log::debug!("Loading configuration from {}", path.display());
            ConfigLoader::from_file(&path).await?
        }
        None => ConfigLoader::from_env()?,
    };
    Ok(config)
}

fn resolve_limits(config: &EngineConfig, args: &RunArgs) -> Result<Limits> {
    let defaults = config.default_limits()?;
    let memory_bytes = match &args.memory {
        Some(memory) => parse_memory_limit(memory)?,
        None => defaults.memory_bytes,
    };
    let wall_clock_seconds = args.timeout.unwrap_or(defaults.wall_clock_seconds);
    let cpu_seconds = args
        .cpu
        .unwrap_or_else(|| defaults.cpu_seconds.min(wall_clock_seconds));
    Ok(Limits::new(memory_bytes, cpu_seconds, wall_clock_seconds))
}

async fn run_payload(mut config: EngineConfig, args: RunArgs) -> Result<ExitCode> {
    if args.force_weak {
        config.force_weak_backend = true;
    }

    let payload = match (&args.payload, &args.payload_file) {
        (Some(payload), _) => payload.clone(),
        (None, Some(path)) => tokio::fs::read_to_string(path)
            .await
            .with_context(|| format!("failed to read payload file {}", path.display()))?,
        (None, None) => bail!("either --payload or --payload-file is required"),
    };
    let limits = resolve_limits(&config, &args)?;

    let engine = ExecutionEngine::new(config)?;
    match engine
        .execute(payload, args.mode, &args.dataset, Some(limits))
        .await
    {
        Ok(result) => {
            println!("{}", serde_json::to_string_pretty(&result)?);
            Ok(if result.is_success() {
                ExitCode::SUCCESS
            } else {
                ExitCode::from(1)
            })
        }
        Err(e) => {
            log::error!("Execution failed: {}", e);
            if let Some(logs) = e.backend_logs().filter(|logs| !logs.is_empty()) {
                eprintln!("--- backend logs ---\n{}", logs);
            }
            eprintln!("Error: {}", e);
            Ok(ExitCode::from(2))
        }
    }
}

async fn probe(config: EngineConfig) -> Result<ExitCode> {
    let engine = ExecutionEngine::new(config)?;
    match engine.backend().await {
        Ok(_) => {
            if let Some(selection) = engine.selection() {
                println!("backend: {}", selection.kind);
                println!("reason:  {}", selection.reason);
            }
            Ok(ExitCode::SUCCESS)
        }
        Err(e) => {
            eprintln!("Error: {}", e);
            Ok(ExitCode::from(2))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn run_args(cpu: Option<u64>, timeout: Option<u64>, memory: Option<&str>) -> RunArgs {
        RunArgs {
            mode: Mode::Script,
            dataset: PathBuf::from("data.csv"),
            payload: Some("print(1);".to_string()),
            payload_file: None,
            memory: memory.map(str::to_string),
            cpu,
            timeout,
            force_weak: false,
        }
    }

    #[test]
    fn test_limits_follow_config_defaults() {
        let config = EngineConfig::default();
        let limits = resolve_limits(&config, &run_args(None, None, None)).unwrap();
        assert_eq!(limits, Limits::new(2 * 1024 * 1024 * 1024, 120, 120));
    }

    #[test]
    fn test_shorter_timeout_caps_cpu() {
        let config = EngineConfig::default();
        let limits = resolve_limits(&config, &run_args(None, Some(10), Some("256m"))).unwrap();
        assert_eq!(limits, Limits::new(256 * 1024 * 1024, 10, 10));
    }

    #[test]
    fn test_cli_parses_run() {
        let cli = Cli::try_parse_from([
            "sandrun",
            "--log-level",
            "debug",
            "run",
            "--mode",
            "query",
            "--dataset",
            "sales.db",
            "--payload",
            "SELECT 1",
            "--timeout",
            "5",
        ])
        .unwrap();
        match cli.command {
            Commands::Run(args) => {
                assert_eq!(args.mode, Mode::Query);
                assert_eq!(args.timeout, Some(5));
            }
            other => panic!("unexpected command: {other:?}"),
        }
    }

    #[test]
    fn test_cli_requires_a_payload() {
        assert!(Cli::try_parse_from([
            "sandrun", "run", "--mode", "script", "--dataset", "data.csv"
        ])
        .is_err());
    }
}
