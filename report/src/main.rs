use std::fs;
use std::path::{Path, PathBuf};
use std::process::{Command, ExitCode};

use clap::Parser;
use thiserror::Error;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer};

mod records;
mod table;

use records::{load_records, sort_records};
use table::summary_table;

/// App Configuration
#[derive(Parser, Debug)]
#[clap(author, version, about, long_about = None)]
struct Args {
    #[clap(default_value = "results", long, env)]
    results_dir: PathBuf,
    /// Hardware label; overrides the value inferred from directory names
    #[clap(long, env)]
    hardware: Option<String>,
    /// Summary JSON path, defaults to <results-dir>/summary.json
    #[clap(long, env)]
    output: Option<PathBuf>,
    /// Pull results over rsync before aggregating, e.g. `user@host:~/results/`
    #[clap(long, env)]
    fetch_from: Option<String>,
    #[clap(default_value = "22", long, env)]
    ssh_port: u16,
    #[clap(long, env)]
    json_output: bool,
}

#[derive(Debug, Error)]
enum ReportError {
    #[error("results directory not found: {0}")]
    MissingResultsDir(PathBuf),
    #[error("no result JSON files found")]
    NoRecords,
    #[error("rsync failed: {0}")]
    Fetch(String),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

fn main() -> ExitCode {
    let args = Args::parse();
    init_logging(args.json_output);

    match run(args) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            tracing::error!("{err}");
            ExitCode::FAILURE
        }
    }
}

fn run(args: Args) -> Result<(), ReportError> {
    if let Some(remote) = &args.fetch_from {
        fetch(remote, &args.results_dir, args.ssh_port)?;
    }

    if !args.results_dir.exists() {
        return Err(ReportError::MissingResultsDir(args.results_dir));
    }

    let mut records = load_records(&args.results_dir, args.hardware.as_deref());
    if records.is_empty() {
        return Err(ReportError::NoRecords);
    }
    sort_records(&mut records);

    let output = args
        .output
        .unwrap_or_else(|| args.results_dir.join("summary.json"));
    fs::write(&output, serde_json::to_vec_pretty(&records)?)?;
    tracing::info!("Wrote {} records to {}", records.len(), output.display());

    println!("{}", summary_table(&records));
    Ok(())
}

/// Pull a remote results tree. rsync is idempotent, so fetching repeatedly
/// only transfers new result files.
fn fetch(remote: &str, results_dir: &Path, ssh_port: u16) -> Result<(), ReportError> {
    fs::create_dir_all(results_dir)?;
    tracing::info!("Fetching {} into {}", remote, results_dir.display());

    let status = Command::new("rsync")
        .arg("-az")
        .arg("-e")
        .arg(format!("ssh -p {ssh_port}"))
        .arg(remote)
        .arg(results_dir)
        .status()
        .map_err(|err| {
            if err.kind() == std::io::ErrorKind::NotFound {
                ReportError::Fetch("rsync not found in PATH".to_string())
            } else {
                ReportError::Fetch(err.to_string())
            }
        })?;

    if status.success() {
        Ok(())
    } else {
        Err(ReportError::Fetch(format!("exited with {status}")))
    }
}

/// Init logging using LOG_LEVEL
fn init_logging(json_output: bool) {
    let fmt_layer = tracing_subscriber::fmt::layer()
        .with_file(true)
        .with_line_number(true);

    let fmt_layer = match json_output {
        true => fmt_layer.json().flatten_event(true).boxed(),
        false => fmt_layer.boxed(),
    };

    let env_filter =
        EnvFilter::try_from_env("LOG_LEVEL").unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt_layer)
        .init();
}
