use std::io::{BufRead, BufReader};
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::TryRecvError;
use std::sync::{mpsc, Arc, Mutex};
use std::thread;
use std::thread::sleep;
use std::time::Duration;

use clap::Parser;
use subprocess::{ExitStatus, Popen, PopenConfig, PopenError, Redirection};
use thiserror::Error;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer};

mod config;
mod server;

use config::{Backend, Matrix, ResolvedModel};
use embedding_benchmark::{model_slug, result_path, SweepPoint};
use server::{port_in_use, server_manager, shutdown_server, wait_port_released, ServerStatus};

/// App Configuration
#[derive(Parser, Debug)]
#[clap(author, version, about, long_about = None)]
struct Args {
    /// YAML model matrix; mutually exclusive with --model-id
    #[clap(long, env)]
    config: Option<PathBuf>,
    /// Benchmark a single model instead of a matrix
    #[clap(long, env)]
    model_id: Option<String>,
    #[clap(default_value = "vllm", long, env)]
    backend: Backend,
    #[clap(default_value = "127.0.0.1", long, env)]
    host: String,
    #[clap(default_value = "8000", long, short, env)]
    port: u16,
    #[clap(default_value = "512", long, env, value_delimiter = ',')]
    chunk_sizes: Vec<u32>,
    #[clap(default_value = "1,4,16,64,256", long, env, value_delimiter = ',')]
    batch_sizes: Vec<u32>,
    #[clap(default_value = "1,4,16,64", long, env, value_delimiter = ',')]
    concurrencies: Vec<u32>,
    #[clap(default_value = "200", long, env)]
    num_requests: usize,
    #[clap(default_value = "results", long, env)]
    result_dir: PathBuf,
    /// Hardware label baked into the per-model result directory name
    #[clap(long, env)]
    hardware: Option<String>,
    /// Model download and weight load dominate startup, so be generous
    #[clap(default_value = "600", long, env)]
    startup_timeout_secs: u64,
    /// Also write server stdout to server.log in the model's result dir
    #[clap(long, env)]
    server_log: bool,
    #[clap(long, env)]
    json_output: bool,
}

#[derive(Debug, Error)]
pub(crate) enum LauncherError {
    #[error("config error: {0}")]
    Config(String),
    #[error("port {0} is already in use")]
    PortInUse(u16),
    #[error("server failed: {0}")]
    Server(String),
    #[error("benchmark failed: {0}")]
    Benchmark(String),
    #[error("interrupted")]
    Interrupted,
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

fn main() -> ExitCode {
    let args = Args::parse();
    init_logging(args.json_output);
    tracing::info!("{:?}", args);

    let models = match load_models(&args) {
        Ok(models) => models,
        Err(err) => {
            tracing::error!("{err}");
            return ExitCode::FAILURE;
        }
    };
    if models.is_empty() {
        tracing::error!("No models to benchmark");
        return ExitCode::FAILURE;
    }

    // Signal handler
    let running = Arc::new(AtomicBool::new(true));
    let r = running.clone();
    ctrlc::set_handler(move || {
        r.store(false, Ordering::SeqCst);
    })
    .expect("Error setting Ctrl-C handler");

    let mut failed: Vec<String> = Vec::new();
    for model in &models {
        if !running.load(Ordering::SeqCst) {
            tracing::info!("Interrupted, stopping");
            break;
        }
        match run_model(&args, model, &running) {
            Ok(()) => {}
            Err(LauncherError::Interrupted) => break,
            Err(err) => {
                tracing::error!("{}: {err}", model.model_id);
                failed.push(model.model_id.clone());
            }
        }
    }

    if !failed.is_empty() {
        tracing::error!("{} model(s) failed: {}", failed.len(), failed.join(", "));
        return ExitCode::FAILURE;
    }
    if running.load(Ordering::SeqCst) {
        tracing::info!("All models benchmarked");
    }
    ExitCode::SUCCESS
}

fn load_models(args: &Args) -> Result<Vec<ResolvedModel>, LauncherError> {
    match (&args.config, &args.model_id) {
        (Some(path), None) => Ok(Matrix::load(path)?.resolve(&args.chunk_sizes)),
        (None, Some(model_id)) => Ok(vec![ResolvedModel {
            model_id: model_id.clone(),
            backend: args.backend,
            port: args.port,
            max_model_len: None,
            extra_args: vec![],
            chunk_sizes: args.chunk_sizes.clone(),
        }]),
        (Some(_), Some(_)) => Err(LauncherError::Config(
            "--config and --model-id are mutually exclusive".to_string(),
        )),
        (None, None) => Err(LauncherError::Config(
            "either --config or --model-id is required".to_string(),
        )),
    }
}

/// Benchmark one model end to end: start its server, wait for health, run the
/// benchmark subprocess, tear the server down.
fn run_model(
    args: &Args,
    model: &ResolvedModel,
    running: &Arc<AtomicBool>,
) -> Result<(), LauncherError> {
    let model_dir = model_result_dir(&args.result_dir, &model.model_id, args.hardware.as_deref());
    std::fs::create_dir_all(&model_dir)?;

    // Whole-model idempotence: only skip when the complete grid is on disk.
    // Partial grids re-run; the benchmark memoizes per point.
    if grid_complete(&model_dir, model, &args.batch_sizes, &args.concurrencies) {
        tracing::info!("All results for {} already exist, skipping", model.model_id);
        return Ok(());
    }

    if port_in_use(&args.host, model.port) {
        return Err(LauncherError::PortInUse(model.port));
    }

    // Shared shutdown bool
    let shutdown = Arc::new(Mutex::new(false));
    // When shutting down, the main thread waits for all senders to be dropped
    let (shutdown_sender, shutdown_receiver) = mpsc::channel();
    // Channel to track server status
    let (status_sender, status_receiver) = mpsc::channel();

    {
        let model = model.clone();
        let host = args.host.clone();
        let startup_timeout = Duration::from_secs(args.startup_timeout_secs);
        let server_log = args.server_log.then(|| model_dir.join("server.log"));
        let shutdown = shutdown.clone();
        let shutdown_sender = shutdown_sender.clone();
        thread::spawn(move || {
            server_manager(
                model,
                host,
                startup_timeout,
                server_log,
                status_sender,
                shutdown,
                shutdown_sender,
            )
        });
    }
    drop(shutdown_sender);

    // Wait for the server to become healthy
    loop {
        if !running.load(Ordering::SeqCst) {
            shutdown_server(shutdown, &shutdown_receiver);
            return Err(LauncherError::Interrupted);
        }
        match status_receiver.try_recv() {
            Ok(ServerStatus::Ready) => break,
            Ok(ServerStatus::Failed(err)) => {
                shutdown_server(shutdown, &shutdown_receiver);
                return Err(LauncherError::Server(err));
            }
            Err(TryRecvError::Empty) => {
                sleep(Duration::from_millis(100));
            }
            Err(TryRecvError::Disconnected) => {
                shutdown_server(shutdown, &shutdown_receiver);
                return Err(LauncherError::Server(
                    "server status channel disconnected".to_string(),
                ));
            }
        }
    }

    let benchmark_result = run_benchmark(args, model, &model_dir, &status_receiver, running);

    shutdown_server(shutdown, &shutdown_receiver);
    if !wait_port_released(&args.host, model.port, Duration::from_secs(30)) {
        tracing::warn!("Port {} still in use after teardown", model.port);
    }

    benchmark_result
}

fn run_benchmark(
    args: &Args,
    model: &ResolvedModel,
    model_dir: &Path,
    status_receiver: &mpsc::Receiver<ServerStatus>,
    running: &Arc<AtomicBool>,
) -> Result<(), LauncherError> {
    let mut argv = vec![
        "embedding-benchmark".to_string(),
        "--model".to_string(),
        model.model_id.clone(),
        "--base-url".to_string(),
        format!("http://{}:{}", args.host, model.port),
        "--chunk-sizes".to_string(),
        csv(&model.chunk_sizes),
        "--batch-sizes".to_string(),
        csv(&args.batch_sizes),
        "--concurrencies".to_string(),
        csv(&args.concurrencies),
        "--num-requests".to_string(),
        args.num_requests.to_string(),
        "--result-dir".to_string(),
        model_dir.display().to_string(),
    ];
    if args.json_output {
        argv.push("--json-output".to_string());
    }

    tracing::info!("Starting benchmark for {}", model.model_id);
    let mut benchmark = match Popen::create(
        &argv,
        PopenConfig {
            stdout: Redirection::Pipe,
            stderr: Redirection::Merge,
            // Needed for the shutdown procedure
            setpgid: true,
            ..Default::default()
        },
    ) {
        Ok(p) => p,
        Err(err) => {
            if let PopenError::IoError(ref err) = err {
                if err.kind() == std::io::ErrorKind::NotFound {
                    tracing::error!("embedding-benchmark not found in PATH");
                }
            }
            return Err(LauncherError::Benchmark(err.to_string()));
        }
    };

    // Redirect STDOUT and STDERR to the console
    // (STDERR is merged into STDOUT)
    let benchmark_stdout = benchmark.stdout.take().unwrap();
    thread::spawn(move || {
        let stdout = BufReader::new(benchmark_stdout);
        for line in stdout.lines() {
            match line {
                Ok(line) => println!("{line}"),
                Err(_) => break,
            }
        }
    });

    loop {
        if let Ok(ServerStatus::Failed(err)) = status_receiver.try_recv() {
            let _ = benchmark.terminate();
            let _ = benchmark.wait_timeout(Duration::from_secs(30));
            return Err(LauncherError::Server(err));
        }
        if !running.load(Ordering::SeqCst) {
            let _ = benchmark.terminate();
            let _ = benchmark.wait_timeout(Duration::from_secs(30));
            return Err(LauncherError::Interrupted);
        }
        match benchmark.poll() {
            Some(ExitStatus::Exited(0)) => return Ok(()),
            Some(status) => {
                return Err(LauncherError::Benchmark(format!(
                    "exited with {status:?}"
                )))
            }
            None => sleep(Duration::from_millis(100)),
        }
    }
}

/// `<result_dir>/<model_slug>__<hardware>` or `<result_dir>/<model_slug>`
fn model_result_dir(result_dir: &Path, model_id: &str, hardware: Option<&str>) -> PathBuf {
    let slug = model_slug(model_id);
    match hardware {
        Some(hardware) => result_dir.join(format!("{slug}__{hardware}")),
        None => result_dir.join(slug),
    }
}

fn grid_complete(
    dir: &Path,
    model: &ResolvedModel,
    batch_sizes: &[u32],
    concurrencies: &[u32],
) -> bool {
    if model.chunk_sizes.is_empty() || batch_sizes.is_empty() || concurrencies.is_empty() {
        return false;
    }
    model.chunk_sizes.iter().all(|&chunk_size| {
        batch_sizes.iter().all(|&batch_size| {
            concurrencies.iter().all(|&concurrency| {
                result_path(
                    dir,
                    &model.model_id,
                    SweepPoint {
                        chunk_size,
                        batch_size,
                        concurrency,
                    },
                )
                .exists()
            })
        })
    })
}

fn csv(values: &[u32]) -> String {
    values
        .iter()
        .map(u32::to_string)
        .collect::<Vec<_>>()
        .join(",")
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

#[cfg(test)]
mod tests {
    use super::*;

    fn model() -> ResolvedModel {
        ResolvedModel {
            model_id: "org/model".to_string(),
            backend: Backend::Vllm,
            port: 8000,
            max_model_len: None,
            extra_args: vec![],
            chunk_sizes: vec![128, 512],
        }
    }

    #[test]
    fn result_dir_naming() {
        let dir = model_result_dir(Path::new("results"), "org/model", Some("h100"));
        assert_eq!(dir, Path::new("results/org_model__h100"));

        let dir = model_result_dir(Path::new("results"), "org/model", None);
        assert_eq!(dir, Path::new("results/org_model"));
    }

    #[test]
    fn csv_join() {
        assert_eq!(csv(&[1, 4, 16]), "1,4,16");
        assert_eq!(csv(&[8]), "8");
    }

    #[test]
    fn grid_complete_requires_every_file() {
        let dir = tempfile::tempdir().unwrap();
        let model = model();
        let batch_sizes = [1, 4];
        let concurrencies = [1];

        assert!(!grid_complete(dir.path(), &model, &batch_sizes, &concurrencies));

        // Write 3 of the 4 expected files
        let mut points = vec![];
        for &chunk_size in &model.chunk_sizes {
            for &batch_size in &batch_sizes {
                points.push(SweepPoint {
                    chunk_size,
                    batch_size,
                    concurrency: 1,
                });
            }
        }
        for point in &points[..3] {
            std::fs::write(result_path(dir.path(), &model.model_id, *point), b"{}").unwrap();
        }
        assert!(!grid_complete(dir.path(), &model, &batch_sizes, &concurrencies));

        std::fs::write(result_path(dir.path(), &model.model_id, points[3]), b"{}").unwrap();
        assert!(grid_complete(dir.path(), &model, &batch_sizes, &concurrencies));
    }

    #[test]
    fn empty_grid_is_never_complete() {
        let dir = tempfile::tempdir().unwrap();
        let model = model();
        assert!(!grid_complete(dir.path(), &model, &[], &[1]));
    }
}
