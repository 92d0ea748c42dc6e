use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Duration;

use clap::Parser;
use embedding_benchmark::SweepConfig;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer};

/// App Configuration
#[derive(Parser, Debug)]
#[clap(author, version, about, long_about = None)]
struct Args {
    /// Model name as served, e.g. `BAAI/bge-large-en-v1.5`
    #[clap(long, env)]
    model: String,
    /// Base URL of the embedding server
    #[clap(default_value = "http://localhost:8000", long, env)]
    base_url: String,
    /// Approximate tokens per text
    #[clap(default_value = "512", long, env, value_delimiter = ',')]
    chunk_sizes: Vec<u32>,
    /// Texts per request
    #[clap(default_value = "1,4,16,64,256", long, env, value_delimiter = ',')]
    batch_sizes: Vec<u32>,
    /// Concurrent in-flight requests
    #[clap(default_value = "1,4,16,64", long, env, value_delimiter = ',')]
    concurrencies: Vec<u32>,
    /// Requests per sweep point
    #[clap(default_value = "200", long, env)]
    num_requests: usize,
    /// Requests for the validation phase
    #[clap(default_value = "8", long, env)]
    validation_requests: usize,
    #[clap(default_value = "results", long, env)]
    result_dir: PathBuf,
    /// Hardware label for log correlation; result directories carry it in
    /// their name, so it is not written into the result files themselves
    #[clap(long, env)]
    hardware: Option<String>,
    #[clap(default_value = "42", long, env)]
    seed: u64,
    #[clap(default_value = "300", long, env)]
    request_timeout_secs: u64,
    /// Go straight to the full sweep
    #[clap(long, env)]
    skip_validation: bool,
    #[clap(long, env)]
    json_output: bool,
}

fn main() -> ExitCode {
    let args = Args::parse();
    init_logging(args.json_output);
    tracing::info!("{:?}", args);
    if let Some(hardware) = &args.hardware {
        tracing::info!("Benchmarking on {hardware}");
    }

    let config = SweepConfig {
        model: args.model,
        base_url: args.base_url,
        chunk_sizes: args.chunk_sizes,
        batch_sizes: args.batch_sizes,
        concurrencies: args.concurrencies,
        num_requests: args.num_requests,
        validation_requests: args.validation_requests,
        seed: args.seed,
        result_dir: args.result_dir,
        request_timeout: Duration::from_secs(args.request_timeout_secs),
        skip_validation: args.skip_validation,
    };

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .expect("failed to build tokio runtime");

    match runtime.block_on(embedding_benchmark::run(config)) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            tracing::error!("benchmark failed: {err}");
            ExitCode::FAILURE
        }
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
