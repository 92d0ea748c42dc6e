mod client;
mod generation;
mod results;
mod sweep;
mod utils;

pub use client::{ClientError, EmbeddingClient};
pub use generation::{generate_batches, generate_text};
pub use results::{model_slug, read_result, result_path, write_result, PointResult, SweepPoint};
pub use sweep::{run_point, run_sweep, BenchError, SweepConfig};

/// Run the benchmark: wait briefly for the server to answer its health
/// endpoint, then hand over to the phase-gated sweep.
pub async fn run(config: SweepConfig) -> Result<(), BenchError> {
    let client = EmbeddingClient::new(
        &config.base_url,
        &config.model,
        1,
        std::time::Duration::from_secs(5),
    )?;
    if !client.health().await {
        tracing::warn!(
            "server at {} is not answering /health yet, the validation phase will decide",
            config.base_url
        );
    }
    run_sweep(config).await
}
