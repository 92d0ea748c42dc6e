use std::fs;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use thiserror::Error;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;

use crate::client::{ClientError, EmbeddingClient};
use crate::generation::generate_batches;
use crate::results::{result_path, write_result, PointResult, SweepPoint};
use crate::utils::{percentile, round2, round3};

#[derive(Debug, Error)]
pub enum BenchError {
    #[error("sweep grid is empty")]
    EmptyGrid,
    #[error("validation phase failed: {0}")]
    Validation(ClientError),
    #[error("{} sweep point(s) failed after retry", failures.len())]
    PointsFailed {
        failures: Vec<(SweepPoint, ClientError)>,
    },
    #[error(transparent)]
    Client(#[from] ClientError),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

pub struct SweepConfig {
    pub model: String,
    pub base_url: String,
    pub chunk_sizes: Vec<u32>,
    pub batch_sizes: Vec<u32>,
    pub concurrencies: Vec<u32>,
    pub num_requests: usize,
    pub validation_requests: usize,
    pub seed: u64,
    pub result_dir: PathBuf,
    pub request_timeout: Duration,
    pub skip_validation: bool,
}

impl SweepConfig {
    /// Full grid in (chunk, batch, concurrency) order, outer to inner.
    pub fn grid(&self) -> Vec<SweepPoint> {
        let mut points = Vec::new();
        for &chunk_size in &self.chunk_sizes {
            for &batch_size in &self.batch_sizes {
                for &concurrency in &self.concurrencies {
                    points.push(SweepPoint {
                        chunk_size,
                        batch_size,
                        concurrency,
                    });
                }
            }
        }
        points
    }

    /// Cheapest coordinate of the grid, used by the validation phase.
    fn validation_point(&self) -> Option<SweepPoint> {
        Some(SweepPoint {
            chunk_size: *self.chunk_sizes.iter().min()?,
            batch_size: *self.batch_sizes.iter().min()?,
            concurrency: *self.concurrencies.iter().min()?,
        })
    }
}

/// Run one sweep point: fan `num_requests` pre-generated batches through a
/// semaphore-bounded worker pool and aggregate latencies.
///
/// The first request error fails the whole point; remaining in-flight
/// requests are still awaited so the server is quiescent before returning.
pub async fn run_point(
    client: &EmbeddingClient,
    model: &str,
    point: SweepPoint,
    num_requests: usize,
    seed: u64,
) -> Result<PointResult, ClientError> {
    let batches = generate_batches(seed, point.chunk_size, point.batch_size, num_requests);
    let semaphore = Arc::new(Semaphore::new(point.concurrency.max(1) as usize));
    let mut tasks = JoinSet::new();

    let start = Instant::now();
    for texts in batches {
        let client = client.clone();
        let semaphore = semaphore.clone();
        tasks.spawn(async move {
            let _permit = semaphore.acquire_owned().await.expect("semaphore closed");
            client.embed(&texts).await
        });
    }

    let mut latencies_ms: Vec<f64> = Vec::with_capacity(num_requests);
    let mut first_error: Option<ClientError> = None;
    while let Some(joined) = tasks.join_next().await {
        match joined.expect("embed task panicked") {
            Ok(latency) => latencies_ms.push(latency.as_secs_f64() * 1000.0),
            Err(err) => {
                if first_error.is_none() {
                    first_error = Some(err);
                }
            }
        }
    }
    let elapsed = start.elapsed().as_secs_f64();

    if let Some(err) = first_error {
        return Err(err);
    }
    // A point that measured nothing proves nothing; it must not produce a
    // result file, and it must not pass validation
    if latencies_ms.is_empty() {
        return Err(ClientError::NoCompletedRequests);
    }

    latencies_ms.sort_by(|a, b| a.total_cmp(b));
    let completed = latencies_ms.len();
    let total_embeddings = (completed * point.batch_size as usize) as f64;
    let throughput = if elapsed > 0.0 {
        total_embeddings / elapsed
    } else {
        0.0
    };
    let throughput_per_user = if point.concurrency > 0 {
        throughput / point.concurrency as f64
    } else {
        0.0
    };

    Ok(PointResult {
        model: model.to_string(),
        chunk_size: point.chunk_size,
        batch_size: point.batch_size,
        concurrency: point.concurrency,
        num_requests,
        completed_requests: completed,
        elapsed_sec: round3(elapsed),
        p50_latency_ms: round2(percentile(&latencies_ms, 0.50)),
        p99_latency_ms: round2(percentile(&latencies_ms, 0.99)),
        throughput_emb_per_sec: round2(throughput),
        throughput_per_user: round2(throughput_per_user),
    })
}

/// Phase-gated sweep: a cheap validation run must pass before the full grid
/// is attempted. Full-sweep points are memoized on their result file, so a
/// crashed or interrupted sweep resumes where it left off. Failing points are
/// collected, retried once after the grid, and aggregated into the error.
pub async fn run_sweep(config: SweepConfig) -> Result<(), BenchError> {
    let grid = config.grid();
    if grid.is_empty() {
        return Err(BenchError::EmptyGrid);
    }
    fs::create_dir_all(&config.result_dir)?;

    let max_concurrency = config.concurrencies.iter().copied().max().unwrap_or(1);
    let client = EmbeddingClient::new(
        &config.base_url,
        &config.model,
        max_concurrency,
        config.request_timeout,
    )?;

    if !config.skip_validation {
        // Grid is non-empty, so the validation point exists
        let point = config.validation_point().expect("empty grid");
        tracing::info!(
            chunk = point.chunk_size,
            batch = point.batch_size,
            concurrency = point.concurrency,
            requests = config.validation_requests,
            "running validation point"
        );
        run_point(
            &client,
            &config.model,
            point,
            config.validation_requests,
            config.seed,
        )
        .await
        .map_err(BenchError::Validation)?;
        tracing::info!("validation passed, starting full sweep of {} points", grid.len());
    }

    let mut failures: Vec<(SweepPoint, ClientError)> = Vec::new();
    for &point in &grid {
        if let PointOutcome::Failed(err) = sweep_point(&client, &config, point).await? {
            tracing::warn!(
                chunk = point.chunk_size,
                batch = point.batch_size,
                concurrency = point.concurrency,
                "point failed: {err}"
            );
            failures.push((point, err));
        }
    }

    if !failures.is_empty() {
        tracing::warn!("retrying {} failed point(s)", failures.len());
        let mut still_failing = Vec::new();
        for (point, _) in failures {
            if let PointOutcome::Failed(err) = sweep_point(&client, &config, point).await? {
                still_failing.push((point, err));
            }
        }
        failures = still_failing;
    }

    if failures.is_empty() {
        Ok(())
    } else {
        for (point, err) in &failures {
            tracing::error!(
                chunk = point.chunk_size,
                batch = point.batch_size,
                concurrency = point.concurrency,
                "unrecovered failure: {err}"
            );
        }
        Err(BenchError::PointsFailed { failures })
    }
}

enum PointOutcome {
    Skipped,
    Completed,
    Failed(ClientError),
}

/// Run a single grid point unless its result file already exists.
///
/// Request failures are recoverable and reported through the outcome; an
/// error persisting a finished result is not and aborts the sweep.
async fn sweep_point(
    client: &EmbeddingClient,
    config: &SweepConfig,
    point: SweepPoint,
) -> Result<PointOutcome, std::io::Error> {
    let path = result_path(&config.result_dir, &config.model, point);
    if path.exists() {
        tracing::info!(
            chunk = point.chunk_size,
            batch = point.batch_size,
            concurrency = point.concurrency,
            "result exists, skipping"
        );
        return Ok(PointOutcome::Skipped);
    }

    tracing::info!(
        chunk = point.chunk_size,
        batch = point.batch_size,
        concurrency = point.concurrency,
        "running point"
    );
    let result = match run_point(client, &config.model, point, config.num_requests, config.seed)
        .await
    {
        Ok(result) => result,
        Err(err) => return Ok(PointOutcome::Failed(err)),
    };

    write_result(&path, &result)?;
    tracing::info!(
        p50_ms = result.p50_latency_ms,
        p99_ms = result.p99_latency_ms,
        throughput = result.throughput_emb_per_sec,
        "saved {}",
        path.file_name().unwrap_or_default().to_string_lossy()
    );
    Ok(PointOutcome::Completed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::results::read_result;

    fn config(result_dir: PathBuf) -> SweepConfig {
        SweepConfig {
            model: "org/model".to_string(),
            // Nothing listens here; tests must never reach the network
            base_url: "http://127.0.0.1:9".to_string(),
            chunk_sizes: vec![128, 512],
            batch_sizes: vec![1, 16],
            concurrencies: vec![1, 4],
            num_requests: 4,
            validation_requests: 2,
            seed: 42,
            result_dir,
            request_timeout: Duration::from_secs(1),
            skip_validation: true,
        }
    }

    #[test]
    fn grid_order_is_chunk_batch_concurrency() {
        let dir = tempfile::tempdir().unwrap();
        let grid = config(dir.path().to_path_buf()).grid();
        assert_eq!(grid.len(), 8);
        assert_eq!(
            grid[0],
            SweepPoint {
                chunk_size: 128,
                batch_size: 1,
                concurrency: 1
            }
        );
        assert_eq!(
            grid[1],
            SweepPoint {
                chunk_size: 128,
                batch_size: 1,
                concurrency: 4
            }
        );
        assert_eq!(
            grid[7],
            SweepPoint {
                chunk_size: 512,
                batch_size: 16,
                concurrency: 4
            }
        );
    }

    #[test]
    fn validation_point_is_cheapest() {
        let dir = tempfile::tempdir().unwrap();
        let point = config(dir.path().to_path_buf()).validation_point().unwrap();
        assert_eq!(
            point,
            SweepPoint {
                chunk_size: 128,
                batch_size: 1,
                concurrency: 1
            }
        );
    }

    #[test]
    fn empty_grid_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = config(dir.path().to_path_buf());
        config.batch_sizes.clear();

        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .unwrap();
        let err = runtime.block_on(run_sweep(config)).unwrap_err();
        assert!(matches!(err, BenchError::EmptyGrid));
    }

    #[test]
    fn fully_memoized_sweep_never_touches_the_server() {
        let dir = tempfile::tempdir().unwrap();
        let config = config(dir.path().to_path_buf());

        // Pre-populate every result file in the grid
        for point in config.grid() {
            let result = PointResult {
                model: config.model.clone(),
                chunk_size: point.chunk_size,
                batch_size: point.batch_size,
                concurrency: point.concurrency,
                num_requests: 4,
                completed_requests: 4,
                elapsed_sec: 1.0,
                p50_latency_ms: 1.0,
                p99_latency_ms: 2.0,
                throughput_emb_per_sec: 4.0,
                throughput_per_user: 4.0,
            };
            write_result(&result_path(&config.result_dir, &config.model, point), &result)
                .unwrap();
        }

        let result_dir = config.result_dir.clone();
        let model = config.model.clone();
        let grid = config.grid();

        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .unwrap();
        // base_url points at a closed port: success proves every point was skipped
        runtime.block_on(run_sweep(config)).unwrap();

        for point in grid {
            let loaded = read_result(&result_path(&result_dir, &model, point)).unwrap();
            assert_eq!(loaded.completed_requests, 4);
        }
    }

    #[test]
    fn zero_requests_fails_the_point() {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .unwrap();
        // No requests are issued, so the closed port is never reached
        let client = EmbeddingClient::new(
            "http://127.0.0.1:9",
            "org/model",
            1,
            Duration::from_secs(1),
        )
        .unwrap();
        let point = SweepPoint {
            chunk_size: 128,
            batch_size: 1,
            concurrency: 1,
        };
        let err = runtime
            .block_on(run_point(&client, "org/model", point, 0, 42))
            .unwrap_err();
        assert!(matches!(err, ClientError::NoCompletedRequests));
    }

    #[test]
    fn zero_validation_requests_cannot_pass_validation() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = config(dir.path().to_path_buf());
        config.skip_validation = false;
        config.validation_requests = 0;

        let result_dir = config.result_dir.clone();
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .unwrap();
        let err = runtime.block_on(run_sweep(config)).unwrap_err();
        assert!(matches!(
            err,
            BenchError::Validation(ClientError::NoCompletedRequests)
        ));
        assert_eq!(std::fs::read_dir(&result_dir).unwrap().count(), 0);
    }

    #[test]
    fn validation_failure_aborts_before_any_write() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = config(dir.path().to_path_buf());
        config.skip_validation = false;

        let result_dir = config.result_dir.clone();
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .unwrap();
        let err = runtime.block_on(run_sweep(config)).unwrap_err();
        assert!(matches!(err, BenchError::Validation(_)));

        let written = std::fs::read_dir(&result_dir).unwrap().count();
        assert_eq!(written, 0);
    }
}
