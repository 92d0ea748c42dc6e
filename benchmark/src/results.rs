use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

/// One (chunk_size, batch_size, concurrency) coordinate of the sweep grid.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SweepPoint {
    pub chunk_size: u32,
    pub batch_size: u32,
    pub concurrency: u32,
}

/// Metrics for a single sweep point.
///
/// Field names match the JSON files written by earlier versions of the suite
/// so that old and new result trees aggregate together.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PointResult {
    pub model: String,
    pub chunk_size: u32,
    pub batch_size: u32,
    pub concurrency: u32,
    pub num_requests: usize,
    pub completed_requests: usize,
    pub elapsed_sec: f64,
    pub p50_latency_ms: f64,
    pub p99_latency_ms: f64,
    pub throughput_emb_per_sec: f64,
    pub throughput_per_user: f64,
}

pub fn model_slug(model: &str) -> String {
    model.replace('/', "_")
}

/// `{model_slug}__chunk{c}__bs{b}__conc{k}.json`
pub fn result_path(result_dir: &Path, model: &str, point: SweepPoint) -> PathBuf {
    result_dir.join(format!(
        "{}__chunk{}__bs{}__conc{}.json",
        model_slug(model),
        point.chunk_size,
        point.batch_size,
        point.concurrency
    ))
}

/// Write a result file atomically.
///
/// The file is staged next to its final location and renamed into place, so a
/// result file either exists complete or not at all. File existence is the
/// memoization key for the sweep; a torn write would poison resume-after-crash.
pub fn write_result(path: &Path, result: &PointResult) -> io::Result<()> {
    let staged = path.with_extension("json.tmp");
    let body = serde_json::to_vec_pretty(result)?;
    fs::write(&staged, body)?;
    fs::rename(&staged, path)
}

pub fn read_result(path: &Path) -> io::Result<PointResult> {
    let body = fs::read(path)?;
    serde_json::from_slice(&body).map_err(io::Error::from)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> PointResult {
        PointResult {
            model: "org/model".to_string(),
            chunk_size: 512,
            batch_size: 16,
            concurrency: 4,
            num_requests: 200,
            completed_requests: 200,
            elapsed_sec: 12.345,
            p50_latency_ms: 40.0,
            p99_latency_ms: 95.5,
            throughput_emb_per_sec: 259.2,
            throughput_per_user: 64.8,
        }
    }

    #[test]
    fn filename_scheme() {
        let point = SweepPoint {
            chunk_size: 512,
            batch_size: 16,
            concurrency: 4,
        };
        let path = result_path(Path::new("/tmp/results"), "org/model", point);
        assert_eq!(
            path,
            Path::new("/tmp/results/org_model__chunk512__bs16__conc4.json")
        );
    }

    #[test]
    fn slug_keeps_plain_names() {
        assert_eq!(model_slug("all-MiniLM-L6-v2"), "all-MiniLM-L6-v2");
        assert_eq!(
            model_slug("BAAI/bge-large-en-v1.5"),
            "BAAI_bge-large-en-v1.5"
        );
    }

    #[test]
    fn write_is_atomic_and_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("point.json");

        write_result(&path, &sample()).unwrap();

        // No staging file left behind
        assert!(!path.with_extension("json.tmp").exists());

        let loaded = read_result(&path).unwrap();
        assert_eq!(loaded.model, "org/model");
        assert_eq!(loaded.completed_requests, 200);
        assert_eq!(loaded.p99_latency_ms, 95.5);
    }
}
