use std::fs;
use std::path::Path;

use embedding_benchmark::PointResult;
use serde::{Deserialize, Serialize};
use walkdir::WalkDir;

/// A sweep point result annotated for aggregation.
///
/// `power_avg_w` and `emb_per_joule` are passthrough fields written by
/// external power-measurement tooling; this tool never computes them.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub(crate) struct Record {
    #[serde(flatten)]
    pub point: PointResult,
    pub hardware: String,
    /// Derived: p99 latency divided over the texts of one batch
    pub latency_per_text_ms: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub power_avg_w: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub emb_per_joule: Option<f64>,
}

#[derive(Deserialize)]
struct RawResult {
    #[serde(flatten)]
    point: PointResult,
    power_avg_w: Option<f64>,
    emb_per_joule: Option<f64>,
}

/// Walk `results_dir` and load every `*.json` result file, skipping
/// `summary.json` and anything that does not parse.
///
/// Hardware comes from the override when given, otherwise from the result's
/// parent directory name (`<model_slug>__<hardware>`), otherwise `"unknown"`.
pub(crate) fn load_records(results_dir: &Path, hardware_override: Option<&str>) -> Vec<Record> {
    let mut records = Vec::new();
    for entry in WalkDir::new(results_dir)
        .sort_by_file_name()
        .into_iter()
        .filter_map(|entry| entry.ok())
    {
        let path = entry.path();
        if !entry.file_type().is_file()
            || path.extension().map_or(true, |ext| ext != "json")
            || entry.file_name().to_str() == Some("summary.json")
        {
            continue;
        }

        let raw: RawResult = match fs::read(path)
            .map_err(|err| err.to_string())
            .and_then(|body| serde_json::from_slice(&body).map_err(|err| err.to_string()))
        {
            Ok(raw) => raw,
            Err(err) => {
                tracing::warn!("skipping {}: {err}", path.display());
                continue;
            }
        };

        let hardware = hardware_override
            .map(str::to_string)
            .or_else(|| infer_hardware(path))
            .unwrap_or_else(|| "unknown".to_string());

        let latency_per_text_ms = if raw.point.batch_size > 0 {
            round3(raw.point.p99_latency_ms / raw.point.batch_size as f64)
        } else {
            0.0
        };

        records.push(Record {
            point: raw.point,
            hardware,
            latency_per_text_ms,
            power_avg_w: raw.power_avg_w,
            emb_per_joule: raw.emb_per_joule,
        });
    }
    records
}

pub(crate) fn sort_records(records: &mut [Record]) {
    records.sort_by(|a, b| {
        (
            &a.point.model,
            &a.hardware,
            a.point.chunk_size,
            a.point.batch_size,
            a.point.concurrency,
        )
            .cmp(&(
                &b.point.model,
                &b.hardware,
                b.point.chunk_size,
                b.point.batch_size,
                b.point.concurrency,
            ))
    });
}

fn infer_hardware(path: &Path) -> Option<String> {
    let parent = path.parent()?.file_name()?.to_str()?;
    parent.split_once("__").map(|(_, hardware)| hardware.to_string())
}

fn round3(value: f64) -> f64 {
    (value * 1000.0).round() / 1000.0
}
