use tabled::{builder::Builder, settings::Style, Table};

use crate::records::Record;

pub(crate) fn summary_table(records: &[Record]) -> Table {
    let mut builder = Builder::default();

    builder.set_header([
        "Model",
        "Hardware",
        "Chunk",
        "Batch",
        "Conc",
        "p50 (ms)",
        "p99 (ms)",
        "Tput (emb/s)",
        "Tput/User",
        "Power (W)",
        "Emb/Joule",
    ]);

    for record in records {
        let point = &record.point;
        let model_short = point.model.rsplit('/').next().unwrap_or(&point.model);
        builder.push_record([
            model_short.to_string(),
            record.hardware.clone(),
            point.chunk_size.to_string(),
            point.batch_size.to_string(),
            point.concurrency.to_string(),
            format!("{:.1}", point.p50_latency_ms),
            format!("{:.1}", point.p99_latency_ms),
            format!("{:.1}", point.throughput_emb_per_sec),
            format!("{:.1}", point.throughput_per_user),
            format_optional(record.power_avg_w, 1),
            format_optional(record.emb_per_joule, 2),
        ]);
    }

    let mut table = builder.build();
    table.with(Style::markdown());
    table
}

fn format_optional(value: Option<f64>, precision: usize) -> String {
    match value {
        Some(value) => format!("{value:.precision$}"),
        None => "-".to_string(),
    }
}
