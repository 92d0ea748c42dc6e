/// Nearest-rank percentile over a pre-sorted slice.
///
/// Index is `floor(n * q) - 1` clamped to the slice, matching the scheme used
/// by historical result files so percentiles stay comparable across runs.
pub(crate) fn percentile(sorted: &[f64], q: f64) -> f64 {
    if sorted.is_empty() {
        return 0.0;
    }
    let rank = (sorted.len() as f64 * q) as usize;
    let i = rank.saturating_sub(1).min(sorted.len() - 1);
    sorted[i]
}

pub(crate) fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}

pub(crate) fn round3(value: f64) -> f64 {
    (value * 1000.0).round() / 1000.0
}
