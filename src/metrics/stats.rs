//! Timing statistics.

use serde::{Deserialize, Serialize};

/// Summary of a set of durations, in seconds.
///
/// Every reported value is an observed sample: `median` is the upper median
/// (`sorted[n / 2]`) and the percentiles use the nearest-rank method.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct TimingStats {
    pub count: usize,
    pub mean: f64,
    /// Upper median for an even count.
    pub median: f64,
    pub p90: f64,
    pub p95: f64,
    pub max: f64,
    pub total: f64,
}

impl TimingStats {
    /// Computes stats over the finite values in `samples`.
    pub fn from_samples(samples: impl IntoIterator<Item = f64>) -> Self {
        let mut values: Vec<f64> = samples.into_iter().filter(|v| v.is_finite()).collect();
        if values.is_empty() {
            return Self::default();
        }
        values.sort_by(f64::total_cmp);

        let total: f64 = values.iter().sum();
        Self {
            count: values.len(),
            mean: total / values.len() as f64,
            median: values[values.len() / 2],
            p90: nearest_rank(&values, 90.0),
            p95: nearest_rank(&values, 95.0),
            max: values[values.len() - 1],
            total,
        }
    }
}

/// `sorted` must be non-empty and ascending.
fn nearest_rank(sorted: &[f64], percentile: f64) -> f64 {
    let n = sorted.len();
    let rank = ((percentile / 100.0) * n as f64).ceil() as usize;
    sorted[rank.clamp(1, n) - 1]
}
