use crate::series::Point;
use serde::Serialize;

/// Aggregates of a non-empty series.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct SeriesSummary {
    pub count: usize,
    pub min: f64,
    pub max: f64,
    pub mean: f64,
    /// Population standard deviation.
    pub std_dev: f64,
    pub p50: f64,
    pub p90: f64,
    pub p99: f64,
}

/// Statistics of a series; an empty series has none.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
#[serde(tag = "status", rename_all = "lowercase")]
pub enum Statistics {
    Undefined,
    Defined(SeriesSummary),
}

impl Statistics {
    pub fn from_values(values: &[f64]) -> Self {
        if values.is_empty() {
            return Statistics::Undefined;
        }

        let count = values.len();
        let n = count as f64;
        let mean = values.iter().sum::<f64>() / n;
        let variance = values.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / n;

        let mut sorted = values.to_vec();
        sorted.sort_by(f64::total_cmp);

        Statistics::Defined(SeriesSummary {
            count,
            min: sorted[0],
            max: sorted[count - 1],
            mean,
            std_dev: variance.sqrt(),
            p50: percentile(&sorted, 50.0),
            p90: percentile(&sorted, 90.0),
            p99: percentile(&sorted, 99.0),
        })
    }

    pub fn summary(&self) -> Option<&SeriesSummary> {
        match self {
            Statistics::Defined(summary) => Some(summary),
            Statistics::Undefined => None,
        }
    }

    pub fn is_defined(&self) -> bool {
        matches!(self, Statistics::Defined(_))
    }
}

/// Statistics over the values of a series, raw or downsampled.
pub fn compute_stats(points: &[Point]) -> Statistics {
    let values: Vec<f64> = points.iter().map(|p| p.value).collect();
    Statistics::from_values(&values)
}

/// Percentile `q` (0-100) of sorted values, interpolating linearly between
/// the two closest ranks.
fn percentile(sorted: &[f64], q: f64) -> f64 {
    let rank = q / 100.0 * (sorted.len() - 1) as f64;
    let lower = rank.floor() as usize;
    let upper = rank.ceil() as usize;
    let fraction = rank - lower as f64;
    sorted[lower] + (sorted[upper] - sorted[lower]) * fraction
}
