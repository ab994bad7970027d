//! Time-series primitives shared by the store and the analysis engine.

use crate::collector::{Metric, TargetId};
use serde::{Deserialize, Serialize};

/// One (timestamp, value) pair of a series. Timestamps are unix seconds.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Point {
    pub timestamp: i64,
    pub value: f64,
}

impl Point {
    pub fn new(timestamp: i64, value: f64) -> Self {
        Self { timestamp, value }
    }
}

/// Inclusive time range; either end may be open.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeRange {
    pub start: Option<i64>,
    pub end: Option<i64>,
}

impl TimeRange {
    /// The unbounded range.
    pub fn all() -> Self {
        Self::default()
    }

    pub fn between(start: i64, end: i64) -> Self {
        Self {
            start: Some(start),
            end: Some(end),
        }
    }

    pub fn contains(&self, timestamp: i64) -> bool {
        self.start.map_or(true, |s| timestamp >= s) && self.end.map_or(true, |e| timestamp <= e)
    }

    /// Bounds suitable for a SQL `BETWEEN`.
    pub(crate) fn bounds(&self) -> (i64, i64) {
        (self.start.unwrap_or(i64::MIN), self.end.unwrap_or(i64::MAX))
    }
}

/// Request for one metric of one target over a time range.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SeriesQuery {
    pub target: TargetId,
    pub metric: Metric,
    pub range: TimeRange,
}

impl SeriesQuery {
    pub fn new(target: TargetId, metric: Metric) -> Self {
        Self {
            target,
            metric,
            range: TimeRange::all(),
        }
    }

    pub fn with_range(mut self, range: TimeRange) -> Self {
        self.range = range;
        self
    }
}
