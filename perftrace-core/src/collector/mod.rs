//! Platform metric collection.
//!
//! This module defines a common interface for reading process and system
//! counters. One implementation exists per supported OS; the right one is
//! picked once at startup by [`create_collector`].

mod factory;
mod probe;
mod types;

#[cfg(target_os = "linux")]
mod linux;
#[cfg(windows)]
mod win;

pub use factory::{create_collector, Platform};
pub use types::{
    Metric, MetricSample, MetricValues, ProcessInfo, ProcessList, Target, TargetId, TargetKind,
    UnknownMetric,
};

#[cfg(target_os = "linux")]
pub use linux::LinuxCollector;
#[cfg(windows)]
pub use win::WindowsCollector;

use crate::error::PlatformError;
use std::collections::BTreeMap;
use thiserror::Error;
use tracing::warn;

/// Per-target collection failure.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum CollectError {
    #[error("Process {pid} not found")]
    TargetNotFound { pid: u32 },

    #[error("Access to process {pid} denied")]
    PermissionDenied { pid: u32 },

    #[error("Transient read failure: {0}")]
    Transient(String),
}

impl CollectError {
    /// Whether a later attempt may succeed.
    pub fn is_transient(&self) -> bool {
        !matches!(self, CollectError::TargetNotFound { .. })
    }
}

/// Result of reading a set of targets at one instant.
#[derive(Debug, Clone, Default)]
pub struct Snapshot {
    /// Unix seconds at which the snapshot was taken.
    pub timestamp: i64,
    pub samples: BTreeMap<TargetId, MetricSample>,
    pub failures: BTreeMap<TargetId, CollectError>,
}

impl Snapshot {
    pub fn new(timestamp: i64) -> Self {
        Self {
            timestamp,
            ..Default::default()
        }
    }

    /// Records the outcome of reading one target.
    pub fn record(&mut self, target: TargetId, result: Result<MetricValues, CollectError>) {
        match result {
            Ok(values) => {
                self.samples.insert(
                    target,
                    MetricSample {
                        target,
                        timestamp: self.timestamp,
                        values,
                    },
                );
            }
            Err(err) => {
                self.failures.insert(target, err);
            }
        }
    }
}

/// Reads metrics for processes and for the system as a whole.
///
/// Implementations block while reading OS counters; the scheduler runs them
/// on the blocking pool and bounds each call with a timeout.
pub trait Collector: Send {
    /// Platform name recorded in the session metadata.
    fn platform(&self) -> &'static str;

    /// Enumerates running processes.
    fn list_processes(&mut self) -> ProcessList;

    /// Reads every target once. Per-target failures go into
    /// [`Snapshot::failures`]; only platform-level problems fail the call.
    fn snapshot(&mut self, targets: &[Target]) -> Result<Snapshot, PlatformError>;

    /// Physical memory of the host in bytes, if known.
    fn total_memory(&mut self) -> Option<u64> {
        None
    }

    /// Establishes counter baselines so the first real snapshot carries
    /// meaningful CPU percentages.
    fn prime(&mut self, targets: &[Target]) {
        if let Err(e) = self.snapshot(targets) {
            warn!("Priming snapshot failed: {}", e);
        }
    }
}
