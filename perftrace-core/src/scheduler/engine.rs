//! One sampling tick: snapshot under a timeout, then target lifecycle.

use super::queue::Batch;
use crate::collector::{CollectError, Collector, Metric, ProcessList, Target, TargetId};
use crate::config::TargetSpec;
use crate::error::{PlatformError, TargetError};
use crate::store::{TargetEvent, TargetEventKind};
use std::collections::HashSet;
use std::sync::{Arc, Mutex, TryLockError};
use std::time::Duration;
use tracing::{debug, info, warn};

/// Consecutive transient failures tolerated before a target is dropped.
pub(crate) const MAX_TRANSIENT_RETRIES: u32 = 3;

pub(crate) type SharedCollector = Arc<Mutex<Box<dyn Collector>>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum SkipReason {
    /// A previous snapshot is still running.
    Busy,
    TimedOut,
    /// The blocking task panicked.
    Failed,
}

#[derive(Debug)]
pub(crate) enum TickOutcome {
    Collected(Batch),
    Skipped(SkipReason),
}

struct LiveTarget {
    target: Target,
    failures: u32,
}

pub(crate) struct TickEngine {
    collector: SharedCollector,
    live: Vec<LiveTarget>,
    metrics: Vec<Metric>,
    timeout: Duration,
    ticks: u64,
    errors: Vec<TargetError>,
}

impl TickEngine {
    pub(crate) fn new(
        collector: SharedCollector,
        targets: Vec<Target>,
        metrics: Vec<Metric>,
        timeout: Duration,
    ) -> Self {
        Self {
            collector,
            live: targets
                .into_iter()
                .map(|target| LiveTarget {
                    target,
                    failures: 0,
                })
                .collect(),
            metrics,
            timeout,
            ticks: 0,
            errors: Vec::new(),
        }
    }

    pub(crate) fn live_targets(&self) -> usize {
        self.live.len()
    }

    /// Target errors recorded so far, in the order they happened.
    pub(crate) fn errors(&self) -> &[TargetError] {
        &self.errors
    }

    pub(crate) fn into_errors(self) -> Vec<TargetError> {
        self.errors
    }

    /// Runs one tick. Only a platform-level failure is an error; everything
    /// else degrades to a skipped tick or a dropped target.
    pub(crate) async fn tick(&mut self) -> Result<TickOutcome, PlatformError> {
        self.ticks += 1;
        let tick = self.ticks;

        let collector = Arc::clone(&self.collector);
        let targets: Vec<Target> = self.live.iter().map(|l| l.target.clone()).collect();
        let task = tokio::task::spawn_blocking(move || {
            let mut collector = match collector.try_lock() {
                Ok(guard) => guard,
                Err(TryLockError::WouldBlock) => return None,
                Err(TryLockError::Poisoned(poisoned)) => poisoned.into_inner(),
            };
            Some(collector.snapshot(&targets))
        });

        let mut snapshot = match tokio::time::timeout(self.timeout, task).await {
            Err(_) => {
                warn!(
                    "Tick {} skipped: snapshot exceeded {:?}",
                    tick, self.timeout
                );
                return Ok(TickOutcome::Skipped(SkipReason::TimedOut));
            }
            Ok(Err(e)) => {
                warn!("Tick {} skipped: snapshot task failed: {}", tick, e);
                return Ok(TickOutcome::Skipped(SkipReason::Failed));
            }
            Ok(Ok(None)) => {
                debug!("Tick {} skipped: collector still busy", tick);
                return Ok(TickOutcome::Skipped(SkipReason::Busy));
            }
            Ok(Ok(Some(result))) => result?,
        };

        let timestamp = snapshot.timestamp;
        let metrics = &self.metrics;
        let errors = &mut self.errors;
        let mut samples = Vec::with_capacity(self.live.len());
        let mut events = Vec::new();

        self.live.retain_mut(|live| {
            let id = live.target.id;

            if let Some(mut sample) = snapshot.samples.remove(&id) {
                live.failures = 0;
                sample.values.retain(metrics);
                samples.push(sample);
                return true;
            }

            let Some(failure) = snapshot.failures.remove(&id) else {
                return true;
            };

            let (kind, error) = match failure {
                CollectError::TargetNotFound { .. } => (
                    TargetEventKind::Ended,
                    TargetError::Ended {
                        id,
                        name: live.target.label(),
                    },
                ),
                err => {
                    live.failures += 1;
                    if live.failures <= MAX_TRANSIENT_RETRIES {
                        debug!(
                            "Target {} read failed ({}/{}): {}",
                            live.target.label(),
                            live.failures,
                            MAX_TRANSIENT_RETRIES,
                            err
                        );
                        return true;
                    }
                    (
                        TargetEventKind::Unavailable,
                        TargetError::Unavailable {
                            id,
                            name: live.target.label(),
                            attempts: live.failures,
                            reason: err.to_string(),
                        },
                    )
                }
            };

            match kind {
                TargetEventKind::Ended => info!("{}", error),
                TargetEventKind::Unavailable => warn!("{}", error),
            }
            events.push(TargetEvent {
                target: id,
                timestamp,
                kind,
                detail: error.to_string(),
            });
            errors.push(error);
            false
        });

        Ok(TickOutcome::Collected(Batch {
            tick,
            samples,
            events,
        }))
    }
}

/// Binds configured target specs to running processes.
///
/// The system target always comes first with id 0; process targets are
/// numbered from 1 in config order. A process matched by several specs is
/// monitored once.
pub(crate) fn resolve_targets(
    processes: &ProcessList,
    specs: &[TargetSpec],
) -> Result<Vec<Target>, TargetError> {
    let mut targets = vec![Target::system()];
    let mut seen = HashSet::new();

    for spec in specs {
        let matches: Vec<_> = match spec {
            TargetSpec::Pid { pid } => {
                let info = processes
                    .find_pid(*pid)
                    .ok_or(TargetError::PidNotFound(*pid))?;
                vec![info]
            }
            TargetSpec::Name { name } => {
                let found: Vec<_> = processes.find_by_name(name).collect();
                if found.is_empty() {
                    return Err(TargetError::NameNotFound(name.clone()));
                }
                found
            }
        };

        for info in matches {
            if seen.insert(info.pid) {
                let id = TargetId(targets.len() as u32);
                let target = Target::process(id, info);
                info!("Monitoring {} as target {}", target.label(), id);
                targets.push(target);
            }
        }
    }

    Ok(targets)
}
