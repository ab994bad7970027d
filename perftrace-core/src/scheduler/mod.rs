//! Sampling scheduler and run control.
//!
//! The scheduler is organized into separate concerns:
//! - `engine`: one tick (snapshot under a timeout, target lifecycle)
//! - `queue`: bounded drop-oldest hand-off to the store writer
//!
//! [`Monitor`] wires them together: a tokio task runs the tick loop, a
//! blocking task owns the [`SessionWriter`] and drains the queue.

mod engine;
mod queue;

pub use queue::{Batch, Pop, PushOutcome, SampleQueue};

use crate::collector::{create_collector, Collector, Target};
use crate::config::Config;
use crate::error::{Error, PlatformError, Result, TargetError};
use crate::store::{create_session_path, SessionMeta, SessionWriter, StorageError, WriterReport};
use engine::{resolve_targets, SharedCollector, SkipReason, TickEngine, TickOutcome};
use serde::Serialize;
use std::fmt;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// How long the writer waits for a batch when nothing is pending.
const WRITER_IDLE_WAIT: Duration = Duration::from_millis(250);

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum MonitorState {
    #[default]
    Idle,
    Running,
    Stopping,
    Stopped,
}

impl fmt::Display for MonitorState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            MonitorState::Idle => "idle",
            MonitorState::Running => "running",
            MonitorState::Stopping => "stopping",
            MonitorState::Stopped => "stopped",
        };
        f.write_str(name)
    }
}

/// Live counters, published after every tick and on every state change.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct Progress {
    pub state: MonitorState,
    pub ticks: u64,
    pub skipped_ticks: u64,
    pub samples_collected: u64,
    pub samples_written: u64,
    pub samples_dropped: u64,
    pub live_targets: usize,
    /// Timestamp of the most recent tick that produced samples.
    pub last_sample_at: Option<i64>,
}

/// What a started run is recording.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RunInfo {
    pub session_path: PathBuf,
    pub started_at: i64,
    pub platform: String,
    pub targets: Vec<Target>,
}

/// Final account of a stopped run.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RunSummary {
    pub session_path: PathBuf,
    pub started_at: i64,
    pub stopped_at: i64,
    pub ticks: u64,
    pub skipped_ticks: u64,
    pub samples_collected: u64,
    pub samples_written: u64,
    pub samples_dropped: u64,
    pub target_errors: Vec<TargetError>,
}

#[derive(Default)]
struct RunCounters {
    samples_written: AtomicU64,
}

#[derive(Default)]
struct TickerReport {
    ticks: u64,
    skipped_ticks: u64,
    samples_collected: u64,
    target_errors: Vec<TargetError>,
    fatal: Option<PlatformError>,
}

struct ActiveRun {
    info: RunInfo,
    cancel: CancellationToken,
    finished: CancellationToken,
    queue: Arc<SampleQueue>,
    ticker: JoinHandle<TickerReport>,
    writer: JoinHandle<std::result::Result<WriterReport, StorageError>>,
}

/// Control surface of a monitoring run.
///
/// `start` and `stop` are the only transitions:
/// `Idle -> Running -> Stopping -> Stopped`. A stopped monitor may be started
/// again; each run writes its own session file.
pub struct Monitor {
    state: MonitorState,
    progress: Arc<watch::Sender<Progress>>,
    run: Option<ActiveRun>,
}

impl Default for Monitor {
    fn default() -> Self {
        Self::new()
    }
}

impl Monitor {
    pub fn new() -> Self {
        let (progress, _) = watch::channel(Progress::default());
        Self {
            state: MonitorState::Idle,
            progress: Arc::new(progress),
            run: None,
        }
    }

    pub fn state(&self) -> MonitorState {
        self.state
    }

    /// Receives a [`Progress`] update after every tick.
    pub fn subscribe(&self) -> watch::Receiver<Progress> {
        self.progress.subscribe()
    }

    pub fn run_info(&self) -> Option<&RunInfo> {
        self.run.as_ref().map(|run| &run.info)
    }

    /// Cancelled once the tick loop has ended, whether by `stop` or by a
    /// fatal error. `None` when no run is active.
    pub fn finished(&self) -> Option<CancellationToken> {
        self.run.as_ref().map(|run| run.finished.clone())
    }

    /// Starts a run with the collector for the current platform.
    pub async fn start(&mut self, config: Config) -> Result<RunInfo> {
        self.ensure_startable()?;
        config.validate()?;
        let collector = create_collector()?;
        self.start_with_collector(config, collector).await
    }

    /// Starts a run with an explicit collector.
    ///
    /// Targets are resolved and the store is created before this returns, so
    /// a missing process or an unwritable output directory fails here and no
    /// tick ever runs.
    pub async fn start_with_collector(
        &mut self,
        config: Config,
        mut collector: Box<dyn Collector>,
    ) -> Result<RunInfo> {
        self.ensure_startable()?;
        config.validate()?;

        let processes = collector.list_processes();
        let targets = resolve_targets(&processes, &config.targets)?;
        collector.prime(&targets);

        let started = chrono::Local::now();
        let session_path = create_session_path(&config.output_dir, &started)?;
        let meta = SessionMeta {
            started_at: started.timestamp(),
            platform: collector.platform().to_string(),
            config_json: serde_json::to_string(&config).map_err(StorageError::from)?,
            memory_total: collector.total_memory(),
        };
        let writer = SessionWriter::create(&session_path, &meta, &targets, &config.writer)?;

        let info = RunInfo {
            session_path,
            started_at: meta.started_at,
            platform: meta.platform,
            targets: targets.clone(),
        };

        let queue = Arc::new(SampleQueue::new(config.writer.queue_capacity));
        let counters = Arc::new(RunCounters::default());
        let cancel = CancellationToken::new();
        let finished = CancellationToken::new();

        let writer = {
            let queue = Arc::clone(&queue);
            let counters = Arc::clone(&counters);
            tokio::task::spawn_blocking(move || run_writer(writer, &queue, &counters))
        };

        let shared: SharedCollector = Arc::new(Mutex::new(collector));
        let engine = TickEngine::new(
            shared,
            targets,
            config.metrics.clone(),
            config.snapshot_timeout(),
        );
        let ticker = tokio::spawn(run_ticks(
            engine,
            config.interval(),
            Arc::clone(&queue),
            counters,
            cancel.clone(),
            finished.clone(),
            Arc::clone(&self.progress),
        ));

        info!(
            "Monitoring {} targets every {}s into {}",
            info.targets.len(),
            config.interval_seconds,
            info.session_path.display()
        );

        self.run = Some(ActiveRun {
            info: info.clone(),
            cancel,
            finished,
            queue,
            ticker,
            writer,
        });
        self.progress.send_modify(|p| {
            *p = Progress {
                live_targets: info.targets.len(),
                ..Default::default()
            }
        });
        self.set_state(MonitorState::Running);

        Ok(info)
    }

    /// Stops the tick loop, drains and closes the store, and reports totals.
    ///
    /// A run that ended on its own (fatal platform or storage failure) still
    /// needs `stop`; the failure is returned here once the store is closed.
    pub async fn stop(&mut self) -> Result<RunSummary> {
        if self.state != MonitorState::Running {
            return Err(Error::InvalidState {
                action: "stop",
                state: self.state,
            });
        }
        let Some(run) = self.run.take() else {
            return Err(Error::InvalidState {
                action: "stop",
                state: self.state,
            });
        };

        self.set_state(MonitorState::Stopping);
        info!("Stopping monitor");

        run.cancel.cancel();
        let report = match run.ticker.await {
            Ok(report) => report,
            Err(e) if e.is_panic() => std::panic::resume_unwind(e.into_panic()),
            Err(e) => {
                warn!("Tick loop ended abnormally: {}", e);
                TickerReport::default()
            }
        };
        run.queue.close();

        let written = match run.writer.await {
            Ok(result) => result,
            Err(e) => {
                error!("Store writer task failed: {}", e);
                Err(StorageError::WriterGone)
            }
        };

        self.set_state(MonitorState::Stopped);

        let written = written?;
        if let Some(fatal) = report.fatal {
            return Err(fatal.into());
        }

        let summary = RunSummary {
            session_path: written.path,
            started_at: run.info.started_at,
            stopped_at: chrono::Utc::now().timestamp(),
            ticks: report.ticks,
            skipped_ticks: report.skipped_ticks,
            samples_collected: report.samples_collected,
            samples_written: written.samples_written,
            samples_dropped: written.samples_dropped,
            target_errors: report.target_errors,
        };
        info!(
            "Run finished: {} samples written, {} dropped, {} ticks skipped",
            summary.samples_written, summary.samples_dropped, summary.skipped_ticks
        );
        Ok(summary)
    }

    fn ensure_startable(&self) -> Result<()> {
        match self.state {
            MonitorState::Idle | MonitorState::Stopped => Ok(()),
            state => Err(Error::InvalidState {
                action: "start",
                state,
            }),
        }
    }

    fn set_state(&mut self, state: MonitorState) {
        debug!("Monitor state {} -> {}", self.state, state);
        self.state = state;
        self.progress.send_modify(|p| p.state = state);
    }
}

impl Drop for Monitor {
    fn drop(&mut self) {
        // The writer still drains and closes the file in the background.
        if let Some(run) = &self.run {
            run.cancel.cancel();
        }
    }
}

async fn run_ticks(
    mut engine: TickEngine,
    period: Duration,
    queue: Arc<SampleQueue>,
    counters: Arc<RunCounters>,
    cancel: CancellationToken,
    finished: CancellationToken,
    progress: Arc<watch::Sender<Progress>>,
) -> TickerReport {
    let mut report = TickerReport::default();
    let mut last_sample_at = None;

    let mut interval = tokio::time::interval(period);
    interval.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            _ = interval.tick() => {}
        }

        report.ticks += 1;
        match engine.tick().await {
            Ok(TickOutcome::Collected(batch)) => {
                report.samples_collected += batch.samples.len() as u64;
                if let Some(sample) = batch.samples.first() {
                    last_sample_at = Some(sample.timestamp);
                }
                match queue.push(batch) {
                    PushOutcome::Queued => {}
                    PushOutcome::DroppedOldest { samples } => {
                        warn!("Store writer is behind; dropped {} samples", samples)
                    }
                    PushOutcome::Closed => {
                        error!("Store writer stopped; ending run");
                        break;
                    }
                }
            }
            Ok(TickOutcome::Skipped(reason)) => {
                report.skipped_ticks += 1;
                if reason == SkipReason::Failed {
                    warn!("Snapshot failed on tick {}", report.ticks);
                }
            }
            Err(e) => {
                error!("Fatal platform error, ending run: {}", e);
                report.fatal = Some(e);
                break;
            }
        }

        progress.send_modify(|p| {
            p.ticks = report.ticks;
            p.skipped_ticks = report.skipped_ticks;
            p.samples_collected = report.samples_collected;
            p.samples_written = counters.samples_written.load(Ordering::Relaxed);
            p.samples_dropped = queue.dropped_samples();
            p.live_targets = engine.live_targets();
            p.last_sample_at = last_sample_at;
        });
    }

    queue.close();
    finished.cancel();
    report.target_errors = engine.into_errors();
    report
}

fn run_writer(
    writer: SessionWriter,
    queue: &SampleQueue,
    counters: &RunCounters,
) -> std::result::Result<WriterReport, StorageError> {
    let result = drain_queue(writer, queue, counters);
    if let Err(e) = &result {
        error!("Store writer failed: {}", e);
        queue.close();
    }
    result
}

fn drain_queue(
    mut writer: SessionWriter,
    queue: &SampleQueue,
    counters: &RunCounters,
) -> std::result::Result<WriterReport, StorageError> {
    loop {
        let wait = writer.flush_deadline().unwrap_or(WRITER_IDLE_WAIT);
        match queue.pop_timeout(wait) {
            Pop::Batch(batch) => writer.write(batch.samples, batch.events)?,
            Pop::Timeout => {}
            Pop::Closed => break,
        }
        writer.flush_if_due()?;
        counters
            .samples_written
            .store(writer.samples_written(), Ordering::Relaxed);
    }

    let report = writer.close(queue.dropped_samples(), chrono::Utc::now().timestamp())?;
    counters
        .samples_written
        .store(report.samples_written, Ordering::Relaxed);
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_display() {
        assert_eq!(MonitorState::Idle.to_string(), "idle");
        assert_eq!(MonitorState::Stopping.to_string(), "stopping");
    }

    #[tokio::test]
    async fn test_stop_before_start_is_rejected() {
        let mut monitor = Monitor::new();
        let err = monitor.stop().await.unwrap_err();
        assert!(matches!(
            err,
            Error::InvalidState {
                action: "stop",
                state: MonitorState::Idle
            }
        ));
        assert_eq!(err.exit_code(), 6);
    }

    #[tokio::test]
    async fn test_invalid_config_fails_before_collector() {
        let mut monitor = Monitor::new();
        let err = monitor
            .start(Config::new().with_interval_seconds(0))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Config(_)));
        assert_eq!(monitor.state(), MonitorState::Idle);
        assert!(monitor.finished().is_none());
    }
}
