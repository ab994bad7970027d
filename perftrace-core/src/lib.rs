//! perftrace-core - Sampling, persistence and analysis engine
//!
//! Provides the building blocks behind the `perftrace` tool:
//! - Platform collectors (Linux, Windows) behind one `Collector` trait
//! - A tick scheduler that feeds a bounded queue
//! - A single-writer SQLite session store
//! - A loader, downsampler and statistics engine for analysis
//!
//! ## Primary API
//!
//! Monitoring goes through [`Monitor`]; analysis goes through [`Loader`],
//! [`StoreReader`], [`downsample`] and [`compute_stats`].

// Public modules
pub mod analysis;
pub mod collector;
pub mod config;
pub mod error;
pub mod loader;
pub mod scheduler;
pub mod series;
pub mod store;

// Public exports
pub use analysis::{compute_stats, downsample, SeriesSummary, Statistics};
pub use collector::{
    create_collector, CollectError, Collector, Metric, MetricSample, MetricValues, ProcessInfo,
    ProcessList, Snapshot, Target, TargetId, TargetKind,
};
pub use config::{Config, ConfigError, TargetSpec, WriterConfig, DEFAULT_CONFIG_FILE};
pub use error::{Error, PlatformError, Result, TargetError};
pub use loader::{Diagnostic, LoadReport, Loader, StoreNode, TargetNode};
pub use scheduler::{Monitor, MonitorState, Progress, RunInfo, RunSummary};
pub use series::{Point, SeriesQuery, TimeRange};
pub use store::{DataError, SessionInfo, StorageError, StoreReader, StoredTarget, TargetEvent};
