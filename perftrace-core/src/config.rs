use crate::collector::Metric;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    FileRead(#[from] std::io::Error),

    #[error("Failed to parse config: {0}")]
    Parse(#[from] serde_yaml::Error),

    #[error("Invalid config: {0}")]
    Invalid(String),
}

pub type Result<T> = std::result::Result<T, ConfigError>;

/// Config file picked up from the working directory when none is given.
pub const DEFAULT_CONFIG_FILE: &str = "perftrace.yaml";

/// Upper bounds for writer sizes; both are preallocated or held in memory.
pub const MAX_QUEUE_CAPACITY: usize = 1 << 16;
pub const MAX_BATCH_SIZE: usize = 1 << 20;

/// Configuration of one monitoring run.
///
/// Every field has a default; a config file only needs the values it wants
/// to override. JSON files are accepted too, since JSON is valid YAML.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    /// Seconds between two samples.
    pub interval_seconds: u64,
    /// Directory receiving one store file per session.
    pub output_dir: PathBuf,
    /// Processes to monitor. The system target is always monitored.
    pub targets: Vec<TargetSpec>,
    /// Metrics to record; the others are stored as NULL.
    pub metrics: Vec<Metric>,
    /// Upper bound for one snapshot. Defaults to 80% of the interval.
    pub snapshot_timeout_ms: Option<u64>,
    pub writer: WriterConfig,
}

/// How a monitored process is selected.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(untagged)]
pub enum TargetSpec {
    /// One process instance.
    Pid { pid: u32 },
    /// Every process whose name matches, ignoring case.
    Name { name: String },
}

/// Batching and backpressure settings of the store writer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(default, deny_unknown_fields)]
pub struct WriterConfig {
    /// Commit once this many samples are pending.
    pub batch_size: usize,
    /// Commit once the oldest pending sample is this old.
    pub flush_interval_secs: u64,
    /// Tick batches buffered between scheduler and writer. When full, the
    /// oldest batch is dropped.
    pub queue_capacity: usize,
    /// Extra attempts for a failed commit before the run stops.
    pub commit_retries: u32,
}

impl Default for WriterConfig {
    fn default() -> Self {
        Self {
            batch_size: 500,
            flush_interval_secs: 2,
            queue_capacity: 64,
            commit_retries: 3,
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            interval_seconds: 1,
            output_dir: PathBuf::from("./data/sessions"),
            targets: Vec::new(),
            metrics: Metric::ALL.to_vec(),
            snapshot_timeout_ms: None,
            writer: WriterConfig::default(),
        }
    }
}

impl Config {
    /// Load configuration from a YAML (or JSON) file.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let contents = fs::read_to_string(path)?;
        Self::from_yaml_str(&contents)
    }

    /// Parse configuration text; missing fields take their defaults.
    pub fn from_yaml_str(contents: &str) -> Result<Self> {
        if contents.trim().is_empty() {
            return Ok(Self::default());
        }
        Ok(serde_yaml::from_str(contents)?)
    }

    /// Load configuration from `perftrace.yaml` if it exists, otherwise use defaults.
    pub fn load_or_default() -> Result<Self> {
        Self::load_or_default_from(DEFAULT_CONFIG_FILE)
    }

    /// Like [`Config::load`], but a missing file yields the defaults. A file
    /// that exists and does not parse is still an error.
    pub fn load_or_default_from<P: AsRef<Path>>(path: P) -> Result<Self> {
        match Self::load(path) {
            Err(ConfigError::FileRead(e)) if e.kind() == io::ErrorKind::NotFound => {
                Ok(Self::default())
            }
            other => other,
        }
    }

    /// Create a new Config with default values and builder-style configuration.
    pub fn new() -> Self {
        Self::default()
    }

    /// Render as YAML, e.g. to write a starter config file.
    pub fn to_yaml(&self) -> Result<String> {
        Ok(serde_yaml::to_string(self)?)
    }

    /// JSON schema of the config file format.
    pub fn json_schema() -> schemars::Schema {
        schemars::schema_for!(Config)
    }

    /// Check value ranges that serde cannot express.
    pub fn validate(&self) -> Result<()> {
        if self.interval_seconds == 0 {
            return Err(invalid("interval_seconds must be at least 1"));
        }
        if self.metrics.is_empty() {
            return Err(invalid("at least one metric must be enabled"));
        }
        for (i, metric) in self.metrics.iter().enumerate() {
            if self.metrics[..i].contains(metric) {
                return Err(invalid(format!("metric '{}' listed twice", metric)));
            }
        }
        for target in &self.targets {
            match target {
                TargetSpec::Pid { pid: 0 } => return Err(invalid("pid 0 cannot be monitored")),
                TargetSpec::Name { name } if name.trim().is_empty() => {
                    return Err(invalid("target name must not be empty"))
                }
                _ => {}
            }
        }
        if let Some(timeout) = self.snapshot_timeout_ms {
            if timeout == 0 || timeout >= self.interval_seconds.saturating_mul(1000) {
                return Err(invalid(
                    "snapshot_timeout_ms must be positive and shorter than the interval",
                ));
            }
        }
        if self.writer.batch_size == 0 || self.writer.queue_capacity == 0 {
            return Err(invalid("writer batch_size and queue_capacity must be positive"));
        }
        if self.writer.batch_size > MAX_BATCH_SIZE {
            return Err(invalid(format!(
                "writer batch_size must be at most {}",
                MAX_BATCH_SIZE
            )));
        }
        if self.writer.queue_capacity > MAX_QUEUE_CAPACITY {
            return Err(invalid(format!(
                "writer queue_capacity must be at most {}",
                MAX_QUEUE_CAPACITY
            )));
        }
        if self.writer.flush_interval_secs == 0 {
            return Err(invalid("writer flush_interval_secs must be at least 1"));
        }
        Ok(())
    }

    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_seconds)
    }

    /// Effective per-snapshot timeout.
    pub fn snapshot_timeout(&self) -> Duration {
        match self.snapshot_timeout_ms {
            Some(ms) => Duration::from_millis(ms),
            None => self.interval().mul_f64(0.8),
        }
    }

    pub fn flush_interval(&self) -> Duration {
        Duration::from_secs(self.writer.flush_interval_secs)
    }

    pub fn is_enabled(&self, metric: Metric) -> bool {
        self.metrics.contains(&metric)
    }

    /// Set the sampling interval in seconds.
    pub fn with_interval_seconds(mut self, seconds: u64) -> Self {
        self.interval_seconds = seconds;
        self
    }

    /// Set the directory receiving session files.
    pub fn with_output_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.output_dir = dir.into();
        self
    }

    /// Monitor one process by pid.
    pub fn with_pid(mut self, pid: u32) -> Self {
        self.targets.push(TargetSpec::Pid { pid });
        self
    }

    /// Monitor every process with the given name.
    pub fn with_process_name(mut self, name: impl Into<String>) -> Self {
        self.targets.push(TargetSpec::Name { name: name.into() });
        self
    }

    /// Replace the enabled metric set.
    pub fn with_metrics(mut self, metrics: Vec<Metric>) -> Self {
        self.metrics = metrics;
        self
    }

    /// Set an explicit snapshot timeout.
    pub fn with_snapshot_timeout(mut self, timeout: Duration) -> Self {
        self.snapshot_timeout_ms = Some(timeout.as_millis() as u64);
        self
    }

    /// Configure writer settings.
    pub fn with_writer_config(mut self, writer: WriterConfig) -> Self {
        self.writer = writer;
        self
    }
}

fn invalid(msg: impl Into<String>) -> ConfigError {
    ConfigError::Invalid(msg.into())
}
