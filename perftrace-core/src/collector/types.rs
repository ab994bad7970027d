use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Run-scoped identifier of a monitored target.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TargetId(pub u32);

impl TargetId {
    /// The system pseudo-target is always the first target of a run.
    pub const SYSTEM: TargetId = TargetId(0);
}

impl fmt::Display for TargetId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TargetKind {
    Process,
    System,
}

impl TargetKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            TargetKind::Process => "process",
            TargetKind::System => "system",
        }
    }
}

impl FromStr for TargetKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "process" => Ok(TargetKind::Process),
            "system" => Ok(TargetKind::System),
            other => Err(format!("unknown target kind '{}'", other)),
        }
    }
}

/// A monitored entity: one process instance, or the whole system.
///
/// A process target is identified by its pid *and* start time, so a pid
/// recycled by the OS after the original process exits never matches.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Target {
    pub id: TargetId,
    pub kind: TargetKind,
    pub pid: Option<u32>,
    pub name: String,
    /// Process start time in unix seconds.
    pub start_time: Option<i64>,
    /// Command line at resolution time.
    pub cmd: Option<String>,
    pub user: Option<String>,
}

impl Target {
    pub fn system() -> Self {
        Self {
            id: TargetId::SYSTEM,
            kind: TargetKind::System,
            pid: None,
            name: "system".to_string(),
            start_time: None,
            cmd: None,
            user: None,
        }
    }

    pub fn process(id: TargetId, info: &ProcessInfo) -> Self {
        Self {
            id,
            kind: TargetKind::Process,
            pid: Some(info.pid),
            name: info.name.clone(),
            start_time: Some(info.start_time),
            cmd: info.cmd.clone(),
            user: info.user.clone(),
        }
    }

    pub fn is_system(&self) -> bool {
        self.kind == TargetKind::System
    }

    /// Human readable label, e.g. `postgres (PID: 812)`.
    pub fn label(&self) -> String {
        match self.pid {
            Some(pid) => format!("{} (PID: {})", self.name, pid),
            None => self.name.clone(),
        }
    }
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("Unknown metric '{0}'")]
pub struct UnknownMetric(pub String);

/// The fixed set of metrics a sample can carry.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, JsonSchema,
)]
#[serde(rename_all = "snake_case")]
pub enum Metric {
    CpuPercent,
    MemoryBytes,
    ReadBytes,
    WriteBytes,
    NetBytes,
    ThreadCount,
    HandleCount,
}

impl Metric {
    pub const ALL: [Metric; 7] = [
        Metric::CpuPercent,
        Metric::MemoryBytes,
        Metric::ReadBytes,
        Metric::WriteBytes,
        Metric::NetBytes,
        Metric::ThreadCount,
        Metric::HandleCount,
    ];

    /// Metric name; doubles as the `samples` column name.
    pub fn name(&self) -> &'static str {
        match self {
            Metric::CpuPercent => "cpu_percent",
            Metric::MemoryBytes => "memory_bytes",
            Metric::ReadBytes => "read_bytes",
            Metric::WriteBytes => "write_bytes",
            Metric::NetBytes => "net_bytes",
            Metric::ThreadCount => "thread_count",
            Metric::HandleCount => "handle_count",
        }
    }
}

impl fmt::Display for Metric {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for Metric {
    type Err = UnknownMetric;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Metric::ALL
            .into_iter()
            .find(|m| m.name() == s)
            .ok_or_else(|| UnknownMetric(s.to_string()))
    }
}

/// Metric values of one sample. `None` means disabled or not available.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MetricValues {
    pub cpu_percent: Option<f64>,
    pub memory_bytes: Option<u64>,
    pub read_bytes: Option<u64>,
    pub write_bytes: Option<u64>,
    pub net_bytes: Option<u64>,
    pub thread_count: Option<u32>,
    pub handle_count: Option<u32>,
}

impl MetricValues {
    pub fn get(&self, metric: Metric) -> Option<f64> {
        match metric {
            Metric::CpuPercent => self.cpu_percent,
            Metric::MemoryBytes => self.memory_bytes.map(|v| v as f64),
            Metric::ReadBytes => self.read_bytes.map(|v| v as f64),
            Metric::WriteBytes => self.write_bytes.map(|v| v as f64),
            Metric::NetBytes => self.net_bytes.map(|v| v as f64),
            Metric::ThreadCount => self.thread_count.map(f64::from),
            Metric::HandleCount => self.handle_count.map(f64::from),
        }
    }

    /// Clears every metric not listed in `enabled`.
    pub fn retain(&mut self, enabled: &[Metric]) {
        for metric in Metric::ALL {
            if enabled.contains(&metric) {
                continue;
            }
            match metric {
                Metric::CpuPercent => self.cpu_percent = None,
                Metric::MemoryBytes => self.memory_bytes = None,
                Metric::ReadBytes => self.read_bytes = None,
                Metric::WriteBytes => self.write_bytes = None,
                Metric::NetBytes => self.net_bytes = None,
                Metric::ThreadCount => self.thread_count = None,
                Metric::HandleCount => self.handle_count = None,
            }
        }
    }
}

/// One measurement of one target at one second.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricSample {
    pub target: TargetId,
    /// Unix seconds.
    pub timestamp: i64,
    pub values: MetricValues,
}

/// Basic process information, as shown in a process picker.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcessInfo {
    pub pid: u32,
    pub name: String,
    /// Unix seconds.
    pub start_time: i64,
    /// Arguments joined by spaces; `None` when the OS hides them.
    pub cmd: Option<String>,
    /// Owning user name, if it could be resolved.
    pub user: Option<String>,
}

/// A finite, restartable process enumeration ordered by pid.
#[derive(Debug, Clone, Default)]
pub struct ProcessList {
    processes: Vec<ProcessInfo>,
}

impl ProcessList {
    pub fn new(mut processes: Vec<ProcessInfo>) -> Self {
        processes.sort_by_key(|p| p.pid);
        Self { processes }
    }

    pub fn iter(&self) -> std::slice::Iter<'_, ProcessInfo> {
        self.processes.iter()
    }

    pub fn len(&self) -> usize {
        self.processes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.processes.is_empty()
    }

    pub fn find_pid(&self, pid: u32) -> Option<&ProcessInfo> {
        self.processes
            .binary_search_by_key(&pid, |p| p.pid)
            .ok()
            .map(|idx| &self.processes[idx])
    }

    /// Processes whose name matches `name`, ignoring case.
    pub fn find_by_name<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a ProcessInfo> + 'a {
        self.processes
            .iter()
            .filter(move |p| p.name.eq_ignore_ascii_case(name))
    }
}

impl<'a> IntoIterator for &'a ProcessList {
    type Item = &'a ProcessInfo;
    type IntoIter = std::slice::Iter<'a, ProcessInfo>;

    fn into_iter(self) -> Self::IntoIter {
        self.processes.iter()
    }
}

impl IntoIterator for ProcessList {
    type Item = ProcessInfo;
    type IntoIter = std::vec::IntoIter<ProcessInfo>;

    fn into_iter(self) -> Self::IntoIter {
        self.processes.into_iter()
    }
}
