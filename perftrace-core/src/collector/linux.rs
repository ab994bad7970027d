use super::probe::SysProbe;
use super::types::{MetricValues, ProcessList, Target};
use super::{CollectError, Collector, Snapshot};
use crate::error::PlatformError;
use std::io;
use std::path::PathBuf;

/// Linux collector: `sysinfo` for CPU/memory/IO, `/proc` for threads and
/// open file descriptors.
pub struct LinuxCollector {
    probe: SysProbe,
    proc_root: PathBuf,
}

impl LinuxCollector {
    pub fn new() -> Self {
        Self {
            probe: SysProbe::new(),
            proc_root: PathBuf::from("/proc"),
        }
    }
}

impl Default for LinuxCollector {
    fn default() -> Self {
        Self::new()
    }
}

impl Collector for LinuxCollector {
    fn platform(&self) -> &'static str {
        "linux"
    }

    fn list_processes(&mut self) -> ProcessList {
        self.probe.list_processes()
    }

    fn total_memory(&mut self) -> Option<u64> {
        self.probe.total_memory()
    }

    fn snapshot(&mut self, targets: &[Target]) -> Result<Snapshot, PlatformError> {
        let timestamp = chrono::Utc::now().timestamp();
        let proc_root = &self.proc_root;

        Ok(self.probe.snapshot(targets, timestamp, |pid, values| {
            fill_proc_counts(proc_root, pid, values)
        }))
    }
}

fn fill_proc_counts(
    proc_root: &std::path::Path,
    pid: u32,
    values: &mut MetricValues,
) -> Result<(), CollectError> {
    let dir = proc_root.join(pid.to_string());

    let status = std::fs::read_to_string(dir.join("status")).map_err(|e| match e.kind() {
        io::ErrorKind::NotFound => CollectError::TargetNotFound { pid },
        io::ErrorKind::PermissionDenied => CollectError::PermissionDenied { pid },
        _ => CollectError::Transient(e.to_string()),
    })?;
    values.thread_count = parse_thread_count(&status);

    // fd listing needs the same uid (or CAP_SYS_PTRACE); leave it empty otherwise
    values.handle_count = std::fs::read_dir(dir.join("fd"))
        .ok()
        .map(|entries| entries.count() as u32);

    Ok(())
}

/// Extracts the `Threads:` field of `/proc/<pid>/status`.
fn parse_thread_count(status: &str) -> Option<u32> {
    status
        .lines()
        .find_map(|line| line.strip_prefix("Threads:"))
        .and_then(|rest| rest.trim().parse().ok())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collector::TargetId;
    use tempfile::tempdir;

    #[test]
    fn test_parse_thread_count() {
        let status = "Name:\tbash\nState:\tS (sleeping)\nThreads:\t7\nSigQ:\t0/63459\n";
        assert_eq!(parse_thread_count(status), Some(7));
        assert_eq!(parse_thread_count("Name:\tbash\n"), None);
    }

    #[test]
    fn test_fill_proc_counts_from_fake_proc() {
        let root = tempdir().unwrap();
        let dir = root.path().join("4242");
        std::fs::create_dir_all(dir.join("fd")).unwrap();
        std::fs::write(dir.join("status"), "Name:\tworker\nThreads:\t3\n").unwrap();
        for fd in ["0", "1", "2"] {
            std::fs::write(dir.join("fd").join(fd), "").unwrap();
        }

        let mut values = MetricValues::default();
        fill_proc_counts(root.path(), 4242, &mut values).unwrap();
        assert_eq!(values.thread_count, Some(3));
        assert_eq!(values.handle_count, Some(3));
    }

    #[test]
    fn test_missing_proc_entry_is_not_found() {
        let root = tempdir().unwrap();
        let mut values = MetricValues::default();
        let err = fill_proc_counts(root.path(), 1, &mut values).unwrap_err();
        assert_eq!(err, CollectError::TargetNotFound { pid: 1 });
    }

    #[test]
    fn test_snapshot_reads_own_process() {
        let mut collector = LinuxCollector::new();
        let list = collector.list_processes();
        let me = list
            .find_pid(std::process::id())
            .expect("current process should be listed")
            .clone();
        let target = Target::process(TargetId(1), &me);

        let snapshot = collector
            .snapshot(&[Target::system(), target.clone()])
            .unwrap();
        let sample = &snapshot.samples[&target.id];
        assert!(sample.values.memory_bytes.unwrap_or(0) > 0);
        assert!(sample.values.thread_count.unwrap_or(0) >= 1);
        assert!(snapshot.samples.contains_key(&TargetId::SYSTEM));
        assert!(collector.total_memory().unwrap_or(0) > 0);
        assert!(me.cmd.is_some());
    }
}
