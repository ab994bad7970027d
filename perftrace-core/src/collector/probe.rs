//! `sysinfo`-backed readings shared by every platform collector.

use super::types::{MetricValues, ProcessInfo, ProcessList, Target, TargetKind};
use super::{CollectError, Snapshot};
use sysinfo::{
    Networks, Pid, Process, ProcessRefreshKind, ProcessesToUpdate, System, UpdateKind, Users,
};

pub(crate) struct SysProbe {
    system: System,
    networks: Networks,
    users: Users,
}

impl SysProbe {
    pub fn new() -> Self {
        let mut system = System::new();
        system.refresh_cpu_usage();
        system.refresh_memory();

        Self {
            system,
            networks: Networks::new_with_refreshed_list(),
            users: Users::new_with_refreshed_list(),
        }
    }

    pub fn total_memory(&mut self) -> Option<u64> {
        self.system.refresh_memory();
        Some(self.system.total_memory()).filter(|&total| total > 0)
    }

    pub fn list_processes(&mut self) -> ProcessList {
        self.system.refresh_processes_specifics(
            ProcessesToUpdate::All,
            true,
            ProcessRefreshKind::new()
                .with_cmd(UpdateKind::OnlyIfNotSet)
                .with_user(UpdateKind::OnlyIfNotSet),
        );
        self.users.refresh_list();

        let users = &self.users;
        let processes = self
            .system
            .processes()
            .iter()
            .map(|(pid, process)| ProcessInfo {
                pid: pid.as_u32(),
                name: process.name().to_string_lossy().into_owned(),
                start_time: process.start_time() as i64,
                cmd: command_line(process),
                user: process
                    .user_id()
                    .and_then(|uid| users.get_user_by_id(uid))
                    .map(|user| user.name().to_string()),
            })
            .collect();

        ProcessList::new(processes)
    }

    /// Takes a snapshot of `targets`. `extra` fills in the platform-specific
    /// metrics (threads, handles) for each live process.
    pub fn snapshot<F>(&mut self, targets: &[Target], timestamp: i64, mut extra: F) -> Snapshot
    where
        F: FnMut(u32, &mut MetricValues) -> Result<(), CollectError>,
    {
        let pids: Vec<Pid> = targets
            .iter()
            .filter_map(|t| t.pid)
            .map(Pid::from_u32)
            .collect();

        if !pids.is_empty() {
            self.system.refresh_processes_specifics(
                ProcessesToUpdate::Some(&pids),
                true,
                ProcessRefreshKind::new()
                    .with_cpu()
                    .with_memory()
                    .with_disk_usage(),
            );
        }

        let mut snapshot = Snapshot::new(timestamp);
        for target in targets {
            let result = match (target.kind, target.pid) {
                (TargetKind::System, _) => Ok(self.system_values()),
                (TargetKind::Process, Some(pid)) => self.process_values(target, pid).and_then(
                    |mut values| {
                        extra(pid, &mut values)?;
                        Ok(values)
                    },
                ),
                (TargetKind::Process, None) => Err(CollectError::Transient(format!(
                    "target {} has no pid",
                    target.id
                ))),
            };
            snapshot.record(target.id, result);
        }

        snapshot
    }

    fn process_values(&self, target: &Target, pid: u32) -> Result<MetricValues, CollectError> {
        let process = self
            .system
            .process(Pid::from_u32(pid))
            .filter(|p| same_instance(target, p))
            .ok_or(CollectError::TargetNotFound { pid })?;

        let disk = process.disk_usage();
        Ok(MetricValues {
            cpu_percent: Some(f64::from(process.cpu_usage())),
            memory_bytes: Some(process.memory()),
            read_bytes: Some(disk.total_read_bytes),
            write_bytes: Some(disk.total_written_bytes),
            ..Default::default()
        })
    }

    fn system_values(&mut self) -> MetricValues {
        self.system.refresh_cpu_usage();
        self.system.refresh_memory();
        self.networks.refresh();

        let net_bytes = self
            .networks
            .iter()
            .map(|(_, data)| data.total_received() + data.total_transmitted())
            .sum();

        MetricValues {
            cpu_percent: Some(f64::from(self.system.global_cpu_usage())),
            memory_bytes: Some(self.system.used_memory()),
            net_bytes: Some(net_bytes),
            ..Default::default()
        }
    }
}

fn command_line(process: &Process) -> Option<String> {
    let args: Vec<_> = process.cmd().iter().map(|arg| arg.to_string_lossy()).collect();
    if args.is_empty() {
        None
    } else {
        Some(args.join(" "))
    }
}

/// A pid recycled by the OS belongs to a different process instance.
fn same_instance(target: &Target, process: &Process) -> bool {
    target
        .start_time
        .map_or(true, |start| start == process.start_time() as i64)
}
