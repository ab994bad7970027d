//! Windows collector: `sysinfo` for CPU/memory/IO, Win32 for thread and
//! handle counts.

use super::probe::SysProbe;
use super::types::{ProcessList, Target};
use super::{CollectError, Collector, Snapshot};
use crate::error::PlatformError;
use std::collections::HashMap;
use windows::core::HRESULT;
use windows::Win32::Foundation::{CloseHandle, E_ACCESSDENIED, E_INVALIDARG, HANDLE};
use windows::Win32::System::Diagnostics::ToolHelp::{
    CreateToolhelp32Snapshot, Thread32First, Thread32Next, TH32CS_SNAPTHREAD, THREADENTRY32,
};
use windows::Win32::System::Threading::{
    GetProcessHandleCount, OpenProcess, PROCESS_QUERY_LIMITED_INFORMATION,
};

pub struct WindowsCollector {
    probe: SysProbe,
}

impl WindowsCollector {
    pub fn new() -> Self {
        Self {
            probe: SysProbe::new(),
        }
    }
}

impl Default for WindowsCollector {
    fn default() -> Self {
        Self::new()
    }
}

impl Collector for WindowsCollector {
    fn platform(&self) -> &'static str {
        "windows"
    }

    fn list_processes(&mut self) -> ProcessList {
        self.probe.list_processes()
    }

    fn total_memory(&mut self) -> Option<u64> {
        self.probe.total_memory()
    }

    fn snapshot(&mut self, targets: &[Target]) -> Result<Snapshot, PlatformError> {
        let timestamp = chrono::Utc::now().timestamp();
        let threads = thread_counts();

        Ok(self.probe.snapshot(targets, timestamp, |pid, values| {
            values.thread_count = threads.get(&pid).copied();
            values.handle_count = handle_count(pid)?;
            Ok(())
        }))
    }
}

/// Closes the wrapped handle on drop.
struct OwnedHandle(HANDLE);

impl Drop for OwnedHandle {
    fn drop(&mut self) {
        if !self.0.is_invalid() {
            // SAFETY: the handle was returned by a successful Win32 call and is closed once
            unsafe {
                let _ = CloseHandle(self.0);
            }
        }
    }
}

/// Handle count of `pid`. Protected processes deny the query; their count is
/// left empty and the rest of the sample is kept.
fn handle_count(pid: u32) -> Result<Option<u32>, CollectError> {
    // SAFETY: plain FFI call, the returned handle is owned by OwnedHandle
    let process = match unsafe { OpenProcess(PROCESS_QUERY_LIMITED_INFORMATION, false, pid) } {
        Ok(handle) => OwnedHandle(handle),
        Err(e) => return open_failure(pid, e.code()).map_or(Ok(None), Err),
    };

    let mut count = 0u32;
    // SAFETY: `process` is a valid handle with query rights and `count` outlives the call
    unsafe { GetProcessHandleCount(process.0, &mut count) }
        .map_err(|e| CollectError::Transient(e.to_string()))?;

    Ok(Some(count))
}

/// Classifies an `OpenProcess` failure. `None` means the process exists but
/// cannot be queried.
fn open_failure(pid: u32, code: HRESULT) -> Option<CollectError> {
    if code == E_ACCESSDENIED {
        None
    } else if code == E_INVALIDARG {
        // no such pid
        Some(CollectError::TargetNotFound { pid })
    } else {
        Some(CollectError::Transient(format!(
            "OpenProcess({}) failed: {:?}",
            pid, code
        )))
    }
}

/// Thread counts of every process, from one ToolHelp snapshot.
fn thread_counts() -> HashMap<u32, u32> {
    let mut counts = HashMap::new();

    // SAFETY: FFI calls with a properly sized THREADENTRY32
    unsafe {
        let Ok(snapshot) = CreateToolhelp32Snapshot(TH32CS_SNAPTHREAD, 0) else {
            return counts;
        };
        let snapshot = OwnedHandle(snapshot);

        let mut entry = THREADENTRY32 {
            dwSize: std::mem::size_of::<THREADENTRY32>() as u32,
            ..Default::default()
        };

        if Thread32First(snapshot.0, &mut entry).is_ok() {
            loop {
                *counts.entry(entry.th32OwnerProcessID).or_insert(0) += 1;
                if Thread32Next(snapshot.0, &mut entry).is_err() {
                    break;
                }
            }
        }
    }

    counts
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_access_denied_leaves_handle_count_empty() {
        assert_eq!(open_failure(4, E_ACCESSDENIED), None);
        assert_eq!(
            open_failure(4, E_INVALIDARG),
            Some(CollectError::TargetNotFound { pid: 4 })
        );
    }

    #[test]
    fn test_handle_count_of_own_process() {
        let count = handle_count(std::process::id()).unwrap();
        assert!(count.unwrap_or(0) > 0);
    }
}
