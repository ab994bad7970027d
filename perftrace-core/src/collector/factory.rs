//! Collector factory selecting the implementation for the host OS.

use super::Collector;
use crate::error::PlatformError;
use std::fmt;
use tracing::info;

/// Operating systems the tool knows about.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Platform {
    Linux,
    Windows,
    Other(&'static str),
}

impl Platform {
    /// Detects the platform this binary was built for.
    pub fn current() -> Self {
        match std::env::consts::OS {
            "linux" => Platform::Linux,
            "windows" => Platform::Windows,
            other => Platform::Other(other),
        }
    }
}

impl fmt::Display for Platform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Platform::Linux => f.write_str("linux"),
            Platform::Windows => f.write_str("windows"),
            Platform::Other(name) => f.write_str(name),
        }
    }
}

/// Creates the collector for the current platform.
///
/// Called once at monitor start; the choice never changes during a run.
///
/// Supported platforms:
/// - `linux` - [`LinuxCollector`](super::LinuxCollector)
/// - `windows` - [`WindowsCollector`](super::WindowsCollector)
pub fn create_collector() -> Result<Box<dyn Collector>, PlatformError> {
    let platform = Platform::current();

    info!("Creating collector for platform: {}", platform);

    if !sysinfo::IS_SUPPORTED_SYSTEM {
        return Err(PlatformError::Unsupported(platform.to_string()));
    }

    match platform {
        #[cfg(target_os = "linux")]
        Platform::Linux => Ok(Box::new(super::LinuxCollector::new())),
        #[cfg(windows)]
        Platform::Windows => Ok(Box::new(super::WindowsCollector::new())),
        other => Err(PlatformError::Unsupported(other.to_string())),
    }
}
