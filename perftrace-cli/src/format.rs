use chrono::{DateTime, Local};
use perftrace_core::Metric;

/// Local wall-clock time of a unix timestamp.
pub fn timestamp(ts: i64) -> String {
    match DateTime::from_timestamp(ts, 0) {
        Some(utc) => utc
            .with_timezone(&Local)
            .format("%Y-%m-%d %H:%M:%S")
            .to_string(),
        None => ts.to_string(),
    }
}

pub fn opt_timestamp(ts: Option<i64>) -> String {
    ts.map(timestamp).unwrap_or_else(|| "-".to_string())
}

pub fn bytes(value: f64) -> String {
    const UNITS: [&str; 5] = ["B", "KiB", "MiB", "GiB", "TiB"];
    let mut value = value;
    let mut unit = 0;
    while value.abs() >= 1024.0 && unit < UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }
    if unit == 0 {
        format!("{:.0} {}", value, UNITS[unit])
    } else {
        format!("{:.1} {}", value, UNITS[unit])
    }
}

/// Renders a metric value in its natural unit.
pub fn value(metric: Metric, value: f64) -> String {
    match metric {
        Metric::CpuPercent => format!("{:.1}%", value),
        Metric::MemoryBytes | Metric::ReadBytes | Metric::WriteBytes | Metric::NetBytes => {
            bytes(value)
        }
        Metric::ThreadCount | Metric::HandleCount => format!("{:.0}", value),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bytes() {
        assert_eq!(bytes(512.0), "512 B");
        assert_eq!(bytes(1536.0), "1.5 KiB");
        assert_eq!(bytes(3.0 * 1024.0 * 1024.0 * 1024.0), "3.0 GiB");
    }

    #[test]
    fn test_metric_values() {
        assert_eq!(value(Metric::CpuPercent, 12.345), "12.3%");
        assert_eq!(value(Metric::ThreadCount, 8.0), "8");
        assert_eq!(opt_timestamp(None), "-");
    }
}
