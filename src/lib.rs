//! perftrace - record process and system performance counters, then analyze
//! them offline.
//!
//! This crate re-exports [`perftrace_core`]. Start a recording with
//! [`Monitor`], reopen it with [`Loader`] or [`StoreReader`], and reduce a
//! series with [`downsample`] and [`compute_stats`].
//!
//! ```no_run
//! use perftrace::{compute_stats, downsample, Metric, SeriesQuery, StoreReader, TargetId};
//!
//! # fn main() -> Result<(), perftrace::DataError> {
//! let reader = StoreReader::open("data/sessions/20250301_142501.db")?;
//! let points = reader.read_series(&SeriesQuery::new(TargetId(1), Metric::CpuPercent))?;
//! let chart = downsample(&points, 1000);
//! println!("{:?}", compute_stats(&chart));
//! # Ok(())
//! # }
//! ```

pub use perftrace_core::*;
