//! Analysis engine: envelope downsampling and summary statistics.
//!
//! Both operations are pure functions over a series of [`Point`]s and hold no
//! state, so they can run on any thread.
//!
//! [`Point`]: crate::series::Point

mod downsample;
mod stats;

pub use downsample::downsample;
pub use stats::{compute_stats, SeriesSummary, Statistics};
