//! Utility functions
//!
//! - `histogram`: fixed-bin histograms with outlier tallies, median and mode
//! - `local_average`: box-car spatial averaging of a 3D volume

pub mod histogram;
pub mod local_average;

pub use histogram::{bins_for_count, mode_with_std, HistId, Histogram, HistogramTable};
pub use local_average::box_average_3d;
