//! # ms-hist
//!
//! N-dimensional binned container used for templates, composed densities
//! and datasets, plus its JSON persistence.

#![warn(missing_docs)]
#![warn(clippy::all)]

/// Binned axes.
pub mod axis;
/// N-dimensional histograms.
pub mod histogram;
/// Histogram files.
pub mod io;

pub use axis::Axis;
pub use histogram::{CellSampler, Histogram};
pub use io::HistogramFile;
