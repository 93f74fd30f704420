//! qspace-histogram: resizable 3D histogram over reciprocal space.
//!
//! - [`Histogram3D`] - dense grid placed by three projection binners, with
//!   point, slice and sphere queries
//! - [`SharedHistogram`] - the histogram behind a single lock
//! - [`PeakFinder`] - parallel local-maximum search
//! - [`SphereIntegrator`] - peak intensity with shell background
//!
//! Grids that do not fit in memory are reallocated with every axis halved
//! until they do; see [`allocation`].
#![warn(missing_docs)]

pub mod allocation;
pub mod binner;
mod error;
mod histogram;
mod integrate;
mod layout;
mod peaks;
mod shared;

pub use allocation::{allocate_grid, AllocationRetry, GridShape, MemoryBudget};
pub use binner::{dual_binners, ProjectionBinner, UniformBinner};
pub use error::{Error, Result};
pub use histogram::{BinIndex, Histogram3D, HistogramStats, SphereIntegrals};
pub use integrate::{
    IntegratedPeak, IntegrationConfig, IntegrationStats, SphereIntegrator, I_OVER_SIGMA_LEVELS,
};
pub use layout::{clamp_max_q, HistogramConfig, HistogramLayout, MAX_MAX_Q, MIN_MAX_Q};
pub use peaks::{PeakFinder, PeakSearchConfig, PeakSearchResult};
pub use shared::SharedHistogram;
