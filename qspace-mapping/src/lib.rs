//! qspace-mapping: detector geometry, time-of-flight to Q mapping, and
//! orientation-matrix indexing.
//!
//! # Key Components
//!
//! - [`InstrumentConfig`] - Flight path and panel geometry, loaded from JSON
//! - [`DetectorGeometry`] - Pixel lookup and ray intersection contract
//! - [`QMapper`] - Maps `(tof, pixel_id)` events to Q, with pixel masks,
//!   |Q| range filters and discarded-peak regions
//! - [`OrientationIndexer`] - UB matrix, Miller indexing and predicted peaks
//!
//! # Processing Pipeline
//!
//! 1. **Setup (Sequential)**: Precompute per-pixel Q directions and
//!    `tof → |Q|` factors; unusable geometry fails here
//! 2. **Mapping (Parallel)**: Map event segments independently with rayon
//!    and concatenate them in order

#![warn(missing_docs)]

mod error;
pub mod filter;
pub mod geometry;
pub mod indexer;
pub mod instrument;
pub mod mapper;

pub use error::{Error, Result};
pub use filter::{DiscardedPeakRegions, EventFilters, PixelMask, QRangeFilter, QRangeMode, RegionShape};
pub use geometry::{DetectorGeometry, DetectorPanel, PanelGeometry, PixelLocation, RayHit};
pub use indexer::{
    nearest_hkl, predicted_peaks, Centering, DetectorCoverage, FullCoverage, OrientationIndexer,
};
pub use instrument::{FlightPath, InstrumentConfig};
pub use mapper::{InverseHit, MapStats, MappedEvents, PointInfo, QMapper, MAX_TABLE_PIXELS};
