//! qspace-core: Core types for reciprocal-space event processing.
//!
//! This crate provides the foundational types shared by the mapping,
//! histogram and I/O crates: 3D vectors and matrices, raw and Q-space
//! events, peaks, and the orientation (UB) matrix.
//!
//! All Q values carry the factor of 2π (`|Q| = 4π sin θ / λ`); see
//! [`convention`] for the only conversions to and from the `1/d` form.

pub mod convention;
pub mod error;
pub mod event;
pub mod matrix;
pub mod orientation;
pub mod peak;
pub mod soa;
pub mod vector;

pub use error::{Error, Result};
pub use event::{QEvent, RawEvent};
pub use matrix::Mat3;
pub use orientation::{hkl_of, q_of, OrientationMatrix};
pub use peak::{Hkl, IntegrationResult, Peak};
pub use soa::RawEventBatch;
pub use vector::Vec3;
