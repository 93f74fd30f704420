//! Raw detector events and Q-space events.

use crate::Vec3;

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

/// A raw time-of-flight event as recorded by the data acquisition system.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct RawEvent {
    /// Time of flight in instrument clock ticks (100 ns at SNS).
    pub tof: u32,
    /// Detector pixel identifier.
    pub pixel_id: u32,
}

impl RawEvent {
    /// Creates a new raw event.
    #[inline]
    #[must_use]
    pub fn new(tof: u32, pixel_id: u32) -> Self {
        Self { tof, pixel_id }
    }
}

/// An event mapped to reciprocal space (Å⁻¹, 2π included).
#[derive(Debug, Clone, Copy, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct QEvent {
    pub x: f64,
    pub y: f64,
    pub z: f64,
    /// Event weight (1.0 for unweighted data).
    pub weight: f64,
}

impl QEvent {
    /// Creates a unit-weight event.
    #[inline]
    #[must_use]
    pub fn new(x: f64, y: f64, z: f64) -> Self {
        Self::weighted(x, y, z, 1.0)
    }

    /// Creates an event with an explicit weight.
    #[inline]
    #[must_use]
    pub fn weighted(x: f64, y: f64, z: f64, weight: f64) -> Self {
        Self { x, y, z, weight }
    }

    /// Creates a unit-weight event at `q`.
    #[inline]
    #[must_use]
    pub fn from_q(q: Vec3) -> Self {
        Self::new(q.x, q.y, q.z)
    }

    /// Q position of the event.
    #[inline]
    #[must_use]
    pub fn q(&self) -> Vec3 {
        Vec3::new(self.x, self.y, self.z)
    }

    /// Magnitude of Q.
    #[inline]
    #[must_use]
    pub fn magnitude(&self) -> f64 {
        self.q().length()
    }
}
