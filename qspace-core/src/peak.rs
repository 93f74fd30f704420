//! Peaks and integration results.

use crate::{QEvent, Vec3};

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

/// Integer Miller indices.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct Hkl {
    pub h: i32,
    pub k: i32,
    pub l: i32,
}

impl Hkl {
    #[inline]
    #[must_use]
    pub const fn new(h: i32, k: i32, l: i32) -> Self {
        Self { h, k, l }
    }

    /// The indices as a floating-point vector.
    #[inline]
    #[must_use]
    pub fn to_vec3(self) -> Vec3 {
        Vec3::new(f64::from(self.h), f64::from(self.k), f64::from(self.l))
    }

    /// True for (0,0,0).
    #[must_use]
    pub fn is_origin(self) -> bool {
        self.h == 0 && self.k == 0 && self.l == 0
    }
}

impl std::fmt::Display for Hkl {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "({} {} {})", self.h, self.k, self.l)
    }
}

/// A peak found in, or predicted for, the histogram.
#[derive(Debug, Clone, Copy, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct Peak {
    /// Q position (2π included).
    pub q: QEvent,
    /// Histogram value at the peak (zero for predicted peaks).
    pub intensity: f64,
    /// Miller indices, once indexed.
    pub hkl: Option<Hkl>,
}

impl Peak {
    /// Creates an unindexed peak.
    #[must_use]
    pub fn new(q: Vec3, intensity: f64) -> Self {
        Self {
            q: QEvent::from_q(q),
            intensity,
            hkl: None,
        }
    }

    /// Attaches Miller indices.
    #[must_use]
    pub fn with_hkl(mut self, hkl: Hkl) -> Self {
        self.hkl = Some(hkl);
        self
    }

    /// Q position as a vector.
    #[inline]
    #[must_use]
    pub fn position(&self) -> Vec3 {
        self.q.q()
    }
}

/// Background-subtracted intensity of one reflection.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct IntegrationResult {
    pub net_intensity: f64,
    pub sigma: f64,
}

impl IntegrationResult {
    #[must_use]
    pub fn new(net_intensity: f64, sigma: f64) -> Self {
        Self {
            net_intensity,
            sigma,
        }
    }

    /// `I / σ(I)`, or zero when σ is zero.
    #[must_use]
    pub fn i_over_sigma(&self) -> f64 {
        if self.sigma > 0.0 {
            self.net_intensity / self.sigma
        } else {
            0.0
        }
    }
}
