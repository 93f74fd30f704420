//! Orientation-matrix indexing and reflection prediction.

use crate::{Error, Result};
use qspace_core::{Hkl, Mat3, OrientationMatrix, Peak, Vec3};
use std::str::FromStr;

/// Largest Miller index searched along any axis when predicting peaks.
const MAX_PREDICTED_INDEX: i32 = 1000;

/// Whether a Q vector can be observed on the instrument.
pub trait DetectorCoverage {
    /// True if a reflection at `q` would land on an active pixel.
    fn covers(&self, q: Vec3) -> bool;
}

/// Coverage that accepts every Q vector.
#[derive(Debug, Clone, Copy, Default)]
pub struct FullCoverage;

impl DetectorCoverage for FullCoverage {
    fn covers(&self, _q: Vec3) -> bool {
        true
    }
}

/// Lattice centering and its reflection condition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Centering {
    /// Primitive: every reflection allowed.
    #[default]
    P,
    /// A-face centered: `k + l` even.
    A,
    /// B-face centered: `h + l` even.
    B,
    /// C-face centered: `h + k` even.
    C,
    /// Body centered: `h + k + l` even.
    I,
    /// All-face centered: `h, k, l` all even or all odd.
    F,
    /// Rhombohedral, obverse setting: `-h + k + l` divisible by 3.
    RObverse,
    /// Rhombohedral, reverse setting: `h - k + l` divisible by 3.
    RReverse,
}

impl Centering {
    /// True if the centering allows reflection (h, k, l).
    #[must_use]
    pub fn allows(self, hkl: Hkl) -> bool {
        let Hkl { h, k, l } = hkl;
        match self {
            Centering::P => true,
            Centering::A => (k + l) % 2 == 0,
            Centering::B => (h + l) % 2 == 0,
            Centering::C => (h + k) % 2 == 0,
            Centering::I => (h + k + l) % 2 == 0,
            Centering::F => {
                let parity = h.rem_euclid(2);
                k.rem_euclid(2) == parity && l.rem_euclid(2) == parity
            }
            Centering::RObverse => (-h + k + l).rem_euclid(3) == 0,
            Centering::RReverse => (h - k + l).rem_euclid(3) == 0,
        }
    }
}

impl FromStr for Centering {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_uppercase().as_str() {
            "P" => Ok(Centering::P),
            "A" => Ok(Centering::A),
            "B" => Ok(Centering::B),
            "C" => Ok(Centering::C),
            "I" => Ok(Centering::I),
            "F" => Ok(Centering::F),
            "R" | "ROBV" => Ok(Centering::RObverse),
            "RREV" => Ok(Centering::RReverse),
            other => Err(Error::Config(format!("unknown centering '{other}'"))),
        }
    }
}

/// Search bound on each Miller index for reflections with `|q| <= max_q`.
///
/// Uses `|row_i(UB⁻¹)|·max_q`, which bounds `|h_i|` for any lattice, and
/// never less than `max_q / |basis_i|`.
#[allow(clippy::cast_possible_truncation)]
fn index_bounds(ub: &OrientationMatrix, max_q: f64) -> Result<[i32; 3]> {
    let mut bounds = [0; 3];
    for (i, bound) in bounds.iter_mut().enumerate() {
        let dual = ub.ub_inverse().row(i).length() * max_q;
        let direct = max_q / ub.basis(i).length();
        let b = dual.max(direct).ceil();
        if !b.is_finite() || b > f64::from(MAX_PREDICTED_INDEX) {
            return Err(Error::Config(format!(
                "reflection search to |Q| = {max_q} needs index {b} on axis {i}"
            )));
        }
        *bound = b as i32;
    }
    Ok(bounds)
}

/// Enumerates reflections with `min_q <= |q| <= max_q` allowed by
/// `centering` and observable according to `coverage`.
///
/// Peaks are returned in ascending (h, k, l) order with zero intensity.
///
/// # Errors
/// Returns [`Error::Config`] for an invalid Q range or one that would
/// need an unreasonably large index search.
pub fn predicted_peaks(
    ub: &OrientationMatrix,
    min_q: f64,
    max_q: f64,
    centering: Centering,
    coverage: &dyn DetectorCoverage,
) -> Result<Vec<Peak>> {
    if !(max_q > 0.0 && max_q.is_finite() && min_q <= max_q) {
        return Err(Error::Config(format!("invalid Q range [{min_q}, {max_q}]")));
    }
    let [hb, kb, lb] = index_bounds(ub, max_q)?;
    let mut peaks = Vec::new();
    for h in -hb..=hb {
        for k in -kb..=kb {
            for l in -lb..=lb {
                let hkl = Hkl::new(h, k, l);
                if hkl.is_origin() || !centering.allows(hkl) {
                    continue;
                }
                let q = ub.ub().mul_vec(hkl.to_vec3());
                let mag = q.length();
                if mag < min_q || mag > max_q || !coverage.covers(q) {
                    continue;
                }
                peaks.push(Peak::new(q, 0.0).with_hkl(hkl));
            }
        }
    }
    Ok(peaks)
}

/// Rounds fractional indices to the nearest integer triple if every
/// component lies within `tolerance` of it.
#[allow(clippy::cast_possible_truncation)]
#[must_use]
pub fn nearest_hkl(fractional: Vec3, tolerance: f64) -> Option<Hkl> {
    let [h, k, l] = fractional.to_array().map(f64::round);
    let off = (fractional - Vec3::new(h, k, l)).to_array();
    if !fractional.is_finite() || off.iter().any(|d| d.abs() > tolerance) {
        return None;
    }
    let limit = f64::from(i32::MAX);
    if h.abs() > limit || k.abs() > limit || l.abs() > limit {
        return None;
    }
    let hkl = Hkl::new(h as i32, k as i32, l as i32);
    (!hkl.is_origin()).then_some(hkl)
}

/// Holds the current orientation matrix and indexes against it.
#[derive(Debug, Clone, Default)]
pub struct OrientationIndexer {
    matrix: Option<OrientationMatrix>,
}

impl OrientationIndexer {
    /// An indexer with no orientation matrix.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Replaces the matrix with `ub` (columns a*, b*, c*, 2π included).
    ///
    /// # Errors
    /// Returns an error if `ub` is not invertible; the previous matrix is
    /// kept.
    pub fn set_matrix(&mut self, ub: Mat3) -> Result<&OrientationMatrix> {
        match OrientationMatrix::new(ub) {
            Ok(matrix) => Ok(&*self.matrix.insert(matrix)),
            Err(err) => {
                log::warn!("rejected orientation matrix: {err}");
                Err(err.into())
            }
        }
    }

    /// Replaces the matrix with an already validated one.
    pub fn set_orientation(&mut self, matrix: OrientationMatrix) {
        self.matrix = Some(matrix);
    }

    /// Forgets the matrix.
    pub fn clear(&mut self) {
        self.matrix = None;
    }

    /// The current orientation matrix, if one was accepted.
    #[must_use]
    pub fn matrix(&self) -> Option<&OrientationMatrix> {
        self.matrix.as_ref()
    }

    fn require(&self) -> Result<&OrientationMatrix> {
        self.matrix.as_ref().ok_or(Error::NoOrientationMatrix)
    }

    /// Fractional indices of `q`.
    ///
    /// # Errors
    /// Returns [`Error::NoOrientationMatrix`] if no matrix is set.
    pub fn hkl_of(&self, q: Vec3) -> Result<Vec3> {
        Ok(self.require()?.hkl_of(q))
    }

    /// Q of reflection `hkl`.
    ///
    /// # Errors
    /// Returns [`Error::NoOrientationMatrix`] if no matrix is set.
    pub fn q_of(&self, hkl: Hkl) -> Result<Vec3> {
        let h = hkl.to_vec3();
        Ok(self.require()?.q_of(h.x, h.y, h.z))
    }

    /// See [`predicted_peaks`].
    ///
    /// # Errors
    /// Returns [`Error::NoOrientationMatrix`] if no matrix is set, or the
    /// errors of [`predicted_peaks`].
    pub fn predicted_peaks(
        &self,
        min_q: f64,
        max_q: f64,
        centering: Centering,
        coverage: &dyn DetectorCoverage,
    ) -> Result<Vec<Peak>> {
        predicted_peaks(self.require()?, min_q, max_q, centering, coverage)
    }

    /// Sets `hkl` on every peak within `tolerance` of an integer triple
    /// and clears it on the rest. Returns the number indexed.
    ///
    /// # Errors
    /// Returns [`Error::NoOrientationMatrix`] if no matrix is set.
    pub fn index_peaks(&self, peaks: &mut [Peak], tolerance: f64) -> Result<usize> {
        let ub = self.require()?;
        let mut indexed = 0;
        for peak in peaks.iter_mut() {
            peak.hkl = nearest_hkl(ub.hkl_of(peak.position()), tolerance);
            if peak.hkl.is_some() {
                indexed += 1;
            }
        }
        Ok(indexed)
    }
}
