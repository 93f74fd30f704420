//! Uniform binning along a direction in Q.
//!
//! The histogram's three edge directions need not be orthogonal. Events
//! are located by projecting onto the dual directions, so a point's bin
//! index along one axis is independent of its coefficients along the
//! other two.

use crate::{Error, Result};
use qspace_core::Vec3;
use std::ops::RangeInclusive;

/// Uniform partition of `[min, max)` into `num_bins` bins.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct UniformBinner {
    min: f64,
    max: f64,
    num_bins: usize,
}

impl UniformBinner {
    /// Creates a binner.
    ///
    /// # Errors
    /// Returns [`Error::InvalidBinning`] if `num_bins` is zero or the
    /// range is empty or not finite.
    pub fn new(min: f64, max: f64, num_bins: usize) -> Result<Self> {
        if num_bins == 0 {
            return Err(Error::InvalidBinning("number of bins must be positive".into()));
        }
        if !(min.is_finite() && max.is_finite() && max > min) {
            return Err(Error::InvalidBinning(format!(
                "range [{min}, {max}] is empty or not finite"
            )));
        }
        Ok(Self { min, max, num_bins })
    }

    /// Lower edge of the first bin.
    #[must_use]
    pub fn min(&self) -> f64 {
        self.min
    }

    /// Upper edge of the last bin.
    #[must_use]
    pub fn max(&self) -> f64 {
        self.max
    }

    /// Number of bins.
    #[must_use]
    pub fn num_bins(&self) -> usize {
        self.num_bins
    }

    /// Width of one bin.
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn step(&self) -> f64 {
        (self.max - self.min) / self.num_bins as f64
    }

    /// Unclamped bin index of `value`; may be negative or past the end.
    #[must_use]
    #[allow(clippy::cast_possible_truncation)]
    pub fn raw_index(&self, value: f64) -> i64 {
        ((value - self.min) / self.step()).floor() as i64
    }

    /// Bin containing `value`, if it lies in `[min, max)`.
    #[must_use]
    pub fn index(&self, value: f64) -> Option<usize> {
        if !value.is_finite() {
            return None;
        }
        usize::try_from(self.raw_index(value))
            .ok()
            .filter(|&i| i < self.num_bins)
    }

    /// Raw index clamped into `0..num_bins`.
    #[must_use]
    pub fn clamped_index(&self, value: f64) -> usize {
        let last = self.num_bins - 1;
        match usize::try_from(self.raw_index(value)) {
            Ok(i) => i.min(last),
            Err(_) => 0,
        }
    }

    /// Coordinate at a fractional index; integer indices give bin centers.
    #[must_use]
    pub fn coordinate(&self, fractional_index: f64) -> f64 {
        self.min + (fractional_index + 0.5) * self.step()
    }

    /// Center of bin `index`.
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn center(&self, index: usize) -> f64 {
        self.coordinate(index as f64)
    }

    /// Same range, different bin count.
    ///
    /// # Errors
    /// Returns [`Error::InvalidBinning`] if `num_bins` is zero.
    pub fn with_num_bins(&self, num_bins: usize) -> Result<Self> {
        Self::new(self.min, self.max, num_bins)
    }

    /// The bins `range` as a binner of their own, with the same step.
    ///
    /// # Errors
    /// Returns [`Error::InvalidBinning`] if `range` is empty or runs past
    /// the last bin.
    #[allow(clippy::cast_precision_loss)]
    pub fn sub_binner(&self, range: RangeInclusive<usize>) -> Result<Self> {
        let (lo, hi) = (*range.start(), *range.end());
        if lo > hi || hi >= self.num_bins {
            return Err(Error::InvalidBinning(format!(
                "bins {lo}..={hi} not within 0..{}",
                self.num_bins
            )));
        }
        let step = self.step();
        Self::new(
            self.min + lo as f64 * step,
            self.min + (hi + 1) as f64 * step,
            hi - lo + 1,
        )
    }
}

/// A [`UniformBinner`] applied to the projection of a point onto a unit
/// direction.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct ProjectionBinner {
    direction: Vec3,
    binner: UniformBinner,
}

impl ProjectionBinner {
    /// Creates a binner along `direction`, which is normalized.
    ///
    /// # Errors
    /// Returns an error if the direction has zero length or the range is
    /// invalid.
    pub fn new(direction: Vec3, min: f64, max: f64, num_bins: usize) -> Result<Self> {
        let direction = direction
            .normalized()
            .ok_or_else(|| Error::InvalidBinning("binning direction has zero length".into()))?;
        Ok(Self {
            direction,
            binner: UniformBinner::new(min, max, num_bins)?,
        })
    }

    /// Unit direction.
    #[must_use]
    pub fn direction(&self) -> Vec3 {
        self.direction
    }

    /// Underlying one-dimensional binner.
    #[must_use]
    pub fn binner(&self) -> &UniformBinner {
        &self.binner
    }

    /// Number of bins.
    #[must_use]
    pub fn num_bins(&self) -> usize {
        self.binner.num_bins
    }

    /// Bin width.
    #[must_use]
    pub fn step(&self) -> f64 {
        self.binner.step()
    }

    /// Projection of `point` onto the direction.
    #[inline]
    #[must_use]
    pub fn project(&self, point: Vec3) -> f64 {
        point.dot(&self.direction)
    }

    /// Bin containing the projection of `point`.
    #[inline]
    #[must_use]
    pub fn index(&self, point: Vec3) -> Option<usize> {
        self.binner.index(self.project(point))
    }

    /// Same direction and range, different bin count.
    ///
    /// # Errors
    /// Returns [`Error::InvalidBinning`] if `num_bins` is zero.
    pub fn with_num_bins(&self, num_bins: usize) -> Result<Self> {
        Ok(Self {
            direction: self.direction,
            binner: self.binner.with_num_bins(num_bins)?,
        })
    }

    /// Same direction, restricted to the bins `range`.
    ///
    /// # Errors
    /// See [`UniformBinner::sub_binner`].
    pub fn sub_binner(&self, range: RangeInclusive<usize>) -> Result<Self> {
        Ok(Self {
            direction: self.direction,
            binner: self.binner.sub_binner(range)?,
        })
    }
}

/// Binners along the dual basis of three edge binners.
///
/// Dual direction `i` is `(e_j × e_k) / (e_i · (e_j × e_k))`. Its range is
/// the edge range divided by the dual's length, with the same bin count,
/// so that `p · d̂_i` falls in bin `n` exactly when the coefficient of `p`
/// along `e_i` does.
///
/// # Errors
/// Returns [`Error::InvalidBinning`] if the edge directions are coplanar.
pub fn dual_binners(edges: &[ProjectionBinner; 3]) -> Result<[ProjectionBinner; 3]> {
    let dual = |i: usize| -> Result<ProjectionBinner> {
        let e_i = edges[i].direction;
        let e_j = edges[(i + 1) % 3].direction;
        let e_k = edges[(i + 2) % 3].direction;
        let cross = e_j.cross(&e_k);
        let triple = e_i.dot(&cross);
        if triple.abs() < 1e-9 {
            return Err(Error::InvalidBinning("edge directions are coplanar".into()));
        }
        let d = cross * (1.0 / triple);
        let length = d.length();
        let b = edges[i].binner;
        ProjectionBinner::new(d, b.min / length, b.max / length, b.num_bins)
    };
    Ok([dual(0)?, dual(1)?, dual(2)?])
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn test_uniform_index_range() {
        let b = UniformBinner::new(-1.0, 1.0, 10).unwrap();
        assert_relative_eq!(b.step(), 0.2);
        assert_eq!(b.index(-1.0), Some(0));
        assert_eq!(b.index(0.99), Some(9));
        assert_eq!(b.index(1.0), None);
        assert_eq!(b.index(-1.01), None);
        assert_eq!(b.index(f64::NAN), None);
        assert_eq!(b.clamped_index(5.0), 9);
        assert_eq!(b.clamped_index(-5.0), 0);
        assert_relative_eq!(b.center(0), -0.9);
        assert_relative_eq!(b.coordinate(4.5), 0.0, epsilon = 1e-12);
    }

    #[test]
    fn test_sub_binner_keeps_bin_positions() {
        let b = UniformBinner::new(-1.0, 1.0, 10).unwrap();
        let sub = b.sub_binner(3..=5).unwrap();
        assert_eq!(sub.num_bins(), 3);
        assert_relative_eq!(sub.step(), b.step(), epsilon = 1e-12);
        assert_relative_eq!(sub.center(0), b.center(3), epsilon = 1e-12);
        assert_relative_eq!(sub.center(2), b.center(5), epsilon = 1e-12);
        assert!(b.sub_binner(8..=10).is_err());
        #[allow(clippy::reversed_empty_ranges)]
        let reversed = b.sub_binner(5..=3);
        assert!(reversed.is_err());
    }

    #[test]
    fn test_invalid_binners() {
        assert!(UniformBinner::new(0.0, 1.0, 0).is_err());
        assert!(UniformBinner::new(1.0, 1.0, 4).is_err());
        assert!(UniformBinner::new(0.0, f64::INFINITY, 4).is_err());
        assert!(ProjectionBinner::new(Vec3::zero(), 0.0, 1.0, 4).is_err());
    }

    #[test]
    fn test_orthogonal_duals_match_edges() {
        let edges = [
            ProjectionBinner::new(Vec3::X, -2.0, 0.0, 8).unwrap(),
            ProjectionBinner::new(Vec3::Y, -1.0, 1.0, 4).unwrap(),
            ProjectionBinner::new(Vec3::Z, -1.0, 1.0, 4).unwrap(),
        ];
        let duals = dual_binners(&edges).unwrap();
        for (d, e) in duals.iter().zip(&edges) {
            assert_relative_eq!(d.direction().dot(&e.direction()), 1.0, epsilon = 1e-12);
            assert_relative_eq!(d.binner().min(), e.binner().min(), epsilon = 1e-12);
            assert_eq!(d.num_bins(), e.num_bins());
        }
    }

    #[test]
    fn test_skewed_duals_recover_coefficients() {
        let a = Vec3::new(1.0, 0.0, 0.0);
        let b = Vec3::new(0.5, 1.0, 0.0);
        let c = Vec3::new(0.2, 0.3, 1.0);
        let edges = [
            ProjectionBinner::new(a, -10.0, 10.0, 20).unwrap(),
            ProjectionBinner::new(b, -10.0, 10.0, 20).unwrap(),
            ProjectionBinner::new(c, -10.0, 10.0, 20).unwrap(),
        ];
        let duals = dual_binners(&edges).unwrap();
        let (ca, cb, cc) = (3.3, -4.7, 0.2);
        let point = edges[0].direction() * ca + edges[1].direction() * cb + edges[2].direction() * cc;
        assert_eq!(duals[0].index(point), edges[0].binner().index(ca));
        assert_eq!(duals[1].index(point), edges[1].binner().index(cb));
        assert_eq!(duals[2].index(point), edges[2].binner().index(cc));
    }

    #[test]
    fn test_coplanar_edges_rejected() {
        let edges = [
            ProjectionBinner::new(Vec3::X, 0.0, 1.0, 2).unwrap(),
            ProjectionBinner::new(Vec3::Y, 0.0, 1.0, 2).unwrap(),
            ProjectionBinner::new(Vec3::new(1.0, 1.0, 0.0), 0.0, 1.0, 2).unwrap(),
        ];
        assert!(matches!(dual_binners(&edges), Err(Error::InvalidBinning(_))));
    }
}
