//! Orientation (UB) matrix.
//!
//! Internally UB maps Miller indices to Q with `q = UB · hkl`: its columns
//! are the reciprocal basis vectors a*, b*, c*, each including 2π. The
//! exchange format used by fitting and file collaborators stores a*, b*, c*
//! as rows without 2π; [`OrientationMatrix::from_isaw_rows`] and
//! [`OrientationMatrix::to_isaw_rows`] are the only conversions.

use crate::convention::TWO_PI;
use crate::{Mat3, Result, Vec3};

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

/// Fractional Miller indices of `q` given `UB⁻¹`.
#[inline]
#[must_use]
pub fn hkl_of(q: Vec3, ub_inverse: &Mat3) -> Vec3 {
    ub_inverse.mul_vec(q)
}

/// Q of the reflection (h, k, l) given `UB`.
#[inline]
#[must_use]
pub fn q_of(h: f64, k: f64, l: f64, ub: &Mat3) -> Vec3 {
    ub.mul_vec(Vec3::new(h, k, l))
}

/// A validated, invertible orientation matrix with its cached inverse.
#[derive(Debug, Clone, Copy, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct OrientationMatrix {
    ub: Mat3,
    ub_inverse: Mat3,
}

impl OrientationMatrix {
    /// Validates `ub` (columns a*, b*, c*, 2π included).
    ///
    /// # Errors
    /// Returns an error if the matrix is non-finite or singular.
    pub fn new(ub: Mat3) -> Result<Self> {
        let ub_inverse = ub.inverse()?;
        Ok(Self { ub, ub_inverse })
    }

    /// Builds the matrix from the reciprocal basis vectors.
    ///
    /// # Errors
    /// Returns an error if the vectors are coplanar or non-finite.
    pub fn from_basis(a_star: Vec3, b_star: Vec3, c_star: Vec3) -> Result<Self> {
        Self::new(Mat3::from_columns(a_star, b_star, c_star))
    }

    /// Converts from the exchange form: rows a*, b*, c* without 2π.
    ///
    /// # Errors
    /// Returns an error if the matrix is non-finite or singular.
    pub fn from_isaw_rows(rows: [[f64; 3]; 3]) -> Result<Self> {
        Self::new(Mat3::from_rows(rows).transpose().scaled(TWO_PI))
    }

    /// Converts back to the exchange form.
    #[must_use]
    pub fn to_isaw_rows(&self) -> [[f64; 3]; 3] {
        self.ub.scaled(1.0 / TWO_PI).transpose().m
    }

    /// UB.
    #[must_use]
    pub fn ub(&self) -> &Mat3 {
        &self.ub
    }

    /// UB⁻¹.
    #[must_use]
    pub fn ub_inverse(&self) -> &Mat3 {
        &self.ub_inverse
    }

    /// Reciprocal basis vector `i` (0 = a*, 1 = b*, 2 = c*).
    #[must_use]
    pub fn basis(&self, i: usize) -> Vec3 {
        self.ub.column(i)
    }

    #[must_use]
    pub fn q_of(&self, h: f64, k: f64, l: f64) -> Vec3 {
        q_of(h, k, l, &self.ub)
    }

    #[must_use]
    pub fn hkl_of(&self, q: Vec3) -> Vec3 {
        hkl_of(q, &self.ub_inverse)
    }
}
