//! 3×3 matrices.

use crate::{Error, Result, Vec3};
use std::ops::Mul;

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

/// Relative determinant threshold below which a matrix is treated as singular.
///
/// The determinant is compared against the product of the column lengths,
/// so the test does not depend on the overall scale of the matrix.
const SINGULAR_TOLERANCE: f64 = 1e-10;

/// A 3×3 matrix stored in row-major order (`m[row][col]`).
#[derive(Debug, Clone, Copy, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct Mat3 {
    pub m: [[f64; 3]; 3],
}

impl Mat3 {
    /// The identity matrix.
    pub const IDENTITY: Mat3 = Mat3 {
        m: [[1.0, 0.0, 0.0], [0.0, 1.0, 0.0], [0.0, 0.0, 1.0]],
    };

    /// Creates a matrix from rows.
    #[must_use]
    pub const fn from_rows(m: [[f64; 3]; 3]) -> Self {
        Self { m }
    }

    /// Creates a matrix whose columns are the given vectors.
    #[must_use]
    pub fn from_columns(c0: Vec3, c1: Vec3, c2: Vec3) -> Self {
        Self {
            m: [[c0.x, c1.x, c2.x], [c0.y, c1.y, c2.y], [c0.z, c1.z, c2.z]],
        }
    }

    /// Returns column `i` (0..3) as a vector.
    #[must_use]
    pub fn column(&self, i: usize) -> Vec3 {
        Vec3::new(self.m[0][i], self.m[1][i], self.m[2][i])
    }

    /// Returns row `i` (0..3) as a vector.
    #[must_use]
    pub fn row(&self, i: usize) -> Vec3 {
        Vec3::from(self.m[i])
    }

    /// Transposed copy.
    #[must_use]
    pub fn transpose(&self) -> Self {
        let m = &self.m;
        Self {
            m: [
                [m[0][0], m[1][0], m[2][0]],
                [m[0][1], m[1][1], m[2][1]],
                [m[0][2], m[1][2], m[2][2]],
            ],
        }
    }

    /// Multiplies every entry by `s`.
    #[must_use]
    pub fn scaled(&self, s: f64) -> Self {
        let mut out = *self;
        for row in &mut out.m {
            for v in row.iter_mut() {
                *v *= s;
            }
        }
        out
    }

    /// Matrix-vector product.
    #[inline]
    #[must_use]
    pub fn mul_vec(&self, v: Vec3) -> Vec3 {
        Vec3::new(self.row(0).dot(&v), self.row(1).dot(&v), self.row(2).dot(&v))
    }

    /// Determinant.
    #[must_use]
    pub fn determinant(&self) -> f64 {
        self.column(0).dot(&self.column(1).cross(&self.column(2)))
    }

    /// True if all entries are finite.
    #[must_use]
    pub fn is_finite(&self) -> bool {
        self.m.iter().flatten().all(|v| v.is_finite())
    }

    /// Inverse via the adjugate.
    ///
    /// # Errors
    /// Returns [`Error::NonFiniteMatrix`] for NaN/infinite entries and
    /// [`Error::SingularMatrix`] when the determinant is negligible relative
    /// to the column lengths.
    pub fn inverse(&self) -> Result<Self> {
        if !self.is_finite() {
            return Err(Error::NonFiniteMatrix);
        }
        let c0 = self.column(0);
        let c1 = self.column(1);
        let c2 = self.column(2);
        let det = self.determinant();
        let scale = c0.length() * c1.length() * c2.length();
        if scale == 0.0 || det.abs() <= SINGULAR_TOLERANCE * scale {
            return Err(Error::SingularMatrix { determinant: det });
        }
        // Rows of the inverse are the dual basis of the columns.
        let inv_det = 1.0 / det;
        let r0 = c1.cross(&c2) * inv_det;
        let r1 = c2.cross(&c0) * inv_det;
        let r2 = c0.cross(&c1) * inv_det;
        Ok(Self::from_rows([r0.to_array(), r1.to_array(), r2.to_array()]))
    }
}

impl Default for Mat3 {
    fn default() -> Self {
        Self::IDENTITY
    }
}

impl Mul for Mat3 {
    type Output = Mat3;

    fn mul(self, rhs: Mat3) -> Mat3 {
        let mut out = [[0.0; 3]; 3];
        for (i, row) in out.iter_mut().enumerate() {
            for (j, v) in row.iter_mut().enumerate() {
                *v = self.row(i).dot(&rhs.column(j));
            }
        }
        Mat3::from_rows(out)
    }
}

impl Mul<Vec3> for Mat3 {
    type Output = Vec3;

    fn mul(self, rhs: Vec3) -> Vec3 {
        self.mul_vec(rhs)
    }
}
