//! Reciprocal-space conventions.
//!
//! Internally every Q vector includes the factor of 2π, so that
//! `|Q| = 4π sin θ / λ = 2π / d`. Collaborators that exchange `1/d`
//! vectors (no 2π) convert through the functions here, at the boundary,
//! and nowhere else.

use crate::Vec3;
use std::f64::consts::TAU;

/// 2π.
pub const TWO_PI: f64 = TAU;

/// Neutron `h / m` in Å·m/µs: `λ[Å] = H_OVER_MN * tof[µs] / L[m]`.
pub const H_OVER_MN: f64 = 3.956_058e-3;

/// Converts a `1/d` vector (no 2π) into the internal Q convention.
#[inline]
#[must_use]
pub fn q_from_inverse_d(v: Vec3) -> Vec3 {
    v * TWO_PI
}

/// Converts an internal Q vector into a `1/d` vector (no 2π).
#[inline]
#[must_use]
pub fn q_to_inverse_d(q: Vec3) -> Vec3 {
    q * (1.0 / TWO_PI)
}

/// d-spacing in Å for a Q vector, or `None` at the origin.
#[must_use]
pub fn d_spacing(q: Vec3) -> Option<f64> {
    let mag = q.length();
    (mag > 0.0).then(|| TWO_PI / mag)
}

/// Wavelength in Å for a time of flight (µs) along a total path (m).
#[inline]
#[must_use]
pub fn wavelength(tof_us: f64, path_m: f64) -> f64 {
    H_OVER_MN * tof_us / path_m
}

/// Time of flight in µs for a wavelength (Å) along a total path (m).
#[inline]
#[must_use]
pub fn time_of_flight(wavelength: f64, path_m: f64) -> f64 {
    wavelength * path_m / H_OVER_MN
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn test_inverse_d_round_trip() {
        let v = Vec3::new(0.25, -0.5, 1.0);
        let q = q_from_inverse_d(v);
        assert_relative_eq!(q.length(), v.length() * TWO_PI);
        let back = q_to_inverse_d(q);
        assert_relative_eq!(back.x, v.x, epsilon = 1e-15);
        assert_relative_eq!(back.y, v.y, epsilon = 1e-15);
        assert_relative_eq!(back.z, v.z, epsilon = 1e-15);
    }

    #[test]
    fn test_d_spacing() {
        let q = Vec3::new(TWO_PI / 2.0, 0.0, 0.0);
        assert_relative_eq!(d_spacing(q).unwrap(), 2.0);
        assert!(d_spacing(Vec3::zero()).is_none());
    }

    #[test]
    fn test_wavelength_tof_round_trip() {
        let lambda = wavelength(5000.0, 20.0);
        // 5 ms over 20 m is about 1 Å.
        assert!(lambda > 0.98 && lambda < 0.999);
        assert_relative_eq!(time_of_flight(lambda, 20.0), 5000.0, epsilon = 1e-9);
    }
}
