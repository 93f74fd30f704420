//! Standard histogram placements in Q.

use crate::allocation::MemoryBudget;
use crate::binner::ProjectionBinner;
use crate::Result;
use qspace_core::{OrientationMatrix, Vec3};

/// Smallest accepted `max_Q` in Å⁻¹.
pub const MIN_MAX_Q: f64 = 0.5;
/// Largest accepted `max_Q` in Å⁻¹.
pub const MAX_MAX_Q: f64 = 25.0;

/// Histogram sizing options.
#[derive(Clone, Debug, PartialEq)]
pub struct HistogramConfig {
    /// Bins per axis for Cartesian layouts.
    pub bins_per_axis: usize,
    /// Bins per Miller index step for reciprocal layouts.
    pub steps_per_index: usize,
    /// Memory allowed for the grid.
    pub memory: MemoryBudget,
}

impl Default for HistogramConfig {
    fn default() -> Self {
        Self {
            bins_per_axis: 512,
            steps_per_index: 1,
            memory: MemoryBudget::default(),
        }
    }
}

impl HistogramConfig {
    /// Set bins per axis for Cartesian layouts.
    #[must_use]
    pub fn with_bins_per_axis(mut self, bins: usize) -> Self {
        self.bins_per_axis = bins;
        self
    }

    /// Set bins per Miller index step for reciprocal layouts.
    #[must_use]
    pub fn with_steps_per_index(mut self, steps: usize) -> Self {
        self.steps_per_index = steps;
        self
    }

    /// Set the memory budget.
    #[must_use]
    pub fn with_memory(mut self, memory: MemoryBudget) -> Self {
        self.memory = memory;
        self
    }
}

/// Where a histogram sits in Q.
#[derive(Clone, Debug, PartialEq)]
pub enum HistogramLayout {
    /// Axis-aligned grid. Qx covers `[-max_q, 0]` since the beam runs
    /// along +x; Qy and Qz cover `[-max_q, max_q]`.
    Cartesian {
        /// Largest |Q| of interest.
        max_q: f64,
        /// Bins per axis.
        bins: usize,
    },
    /// Grid along a*, b*, c* with bins centered on integer Miller indices.
    Reciprocal {
        /// Orientation defining the axes.
        ub: OrientationMatrix,
        /// Largest |Q| of interest.
        max_q: f64,
        /// Bins per unit step of each index.
        steps_per_index: usize,
    },
}

impl HistogramLayout {
    /// Cartesian layout with `config.bins_per_axis` bins per axis.
    #[must_use]
    pub fn cartesian(max_q: f64, config: &HistogramConfig) -> Self {
        Self::Cartesian {
            max_q,
            bins: config.bins_per_axis,
        }
    }

    /// Reciprocal layout with `config.steps_per_index` bins per index.
    #[must_use]
    pub fn reciprocal(ub: OrientationMatrix, max_q: f64, config: &HistogramConfig) -> Self {
        Self::Reciprocal {
            ub,
            max_q,
            steps_per_index: config.steps_per_index,
        }
    }

    /// Requested `max_q`, before clamping.
    #[must_use]
    pub fn max_q(&self) -> f64 {
        match self {
            Self::Cartesian { max_q, .. } | Self::Reciprocal { max_q, .. } => *max_q,
        }
    }

    /// Edge binners for this layout.
    ///
    /// # Errors
    /// Returns an error if the bin count is zero.
    #[allow(
        clippy::cast_possible_truncation,
        clippy::cast_precision_loss,
        clippy::cast_sign_loss
    )]
    pub fn edge_binners(&self) -> Result<[ProjectionBinner; 3]> {
        let max_q = clamp_max_q(self.max_q());
        match self {
            Self::Cartesian { bins, .. } => Ok([
                ProjectionBinner::new(Vec3::X, -max_q, 0.0, *bins)?,
                ProjectionBinner::new(Vec3::Y, -max_q, max_q, *bins)?,
                ProjectionBinner::new(Vec3::Z, -max_q, max_q, *bins)?,
            ]),
            Self::Reciprocal {
                ub,
                steps_per_index,
                ..
            } => {
                let steps = (*steps_per_index).max(1) as f64;
                let axis = |i: usize| -> Result<ProjectionBinner> {
                    let basis = ub.basis(i);
                    let step = basis.length() / steps;
                    let max_index = (max_q / step).round().max(1.0);
                    let half = (max_index + 0.5) * step;
                    ProjectionBinner::new(basis, -half, half, 2 * max_index as usize + 1)
                };
                Ok([axis(0)?, axis(1)?, axis(2)?])
            }
        }
    }
}

/// Clamps `max_q` into `[MIN_MAX_Q, MAX_MAX_Q]`, logging when it changes.
#[must_use]
pub fn clamp_max_q(max_q: f64) -> f64 {
    if (MIN_MAX_Q..=MAX_MAX_Q).contains(&max_q) {
        return max_q;
    }
    let clamped = if max_q.is_nan() {
        MAX_MAX_Q
    } else {
        max_q.clamp(MIN_MAX_Q, MAX_MAX_Q)
    };
    log::warn!("max_Q {max_q} outside [{MIN_MAX_Q}, {MAX_MAX_Q}], using {clamped}");
    clamped
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use qspace_core::Mat3;

    #[test]
    fn test_cartesian_layout() {
        let layout = HistogramLayout::Cartesian { max_q: 12.0, bins: 100 };
        let [x, y, z] = layout.edge_binners().unwrap();
        assert_relative_eq!(x.binner().min(), -12.0);
        assert_relative_eq!(x.binner().max(), 0.0);
        assert_relative_eq!(y.binner().min(), -12.0);
        assert_relative_eq!(z.binner().max(), 12.0);
        assert_eq!(z.num_bins(), 100);
    }

    #[test]
    fn test_layouts_from_config() {
        let config = HistogramConfig::default()
            .with_bins_per_axis(64)
            .with_steps_per_index(2);
        let [x, _, _] = HistogramLayout::cartesian(6.0, &config).edge_binners().unwrap();
        assert_eq!(x.num_bins(), 64);

        let ub = OrientationMatrix::new(Mat3::IDENTITY.scaled(0.5)).unwrap();
        let layout = HistogramLayout::reciprocal(ub, 2.0, &config);
        let [a, _, _] = layout.edge_binners().unwrap();
        // step 0.25, max index 8 -> 17 bins
        assert_eq!(a.num_bins(), 17);
        assert_relative_eq!(a.step(), 0.25, epsilon = 1e-12);
    }

    #[test]
    fn test_max_q_is_clamped() {
        assert_relative_eq!(clamp_max_q(100.0), MAX_MAX_Q);
        assert_relative_eq!(clamp_max_q(0.01), MIN_MAX_Q);
        assert_relative_eq!(clamp_max_q(7.0), 7.0);
    }

    #[test]
    fn test_reciprocal_bins_centered_on_indices() {
        let ub = OrientationMatrix::new(Mat3::IDENTITY.scaled(0.5)).unwrap();
        let layout = HistogramLayout::Reciprocal {
            ub,
            max_q: 2.0,
            steps_per_index: 1,
        };
        let [a, _, _] = layout.edge_binners().unwrap();
        // step 0.5, max index 4 -> indices -4..=4
        assert_eq!(a.num_bins(), 9);
        assert_relative_eq!(a.binner().center(4), 0.0, epsilon = 1e-12);
        assert_relative_eq!(a.binner().center(5), 0.5, epsilon = 1e-12);
    }
}
