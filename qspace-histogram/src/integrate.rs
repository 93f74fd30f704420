//! Spherical peak integration with shell background subtraction.

use crate::histogram::Histogram3D;
use crate::{Error, Result};
use qspace_core::{IntegrationResult, Peak, Vec3};
use std::fmt;

/// Integration radius limits and defaults.
#[derive(Clone, Debug, PartialEq)]
pub struct IntegrationConfig {
    /// Smallest radius used, in Å⁻¹.
    pub min_radius: f64,
    /// Largest radius used, in Å⁻¹.
    pub max_radius: f64,
    /// Background radius as a multiple of the peak radius. The default,
    /// 2^(1/3), makes the background shell as large as the peak sphere.
    pub bkg_ratio: f64,
}

impl Default for IntegrationConfig {
    fn default() -> Self {
        Self {
            min_radius: 0.01,
            max_radius: 2.0,
            bkg_ratio: 2f64.cbrt(),
        }
    }
}

impl IntegrationConfig {
    /// Set the radius limits.
    #[must_use]
    pub fn with_radius_limits(mut self, min_radius: f64, max_radius: f64) -> Self {
        self.min_radius = min_radius;
        self.max_radius = max_radius;
        self
    }

    /// Set the background-to-peak radius ratio.
    #[must_use]
    pub fn with_bkg_ratio(mut self, ratio: f64) -> Self {
        self.bkg_ratio = ratio;
        self
    }
}

/// A peak with its integration outcome.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct IntegratedPeak {
    /// The peak integrated.
    pub peak: Peak,
    /// `None` when the peak center holds no counts or lies off the grid.
    pub result: Option<IntegrationResult>,
}

/// Integrates intensity in a sphere around a point, subtracting the
/// background measured in the surrounding shell.
#[derive(Clone, Debug, Default)]
pub struct SphereIntegrator {
    config: IntegrationConfig,
}

impl SphereIntegrator {
    /// Creates an integrator.
    #[must_use]
    pub fn new(config: IntegrationConfig) -> Self {
        Self { config }
    }

    /// The radius configuration.
    #[must_use]
    pub fn config(&self) -> &IntegrationConfig {
        &self.config
    }

    fn bkg_ratio(&self) -> f64 {
        let ratio = self.config.bkg_ratio;
        if ratio > 1.0 && ratio.is_finite() {
            ratio
        } else {
            let fallback = IntegrationConfig::default().bkg_ratio;
            log::warn!("background ratio {ratio} must exceed 1, using {fallback}");
            fallback
        }
    }

    /// Clamps the peak radius to `[min_radius, max_radius / ratio]` and
    /// the background radius to `(peak, max_radius]`. A background radius
    /// at or inside the peak sphere becomes `peak × ratio`.
    fn clamp_radii(&self, peak_radius: f64, bkg_radius: f64) -> Result<(f64, f64)> {
        if peak_radius.is_nan() || bkg_radius.is_nan() {
            return Err(Error::InvalidRadii(format!(
                "radii must be numbers, got {peak_radius} and {bkg_radius}"
            )));
        }
        let ratio = self.bkg_ratio();
        let (lo, hi) = (self.config.min_radius, self.config.max_radius);
        let peak_hi = hi / ratio;
        let peak = peak_radius.max(lo).min(peak_hi);
        if peak_radius < lo || peak_radius > peak_hi {
            log::warn!("peak radius {peak_radius} outside [{lo}, {peak_hi}], using {peak}");
        }
        let bkg = if bkg_radius <= peak {
            let bkg = peak * ratio;
            log::warn!("background radius {bkg_radius} not beyond peak radius {peak}, using {bkg}");
            bkg
        } else if bkg_radius > hi {
            log::warn!("background radius {bkg_radius} above {hi}, using {hi}");
            hi
        } else {
            bkg_radius
        };
        Ok((peak, bkg))
    }

    /// Integrates around `center`.
    ///
    /// The net intensity is `peak − peak_volume × bkg / bkg_volume`, where
    /// `bkg` covers the shell between the two radii, and
    /// `σ = sqrt(peak + (peak_volume / bkg_volume)² × bkg)`. An empty shell
    /// means no background is subtracted. Returns `Ok(None)` when the bin
    /// at `center` is not positive or lies off the grid.
    ///
    /// Radii outside the configured limits are clamped with a warning.
    ///
    /// # Errors
    /// Returns [`Error::InvalidRadii`] if a radius is NaN.
    pub fn integrate(
        &self,
        histogram: &Histogram3D,
        center: Vec3,
        peak_radius: f64,
        bkg_radius: f64,
    ) -> Result<Option<IntegrationResult>> {
        let (peak_radius, bkg_radius) = self.clamp_radii(peak_radius, bkg_radius)?;
        if !histogram.value_at(center).is_some_and(|v| v > 0.0) {
            return Ok(None);
        }
        let Some(sums) = histogram.sphere_integrals(center, &[peak_radius, bkg_radius])? else {
            return Ok(None);
        };

        let peak_count = sums.sums[0];
        let peak_volume = sums.volumes[0];
        let bkg_count = sums.sums[1] - peak_count;
        let bkg_volume = sums.volumes[1] - peak_volume;

        let (net, variance) = if bkg_volume > 0.0 {
            let ratio = peak_volume / bkg_volume;
            (peak_count - ratio * bkg_count, peak_count + ratio * ratio * bkg_count)
        } else {
            (peak_count, peak_count)
        };
        Ok(Some(IntegrationResult::new(net, variance.max(0.0).sqrt())))
    }

    /// Integrates every peak with the configured background ratio.
    ///
    /// # Errors
    /// Returns [`Error::InvalidRadii`] if `peak_radius` is NaN.
    pub fn integrate_peaks(
        &self,
        histogram: &Histogram3D,
        peaks: &[Peak],
        peak_radius: f64,
    ) -> Result<Vec<IntegratedPeak>> {
        let (peak_radius, bkg_radius) = self.clamp_radii(peak_radius, peak_radius * self.bkg_ratio())?;
        peaks
            .iter()
            .map(|&peak| {
                Ok(IntegratedPeak {
                    peak,
                    result: self.integrate(histogram, peak.position(), peak_radius, bkg_radius)?,
                })
            })
            .collect()
    }
}

/// I/σ levels reported by [`IntegrationStats`].
pub const I_OVER_SIGMA_LEVELS: [f64; 4] = [2.0, 3.0, 5.0, 10.0];

/// Summary counts over a set of integrations.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct IntegrationStats {
    /// Peaks submitted.
    pub peaks: usize,
    /// Peaks with a result.
    pub integrated: usize,
    /// Results with positive net intensity.
    pub positive: usize,
    /// Results with I/σ at or above each of [`I_OVER_SIGMA_LEVELS`].
    pub above_i_over_sigma: [usize; 4],
}

impl IntegrationStats {
    /// Tallies integration outcomes.
    pub fn from_peaks<'a>(peaks: impl IntoIterator<Item = &'a IntegratedPeak>) -> Self {
        let mut stats = Self::default();
        for peak in peaks {
            stats.peaks += 1;
            let Some(result) = peak.result else {
                continue;
            };
            stats.integrated += 1;
            if result.net_intensity > 0.0 {
                stats.positive += 1;
            }
            let ratio = result.i_over_sigma();
            for (count, level) in stats.above_i_over_sigma.iter_mut().zip(I_OVER_SIGMA_LEVELS) {
                if ratio >= level {
                    *count += 1;
                }
            }
        }
        stats
    }
}

impl fmt::Display for IntegrationStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} of {} peaks integrated, {} with I > 0",
            self.integrated, self.peaks, self.positive
        )?;
        for (count, level) in self.above_i_over_sigma.iter().zip(I_OVER_SIGMA_LEVELS) {
            write!(f, ", {count} with I/σ ≥ {level}")?;
        }
        Ok(())
    }
}
