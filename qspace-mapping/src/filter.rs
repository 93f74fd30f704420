//! Event filters applied while mapping.

use crate::geometry::PixelLocation;
use qspace_core::Vec3;
use std::collections::HashSet;

/// Pixels excluded from mapping, by detector, row, column or single pixel.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PixelMask {
    detectors: HashSet<u32>,
    rows: HashSet<(u32, u32)>,
    columns: HashSet<(u32, u32)>,
    pixels: HashSet<(u32, u32, u32)>,
}

impl PixelMask {
    /// A mask that excludes nothing.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Masks a whole detector.
    #[must_use]
    pub fn with_detector(mut self, detector_id: u32) -> Self {
        self.detectors.insert(detector_id);
        self
    }

    /// Masks one row of a detector.
    #[must_use]
    pub fn with_row(mut self, detector_id: u32, row: u32) -> Self {
        self.rows.insert((detector_id, row));
        self
    }

    /// Masks one column of a detector.
    #[must_use]
    pub fn with_column(mut self, detector_id: u32, col: u32) -> Self {
        self.columns.insert((detector_id, col));
        self
    }

    /// Masks a single pixel.
    #[must_use]
    pub fn with_pixel(mut self, detector_id: u32, row: u32, col: u32) -> Self {
        self.pixels.insert((detector_id, row, col));
        self
    }

    /// Masks the same rows on each of `detector_ids`.
    #[must_use]
    pub fn with_rows(mut self, detector_ids: &[u32], rows: &[u32]) -> Self {
        for &det in detector_ids {
            for &row in rows {
                self.rows.insert((det, row));
            }
        }
        self
    }

    /// Masks the same columns on each of `detector_ids`.
    #[must_use]
    pub fn with_columns(mut self, detector_ids: &[u32], cols: &[u32]) -> Self {
        for &det in detector_ids {
            for &col in cols {
                self.columns.insert((det, col));
            }
        }
        self
    }

    /// True if nothing is masked.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.detectors.is_empty()
            && self.rows.is_empty()
            && self.columns.is_empty()
            && self.pixels.is_empty()
    }

    /// True if the pixel at `loc` is excluded.
    #[must_use]
    pub fn is_masked(&self, loc: &PixelLocation) -> bool {
        self.masks(loc.detector_id, loc.row, loc.col)
    }

    /// True if (`detector_id`, `row`, `col`) is excluded.
    #[must_use]
    pub fn masks(&self, detector_id: u32, row: u32, col: u32) -> bool {
        self.detectors.contains(&detector_id)
            || self.rows.contains(&(detector_id, row))
            || self.columns.contains(&(detector_id, col))
            || self.pixels.contains(&(detector_id, row, col))
    }
}

/// How a [`QRangeFilter`] treats its ranges.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum QRangeMode {
    /// Keep only events whose |Q| lies in one of the ranges.
    #[default]
    KeepOnly,
    /// Drop events whose |Q| lies in one of the ranges.
    Omit,
}

/// Filter on |Q| over one or more closed ranges.
#[derive(Debug, Clone, PartialEq)]
pub struct QRangeFilter {
    ranges: Vec<(f64, f64)>,
    mode: QRangeMode,
}

impl QRangeFilter {
    /// A filter over `[min_q, max_q]`. Reversed bounds are swapped.
    #[must_use]
    pub fn new(min_q: f64, max_q: f64, mode: QRangeMode) -> Self {
        Self {
            ranges: vec![ordered(min_q, max_q)],
            mode,
        }
    }

    /// A filter over several ranges given as consecutive endpoint pairs.
    /// A trailing unpaired endpoint is ignored.
    #[must_use]
    pub fn from_endpoints(endpoints: &[f64], mode: QRangeMode) -> Self {
        Self {
            ranges: endpoints
                .chunks_exact(2)
                .map(|pair| ordered(pair[0], pair[1]))
                .collect(),
            mode,
        }
    }

    /// Whether the ranges keep or reject events.
    #[must_use]
    pub fn mode(&self) -> QRangeMode {
        self.mode
    }

    /// The `(min, max)` |Q| ranges in Å⁻¹.
    #[must_use]
    pub fn ranges(&self) -> &[(f64, f64)] {
        &self.ranges
    }

    /// True if an event with magnitude `mag_q` passes the filter.
    #[must_use]
    pub fn accepts(&self, mag_q: f64) -> bool {
        let inside = self
            .ranges
            .iter()
            .any(|&(lo, hi)| (lo..=hi).contains(&mag_q));
        match self.mode {
            QRangeMode::KeepOnly => inside,
            QRangeMode::Omit => !inside,
        }
    }
}

fn ordered(a: f64, b: f64) -> (f64, f64) {
    if a <= b {
        (a, b)
    } else {
        (b, a)
    }
}

/// Shape of the region excluded around each listed reflection.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum RegionShape {
    /// Axis-aligned ellipsoid.
    Ellipsoid {
        /// Semi-axes in Å⁻¹.
        semi_axes: Vec3,
    },
    /// Axis-aligned box.
    Box {
        /// Half-widths in Å⁻¹.
        half_widths: Vec3,
    },
}

impl RegionShape {
    /// True if `offset` from a region center falls inside the shape.
    #[must_use]
    pub fn contains(&self, offset: Vec3) -> bool {
        match *self {
            RegionShape::Ellipsoid { semi_axes } => {
                let nx = offset.x / semi_axes.x;
                let ny = offset.y / semi_axes.y;
                let nz = offset.z / semi_axes.z;
                nx * nx + ny * ny + nz * nz <= 1.0
            }
            RegionShape::Box { half_widths } => {
                offset.x.abs() <= half_widths.x
                    && offset.y.abs() <= half_widths.y
                    && offset.z.abs() <= half_widths.z
            }
        }
    }
}

/// Regions around known contaminant reflections whose events are dropped.
#[derive(Debug, Clone, PartialEq)]
pub struct DiscardedPeakRegions {
    shape: RegionShape,
    centers: Vec<Vec3>,
}

impl DiscardedPeakRegions {
    /// One region of `shape` around each center.
    #[must_use]
    pub fn new(shape: RegionShape, centers: Vec<Vec3>) -> Self {
        Self { shape, centers }
    }

    /// Number of regions.
    #[must_use]
    pub fn len(&self) -> usize {
        self.centers.len()
    }

    /// True if there are no regions.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.centers.is_empty()
    }

    /// True if `q` falls inside any region.
    #[must_use]
    pub fn contains(&self, q: Vec3) -> bool {
        self.centers.iter().any(|&c| self.shape.contains(q - c))
    }
}

/// The filters a mapper applies, grouped.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct EventFilters {
    /// Pixels whose events are dropped before mapping.
    pub pixel_mask: PixelMask,
    /// |Q| ranges applied after mapping.
    pub q_range: Option<QRangeFilter>,
    /// Regions around known peaks whose events are dropped.
    pub discarded: Option<DiscardedPeakRegions>,
}

impl EventFilters {
    /// True if an event at `q` passes the Q-space filters.
    #[must_use]
    pub fn accepts_q(&self, q: Vec3) -> bool {
        if let Some(range) = &self.q_range {
            if !range.accepts(q.length()) {
                return false;
            }
        }
        !self.discarded.as_ref().is_some_and(|d| d.contains(q))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn loc(detector_id: u32, row: u32, col: u32) -> PixelLocation {
        PixelLocation {
            pixel_id: 0,
            detector_id,
            row,
            col,
            position: Vec3::Y,
        }
    }

    #[test]
    fn test_pixel_mask() {
        let mask = PixelMask::new()
            .with_detector(7)
            .with_row(1, 3)
            .with_column(2, 5)
            .with_pixel(3, 1, 1);
        assert!(mask.is_masked(&loc(7, 0, 0)));
        assert!(mask.is_masked(&loc(1, 3, 9)));
        assert!(!mask.is_masked(&loc(1, 4, 9)));
        assert!(mask.is_masked(&loc(2, 0, 5)));
        assert!(!mask.is_masked(&loc(1, 0, 5)));
        assert!(mask.is_masked(&loc(3, 1, 1)));
        assert!(!mask.is_masked(&loc(3, 1, 2)));
        assert!(PixelMask::new().is_empty());
    }

    #[test]
    fn test_rows_on_several_detectors() {
        let mask = PixelMask::new().with_rows(&[1, 2], &[0, 255]);
        assert!(mask.is_masked(&loc(2, 255, 10)));
        assert!(!mask.is_masked(&loc(3, 0, 10)));
    }

    #[test]
    fn test_q_range_modes() {
        let keep = QRangeFilter::new(2.0, 1.0, QRangeMode::KeepOnly);
        assert_eq!(keep.ranges(), &[(1.0, 2.0)]);
        assert!(keep.accepts(1.5));
        assert!(keep.accepts(1.0));
        assert!(!keep.accepts(2.5));

        let omit = QRangeFilter::from_endpoints(&[1.0, 2.0, 3.0, 4.0, 9.0], QRangeMode::Omit);
        assert_eq!(omit.ranges().len(), 2);
        assert!(!omit.accepts(3.5));
        assert!(omit.accepts(2.5));
    }

    #[test]
    fn test_discarded_regions() {
        let ellipsoid = DiscardedPeakRegions::new(
            RegionShape::Ellipsoid {
                semi_axes: Vec3::new(0.1, 0.2, 0.3),
            },
            vec![Vec3::new(1.0, 1.0, 1.0)],
        );
        assert!(ellipsoid.contains(Vec3::new(1.0, 1.19, 1.0)));
        assert!(!ellipsoid.contains(Vec3::new(1.11, 1.0, 1.0)));

        let cube = DiscardedPeakRegions::new(
            RegionShape::Box {
                half_widths: Vec3::new(0.1, 0.1, 0.1),
            },
            vec![Vec3::zero(), Vec3::X],
        );
        assert!(cube.contains(Vec3::new(1.09, -0.09, 0.09)));
        assert!(!cube.contains(Vec3::new(0.5, 0.0, 0.0)));
    }

    #[test]
    fn test_event_filters_combine() {
        let filters = EventFilters {
            q_range: Some(QRangeFilter::new(0.0, 5.0, QRangeMode::KeepOnly)),
            discarded: Some(DiscardedPeakRegions::new(
                RegionShape::Box {
                    half_widths: Vec3::new(0.5, 0.5, 0.5),
                },
                vec![Vec3::new(-2.0, 0.0, 0.0)],
            )),
            ..EventFilters::default()
        };
        assert!(filters.accepts_q(Vec3::new(-1.0, 0.0, 0.0)));
        assert!(!filters.accepts_q(Vec3::new(-2.1, 0.0, 0.0)));
        assert!(!filters.accepts_q(Vec3::new(-6.0, 0.0, 0.0)));
    }
}
