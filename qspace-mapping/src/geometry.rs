//! Detector geometry.
//!
//! The sample sits at the lab origin and the incident beam travels along
//! +x. Each flat panel is a grid of `n_rows × n_cols` pixels whose ids are
//! laid out row-major from `first_pixel_id`.

use crate::{Error, Result};
use qspace_core::Vec3;
use std::ops::RangeInclusive;

/// Minimum `|x_dir × y_dir|` for a usable panel.
const MIN_AXIS_SEPARATION: f64 = 1e-6;

/// Where a pixel id lives on the instrument.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PixelLocation {
    /// The pixel id looked up.
    pub pixel_id: u32,
    /// Owning detector panel.
    pub detector_id: u32,
    /// Row on the panel.
    pub row: u32,
    /// Column on the panel.
    pub col: u32,
    /// Lab-frame position of the pixel center (m).
    pub position: Vec3,
}

/// A scattered ray hitting a panel.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RayHit {
    /// The pixel containing the intersection.
    pub location: PixelLocation,
    /// Exact lab-frame intersection point (m).
    pub point: Vec3,
    /// Fractional row coordinate of the intersection.
    pub row: f64,
    /// Fractional column coordinate of the intersection.
    pub col: f64,
}

/// Query contract for detector geometry.
pub trait DetectorGeometry: Send + Sync {
    /// Resolves a pixel id, or `None` if no panel owns it.
    fn position_of(&self, pixel_id: u32) -> Option<PixelLocation>;

    /// Pixel id at a detector row and column.
    fn pixel_of(&self, detector_id: u32, row: u32, col: u32) -> Option<u32>;

    /// Smallest range covering every valid pixel id, or `None` when empty.
    fn pixel_id_range(&self) -> Option<RangeInclusive<u32>>;

    /// Disjoint ascending ranges holding every valid pixel id.
    fn pixel_id_ranges(&self) -> Vec<RangeInclusive<u32>> {
        self.pixel_id_range().into_iter().collect()
    }

    /// The nearest panel hit by a ray from the sample along `direction`.
    fn pixel_along(&self, direction: Vec3) -> Option<RayHit>;
}

/// A flat rectangular detector panel.
#[derive(Debug, Clone, PartialEq)]
pub struct DetectorPanel {
    id: u32,
    first_pixel_id: u32,
    n_rows: u32,
    n_cols: u32,
    width: f64,
    height: f64,
    center: Vec3,
    x_dir: Vec3,
    y_dir: Vec3,
    normal: Vec3,
}

impl DetectorPanel {
    /// Creates a panel.
    ///
    /// `x_dir` runs along increasing column and `y_dir` along increasing
    /// row. `y_dir` is made orthogonal to `x_dir`.
    ///
    /// # Errors
    /// Returns [`Error::Geometry`] for empty or non-finite dimensions,
    /// parallel direction vectors, or a pixel range that overflows `u32`.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        id: u32,
        first_pixel_id: u32,
        n_rows: u32,
        n_cols: u32,
        width: f64,
        height: f64,
        center: Vec3,
        x_dir: Vec3,
        y_dir: Vec3,
    ) -> Result<Self> {
        if n_rows == 0 || n_cols == 0 {
            return Err(Error::Geometry(format!(
                "detector {id} has {n_rows} rows and {n_cols} columns"
            )));
        }
        if !(width > 0.0 && width.is_finite() && height > 0.0 && height.is_finite()) {
            return Err(Error::Geometry(format!(
                "detector {id} has invalid size {width} x {height}"
            )));
        }
        if !center.is_finite() {
            return Err(Error::Geometry(format!("detector {id} center is not finite")));
        }
        let pixel_count = u64::from(n_rows) * u64::from(n_cols);
        if u64::from(first_pixel_id) + pixel_count - 1 > u64::from(u32::MAX) {
            return Err(Error::Geometry(format!(
                "detector {id} pixel ids overflow starting at {first_pixel_id}"
            )));
        }

        let x_dir = x_dir
            .normalized()
            .ok_or_else(|| Error::Geometry(format!("detector {id} x direction is degenerate")))?;
        let y_raw = y_dir
            .normalized()
            .ok_or_else(|| Error::Geometry(format!("detector {id} y direction is degenerate")))?;
        if x_dir.cross(&y_raw).length() < MIN_AXIS_SEPARATION {
            return Err(Error::Geometry(format!(
                "detector {id} x and y directions are parallel"
            )));
        }
        let y_dir = (y_raw - x_dir * x_dir.dot(&y_raw))
            .normalized()
            .ok_or_else(|| Error::Geometry(format!("detector {id} y direction is degenerate")))?;
        let normal = x_dir.cross(&y_dir);

        Ok(Self {
            id,
            first_pixel_id,
            n_rows,
            n_cols,
            width,
            height,
            center,
            x_dir,
            y_dir,
            normal,
        })
    }

    /// Detector id.
    #[must_use]
    pub fn id(&self) -> u32 {
        self.id
    }

    /// First pixel id owned by this panel.
    #[must_use]
    pub fn first_pixel_id(&self) -> u32 {
        self.first_pixel_id
    }

    /// Last pixel id owned by this panel.
    #[must_use]
    pub fn last_pixel_id(&self) -> u32 {
        self.first_pixel_id + (self.n_rows * self.n_cols - 1)
    }

    /// Pixel rows.
    #[must_use]
    pub fn n_rows(&self) -> u32 {
        self.n_rows
    }

    /// Pixel columns.
    #[must_use]
    pub fn n_cols(&self) -> u32 {
        self.n_cols
    }

    /// Lab-frame center of the panel (m).
    #[must_use]
    pub fn center(&self) -> Vec3 {
        self.center
    }

    /// True if `pixel_id` belongs to this panel.
    #[must_use]
    pub fn contains_pixel(&self, pixel_id: u32) -> bool {
        (self.first_pixel_id..=self.last_pixel_id()).contains(&pixel_id)
    }

    /// Lab-frame position of a (possibly fractional) row and column.
    ///
    /// Integer coordinates name the pixel's corner; add 0.5 for its center.
    #[must_use]
    pub fn position_at(&self, row: f64, col: f64) -> Vec3 {
        let du = (col - f64::from(self.n_cols) / 2.0) * self.width / f64::from(self.n_cols);
        let dv = (row - f64::from(self.n_rows) / 2.0) * self.height / f64::from(self.n_rows);
        self.center + self.x_dir * du + self.y_dir * dv
    }

    /// Center of pixel (`row`, `col`).
    #[must_use]
    pub fn pixel_position(&self, row: u32, col: u32) -> Vec3 {
        self.position_at(f64::from(row) + 0.5, f64::from(col) + 0.5)
    }

    /// Pixel id of (`row`, `col`), if on the panel.
    #[must_use]
    pub fn pixel_id(&self, row: u32, col: u32) -> Option<u32> {
        (row < self.n_rows && col < self.n_cols)
            .then(|| self.first_pixel_id + row * self.n_cols + col)
    }

    /// Resolves a pixel id owned by this panel.
    #[must_use]
    pub fn location(&self, pixel_id: u32) -> Option<PixelLocation> {
        if !self.contains_pixel(pixel_id) {
            return None;
        }
        let offset = pixel_id - self.first_pixel_id;
        let row = offset / self.n_cols;
        let col = offset % self.n_cols;
        Some(PixelLocation {
            pixel_id,
            detector_id: self.id,
            row,
            col,
            position: self.pixel_position(row, col),
        })
    }

    /// Intersects a ray from the origin with the panel.
    ///
    /// Returns the distance parameter `t` (for a unit `direction`, the
    /// distance in m) along with the hit.
    #[must_use]
    #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
    pub fn intersect(&self, direction: Vec3) -> Option<(f64, RayHit)> {
        let denom = direction.dot(&self.normal);
        if denom.abs() < 1e-12 {
            return None;
        }
        let t = self.center.dot(&self.normal) / denom;
        if !(t > 0.0 && t.is_finite()) {
            return None;
        }
        let point = direction * t;
        let rel = point - self.center;
        let col = rel.dot(&self.x_dir) * f64::from(self.n_cols) / self.width
            + f64::from(self.n_cols) / 2.0;
        let row = rel.dot(&self.y_dir) * f64::from(self.n_rows) / self.height
            + f64::from(self.n_rows) / 2.0;
        if !(0.0..f64::from(self.n_cols)).contains(&col)
            || !(0.0..f64::from(self.n_rows)).contains(&row)
        {
            return None;
        }
        let pixel_id = self.pixel_id(row.floor() as u32, col.floor() as u32)?;
        let location = self.location(pixel_id)?;
        Some((
            t,
            RayHit {
                location,
                point,
                row,
                col,
            },
        ))
    }
}

/// A set of flat panels with disjoint pixel-id ranges.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PanelGeometry {
    /// Sorted by `first_pixel_id`.
    panels: Vec<DetectorPanel>,
}

impl PanelGeometry {
    /// Builds the geometry.
    ///
    /// # Errors
    /// Returns [`Error::Geometry`] if two panels share a detector id or
    /// overlapping pixel ids.
    pub fn new(mut panels: Vec<DetectorPanel>) -> Result<Self> {
        panels.sort_by_key(DetectorPanel::first_pixel_id);
        for pair in panels.windows(2) {
            if pair[1].first_pixel_id <= pair[0].last_pixel_id() {
                return Err(Error::Geometry(format!(
                    "detectors {} and {} have overlapping pixel ids",
                    pair[0].id, pair[1].id
                )));
            }
        }
        let mut ids: Vec<u32> = panels.iter().map(DetectorPanel::id).collect();
        ids.sort_unstable();
        if let Some(dup) = ids.windows(2).find(|w| w[0] == w[1]) {
            return Err(Error::Geometry(format!("duplicate detector id {}", dup[0])));
        }
        Ok(Self { panels })
    }

    /// Panels in pixel-id order.
    #[must_use]
    pub fn panels(&self) -> &[DetectorPanel] {
        &self.panels
    }

    /// The panel with `detector_id`.
    #[must_use]
    pub fn panel(&self, detector_id: u32) -> Option<&DetectorPanel> {
        self.panels.iter().find(|p| p.id == detector_id)
    }

    /// Detector ids, in pixel-id order.
    #[must_use]
    pub fn detector_ids(&self) -> Vec<u32> {
        self.panels.iter().map(DetectorPanel::id).collect()
    }

    fn panel_for_pixel(&self, pixel_id: u32) -> Option<&DetectorPanel> {
        let idx = self
            .panels
            .partition_point(|p| p.first_pixel_id <= pixel_id)
            .checked_sub(1)?;
        let panel = &self.panels[idx];
        panel.contains_pixel(pixel_id).then_some(panel)
    }
}

impl DetectorGeometry for PanelGeometry {
    fn position_of(&self, pixel_id: u32) -> Option<PixelLocation> {
        self.panel_for_pixel(pixel_id)?.location(pixel_id)
    }

    fn pixel_of(&self, detector_id: u32, row: u32, col: u32) -> Option<u32> {
        self.panel(detector_id)?.pixel_id(row, col)
    }

    fn pixel_id_range(&self) -> Option<RangeInclusive<u32>> {
        let first = self.panels.first()?.first_pixel_id;
        let last = self.panels.last()?.last_pixel_id();
        Some(first..=last)
    }

    fn pixel_id_ranges(&self) -> Vec<RangeInclusive<u32>> {
        let mut ranges: Vec<RangeInclusive<u32>> = Vec::with_capacity(self.panels.len());
        for panel in &self.panels {
            let (first, last) = (panel.first_pixel_id, panel.last_pixel_id());
            match ranges.last_mut() {
                Some(prev) if prev.end().checked_add(1) == Some(first) => {
                    *prev = *prev.start()..=last;
                }
                _ => ranges.push(first..=last),
            }
        }
        ranges
    }

    fn pixel_along(&self, direction: Vec3) -> Option<RayHit> {
        let direction = direction.normalized()?;
        self.panels
            .iter()
            .filter_map(|p| p.intersect(direction))
            .min_by(|a, b| a.0.total_cmp(&b.0))
            .map(|(_, hit)| hit)
    }
}
