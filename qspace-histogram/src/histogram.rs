//! Dense 3D histogram over reciprocal space.
//!
//! The grid is stored `[page][row][col]`, where columns run along the
//! first edge direction, rows along the second and pages along the third.
//! Events are located through the dual binners, so the edge directions may
//! be any three non-coplanar vectors.

use crate::allocation::{allocate_grid, AllocationRetry, GridShape, MemoryBudget};
use crate::binner::{dual_binners, ProjectionBinner};
use crate::layout::{HistogramConfig, HistogramLayout};
use crate::{Error, Result};
use ndarray::{s, Array2, Array3, ArrayView3, Axis};
use qspace_core::{QEvent, Vec3};
use rayon::prelude::*;
use std::ops::RangeInclusive;
use std::sync::OnceLock;

/// Bin coordinates `[col, row, page]`.
pub type BinIndex = [usize; 3];

/// Recomputed histogram statistics.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct HistogramStats {
    /// Smallest bin value.
    pub min: f32,
    /// Largest bin value.
    pub max: f32,
    /// Sum of all bins.
    pub total: f64,
}

/// Sums over concentric spheres, one entry per radius.
#[derive(Clone, Debug, PartialEq)]
pub struct SphereIntegrals {
    /// Radii, ascending.
    pub radii: Vec<f64>,
    /// Sum of bins whose centers lie strictly inside each radius.
    pub sums: Vec<f64>,
    /// Number of bins counted for each radius.
    pub bin_counts: Vec<usize>,
    /// `bin_counts × bin_volume` for each radius.
    pub volumes: Vec<f64>,
}

/// A dense 3D accumulator positioned in Q by three projection binners.
#[derive(Clone, Debug)]
pub struct Histogram3D {
    edges: [ProjectionBinner; 3],
    duals: [ProjectionBinner; 3],
    grid: Array3<f32>,
    // Caches are rebuilt by a full scan when empty. `max` is updated in
    // place while only non-negative weights arrive.
    max: OnceLock<f32>,
    min: OnceLock<f32>,
    total: f64,
    num_added: u64,
}

impl Histogram3D {
    /// Allocates a histogram within the default memory budget.
    ///
    /// # Errors
    /// Returns an error if the edges are coplanar or no grid can be
    /// allocated.
    pub fn new(edges: [ProjectionBinner; 3]) -> Result<Self> {
        Self::with_budget(edges, &MemoryBudget::default(), &mut |_| {})
    }

    /// Allocates a histogram, halving every axis while the grid does not
    /// fit. Each retry is passed to `on_retry`; the binners of the
    /// returned histogram reflect the bin counts actually allocated.
    ///
    /// # Errors
    /// Returns an error if the edges are coplanar or halving reaches a
    /// zero-sized axis.
    pub fn with_budget(
        edges: [ProjectionBinner; 3],
        budget: &MemoryBudget,
        on_retry: &mut dyn FnMut(&AllocationRetry),
    ) -> Result<Self> {
        dual_binners(&edges)?;
        let budget_bytes = match budget.resolve_budget_bytes() {
            Ok(bytes) => Some(bytes),
            Err(e) => {
                log::warn!("Memory budget unavailable ({e}); allocating without a budget");
                None
            }
        };
        let requested = GridShape::new(edges[0].num_bins(), edges[1].num_bins(), edges[2].num_bins());
        let (shape, cells) = allocate_grid(requested, budget_bytes, on_retry)?;
        let edges = if shape == requested {
            edges
        } else {
            log::info!("Histogram reduced from {requested} to {shape} bins");
            [
                edges[0].with_num_bins(shape.nx)?,
                edges[1].with_num_bins(shape.ny)?,
                edges[2].with_num_bins(shape.nz)?,
            ]
        };
        let grid = Array3::from_shape_vec((shape.nz, shape.ny, shape.nx), cells)
            .map_err(|e| Error::InvalidBinning(e.to_string()))?;
        Ok(Self {
            duals: dual_binners(&edges)?,
            edges,
            grid,
            max: OnceLock::from(0.0),
            min: OnceLock::from(0.0),
            total: 0.0,
            num_added: 0,
        })
    }

    /// Allocates a histogram for a standard layout.
    ///
    /// # Errors
    /// See [`Histogram3D::with_budget`].
    pub fn from_layout(
        layout: &HistogramLayout,
        config: &HistogramConfig,
        on_retry: &mut dyn FnMut(&AllocationRetry),
    ) -> Result<Self> {
        Self::with_budget(layout.edge_binners()?, &config.memory, on_retry)
    }

    /// Moves the histogram to new edges and clears it. The grid is reused
    /// when the bin counts match; otherwise a new one is allocated. On
    /// error the histogram is left unchanged.
    ///
    /// # Errors
    /// See [`Histogram3D::with_budget`].
    pub fn set_position(
        &mut self,
        edges: [ProjectionBinner; 3],
        budget: &MemoryBudget,
        on_retry: &mut dyn FnMut(&AllocationRetry),
    ) -> Result<()> {
        let same_shape = edges
            .iter()
            .zip(&self.edges)
            .all(|(new, old)| new.num_bins() == old.num_bins());
        if same_shape {
            self.duals = dual_binners(&edges)?;
            self.edges = edges;
            self.clear();
        } else {
            *self = Self::with_budget(edges, budget, on_retry)?;
        }
        Ok(())
    }

    /// Zeroes every bin and resets the statistics.
    pub fn clear(&mut self) {
        self.grid.fill(0.0);
        self.max = OnceLock::from(0.0);
        self.min = OnceLock::from(0.0);
        self.total = 0.0;
        self.num_added = 0;
    }

    /// Edge binners (columns, rows, pages).
    #[must_use]
    pub fn edges(&self) -> &[ProjectionBinner; 3] {
        &self.edges
    }

    /// Dual binners used to locate points.
    #[must_use]
    pub fn duals(&self) -> &[ProjectionBinner; 3] {
        &self.duals
    }

    /// Bin counts.
    #[must_use]
    pub fn shape(&self) -> GridShape {
        GridShape::new(self.edges[0].num_bins(), self.edges[1].num_bins(), self.edges[2].num_bins())
    }

    /// Read-only view of the grid, indexed `[page, row, col]`.
    #[must_use]
    pub fn grid(&self) -> ArrayView3<'_, f32> {
        self.grid.view()
    }

    /// Adds events to their bins, with `weight` or 1 each. Events outside
    /// the grid and events with non-finite weights are skipped. Returns
    /// the weight added.
    #[allow(clippy::cast_possible_truncation)]
    pub fn add_events(&mut self, events: &[QEvent], use_weights: bool) -> f64 {
        let located: Vec<Option<BinIndex>> = events
            .par_iter()
            .map(|event| self.bin_index(event.q()))
            .collect();

        let mut added = 0.0;
        let mut count = 0u64;
        let mut skipped = 0usize;
        let mut peak = f32::NEG_INFINITY;
        let mut negative = false;
        for (event, index) in events.iter().zip(located) {
            let Some([col, row, page]) = index else {
                continue;
            };
            let weight = if use_weights { event.weight } else { 1.0 };
            if !weight.is_finite() {
                skipped += 1;
                continue;
            }
            let cell = &mut self.grid[[page, row, col]];
            *cell += weight as f32;
            peak = peak.max(*cell);
            negative |= weight < 0.0;
            added += weight;
            count += 1;
        }
        if skipped > 0 {
            log::debug!("Skipped {skipped} events with non-finite weights");
        }
        if count == 0 {
            return 0.0;
        }

        self.total += added;
        self.num_added += count;
        self.min = OnceLock::new();
        self.max = match (negative, self.max.get()) {
            (false, Some(&max)) => OnceLock::from(max.max(peak)),
            _ => OnceLock::new(),
        };
        added
    }

    /// Bin containing `q`, if inside the grid.
    #[must_use]
    pub fn bin_index(&self, q: Vec3) -> Option<BinIndex> {
        Some([
            self.duals[0].index(q)?,
            self.duals[1].index(q)?,
            self.duals[2].index(q)?,
        ])
    }

    /// True if `q` falls inside the grid.
    #[must_use]
    pub fn is_point_in(&self, q: Vec3) -> bool {
        self.bin_index(q).is_some()
    }

    /// Value of the bin containing `q`, or `None` outside the grid.
    #[must_use]
    pub fn value_at(&self, q: Vec3) -> Option<f32> {
        let [col, row, page] = self.bin_index(q)?;
        Some(self.grid[[page, row, col]])
    }

    /// Value of bin `[col, row, page]`, or `None` out of bounds.
    #[must_use]
    pub fn value_at_index(&self, [col, row, page]: BinIndex) -> Option<f32> {
        self.grid.get([page, row, col]).copied()
    }

    /// Q at fractional bin coordinates; integer coordinates give centers.
    #[must_use]
    pub fn point_at(&self, col: f64, row: f64, page: f64) -> Vec3 {
        [col, row, page]
            .iter()
            .zip(&self.edges)
            .fold(Vec3::zero(), |acc, (&f, edge)| {
                acc + edge.direction() * edge.binner().coordinate(f)
            })
    }

    /// Q at the center of bin `[col, row, page]`.
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn bin_center(&self, [col, row, page]: BinIndex) -> Vec3 {
        self.point_at(col as f64, row as f64, page as f64)
    }

    /// Volume of one bin in Å⁻³.
    #[must_use]
    pub fn bin_volume(&self) -> f64 {
        let [a, b, c] = &self.edges;
        a.direction().dot(&b.direction().cross(&c.direction())).abs() * a.step() * b.step() * c.step()
    }

    /// Largest bin value.
    #[must_use]
    pub fn max_value(&self) -> f32 {
        *self
            .max
            .get_or_init(|| self.grid.iter().copied().fold(f32::NEG_INFINITY, f32::max))
    }

    /// Smallest bin value. After events are added this costs one full
    /// scan of the grid, cached until the next change.
    #[must_use]
    pub fn min_value(&self) -> f32 {
        *self
            .min
            .get_or_init(|| self.grid.iter().copied().fold(f32::INFINITY, f32::min))
    }

    /// Sum of the weights added since the last clear.
    #[must_use]
    pub fn total(&self) -> f64 {
        self.total
    }

    /// Number of in-range events added since the last clear.
    #[must_use]
    pub fn num_added(&self) -> u64 {
        self.num_added
    }

    /// Recomputes min, max and total from the grid.
    pub fn scan(&mut self) -> HistogramStats {
        let (min, max, total) = self.grid.iter().fold(
            (f32::INFINITY, f32::NEG_INFINITY, 0.0f64),
            |(lo, hi, sum), &v| (lo.min(v), hi.max(v), sum + f64::from(v)),
        );
        self.min = OnceLock::from(min);
        self.max = OnceLock::from(max);
        self.total = total;
        HistogramStats { min, max, total }
    }

    /// Copy of one page, indexed `[row][col]`.
    #[must_use]
    pub fn page_slice(&self, page: usize) -> Option<Array2<f32>> {
        (page < self.grid.len_of(Axis(0))).then(|| self.grid.index_axis(Axis(0), page).to_owned())
    }

    /// Copy of one row across all pages, indexed `[col][page]`.
    #[must_use]
    pub fn row_slice(&self, row: usize) -> Option<Array2<f32>> {
        (row < self.grid.len_of(Axis(1))).then(|| self.grid.index_axis(Axis(1), row).t().to_owned())
    }

    /// Copy of one column across all pages, indexed `[page][row]`.
    #[must_use]
    pub fn col_slice(&self, col: usize) -> Option<Array2<f32>> {
        (col < self.grid.len_of(Axis(2))).then(|| self.grid.index_axis(Axis(2), col).to_owned())
    }

    /// Sum over the `(2n+1)³` bins around the bin containing `q`. `None`
    /// if that cube does not fit inside the grid.
    #[must_use]
    pub fn total_near(&self, q: Vec3, n: usize) -> Option<f64> {
        let [col, row, page] = self.bin_index(q)?;
        let shape = self.shape();
        let fits = |i: usize, len: usize| i >= n && i + n < len;
        if !(fits(col, shape.nx) && fits(row, shape.ny) && fits(page, shape.nz)) {
            return None;
        }
        let cube = self
            .grid
            .slice(s![page - n..=page + n, row - n..=row + n, col - n..=col + n]);
        Some(cube.iter().map(|&v| f64::from(v)).sum())
    }

    /// Index ranges `[cols, rows, pages]` covering a sphere, clamped to the
    /// grid. `None` if `center` is outside the grid.
    #[must_use]
    pub fn index_ranges(&self, center: Vec3, radius: f64) -> Option<[RangeInclusive<usize>; 3]> {
        self.bin_index(center)?;
        let range = |dual: &ProjectionBinner| {
            let p = dual.project(center);
            let lo = dual.binner().clamped_index(p - radius);
            let hi = dual.binner().clamped_index(p + radius);
            lo.min(hi)..=lo.max(hi)
        };
        Some([range(&self.duals[0]), range(&self.duals[1]), range(&self.duals[2])])
    }

    /// Visits every bin in the sphere's index box with its center distance.
    fn for_each_near(&self, center: Vec3, radius: f64, mut visit: impl FnMut(BinIndex, f64, f32)) -> bool {
        let Some([cols, rows, pages]) = self.index_ranges(center, radius) else {
            return false;
        };
        for page in pages {
            for row in rows.clone() {
                for col in cols.clone() {
                    let index = [col, row, page];
                    let distance = self.bin_center(index).distance(&center);
                    visit(index, distance, self.grid[[page, row, col]]);
                }
            }
        }
        true
    }

    /// Sums bins inside spheres of ascending `radii` around `center`.
    /// Returns `Ok(None)` when `center` is outside the grid.
    ///
    /// # Errors
    /// Returns [`Error::InvalidRadii`] if `radii` is empty, not positive,
    /// or not strictly ascending.
    pub fn sphere_integrals(&self, center: Vec3, radii: &[f64]) -> Result<Option<SphereIntegrals>> {
        let Some(&outer) = radii.last() else {
            return Err(Error::InvalidRadii("no radii given".into()));
        };
        if radii.iter().any(|r| !(r.is_finite() && *r > 0.0)) {
            return Err(Error::InvalidRadii(format!("radii must be positive: {radii:?}")));
        }
        if radii.windows(2).any(|w| w[0] >= w[1]) {
            return Err(Error::InvalidRadii(format!("radii must be strictly ascending: {radii:?}")));
        }

        let mut sums = vec![0.0; radii.len()];
        let mut bin_counts = vec![0usize; radii.len()];
        let inside = self.for_each_near(center, outer, |_, distance, value| {
            let first = radii.partition_point(|&r| r <= distance);
            for i in first..radii.len() {
                sums[i] += f64::from(value);
                bin_counts[i] += 1;
            }
        });
        if !inside {
            return Ok(None);
        }

        let bin_volume = self.bin_volume();
        #[allow(clippy::cast_precision_loss)]
        let volumes = bin_counts.iter().map(|&n| n as f64 * bin_volume).collect();
        Ok(Some(SphereIntegrals {
            radii: radii.to_vec(),
            sums,
            bin_counts,
            volumes,
        }))
    }

    /// Intensity-weighted mean position of the bins within `radius` of
    /// `center`. `None` outside the grid or when the weight is not positive.
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn centroid(&self, center: Vec3, radius: f64) -> Option<Vec3> {
        let mut weight = 0.0;
        let mut sum = [0.0f64; 3];
        self.for_each_near(center, radius, |index, distance, value| {
            if distance < radius {
                let v = f64::from(value);
                weight += v;
                for (acc, &i) in sum.iter_mut().zip(&index) {
                    *acc += v * i as f64;
                }
            }
        });
        (weight > 0.0).then(|| self.point_at(sum[0] / weight, sum[1] / weight, sum[2] / weight))
    }

    /// Bin where the projections of the sphere's index box onto each axis
    /// peak. Ties go to the index nearest `center`'s bin. `None` outside
    /// the grid or when the box holds no counts.
    #[must_use]
    pub fn max_point(&self, center: Vec3, radius: f64) -> Option<(BinIndex, Vec3)> {
        let ranges = self.index_ranges(center, radius)?;
        let home = self.bin_index(center)?;
        let mut projections = ranges.clone().map(|r| vec![0.0f64; r.end() - r.start() + 1]);
        let [cols, rows, pages] = ranges.clone();
        let mut total = 0.0;
        for page in pages {
            for row in rows.clone() {
                for col in cols.clone() {
                    let v = f64::from(self.grid[[page, row, col]]);
                    total += v;
                    for ((proj, range), i) in projections.iter_mut().zip(&ranges).zip([col, row, page]) {
                        proj[i - range.start()] += v;
                    }
                }
            }
        }
        if total == 0.0 {
            return None;
        }
        let index: BinIndex = std::array::from_fn(|axis| {
            let start = *ranges[axis].start();
            start + peak_bin(&projections[axis], home[axis] - start)
        });
        Some((index, self.bin_center(index)))
    }

    /// Copy of the bins `[cols, rows, pages]` as a histogram of its own,
    /// positioned where those bins sit in this one. Statistics are
    /// recomputed from the copied bins; the event count is unknown and set
    /// to the rounded total.
    ///
    /// # Errors
    /// Returns [`Error::InvalidBinning`] if a range is empty or runs past
    /// the grid.
    #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
    pub fn sub_histogram(&self, ranges: [RangeInclusive<usize>; 3]) -> Result<Self> {
        let edges = [
            self.edges[0].sub_binner(ranges[0].clone())?,
            self.edges[1].sub_binner(ranges[1].clone())?,
            self.edges[2].sub_binner(ranges[2].clone())?,
        ];
        let [cols, rows, pages] = ranges;
        let grid = self.grid.slice(s![pages, rows, cols]).to_owned();
        let mut sub = Self {
            duals: dual_binners(&edges)?,
            edges,
            grid,
            max: OnceLock::new(),
            min: OnceLock::new(),
            total: 0.0,
            num_added: 0,
        };
        let stats = sub.scan();
        sub.num_added = stats.total.max(0.0).round() as u64;
        Ok(sub)
    }
}

/// Index of the largest entry; ties go to the index nearest `near`.
fn peak_bin(values: &[f64], near: usize) -> usize {
    let mut best = 0;
    for (i, &v) in values.iter().enumerate().skip(1) {
        let tied = v >= values[best] && i.abs_diff(near) < best.abs_diff(near);
        if v > values[best] || tied {
            best = i;
        }
    }
    best
}
