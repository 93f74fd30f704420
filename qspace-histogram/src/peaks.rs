//! Local-maximum peak search over a histogram.

use crate::histogram::Histogram3D;
use ndarray::{Array3, ArrayView3};
use qspace_core::Peak;
use rayon::prelude::*;
use std::cmp::Ordering;

/// Peak search options.
#[derive(Clone, Debug, PartialEq)]
pub struct PeakSearchConfig {
    /// Replace each bin by the mean of its 3×3 in-page neighborhood first.
    pub smooth: bool,
    /// Most peaks to return.
    pub max_peaks: usize,
    /// Bins must exceed this value (and the global minimum) to qualify.
    pub min_intensity: f32,
}

impl Default for PeakSearchConfig {
    fn default() -> Self {
        Self {
            smooth: false,
            max_peaks: 50,
            min_intensity: 0.0,
        }
    }
}

impl PeakSearchConfig {
    /// Enable or disable smoothing.
    #[must_use]
    pub fn with_smooth(mut self, smooth: bool) -> Self {
        self.smooth = smooth;
        self
    }

    /// Set the peak limit.
    #[must_use]
    pub fn with_max_peaks(mut self, max_peaks: usize) -> Self {
        self.max_peaks = max_peaks;
        self
    }

    /// Set the intensity threshold.
    #[must_use]
    pub fn with_min_intensity(mut self, min_intensity: f32) -> Self {
        self.min_intensity = min_intensity;
        self
    }
}

/// Peaks found plus a status line.
#[derive(Clone, Debug, PartialEq)]
pub struct PeakSearchResult {
    /// Peaks by descending intensity.
    pub peaks: Vec<Peak>,
    /// Human-readable summary.
    pub status: String,
}

#[derive(Clone, Copy, Debug)]
struct Candidate {
    page: usize,
    row: usize,
    col: usize,
    value: f32,
}

/// Finds local maxima in a histogram.
#[derive(Clone, Debug, Default)]
pub struct PeakFinder {
    config: PeakSearchConfig,
}

impl PeakFinder {
    /// Creates a finder.
    #[must_use]
    pub fn new(config: PeakSearchConfig) -> Self {
        Self { config }
    }

    /// The search options.
    #[must_use]
    pub fn config(&self) -> &PeakSearchConfig {
        &self.config
    }

    /// Finds bins that exceed the threshold and are not below any of their
    /// 26 neighbors. Equal neighbors are resolved in favour of the lower
    /// `[page, row, col]` index. Pages are searched in parallel.
    ///
    /// Peaks are ordered by descending value, then ascending page, row and
    /// column. Each position is the 3×3×3 intensity-weighted centroid.
    #[must_use]
    pub fn find_peaks(&self, histogram: &Histogram3D) -> PeakSearchResult {
        let smoothed;
        let data = if self.config.smooth {
            smoothed = smooth_pages(histogram.grid());
            smoothed.view()
        } else {
            histogram.grid()
        };

        let global_min = data.iter().copied().fold(f32::INFINITY, f32::min);
        let threshold = self.config.min_intensity.max(global_min);

        let mut candidates: Vec<Candidate> = (0..data.dim().0)
            .into_par_iter()
            .flat_map_iter(|page| page_maxima(data, page, threshold))
            .collect();
        let found = candidates.len();
        candidates.sort_by(|a, b| {
            b.value
                .total_cmp(&a.value)
                .then(a.page.cmp(&b.page))
                .then(a.row.cmp(&b.row))
                .then(a.col.cmp(&b.col))
        });
        candidates.truncate(self.config.max_peaks);

        let peaks: Vec<Peak> = candidates
            .iter()
            .map(|c| {
                let [col, row, page] = centroid(histogram.grid(), c);
                Peak::new(histogram.point_at(col, row, page), f64::from(c.value))
            })
            .collect();

        let status = if peaks.is_empty() {
            format!("no peaks above threshold {threshold}")
        } else {
            format!(
                "found {} peaks ({found} local maxima above threshold {threshold})",
                peaks.len()
            )
        };
        log::info!("Peak search: {status}");
        PeakSearchResult { peaks, status }
    }
}

fn neighbors(len: usize, i: usize) -> impl Iterator<Item = (usize, Ordering)> {
    [(i.checked_sub(1), Ordering::Less), (Some(i), Ordering::Equal), (Some(i + 1), Ordering::Greater)]
        .into_iter()
        .filter_map(move |(n, ord)| n.filter(|&n| n < len).map(|n| (n, ord)))
}

fn page_maxima(data: ArrayView3<'_, f32>, page: usize, threshold: f32) -> Vec<Candidate> {
    let (pages, rows, cols) = data.dim();
    let mut out = Vec::new();
    for row in 0..rows {
        for col in 0..cols {
            let value = data[[page, row, col]];
            if value <= threshold {
                continue;
            }
            let is_max = neighbors(pages, page).all(|(p, op)| {
                neighbors(rows, row).all(|(r, or)| {
                    neighbors(cols, col).all(|(c, oc)| match op.then(or).then(oc) {
                        Ordering::Equal => true,
                        Ordering::Less => value > data[[p, r, c]],
                        Ordering::Greater => value >= data[[p, r, c]],
                    })
                })
            });
            if is_max {
                out.push(Candidate { page, row, col, value });
            }
        }
    }
    out
}

#[allow(clippy::cast_precision_loss)]
fn smooth_pages(grid: ArrayView3<'_, f32>) -> Array3<f32> {
    let (_, rows, cols) = grid.dim();
    Array3::from_shape_fn(grid.dim(), |(page, row, col)| {
        let mut sum = 0.0;
        let mut n = 0u32;
        for (r, _) in neighbors(rows, row) {
            for (c, _) in neighbors(cols, col) {
                sum += grid[[page, r, c]];
                n += 1;
            }
        }
        sum / n as f32
    })
}

/// Fractional `[col, row, page]` of the positive-weighted 3×3×3 centroid.
#[allow(clippy::cast_precision_loss)]
fn centroid(grid: ArrayView3<'_, f32>, c: &Candidate) -> [f64; 3] {
    let (pages, rows, cols) = grid.dim();
    let mut weight = 0.0;
    let mut sum = [0.0f64; 3];
    for (p, _) in neighbors(pages, c.page) {
        for (r, _) in neighbors(rows, c.row) {
            for (col, _) in neighbors(cols, c.col) {
                let v = f64::from(grid[[p, r, col]]);
                if v > 0.0 {
                    weight += v;
                    sum[0] += v * col as f64;
                    sum[1] += v * r as f64;
                    sum[2] += v * p as f64;
                }
            }
        }
    }
    if weight > 0.0 {
        sum.map(|s| s / weight)
    } else {
        [c.col as f64, c.row as f64, c.page as f64]
    }
}
