//! Time-of-flight to Q mapping.
//!
//! Per-pixel constants are computed once at construction: the unit Q
//! direction `(d̂ - x̂) / |d̂ - x̂|` and `4π·(L1 + L2)·sin θ / (h/mₙ)`, so
//! mapping one event costs a table lookup, a division and three
//! multiplications.

use crate::filter::{DiscardedPeakRegions, EventFilters, PixelMask, QRangeFilter};
use crate::geometry::{DetectorGeometry, PixelLocation, RayHit};
use crate::indexer::DetectorCoverage;
use crate::instrument::{FlightPath, InstrumentConfig};
use crate::{Error, Result};
use qspace_core::convention::{self, H_OVER_MN};
use qspace_core::{QEvent, RawEvent, RawEventBatch, Vec3};
use rayon::prelude::*;
use std::f64::consts::PI;
use std::ops::Range;
use std::sync::Arc;

/// Most pixels a mapper tabulates.
pub const MAX_TABLE_PIXELS: usize = 1 << 26;

/// A run of consecutive pixel ids stored from `offset` in the table.
#[derive(Debug, Clone, Copy)]
struct PixelSpan {
    first_id: u32,
    len: usize,
    offset: usize,
}

/// Per-pixel mapping constants.
#[derive(Debug, Clone, Copy)]
struct PixelEntry {
    q_dir: Vec3,
    tof_to_mag_q: f64,
    detector_id: u32,
    row: u32,
    col: u32,
}

/// Why events were not mapped.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MapStats {
    /// Events turned into Q.
    pub mapped: usize,
    /// Pixel id not owned by any detector.
    pub unmatched: usize,
    /// Pixel excluded by the pixel mask.
    pub masked: usize,
    /// Rejected by the |Q| range or discarded-peak filters.
    pub filtered: usize,
    /// Non-positive time of flight after the t0 shift.
    pub bad_tof: usize,
}

impl MapStats {
    /// Total number of events seen.
    #[must_use]
    pub fn total(&self) -> usize {
        self.mapped + self.unmatched + self.masked + self.filtered + self.bad_tof
    }

    /// Adds another set of counts.
    pub fn merge(&mut self, other: &MapStats) {
        self.mapped += other.mapped;
        self.unmatched += other.unmatched;
        self.masked += other.masked;
        self.filtered += other.filtered;
        self.bad_tof += other.bad_tof;
    }
}

/// Mapped events with the counts of dropped ones.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MappedEvents {
    /// Mapped events, in input order.
    pub events: Vec<QEvent>,
    /// Counts of mapped and dropped events.
    pub stats: MapStats,
}

/// Where a Q vector would have been detected.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct InverseHit {
    /// Pixel struck by the scattered beam.
    pub hit: RayHit,
    /// Neutron wavelength in Å.
    pub wavelength: f64,
    /// Time of flight in µs as measured (t0 removed).
    pub tof_us: f64,
}

/// Derived quantities for a point in Q.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PointInfo {
    /// The point.
    pub q: Vec3,
    /// |Q| in Å⁻¹.
    pub mag_q: f64,
    /// d-spacing in Å; `None` at Q = 0.
    pub d_spacing: Option<f64>,
    /// Scattering angle 2θ in radians, for elastic scattering with the
    /// beam along +x.
    pub two_theta: Option<f64>,
    /// Wavelength in Å for elastic scattering to `q`.
    pub wavelength: Option<f64>,
    /// Where the detectors would see `q`.
    pub detector: Option<InverseHit>,
}

/// Maps raw events to Q through a detector geometry.
pub struct QMapper {
    geometry: Arc<dyn DetectorGeometry>,
    flight_path: FlightPath,
    spans: Vec<PixelSpan>,
    table: Vec<Option<PixelEntry>>,
    masked: Vec<bool>,
    filters: EventFilters,
}

impl std::fmt::Debug for QMapper {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QMapper")
            .field("flight_path", &self.flight_path)
            .field("spans", &self.spans.len())
            .field("pixels", &self.table.len())
            .field("filters", &self.filters)
            .finish_non_exhaustive()
    }
}

impl QMapper {
    /// Creates a mapper for an instrument.
    ///
    /// # Errors
    /// See [`QMapper::with_geometry`].
    pub fn new(instrument: &InstrumentConfig) -> Result<Self> {
        Self::with_geometry(Arc::new(instrument.geometry.clone()), instrument.flight_path)
    }

    /// Creates a mapper over any geometry.
    ///
    /// # Errors
    /// Returns [`Error::Geometry`] if the geometry has no pixels or any
    /// pixel sits at the sample, in the direct beam, or at a non-finite
    /// position, and [`Error::Config`] for an invalid flight path.
    pub fn with_geometry(
        geometry: Arc<dyn DetectorGeometry>,
        flight_path: FlightPath,
    ) -> Result<Self> {
        flight_path.validate()?;
        let ranges = geometry.pixel_id_ranges();
        if ranges.is_empty() {
            return Err(Error::Geometry("geometry has no pixels".to_string()));
        }
        let mut spans = Vec::with_capacity(ranges.len());
        let mut offset = 0usize;
        for range in &ranges {
            let len = (range.end() - range.start()) as usize + 1;
            spans.push(PixelSpan {
                first_id: *range.start(),
                len,
                offset,
            });
            offset = offset.saturating_add(len);
        }
        if offset > MAX_TABLE_PIXELS {
            return Err(Error::Config(format!(
                "{offset} pixel ids exceed the {MAX_TABLE_PIXELS} a mapper can tabulate"
            )));
        }

        let table = ranges
            .into_iter()
            .flatten()
            .map(|id| match geometry.position_of(id) {
                Some(loc) => pixel_entry(&loc, flight_path.l1_m).map(Some),
                None => Ok(None),
            })
            .collect::<Result<Vec<_>>>()?;
        let valid = table.iter().filter(|e| e.is_some()).count();
        log::debug!(
            "QMapper covers {} pixel ids in {} spans ({valid} valid)",
            table.len(),
            spans.len()
        );

        Ok(Self {
            masked: vec![false; table.len()],
            geometry,
            flight_path,
            spans,
            table,
            filters: EventFilters::default(),
        })
    }

    /// Replaces the pixel mask.
    pub fn set_pixel_mask(&mut self, mask: PixelMask) {
        for (flag, entry) in self.masked.iter_mut().zip(&self.table) {
            *flag = entry.is_some_and(|e| mask.masks(e.detector_id, e.row, e.col));
        }
        self.filters.pixel_mask = mask;
    }

    /// Sets or clears the |Q| range filter.
    pub fn set_q_range(&mut self, filter: Option<QRangeFilter>) {
        self.filters.q_range = filter;
    }

    /// Sets or clears the discarded-peak regions.
    pub fn set_discarded_regions(&mut self, regions: Option<DiscardedPeakRegions>) {
        self.filters.discarded = regions;
    }

    /// Sets the pixel mask.
    #[must_use]
    pub fn with_pixel_mask(mut self, mask: PixelMask) -> Self {
        self.set_pixel_mask(mask);
        self
    }

    /// Sets the |Q| range filter.
    #[must_use]
    pub fn with_q_range(mut self, filter: QRangeFilter) -> Self {
        self.filters.q_range = Some(filter);
        self
    }

    /// Sets the discarded-peak regions.
    #[must_use]
    pub fn with_discarded_regions(mut self, regions: DiscardedPeakRegions) -> Self {
        self.filters.discarded = Some(regions);
        self
    }

    /// Active event filters.
    #[must_use]
    pub fn filters(&self) -> &EventFilters {
        &self.filters
    }

    /// Flight path the mapper was built for.
    #[must_use]
    pub fn flight_path(&self) -> &FlightPath {
        &self.flight_path
    }

    /// The detector geometry.
    #[must_use]
    pub fn geometry(&self) -> &dyn DetectorGeometry {
        self.geometry.as_ref()
    }

    fn entry(&self, pixel_id: u32) -> Option<(usize, &PixelEntry)> {
        let span = self
            .spans
            .partition_point(|s| s.first_id <= pixel_id)
            .checked_sub(1)
            .map(|i| &self.spans[i])?;
        let within = (pixel_id - span.first_id) as usize;
        if within >= span.len {
            return None;
        }
        let idx = span.offset + within;
        self.table.get(idx)?.as_ref().map(|entry| (idx, entry))
    }

    fn map_one(&self, event: RawEvent, stats: &mut MapStats) -> Option<QEvent> {
        let Some((idx, entry)) = self.entry(event.pixel_id) else {
            stats.unmatched += 1;
            return None;
        };
        if self.masked[idx] {
            stats.masked += 1;
            return None;
        }
        let tof = self.flight_path.tof_us(event.tof);
        if tof <= 0.0 {
            stats.bad_tof += 1;
            return None;
        }
        let q = entry.q_dir * (entry.tof_to_mag_q / tof);
        if !self.filters.accepts_q(q) {
            stats.filtered += 1;
            return None;
        }
        stats.mapped += 1;
        Some(QEvent::from_q(q))
    }

    /// Maps a single event, or `None` if it is dropped.
    #[must_use]
    pub fn map_event(&self, event: RawEvent) -> Option<QEvent> {
        self.map_one(event, &mut MapStats::default())
    }

    /// Maps events in order. Dropped events produce no output.
    #[must_use]
    pub fn map(&self, events: &[RawEvent]) -> MappedEvents {
        let mut stats = MapStats::default();
        let events = events
            .iter()
            .filter_map(|&e| self.map_one(e, &mut stats))
            .collect();
        log_stats(&stats);
        MappedEvents { events, stats }
    }

    /// Maps a sub-range of a batch in order.
    ///
    /// The range is clamped to the batch.
    #[must_use]
    pub fn map_range(&self, batch: &RawEventBatch, range: Range<usize>) -> MappedEvents {
        let end = range.end.min(batch.len());
        let start = range.start.min(end);
        let mut stats = MapStats::default();
        let mut events = Vec::with_capacity(end - start);
        for (&tof, &pixel_id) in batch.tof[start..end].iter().zip(&batch.pixel_id[start..end]) {
            if let Some(q) = self.map_one(RawEvent::new(tof, pixel_id), &mut stats) {
                events.push(q);
            }
        }
        MappedEvents { events, stats }
    }

    /// Maps a whole batch on the current rayon pool, splitting it into
    /// segments of at most `max_segment_size` events. Order is preserved.
    #[must_use]
    pub fn map_batch(&self, batch: &RawEventBatch, max_segment_size: usize) -> MappedEvents {
        let parts: Vec<MappedEvents> = batch
            .segments(max_segment_size)
            .into_par_iter()
            .map(|range| self.map_range(batch, range))
            .collect();

        let mut out = MappedEvents {
            events: Vec::with_capacity(parts.iter().map(|p| p.events.len()).sum()),
            stats: MapStats::default(),
        };
        for part in parts {
            out.events.extend(part.events);
            out.stats.merge(&part.stats);
        }
        log_stats(&out.stats);
        out
    }

    /// Finds the pixel and time of flight at which a neutron scattered
    /// elastically to `q` would be detected.
    ///
    /// Returns `None` when `q` is not reachable with the beam along +x
    /// (`Qx >= 0`) or the scattered ray misses every panel.
    #[must_use]
    pub fn inverse(&self, q: Vec3) -> Option<InverseHit> {
        let k = incident_k(q)?;
        let direction = q * (1.0 / k) + Vec3::X;
        let hit = self.geometry.pixel_along(direction)?;
        let wavelength = 2.0 * PI / k;
        let path = self.flight_path.l1_m + hit.point.length();
        let tof_us = convention::time_of_flight(wavelength, path) - self.flight_path.t0_us;
        Some(InverseHit {
            hit,
            wavelength,
            tof_us,
        })
    }

    /// |Q|, d-spacing, scattering angle, wavelength and the detector
    /// position for a point in Q.
    #[must_use]
    pub fn point_info(&self, q: Vec3) -> PointInfo {
        let mag_q = q.length();
        let k = incident_k(q);
        let two_theta = k.map(|k| (1.0 + q.x / k).clamp(-1.0, 1.0).acos());
        PointInfo {
            q,
            mag_q,
            d_spacing: convention::d_spacing(q),
            two_theta,
            wavelength: k.map(|k| 2.0 * PI / k),
            detector: self.inverse(q),
        }
    }
}

impl DetectorCoverage for QMapper {
    fn covers(&self, q: Vec3) -> bool {
        self.inverse(q)
            .and_then(|inv| self.entry(inv.hit.location.pixel_id))
            .is_some_and(|(idx, _)| !self.masked[idx])
    }
}

/// `|k|` of the incident beam for elastic scattering to `q`, given the
/// beam along +x: from `|k·x̂ + q| = k`, `k = -|q|² / (2 q_x)`.
fn incident_k(q: Vec3) -> Option<f64> {
    if !q.is_finite() || q.x >= 0.0 {
        return None;
    }
    let k = -q.length_squared() / (2.0 * q.x);
    (k.is_finite() && k > 0.0).then_some(k)
}

fn pixel_entry(loc: &PixelLocation, l1: f64) -> Result<PixelEntry> {
    let pos = loc.position;
    let l2 = pos.length();
    let bad = |why: &str| {
        Error::Geometry(format!(
            "pixel {} (detector {}, row {}, col {}) {why}",
            loc.pixel_id, loc.detector_id, loc.row, loc.col
        ))
    };
    if !pos.is_finite() {
        return Err(bad("has a non-finite position"));
    }
    if l2 <= 0.0 {
        return Err(bad("is at the sample position"));
    }
    let q_dir = (pos * (1.0 / l2) - Vec3::X)
        .normalized()
        .ok_or_else(|| bad("is in the direct beam"))?;
    let two_theta = (pos.x / l2).clamp(-1.0, 1.0).acos();
    let tof_to_mag_q = 4.0 * PI * (l1 + l2) * (two_theta / 2.0).sin() / H_OVER_MN;
    Ok(PixelEntry {
        q_dir,
        tof_to_mag_q,
        detector_id: loc.detector_id,
        row: loc.row,
        col: loc.col,
    })
}

fn log_stats(stats: &MapStats) {
    if stats.total() > stats.mapped {
        log::debug!(
            "mapped {} of {} events ({} unmatched pixel ids, {} masked, {} filtered, {} bad tof)",
            stats.mapped,
            stats.total(),
            stats.unmatched,
            stats.masked,
            stats.filtered,
            stats.bad_tof
        );
    }
}
