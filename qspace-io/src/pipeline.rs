//! Raw event batches mapped to Q on the worker pool.
//!
//! A batch is split into `⌈len / max_segment_size⌉` segments, each mapped
//! by one pool job. Segment results are concatenated in order, so the
//! output matches a sequential mapping of the whole batch.

use crate::pool::{BatchStatus, WorkerPool};
use crate::Error;
use qspace_core::{QEvent, RawEventBatch};
use qspace_mapping::{MapStats, QMapper};
use std::sync::Arc;

/// Mapped events from one batch.
#[derive(Debug)]
pub struct MappedBatch {
    /// Events in input order. After a failure, only finished segments.
    pub events: Vec<QEvent>,
    /// Counters summed over finished segments.
    pub stats: MapStats,
    /// How the batch ended.
    pub status: BatchStatus,
    /// Segments submitted.
    pub segments: usize,
    /// Segments finished.
    pub completed: usize,
}

impl MappedBatch {
    /// True if every segment was mapped.
    #[must_use]
    pub fn is_complete(&self) -> bool {
        self.status == BatchStatus::Complete
    }

    /// The failure as an error, or `None` for a complete batch.
    #[must_use]
    pub fn error(&self) -> Option<Error> {
        self.status.to_error(self.completed, self.segments)
    }
}

/// Maps `batch` on `pool` using the pool's segment size.
#[must_use]
pub fn map_on_pool(pool: &WorkerPool, mapper: &Arc<QMapper>, batch: &RawEventBatch) -> MappedBatch {
    let ranges = batch.segments(pool.config().max_segment_size);
    let segments = ranges.len();
    let jobs: Vec<_> = ranges
        .into_iter()
        .map(|range| {
            let mapper = Arc::clone(mapper);
            let segment = batch.slice(range);
            move || mapper.map_range(&segment, 0..segment.len())
        })
        .collect();

    let outcome = pool.run(jobs);
    let completed = outcome.completed();
    let status = outcome.status.clone();

    let mut events = Vec::with_capacity(batch.len());
    let mut stats = MapStats::default();
    for mapped in outcome.into_partial() {
        events.extend(mapped.events);
        stats.merge(&mapped.stats);
    }

    if stats.unmatched > 0 {
        log::debug!("{} events had unknown pixel ids", stats.unmatched);
    }
    log::debug!(
        "Mapped {} of {} events in {completed}/{segments} segments",
        stats.mapped,
        batch.len()
    );

    MappedBatch {
        events,
        stats,
        status,
        segments,
        completed,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pool::WorkerPoolConfig;
    use qspace_core::{RawEvent, Vec3};
    use qspace_mapping::{DetectorPanel, FlightPath, InstrumentConfig, PanelGeometry};

    fn mapper() -> Arc<QMapper> {
        let panel = DetectorPanel::new(
            1,
            0,
            8,
            8,
            0.2,
            0.2,
            Vec3::new(0.0, 0.5, 0.0),
            Vec3::X,
            Vec3::Z,
        )
        .unwrap();
        let instrument = InstrumentConfig::new(
            "test",
            FlightPath::default(),
            PanelGeometry::new(vec![panel]).unwrap(),
        )
        .unwrap();
        Arc::new(QMapper::new(&instrument).unwrap())
    }

    #[test]
    fn test_segments_match_sequential_mapping() {
        let mapper = mapper();
        let batch: RawEventBatch = (0..250u32)
            .map(|i| RawEvent::new(20_000 + i * 37, i % 70))
            .collect();
        let pool = WorkerPool::new(
            WorkerPoolConfig::default()
                .with_workers(3)
                .with_max_segment_size(40),
        )
        .unwrap();

        let mapped = map_on_pool(&pool, &mapper, &batch);
        assert!(mapped.is_complete());
        assert!(mapped.error().is_none());
        assert_eq!(mapped.segments, 7);
        assert_eq!(mapped.completed, 7);

        let sequential = mapper.map_range(&batch, 0..batch.len());
        assert_eq!(mapped.events, sequential.events);
        assert_eq!(mapped.stats, sequential.stats);
        // Pixel ids 64..70 are not on the 8x8 panel.
        assert!(mapped.stats.unmatched > 0);
    }

    #[test]
    fn test_empty_batch() {
        let pool = WorkerPool::new(WorkerPoolConfig::default()).unwrap();
        let mapped = map_on_pool(&pool, &mapper(), &RawEventBatch::default());
        assert!(mapped.is_complete());
        assert_eq!(mapped.segments, 0);
        assert!(mapped.events.is_empty());
    }
}
