//! Structure of Arrays (`SoA`) storage for raw events.
//!
//! Event files and network packets deliver time-of-flight and pixel-id
//! columns separately; `RawEventBatch` keeps them in parallel vectors so
//! segments can be handed to workers as cheap slices.

use crate::{Error, RawEvent, Result};
use std::ops::Range;

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

/// A batch of raw events stored in `SoA` layout.
#[derive(Debug, Clone, Default, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct RawEventBatch {
    /// Columnar storage for time-of-flight values.
    pub tof: Vec<u32>,
    /// Columnar storage for pixel ids.
    pub pixel_id: Vec<u32>,
}

impl RawEventBatch {
    /// Creates a new empty batch with specified capacity.
    #[must_use]
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            tof: Vec::with_capacity(capacity),
            pixel_id: Vec::with_capacity(capacity),
        }
    }

    /// Builds a batch from separate columns.
    ///
    /// # Errors
    /// Returns [`Error::LengthMismatch`] if the columns differ in length.
    pub fn from_columns(tof: Vec<u32>, pixel_id: Vec<u32>) -> Result<Self> {
        if tof.len() != pixel_id.len() {
            return Err(Error::LengthMismatch {
                tofs: tof.len(),
                pixel_ids: pixel_id.len(),
            });
        }
        Ok(Self { tof, pixel_id })
    }

    /// Returns the number of events in the batch.
    #[must_use]
    pub fn len(&self) -> usize {
        self.tof.len()
    }

    /// Returns true if the batch is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.tof.is_empty()
    }

    /// Clears all columns.
    pub fn clear(&mut self) {
        self.tof.clear();
        self.pixel_id.clear();
    }

    /// Pushes a single event.
    pub fn push(&mut self, event: RawEvent) {
        self.tof.push(event.tof);
        self.pixel_id.push(event.pixel_id);
    }

    /// Appends all events from another batch.
    pub fn append(&mut self, other: &RawEventBatch) {
        self.tof.extend_from_slice(&other.tof);
        self.pixel_id.extend_from_slice(&other.pixel_id);
    }

    /// Returns the event at `index`.
    #[must_use]
    pub fn get(&self, index: usize) -> Option<RawEvent> {
        Some(RawEvent::new(
            *self.tof.get(index)?,
            *self.pixel_id.get(index)?,
        ))
    }

    /// Iterates over the events in order.
    pub fn iter(&self) -> impl Iterator<Item = RawEvent> + '_ {
        self.tof
            .iter()
            .zip(&self.pixel_id)
            .map(|(&tof, &pixel_id)| RawEvent::new(tof, pixel_id))
    }

    /// Copies a sub-range of the batch.
    #[must_use]
    pub fn slice(&self, range: Range<usize>) -> Self {
        Self {
            tof: self.tof[range.clone()].to_vec(),
            pixel_id: self.pixel_id[range].to_vec(),
        }
    }

    /// Splits `0..len` into contiguous ranges of at most `max_segment_size`
    /// events (`⌈len / max_segment_size⌉` segments).
    #[must_use]
    pub fn segments(&self, max_segment_size: usize) -> Vec<Range<usize>> {
        segment_ranges(self.len(), max_segment_size)
    }
}

impl FromIterator<RawEvent> for RawEventBatch {
    fn from_iter<I: IntoIterator<Item = RawEvent>>(iter: I) -> Self {
        let mut batch = Self::default();
        for event in iter {
            batch.push(event);
        }
        batch
    }
}

/// Splits `0..len` into contiguous ranges of at most `max_segment_size`.
///
/// A `max_segment_size` of zero is treated as one.
#[must_use]
pub fn segment_ranges(len: usize, max_segment_size: usize) -> Vec<Range<usize>> {
    let size = max_segment_size.max(1);
    (0..len.div_ceil(size))
        .map(|i| {
            let start = i * size;
            start..(start + size).min(len)
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_raw_event_batch_operations() {
        let mut batch = RawEventBatch::with_capacity(10);
        assert!(batch.is_empty());

        batch.push(RawEvent::new(1000, 5));
        batch.push(RawEvent::new(1001, 6));
        assert_eq!(batch.len(), 2);
        assert_eq!(batch.get(1), Some(RawEvent::new(1001, 6)));
        assert_eq!(batch.get(2), None);

        let copy = batch.slice(1..2);
        assert_eq!(copy.len(), 1);
        assert_eq!(copy.tof[0], 1001);

        batch.clear();
        assert!(batch.is_empty());
    }

    #[test]
    fn test_from_columns_rejects_mismatch() {
        assert!(RawEventBatch::from_columns(vec![1, 2], vec![1]).is_err());
        let batch = RawEventBatch::from_columns(vec![1, 2], vec![3, 4]).unwrap();
        let events: Vec<_> = batch.iter().collect();
        assert_eq!(events, vec![RawEvent::new(1, 3), RawEvent::new(2, 4)]);
    }

    #[test]
    fn test_segment_ranges() {
        assert_eq!(segment_ranges(10, 4), vec![0..4, 4..8, 8..10]);
        assert_eq!(segment_ranges(8, 4), vec![0..4, 4..8]);
        assert!(segment_ranges(0, 4).is_empty());
        assert_eq!(segment_ranges(3, 0).len(), 3);
    }
}
