//! Memory-mapped event file readers.
//!
//! An event file is a flat array of 8-byte little-endian records
//! `(tof: u32, pixel_id: u32)`, TOF in clock ticks.

use crate::{Error, Result};
use memmap2::Mmap;
use qspace_core::{RawEvent, RawEventBatch};
use rayon::prelude::*;
use std::fs::File;
use std::ops::Range;
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Bytes per event record.
pub const EVENT_RECORD_BYTES: usize = 8;

/// A memory-mapped file reader.
///
/// Uses memmap2 to efficiently access file contents without
/// loading the entire file into memory.
pub struct MappedFileReader {
    mmap: Arc<Mmap>,
    path: PathBuf,
}

impl MappedFileReader {
    /// Opens a file for memory-mapped reading.
    ///
    /// # Errors
    /// Returns an error if the file cannot be opened or memory-mapped.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let file = File::open(&path)?;
        // SAFETY: The file is opened read-only and we assume it is not modified concurrently.
        // This is the standard safety contract for memory mapping.
        #[allow(unsafe_code)]
        let mmap = unsafe { Mmap::map(&file)? };
        Ok(Self {
            mmap: Arc::new(mmap),
            path: path.as_ref().to_path_buf(),
        })
    }

    /// Returns the file contents as a byte slice.
    #[must_use]
    pub fn as_bytes(&self) -> &[u8] {
        &self.mmap[..]
    }

    /// Returns the file size in bytes.
    #[must_use]
    pub fn len(&self) -> usize {
        self.mmap.len()
    }

    /// Returns true if the file is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.mmap.is_empty()
    }

    /// Path the file was opened from.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }
}

/// Reader for SNS raw neutron event files.
pub struct EventFileReader {
    reader: MappedFileReader,
}

impl EventFileReader {
    /// Opens an event file.
    ///
    /// # Errors
    /// Returns an error if the file cannot be mapped or its size is not a
    /// multiple of the record size.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let reader = MappedFileReader::open(path)?;
        if !reader.len().is_multiple_of(EVENT_RECORD_BYTES) {
            return Err(Error::InvalidFormat(format!(
                "file size {} is not a multiple of {EVENT_RECORD_BYTES} (file: {})",
                reader.len(),
                reader.path.display()
            )));
        }
        Ok(Self { reader })
    }

    /// Returns the file size in bytes.
    #[must_use]
    pub fn file_size(&self) -> usize {
        self.reader.len()
    }

    /// Number of events in the file.
    #[must_use]
    pub fn event_count(&self) -> usize {
        self.reader.len() / EVENT_RECORD_BYTES
    }

    /// Path the file was opened from.
    #[must_use]
    pub fn path(&self) -> &Path {
        self.reader.path()
    }

    /// The event window `[first, first + count)` clamped to the file.
    #[must_use]
    pub fn window(&self, first: usize, count: usize) -> Range<usize> {
        let total = self.event_count();
        let start = first.min(total);
        start..start.saturating_add(count).min(total)
    }

    /// Reads events `[first, first + count)`, clamped to the file.
    #[must_use]
    pub fn read_events(&self, first: usize, count: usize) -> RawEventBatch {
        let range = self.window(first, count);
        let bytes = &self.reader.as_bytes()
            [range.start * EVENT_RECORD_BYTES..range.end * EVENT_RECORD_BYTES];
        bytes.chunks_exact(EVENT_RECORD_BYTES).map(decode_record).collect()
    }

    /// Reads a window as consecutive segments of at most
    /// `max_segment_size` events, decoded in parallel.
    #[must_use]
    pub fn read_segments(
        &self,
        first: usize,
        count: usize,
        max_segment_size: usize,
    ) -> Vec<RawEventBatch> {
        let window = self.window(first, count);
        qspace_core::soa::segment_ranges(window.len(), max_segment_size)
            .into_par_iter()
            .map(|r| self.read_events(window.start + r.start, r.len()))
            .collect()
    }

    /// Iterates over every event in the file.
    pub fn iter_events(&self) -> impl Iterator<Item = RawEvent> + '_ {
        self.reader
            .as_bytes()
            .chunks_exact(EVENT_RECORD_BYTES)
            .map(decode_record)
    }
}

fn decode_record(chunk: &[u8]) -> RawEvent {
    let word = |i: usize| u32::from_le_bytes([chunk[i], chunk[i + 1], chunk[i + 2], chunk[i + 3]]);
    RawEvent::new(word(0), word(4))
}
