//! Writer for raw event files.

use crate::Result;
use qspace_core::RawEvent;
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::Path;

/// Writes events in the 8-byte little-endian record format read by
/// [`crate::EventFileReader`].
pub struct EventFileWriter {
    writer: BufWriter<File>,
}

impl EventFileWriter {
    /// Creates a new file writer.
    ///
    /// # Errors
    /// Returns an error if the file cannot be created.
    pub fn create<P: AsRef<Path>>(path: P) -> Result<Self> {
        let file = File::create(path)?;
        let writer = BufWriter::new(file);
        Ok(Self { writer })
    }

    /// Appends events.
    ///
    /// # Errors
    /// Returns an error if writing fails.
    pub fn write_events(&mut self, events: &[RawEvent]) -> Result<()> {
        for e in events {
            self.writer.write_all(&e.tof.to_le_bytes())?;
            self.writer.write_all(&e.pixel_id.to_le_bytes())?;
        }
        Ok(())
    }

    /// Flushes the writer.
    ///
    /// # Errors
    /// Returns an error if flushing fails.
    pub fn flush(&mut self) -> Result<()> {
        self.writer.flush()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::NamedTempFile;

    #[test]
    fn test_write_events_binary() {
        let file = NamedTempFile::new().unwrap();
        let mut writer = EventFileWriter::create(file.path()).unwrap();
        writer
            .write_events(&[RawEvent::new(0x0102_0304, 7), RawEvent::new(5, 6)])
            .unwrap();
        writer.flush().unwrap();

        let data = std::fs::read(file.path()).unwrap();
        assert_eq!(data.len(), 16);
        assert_eq!(&data[..8], &[4, 3, 2, 1, 7, 0, 0, 0]);
    }
}
