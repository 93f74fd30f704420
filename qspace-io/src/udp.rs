//! UDP event packet codec.
//!
//! All fields are little-endian:
//!
//! | bytes     | field                                              |
//! |-----------|----------------------------------------------------|
//! | `4..8`    | packet type marker                                 |
//! | `8..12`   | end offset of the event records                    |
//! | `12..16`  | start offset of the event records                  |
//! | `24 + start..` | event records                                 |
//!
//! Command packets also carry 24-byte pulse records from a configurable
//! offset up to the first event record, each beginning with the pulse's
//! protons on target as an `f64`.

use crate::{Error, Result};
use qspace_core::{QEvent, RawEvent};

/// Marker of a packet with pulse records and events.
pub const COMMAND_PACKET: u32 = 0x0002_0000;
/// Marker of a packet with events only.
pub const DATA_PACKET: u32 = 0x0000_0200;
/// Bytes before the offset origin of the event records.
pub const HEADER_BYTES: usize = 24;
/// Default position of the first pulse record.
pub const DEFAULT_PULSE_OFFSET: usize = 40;
/// Bytes per pulse record.
pub const PULSE_RECORD_BYTES: usize = 24;

/// Packet type.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PacketKind {
    /// Pulse records and events.
    Command,
    /// Events only.
    Data,
}

impl PacketKind {
    fn marker(self) -> u32 {
        match self {
            PacketKind::Command => COMMAND_PACKET,
            PacketKind::Data => DATA_PACKET,
        }
    }
}

/// Layout of one event record.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum RecordFormat {
    /// `(tof: f32, pixel_id: f32)`.
    #[default]
    FloatPair,
    /// `(tof: u32, pixel_id: u32)`.
    IntegerPair,
    /// `(qx: f32, qy: f32, qz: f32)`, already mapped to Q.
    QTriple,
}

impl RecordFormat {
    /// Bytes per record.
    #[must_use]
    pub fn record_bytes(self) -> usize {
        match self {
            RecordFormat::FloatPair | RecordFormat::IntegerPair => 8,
            RecordFormat::QTriple => 12,
        }
    }
}

impl std::str::FromStr for RecordFormat {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "float" | "float-pair" => Ok(Self::FloatPair),
            "int" | "integer" | "integer-pair" => Ok(Self::IntegerPair),
            "q" | "q-triple" => Ok(Self::QTriple),
            other => Err(Error::Config(format!("unknown record format '{other}'"))),
        }
    }
}

/// Events carried by a packet.
#[derive(Clone, Debug, PartialEq)]
pub enum WireEvents {
    /// Raw `(tof, pixel_id)` events for the mapper.
    Raw(Vec<RawEvent>),
    /// Events already in Q.
    Q(Vec<QEvent>),
}

impl WireEvents {
    /// Number of events.
    #[must_use]
    pub fn len(&self) -> usize {
        match self {
            WireEvents::Raw(e) => e.len(),
            WireEvents::Q(e) => e.len(),
        }
    }

    /// True if there are no events.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// A decoded packet.
#[derive(Clone, Debug, PartialEq)]
pub struct Packet {
    /// Packet type.
    pub kind: PacketKind,
    /// Event records that decoded cleanly.
    pub events: WireEvents,
    /// Protons on target of each pulse record.
    pub protons_on_target: Vec<f64>,
    /// Records dropped as unusable (negative or non-finite fields).
    pub dropped_records: usize,
}

/// Encodes and decodes packets for one record format.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PacketCodec {
    format: RecordFormat,
    pulse_offset: usize,
}

impl Default for PacketCodec {
    fn default() -> Self {
        Self::new(RecordFormat::default(), DEFAULT_PULSE_OFFSET)
    }
}

fn u32_at(data: &[u8], at: usize) -> Option<u32> {
    let bytes = data.get(at..at + 4)?;
    Some(u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
}

fn f32_at(data: &[u8], at: usize) -> Option<f32> {
    u32_at(data, at).map(f32::from_bits)
}

fn f64_at(data: &[u8], at: usize) -> Option<f64> {
    let bytes: [u8; 8] = data.get(at..at + 8)?.try_into().ok()?;
    Some(f64::from_le_bytes(bytes))
}

#[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
fn f32_to_u32(value: f32) -> Option<u32> {
    let rounded = f64::from(value).round();
    (rounded.is_finite() && (0.0..=f64::from(u32::MAX)).contains(&rounded)).then_some(rounded as u32)
}

impl PacketCodec {
    /// Creates a codec.
    #[must_use]
    pub fn new(format: RecordFormat, pulse_offset: usize) -> Self {
        Self {
            format,
            pulse_offset,
        }
    }

    /// Record format handled.
    #[must_use]
    pub fn format(&self) -> RecordFormat {
        self.format
    }

    /// Decodes one packet. Unusable records are dropped and counted; a
    /// trailing partial record is ignored.
    ///
    /// # Errors
    /// Returns [`Error::MalformedPacket`] for an unknown type marker or
    /// offsets outside the packet.
    pub fn decode(&self, data: &[u8]) -> Result<Packet> {
        let malformed = Error::MalformedPacket;
        let marker = u32_at(data, 4).ok_or_else(|| malformed(format!("{} byte packet", data.len())))?;
        let kind = match marker {
            COMMAND_PACKET => PacketKind::Command,
            DATA_PACKET => PacketKind::Data,
            other => return Err(malformed(format!("unknown packet type {other:#010x}"))),
        };
        let end = u32_at(data, 8).ok_or_else(|| malformed("missing end offset".into()))? as usize;
        let start = u32_at(data, 12).ok_or_else(|| malformed("missing start offset".into()))? as usize;
        if end < start {
            return Err(malformed(format!("end offset {end} before start offset {start}")));
        }
        let first = HEADER_BYTES + start;
        let size = self.format.record_bytes();
        let count = (end - start) / size;
        if (end - start) % size != 0 {
            log::debug!("Ignoring {} trailing bytes in event records", (end - start) % size);
        }
        let last = first + count * size;
        if last > data.len() {
            return Err(malformed(format!(
                "{count} records from byte {first} overrun the {} byte packet",
                data.len()
            )));
        }

        let records = data[first..last].chunks_exact(size);
        let mut dropped_records = 0;
        let events = match self.format {
            RecordFormat::FloatPair => WireEvents::Raw(
                records
                    .filter_map(|r| {
                        let event = f32_to_u32(f32_at(r, 0)?)
                            .zip(f32_to_u32(f32_at(r, 4)?))
                            .map(|(tof, pixel)| RawEvent::new(tof, pixel));
                        dropped_records += usize::from(event.is_none());
                        event
                    })
                    .collect(),
            ),
            RecordFormat::IntegerPair => WireEvents::Raw(
                records
                    .filter_map(|r| Some(RawEvent::new(u32_at(r, 0)?, u32_at(r, 4)?)))
                    .collect(),
            ),
            RecordFormat::QTriple => WireEvents::Q(
                records
                    .filter_map(|r| {
                        let q = [f32_at(r, 0)?, f32_at(r, 4)?, f32_at(r, 8)?];
                        let event = q
                            .iter()
                            .all(|v| v.is_finite())
                            .then(|| QEvent::new(f64::from(q[0]), f64::from(q[1]), f64::from(q[2])));
                        dropped_records += usize::from(event.is_none());
                        event
                    })
                    .collect(),
            ),
        };

        let mut protons_on_target = Vec::new();
        if kind == PacketKind::Command {
            let mut pos = self.pulse_offset;
            while pos + 8 <= first {
                match f64_at(data, pos) {
                    Some(pot) if pot.is_finite() => protons_on_target.push(pot),
                    _ => dropped_records += 1,
                }
                pos += PULSE_RECORD_BYTES;
            }
        }

        Ok(Packet {
            kind,
            events,
            protons_on_target,
            dropped_records,
        })
    }

    /// Encodes a packet. Pulse records are written only for command
    /// packets.
    ///
    /// # Errors
    /// Returns [`Error::Config`] if the events do not match the record
    /// format or the offsets do not fit in 32 bits.
    #[allow(clippy::cast_precision_loss, clippy::cast_possible_truncation)]
    pub fn encode(&self, kind: PacketKind, events: &WireEvents, protons_on_target: &[f64]) -> Result<Vec<u8>> {
        let first = match kind {
            PacketKind::Command => {
                (self.pulse_offset + PULSE_RECORD_BYTES * protons_on_target.len()).max(HEADER_BYTES)
            }
            PacketKind::Data => HEADER_BYTES,
        };
        let size = self.format.record_bytes();
        let mut data = vec![0u8; first];
        data[4..8].copy_from_slice(&kind.marker().to_le_bytes());
        let start = first - HEADER_BYTES;
        let end = start + events.len() * size;
        let offset = |v: usize| {
            u32::try_from(v).map_err(|_| Error::Config(format!("offset {v} does not fit in 32 bits")))
        };
        data[8..12].copy_from_slice(&offset(end)?.to_le_bytes());
        data[12..16].copy_from_slice(&offset(start)?.to_le_bytes());
        if kind == PacketKind::Command {
            for (i, pot) in protons_on_target.iter().enumerate() {
                let at = self.pulse_offset + i * PULSE_RECORD_BYTES;
                data[at..at + 8].copy_from_slice(&pot.to_le_bytes());
            }
        }

        match (self.format, events) {
            (RecordFormat::FloatPair, WireEvents::Raw(raw)) => {
                for e in raw {
                    data.extend_from_slice(&(e.tof as f32).to_le_bytes());
                    data.extend_from_slice(&(e.pixel_id as f32).to_le_bytes());
                }
            }
            (RecordFormat::IntegerPair, WireEvents::Raw(raw)) => {
                for e in raw {
                    data.extend_from_slice(&e.tof.to_le_bytes());
                    data.extend_from_slice(&e.pixel_id.to_le_bytes());
                }
            }
            (RecordFormat::QTriple, WireEvents::Q(q)) => {
                for e in q {
                    for v in [e.x, e.y, e.z] {
                        data.extend_from_slice(&(v as f32).to_le_bytes());
                    }
                }
            }
            (format, _) => {
                return Err(Error::Config(format!("events do not match record format {format:?}")));
            }
        }
        Ok(data)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    /// Command packet laid out by hand: one pulse at byte 40, events from 48.
    fn hand_built(events: &[(f32, f32)], pot: f64) -> Vec<u8> {
        let mut data = vec![0u8; 48];
        data[6] = 2;
        let len = u32::try_from(events.len() * 8).unwrap();
        data[8..12].copy_from_slice(&(24 + len).to_le_bytes());
        data[12..16].copy_from_slice(&24u32.to_le_bytes());
        data[40..48].copy_from_slice(&pot.to_le_bytes());
        for (tof, pixel) in events {
            data.extend_from_slice(&tof.to_le_bytes());
            data.extend_from_slice(&pixel.to_le_bytes());
        }
        data
    }

    #[test]
    fn test_decode_hand_built_command_packet() {
        let data = hand_built(&[(1500.0, 7.0), (2500.0, 65_536.0)], 3.5e12);
        let packet = PacketCodec::default().decode(&data).unwrap();
        assert_eq!(packet.kind, PacketKind::Command);
        assert_eq!(
            packet.events,
            WireEvents::Raw(vec![RawEvent::new(1500, 7), RawEvent::new(2500, 65_536)])
        );
        assert_eq!(packet.protons_on_target.len(), 1);
        assert_relative_eq!(packet.protons_on_target[0], 3.5e12);
    }

    #[test]
    fn test_bad_float_records_dropped() {
        let data = hand_built(&[(-5.0, 1.0), (f32::NAN, 2.0), (10.0, 3.0)], 1.0);
        let packet = PacketCodec::default().decode(&data).unwrap();
        assert_eq!(packet.events, WireEvents::Raw(vec![RawEvent::new(10, 3)]));
        assert_eq!(packet.dropped_records, 2);
    }

    #[test]
    fn test_malformed_packets() {
        let codec = PacketCodec::default();
        assert!(matches!(codec.decode(&[0u8; 6]), Err(Error::MalformedPacket(_))));

        let mut unknown = vec![0u8; 24];
        unknown[4] = 9;
        assert!(codec.decode(&unknown).is_err());

        let mut overrun = hand_built(&[(1.0, 1.0)], 1.0);
        overrun.truncate(50);
        assert!(matches!(codec.decode(&overrun), Err(Error::MalformedPacket(_))));

        let mut reversed = hand_built(&[], 1.0);
        reversed[8..12].copy_from_slice(&0u32.to_le_bytes());
        assert!(codec.decode(&reversed).is_err());
    }

    #[test]
    fn test_data_packet_has_no_pulses() {
        let codec = PacketCodec::new(RecordFormat::IntegerPair, DEFAULT_PULSE_OFFSET);
        let events = WireEvents::Raw(vec![RawEvent::new(u32::MAX, 1)]);
        let data = codec.encode(PacketKind::Data, &events, &[9.0]).unwrap();
        assert_eq!(&data[4..8], &DATA_PACKET.to_le_bytes());
        let packet = codec.decode(&data).unwrap();
        assert_eq!(packet.kind, PacketKind::Data);
        assert_eq!(packet.events, events);
        assert!(packet.protons_on_target.is_empty());
    }

    #[test]
    fn test_multiple_pulses_and_q_records() {
        let codec = PacketCodec::new(RecordFormat::QTriple, DEFAULT_PULSE_OFFSET);
        let events = WireEvents::Q(vec![QEvent::new(-1.5, 0.25, 2.0)]);
        let data = codec.encode(PacketKind::Command, &events, &[1.0, 2.0, 4.0]).unwrap();
        let packet = codec.decode(&data).unwrap();
        assert_eq!(packet.protons_on_target, vec![1.0, 2.0, 4.0]);
        assert_eq!(packet.events, events);
        assert!(codec
            .encode(PacketKind::Data, &WireEvents::Raw(vec![]), &[])
            .is_err());
    }

    #[test]
    fn test_record_format_names() {
        assert_eq!("float".parse::<RecordFormat>().unwrap(), RecordFormat::FloatPair);
        assert_eq!("Integer-Pair".parse::<RecordFormat>().unwrap(), RecordFormat::IntegerPair);
        assert!("bogus".parse::<RecordFormat>().is_err());
    }
}
