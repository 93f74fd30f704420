//! qspace-io: event sources and the command session.
//!
//! Event files are memory-mapped via memmap2; live events arrive over UDP.
//! Raw events are mapped to Q on a shared worker pool and binned into the
//! session's histogram.
//!
//! # Key Components
//!
//! - [`EventFileReader`] - Windowed, segmented reads of `(tof, pixel_id)` files
//! - [`WorkerPool`] - Fixed-size pool running batches with partial results
//! - [`PacketCodec`] / [`UdpEventReceiver`] - Wire format and live ingestion
//! - [`Session`] - Typed command dispatch over mapper, histogram and orientation

mod error;
pub mod pipeline;
pub mod pool;
mod reader;
pub mod receiver;
pub mod session;
pub mod udp;
mod writer;

pub use error::{Error, Result};
pub use pipeline::{map_on_pool, MappedBatch};
pub use pool::{BatchOutcome, BatchStatus, WorkerPool, WorkerPoolConfig};
pub use reader::{EventFileReader, MappedFileReader, EVENT_RECORD_BYTES};
pub use receiver::{EventBuffer, ReceiverConfig, ReceiverMessage, ReceiverStats, UdpEventReceiver};
pub use session::{Command, CommandError, CommandOutcome, Reply, Session};
pub use udp::{Packet, PacketCodec, PacketKind, RecordFormat, WireEvents};
pub use writer::EventFileWriter;
