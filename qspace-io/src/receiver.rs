//! Live event ingestion from UDP.
//!
//! A receive thread decodes packets into an [`EventBuffer`]; a flush
//! thread drains the buffer into a channel at a fixed interval. The buffer
//! is also drained as soon as it reaches capacity. While paused, packets
//! are discarded.

use crate::udp::{Packet, PacketCodec, RecordFormat, WireEvents, DEFAULT_PULSE_OFFSET};
use crate::Result;
use qspace_core::{QEvent, RawEventBatch};
use std::io::ErrorKind;
use std::net::{SocketAddr, UdpSocket};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::mpsc::{self, RecvTimeoutError, Sender};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::Duration;

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

const MAX_DATAGRAM: usize = 65_536;

/// Receiver settings.
#[derive(Clone, Debug, PartialEq)]
pub struct ReceiverConfig {
    /// Address to bind.
    pub bind_addr: SocketAddr,
    /// Event record layout.
    pub format: RecordFormat,
    /// Byte offset of the first pulse record in command packets.
    pub pulse_offset: usize,
    /// Interval between flushes.
    pub flush_interval: Duration,
    /// Buffered events that trigger an immediate flush.
    pub buffer_capacity: usize,
    /// Send the protons-on-target total downstream when it changes.
    pub broadcast_scale_factor: bool,
    /// Socket read timeout; bounds how long shutdown waits.
    pub read_timeout: Duration,
}

impl Default for ReceiverConfig {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from(([0, 0, 0, 0], 8002)),
            format: RecordFormat::default(),
            pulse_offset: DEFAULT_PULSE_OFFSET,
            flush_interval: Duration::from_secs(2),
            buffer_capacity: 1_000_000,
            broadcast_scale_factor: false,
            read_timeout: Duration::from_millis(100),
        }
    }
}

impl ReceiverConfig {
    /// Set the bind address.
    #[must_use]
    pub fn with_bind_addr(mut self, addr: SocketAddr) -> Self {
        self.bind_addr = addr;
        self
    }

    /// Set the record format.
    #[must_use]
    pub fn with_format(mut self, format: RecordFormat) -> Self {
        self.format = format;
        self
    }

    /// Set the pulse record offset.
    #[must_use]
    pub fn with_pulse_offset(mut self, offset: usize) -> Self {
        self.pulse_offset = offset;
        self
    }

    /// Set the flush interval.
    #[must_use]
    pub fn with_flush_interval(mut self, interval: Duration) -> Self {
        self.flush_interval = interval;
        self
    }

    /// Set the buffer capacity.
    #[must_use]
    pub fn with_buffer_capacity(mut self, capacity: usize) -> Self {
        self.buffer_capacity = capacity;
        self
    }

    /// Enable or disable scale factor updates.
    #[must_use]
    pub fn with_broadcast_scale_factor(mut self, enabled: bool) -> Self {
        self.broadcast_scale_factor = enabled;
        self
    }
}

/// What the receiver delivers downstream.
#[derive(Clone, Debug, PartialEq)]
pub enum ReceiverMessage {
    /// Raw events for the mapper.
    Raw(RawEventBatch),
    /// Events already in Q.
    Mapped(Vec<QEvent>),
    /// Running protons-on-target total.
    ScaleFactor {
        /// Protons on target summed since the receiver started.
        protons_on_target: f64,
    },
}

/// Receiver counters.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct ReceiverStats {
    /// Datagrams received.
    pub packets: usize,
    /// Datagrams that could not be decoded.
    pub malformed: usize,
    /// Datagrams discarded while paused.
    pub dropped_while_paused: usize,
    /// Events accepted.
    pub events: usize,
    /// Unusable records dropped from otherwise valid packets.
    pub dropped_records: usize,
}

/// Events and pulse totals accumulated between flushes.
#[derive(Debug, Default)]
pub struct EventBuffer {
    raw: RawEventBatch,
    mapped: Vec<QEvent>,
    capacity: usize,
    protons_on_target: f64,
    protons_changed: bool,
    broadcast: bool,
}

impl EventBuffer {
    /// Creates a buffer that reports full at `capacity` events.
    #[must_use]
    pub fn new(capacity: usize, broadcast_scale_factor: bool) -> Self {
        Self {
            capacity,
            broadcast: broadcast_scale_factor,
            ..Self::default()
        }
    }

    /// Buffered events.
    #[must_use]
    pub fn len(&self) -> usize {
        self.raw.len() + self.mapped.len()
    }

    /// True if no events are buffered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Protons on target summed so far.
    #[must_use]
    pub fn protons_on_target(&self) -> f64 {
        self.protons_on_target
    }

    /// Adds a packet. Returns true once the buffer is full.
    pub fn push(&mut self, packet: Packet) -> bool {
        if !packet.protons_on_target.is_empty() {
            self.protons_on_target += packet.protons_on_target.iter().sum::<f64>();
            self.protons_changed = true;
        }
        match packet.events {
            WireEvents::Raw(events) => events.into_iter().for_each(|e| self.raw.push(e)),
            WireEvents::Q(events) => self.mapped.extend(events),
        }
        self.len() >= self.capacity
    }

    /// Drains buffered events, plus a scale factor update if enabled and
    /// the total changed.
    pub fn take(&mut self) -> Vec<ReceiverMessage> {
        let mut messages = Vec::new();
        if !self.raw.is_empty() {
            messages.push(ReceiverMessage::Raw(std::mem::take(&mut self.raw)));
        }
        if !self.mapped.is_empty() {
            messages.push(ReceiverMessage::Mapped(std::mem::take(&mut self.mapped)));
        }
        if self.broadcast && self.protons_changed {
            messages.push(ReceiverMessage::ScaleFactor {
                protons_on_target: self.protons_on_target,
            });
        }
        self.protons_changed = false;
        messages
    }

    /// Discards buffered events. The protons-on-target total is kept.
    pub fn reset(&mut self) {
        self.raw.clear();
        self.mapped.clear();
    }
}

struct Shared {
    codec: PacketCodec,
    buffer: Mutex<EventBuffer>,
    stats: Mutex<ReceiverStats>,
    paused: AtomicBool,
    /// Bumped by every pause, under the buffer lock.
    pauses: AtomicU64,
    running: AtomicBool,
    sink: Sender<ReceiverMessage>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl Shared {
    fn handle(&self, datagram: &[u8]) {
        let pauses = self.pauses.load(Ordering::SeqCst);
        let decoded = (!self.paused.load(Ordering::SeqCst)).then(|| self.codec.decode(datagram));

        let mut buffer = lock(&self.buffer);
        let mut stats = lock(&self.stats);
        stats.packets += 1;
        // A pause since decoding has already reset the buffer.
        let current = !self.paused.load(Ordering::SeqCst) && self.pauses.load(Ordering::SeqCst) == pauses;
        let Some(decoded) = decoded.filter(|_| current) else {
            stats.dropped_while_paused += 1;
            return;
        };
        let packet = match decoded {
            Ok(packet) => packet,
            Err(e) => {
                stats.malformed += 1;
                log::debug!("Dropped {} byte datagram: {e}", datagram.len());
                return;
            }
        };
        stats.events += packet.events.len();
        stats.dropped_records += packet.dropped_records;
        drop(stats);
        if buffer.push(packet) {
            self.send(buffer.take());
        }
    }

    fn flush(&self) {
        let mut buffer = lock(&self.buffer);
        self.send(buffer.take());
    }

    fn send(&self, messages: Vec<ReceiverMessage>) {
        for message in messages {
            if self.sink.send(message).is_err() {
                log::debug!("Event sink closed; discarding flushed events");
                break;
            }
        }
    }
}

/// A running UDP event receiver.
pub struct UdpEventReceiver {
    local_addr: SocketAddr,
    shared: Arc<Shared>,
    stop: Option<Sender<()>>,
    threads: Vec<JoinHandle<()>>,
}

impl UdpEventReceiver {
    /// Binds the socket and starts the receive and flush threads.
    ///
    /// # Errors
    /// Returns an error if the socket cannot be bound or a thread cannot
    /// be started.
    pub fn start(config: &ReceiverConfig, sink: Sender<ReceiverMessage>) -> Result<Self> {
        let socket = UdpSocket::bind(config.bind_addr)?;
        socket.set_read_timeout(Some(config.read_timeout))?;
        let local_addr = socket.local_addr()?;
        let shared = Arc::new(Shared {
            codec: PacketCodec::new(config.format, config.pulse_offset),
            buffer: Mutex::new(EventBuffer::new(config.buffer_capacity, config.broadcast_scale_factor)),
            stats: Mutex::new(ReceiverStats::default()),
            paused: AtomicBool::new(false),
            pauses: AtomicU64::new(0),
            running: AtomicBool::new(true),
            sink,
        });

        let recv_shared = Arc::clone(&shared);
        let retry_delay = config.read_timeout;
        let receiver = thread::Builder::new()
            .name("qspace-udp-recv".to_string())
            .spawn(move || receive_loop(&socket, &recv_shared, retry_delay))?;

        let (stop_tx, stop_rx) = mpsc::channel::<()>();
        let flush_shared = Arc::clone(&shared);
        let interval = config.flush_interval;
        let flusher = thread::Builder::new()
            .name("qspace-udp-flush".to_string())
            .spawn(move || loop {
                match stop_rx.recv_timeout(interval) {
                    Err(RecvTimeoutError::Timeout) => flush_shared.flush(),
                    Ok(()) | Err(RecvTimeoutError::Disconnected) => {
                        flush_shared.flush();
                        break;
                    }
                }
            })?;

        log::info!("Listening for events on {local_addr}");
        Ok(Self {
            local_addr,
            shared,
            stop: Some(stop_tx),
            threads: vec![receiver, flusher],
        })
    }

    /// Address the socket is bound to.
    #[must_use]
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Stops accepting events and discards the buffer.
    pub fn pause(&self) {
        let mut buffer = lock(&self.shared.buffer);
        self.shared.paused.store(true, Ordering::SeqCst);
        self.shared.pauses.fetch_add(1, Ordering::SeqCst);
        buffer.reset();
        drop(buffer);
        log::info!("Event receiver paused");
    }

    /// Accepts events again.
    pub fn resume(&self) {
        self.shared.paused.store(false, Ordering::SeqCst);
        log::info!("Event receiver resumed");
    }

    /// True while paused.
    #[must_use]
    pub fn is_paused(&self) -> bool {
        self.shared.paused.load(Ordering::SeqCst)
    }

    /// Current counters.
    #[must_use]
    pub fn stats(&self) -> ReceiverStats {
        *lock(&self.shared.stats)
    }

    /// Protons on target summed so far.
    #[must_use]
    pub fn protons_on_target(&self) -> f64 {
        lock(&self.shared.buffer).protons_on_target()
    }

    /// Stops both threads after a final flush.
    pub fn stop(mut self) {
        self.shutdown();
    }

    fn shutdown(&mut self) {
        self.shared.running.store(false, Ordering::SeqCst);
        self.stop.take();
        for handle in self.threads.drain(..) {
            if handle.join().is_err() {
                log::error!("Event receiver thread panicked");
            }
        }
    }
}

impl Drop for UdpEventReceiver {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn receive_loop(socket: &UdpSocket, shared: &Shared, retry_delay: Duration) {
    let mut buf = vec![0u8; MAX_DATAGRAM];
    while shared.running.load(Ordering::SeqCst) {
        match socket.recv_from(&mut buf) {
            Ok((n, _)) => shared.handle(&buf[..n]),
            Err(e) if matches!(e.kind(), ErrorKind::WouldBlock | ErrorKind::TimedOut) => {}
            Err(e) => {
                log::warn!("UDP receive failed: {e}");
                thread::sleep(retry_delay);
            }
        }
    }
}
