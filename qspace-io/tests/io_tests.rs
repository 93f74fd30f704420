//! End-to-end tests: event files and UDP packets through the session.
#![allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]

use qspace_core::{RawEvent, Vec3};
use qspace_histogram::{HistogramConfig, HistogramLayout, IntegrationConfig, PeakSearchConfig};
use qspace_io::{
    Command, EventFileWriter, PacketCodec, PacketKind, ReceiverConfig, ReceiverMessage, Reply,
    Session, UdpEventReceiver, WireEvents, WorkerPoolConfig,
};
use qspace_mapping::{DetectorPanel, FlightPath, InstrumentConfig, PanelGeometry};
use std::net::UdpSocket;
use std::sync::mpsc;
use std::thread;
use std::time::{Duration, Instant};

const CENTER_PIXEL: u32 = 32 * 64 + 32;
const UNKNOWN_PIXEL: u32 = 999_999;
// 2 Å neutrons over 15.5 m.
const TOF_TICKS: u32 = 78_360;

fn instrument() -> InstrumentConfig {
    let panel = DetectorPanel::new(
        1,
        0,
        64,
        64,
        0.3,
        0.3,
        Vec3::new(0.0, 0.5, 0.0),
        Vec3::X,
        Vec3::Z,
    )
    .unwrap();
    InstrumentConfig::new(
        "test",
        FlightPath {
            l1_m: 15.0,
            t0_us: 0.0,
            tof_tick_us: 0.1,
        },
        PanelGeometry::new(vec![panel]).unwrap(),
    )
    .unwrap()
}

fn session() -> Session {
    Session::new(
        WorkerPoolConfig::default().with_max_segment_size(64),
        HistogramConfig::default(),
        IntegrationConfig::default(),
    )
    .unwrap()
}

#[test]
fn test_file_to_peaks() {
    let mut events = vec![RawEvent::new(TOF_TICKS, CENTER_PIXEL); 200];
    events.extend(vec![RawEvent::new(TOF_TICKS, UNKNOWN_PIXEL); 20]);
    let file = tempfile::NamedTempFile::new().unwrap();
    let mut writer = EventFileWriter::create(file.path()).unwrap();
    writer.write_events(&events).unwrap();
    writer.flush().unwrap();

    let mut session = session();
    let window = session
        .execute(Command::LoadEvents {
            path: file.path().to_path_buf(),
            first: 10,
            count: 5,
            threads: None,
        })
        .unwrap();
    assert_eq!(
        window.reply,
        Reply::EventsLoaded {
            count: 5,
            file_events: 220,
            segments: 1
        }
    );
    session
        .execute(Command::LoadEvents {
            path: file.path().to_path_buf(),
            first: 0,
            count: usize::MAX,
            threads: Some(2),
        })
        .unwrap();
    assert_eq!(session.loaded_events().len(), 220);

    session
        .execute(Command::InitInstrument(Box::new(instrument())))
        .unwrap();
    session
        .execute(Command::InitHistogram(HistogramLayout::Cartesian {
            max_q: 6.0,
            bins: 60,
        }))
        .unwrap();

    let mapped = session.execute(Command::MapAndAddEvents(None)).unwrap();
    let Reply::EventsMapped {
        stats,
        added,
        failure,
    } = mapped.reply
    else {
        panic!("unexpected reply: {:?}", mapped.reply);
    };
    assert_eq!(stats.mapped, 200);
    assert_eq!(stats.unmatched, 20);
    assert!(failure.is_none());
    assert!((added - 200.0).abs() < 1e-9);
    assert_eq!(session.histogram().unwrap().lock().num_added(), 200);

    let expected = session
        .mapper()
        .unwrap()
        .map_event(RawEvent::new(TOF_TICKS, CENTER_PIXEL))
        .unwrap()
        .q();
    assert!((expected.length() - 4.44).abs() < 0.05);

    let found = session
        .execute(Command::FindPeaks(PeakSearchConfig::default()))
        .unwrap();
    let Reply::Peaks(peaks) = found.reply else {
        panic!("unexpected reply");
    };
    assert_eq!(peaks.len(), 1);
    assert!((peaks[0].intensity - 200.0).abs() < 1e-9);
    // Within one bin diagonal of the mapped position.
    assert!(peaks[0].position().distance(&expected) < 0.3);

    let point = session.execute(Command::SelectPoint(expected)).unwrap();
    let Reply::Point { info, value, .. } = point.reply else {
        panic!("unexpected reply");
    };
    assert_eq!(value, Some(200.0));
    let hit = info.detector.expect("point should hit the panel");
    assert_eq!(hit.hit.location.detector_id, 1);
    assert!((hit.tof_us - f64::from(TOF_TICKS) * 0.1).abs() < 1.0);
}

#[test]
fn test_file_load_uses_segment_size() {
    let events: Vec<RawEvent> = (0..300).map(|i| RawEvent::new(1000 + i, i % 64)).collect();
    let file = tempfile::NamedTempFile::new().unwrap();
    let mut writer = EventFileWriter::create(file.path()).unwrap();
    writer.write_events(&events).unwrap();
    writer.flush().unwrap();

    let mut session = session();
    let outcome = session
        .execute(Command::LoadEvents {
            path: file.path().to_path_buf(),
            first: 20,
            count: 200,
            threads: Some(3),
        })
        .unwrap();
    assert_eq!(
        outcome.reply,
        Reply::EventsLoaded {
            count: 200,
            file_events: 300,
            segments: 4
        }
    );
    assert!(outcome.status.contains("4 segments"));
    let loaded: Vec<RawEvent> = session.loaded_events().iter().collect();
    assert_eq!(loaded, events[20..220]);
}

#[test]
fn test_failed_load_keeps_pool_and_events() {
    let events = vec![RawEvent::new(TOF_TICKS, CENTER_PIXEL); 8];
    let file = tempfile::NamedTempFile::new().unwrap();
    let mut writer = EventFileWriter::create(file.path()).unwrap();
    writer.write_events(&events).unwrap();
    writer.flush().unwrap();

    let mut session = session();
    session
        .execute(Command::LoadEvents {
            path: file.path().to_path_buf(),
            first: 0,
            count: 8,
            threads: Some(2),
        })
        .unwrap();
    let err = session
        .execute(Command::LoadEvents {
            path: file.path().with_extension("missing"),
            first: 0,
            count: 8,
            threads: Some(5),
        })
        .unwrap_err();
    assert_eq!(err.command, "LoadEvents");
    assert_eq!(session.pool().config().workers, 2);
    assert_eq!(session.loaded_events().len(), 8);
}

fn recv_raw(rx: &mpsc::Receiver<ReceiverMessage>) -> Option<Vec<RawEvent>> {
    let deadline = Instant::now() + Duration::from_secs(3);
    while let Some(left) = deadline.checked_duration_since(Instant::now()) {
        match rx.recv_timeout(left) {
            Ok(ReceiverMessage::Raw(batch)) => return Some(batch.iter().collect()),
            Ok(_) => {}
            Err(_) => return None,
        }
    }
    None
}

fn wait_for_packets(receiver: &UdpEventReceiver, packets: usize) {
    let deadline = Instant::now() + Duration::from_secs(3);
    while receiver.stats().packets < packets && Instant::now() < deadline {
        thread::sleep(Duration::from_millis(10));
    }
}

#[test]
fn test_udp_pause_resume() {
    let (tx, rx) = mpsc::channel();
    let config = ReceiverConfig::default()
        .with_bind_addr("127.0.0.1:0".parse().unwrap())
        .with_flush_interval(Duration::from_millis(50))
        .with_broadcast_scale_factor(true);
    let receiver = UdpEventReceiver::start(&config, tx).unwrap();
    let sender = UdpSocket::bind("127.0.0.1:0").unwrap();

    let codec = PacketCodec::default();
    let events = vec![RawEvent::new(5000, 12), RawEvent::new(6000, 13)];
    let packet = codec
        .encode(PacketKind::Command, &WireEvents::Raw(events.clone()), &[1.0e12])
        .unwrap();

    sender.send_to(&packet, receiver.local_addr()).unwrap();
    assert_eq!(recv_raw(&rx), Some(events.clone()));

    receiver.pause();
    assert!(receiver.is_paused());
    sender.send_to(&packet, receiver.local_addr()).unwrap();
    wait_for_packets(&receiver, 2);
    thread::sleep(Duration::from_millis(150));
    assert!(rx
        .try_iter()
        .all(|m| !matches!(m, ReceiverMessage::Raw(_))));
    assert_eq!(receiver.stats().dropped_while_paused, 1);

    receiver.resume();
    sender.send_to(&packet, receiver.local_addr()).unwrap();
    assert_eq!(recv_raw(&rx), Some(events));

    let stats = receiver.stats();
    assert_eq!(stats.packets, 3);
    assert_eq!(stats.events, 4);
    assert_eq!(stats.malformed, 0);
    assert!((receiver.protons_on_target() - 2.0e12).abs() < 1.0);
    receiver.stop();
}

#[test]
fn test_udp_malformed_packets_counted() {
    let (tx, _rx) = mpsc::channel();
    let config = ReceiverConfig::default()
        .with_bind_addr("127.0.0.1:0".parse().unwrap())
        .with_flush_interval(Duration::from_millis(50));
    let receiver = UdpEventReceiver::start(&config, tx).unwrap();
    let sender = UdpSocket::bind("127.0.0.1:0").unwrap();
    sender.send_to(&[1, 2, 3], receiver.local_addr()).unwrap();
    wait_for_packets(&receiver, 1);
    assert_eq!(receiver.stats().malformed, 1);
}

#[test]
fn test_udp_pause_discards_unflushed_events() {
    let (tx, rx) = mpsc::channel();
    let config = ReceiverConfig::default()
        .with_bind_addr("127.0.0.1:0".parse().unwrap())
        .with_flush_interval(Duration::from_secs(30))
        .with_buffer_capacity(1_000_000);
    let receiver = UdpEventReceiver::start(&config, tx).unwrap();
    let sender = UdpSocket::bind("127.0.0.1:0").unwrap();
    let codec = PacketCodec::default();

    let stale = vec![RawEvent::new(1000, 1), RawEvent::new(1100, 2), RawEvent::new(1200, 3)];
    let packet = codec.encode(PacketKind::Data, &WireEvents::Raw(stale), &[]).unwrap();
    sender.send_to(&packet, receiver.local_addr()).unwrap();
    wait_for_packets(&receiver, 1);
    assert_eq!(receiver.stats().events, 3);

    receiver.pause();
    receiver.resume();

    let fresh = vec![RawEvent::new(7000, 40)];
    let packet = codec
        .encode(PacketKind::Data, &WireEvents::Raw(fresh.clone()), &[])
        .unwrap();
    sender.send_to(&packet, receiver.local_addr()).unwrap();
    wait_for_packets(&receiver, 2);
    receiver.stop();

    let delivered: Vec<RawEvent> = rx
        .try_iter()
        .filter_map(|m| match m {
            ReceiverMessage::Raw(batch) => Some(batch.iter().collect::<Vec<_>>()),
            _ => None,
        })
        .flatten()
        .collect();
    assert_eq!(delivered, fresh);
}
