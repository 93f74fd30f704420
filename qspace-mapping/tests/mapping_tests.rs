#![allow(
    clippy::cast_possible_truncation,
    clippy::cast_sign_loss,
    clippy::cast_precision_loss
)]
use qspace_core::{Mat3, RawEvent, RawEventBatch};
use qspace_mapping::{
    Centering, DetectorCoverage, InstrumentConfig, OrientationIndexer, PixelMask, QMapper,
};

const INSTRUMENT: &str = r#"{
    "instrument": {
        "name": "test-scd",
        "flight_path": { "l1_m": 10.0, "t0_us": 0.0, "tof_tick_us": 0.1 },
        "panels": [
            { "id": 1, "first_pixel_id": 0, "n_rows": 128, "n_cols": 128,
              "width_m": 0.3, "height_m": 0.3, "center": [0.0, 0.5, 0.0] },
            { "id": 2, "first_pixel_id": 65536, "n_rows": 128, "n_cols": 128,
              "width_m": 0.3, "height_m": 0.3, "center": [-0.35, -0.35, 0.0],
              "x_dir": [0.7071, -0.7071, 0.0], "y_dir": [0.0, 0.0, 1.0] }
        ]
    }
}"#;

fn rotated_cubic(a: f64) -> Mat3 {
    let (s, c) = 0.3f64.sin_cos();
    let u = Mat3::from_rows([[c, -s, 0.0], [s, c, 0.0], [0.0, 0.0, 1.0]]);
    u * Mat3::IDENTITY.scaled(std::f64::consts::TAU / a)
}

#[test]
fn test_predicted_peaks_map_back_to_their_indices() {
    let config = InstrumentConfig::from_json(INSTRUMENT).unwrap();
    let mapper = QMapper::new(&config).unwrap();
    let mut indexer = OrientationIndexer::new();
    indexer.set_matrix(rotated_cubic(8.0)).unwrap();

    let predicted = indexer
        .predicted_peaks(1.0, 5.0, Centering::P, &mapper)
        .unwrap();
    assert!(!predicted.is_empty(), "no reflections hit the panels");

    let tick = config.flight_path.tof_tick_us;
    let mut events = Vec::new();
    for peak in &predicted {
        let inv = mapper.inverse(peak.position()).expect("covered peak must invert");
        let ticks = (inv.tof_us / tick).round() as u32;
        events.push(RawEvent::new(ticks, inv.hit.location.pixel_id));
    }

    let mapped = mapper.map(&events);
    assert_eq!(mapped.events.len(), predicted.len());

    let mut found: Vec<_> = mapped
        .events
        .iter()
        .map(|e| qspace_core::Peak::new(e.q(), 1.0))
        .collect();
    let n = indexer.index_peaks(&mut found, 0.2).unwrap();
    assert_eq!(n, predicted.len());
    for (f, p) in found.iter().zip(&predicted) {
        assert_eq!(f.hkl, p.hkl);
    }
}

#[test]
fn test_masked_detector_removes_coverage() {
    let config = InstrumentConfig::from_json(INSTRUMENT).unwrap();
    let mapper = QMapper::new(&config).unwrap();
    let mut indexer = OrientationIndexer::new();
    indexer.set_matrix(rotated_cubic(8.0)).unwrap();
    let all = indexer
        .predicted_peaks(1.0, 5.0, Centering::P, &mapper)
        .unwrap();

    let masked = QMapper::new(&config)
        .unwrap()
        .with_pixel_mask(PixelMask::new().with_detector(1));
    let some = indexer
        .predicted_peaks(1.0, 5.0, Centering::P, &masked)
        .unwrap();
    assert!(some.len() <= all.len());
    for peak in &some {
        let inv = masked.inverse(peak.position()).unwrap();
        assert_eq!(inv.hit.location.detector_id, 2);
        assert!(masked.covers(peak.position()));
    }
}

#[test]
fn test_parallel_mapping_of_large_batch() {
    let config = InstrumentConfig::from_json(INSTRUMENT).unwrap();
    let mapper = QMapper::new(&config).unwrap();
    let batch: RawEventBatch = (0..100_000u32)
        .map(|i| RawEvent::new(20_000 + (i * 7) % 100_000, (i * 13) % (2 * 65536)))
        .collect();
    let out = mapper.map_batch(&batch, 8192);
    // Ids 16384..65535 and above 81919 have no pixel.
    assert_eq!(out.stats.total(), batch.len());
    assert_eq!(out.stats.mapped + out.stats.unmatched, batch.len());
    assert!(out.stats.mapped > 0);
    for e in &out.events {
        assert!(e.x < 0.0);
        assert!(e.q().is_finite());
        assert!((e.weight - 1.0).abs() < f64::EPSILON);
    }
}
