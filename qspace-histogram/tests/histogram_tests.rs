#![allow(clippy::cast_precision_loss, clippy::cast_possible_truncation)]
use approx::assert_relative_eq;
use qspace_core::{QEvent, Vec3};
use qspace_histogram::{
    GridShape, Histogram3D, MemoryBudget, PeakFinder, PeakSearchConfig, ProjectionBinner,
};

/// Deterministic uniform values in `[lo, hi)`.
struct Lcg(u64);

impl Lcg {
    fn next_in(&mut self, lo: f64, hi: f64) -> f64 {
        self.0 = self
            .0
            .wrapping_mul(6_364_136_223_846_793_005)
            .wrapping_add(1_442_695_040_888_963_407);
        let unit = (self.0 >> 11) as f64 / (1u64 << 53) as f64;
        lo + unit * (hi - lo)
    }
}

fn cube(min: f64, max: f64, bins: usize) -> Histogram3D {
    Histogram3D::new([
        ProjectionBinner::new(Vec3::X, min, max, bins).unwrap(),
        ProjectionBinner::new(Vec3::Y, min, max, bins).unwrap(),
        ProjectionBinner::new(Vec3::Z, min, max, bins).unwrap(),
    ])
    .unwrap()
}

#[test]
fn test_weight_conservation() {
    let mut h = cube(-10.0, 10.0, 40);
    let mut rng = Lcg(7);
    let events: Vec<QEvent> = (0..20_000)
        .map(|_| {
            QEvent::weighted(
                rng.next_in(-10.0, 10.0),
                rng.next_in(-10.0, 10.0),
                rng.next_in(-10.0, 10.0),
                rng.next_in(0.5, 2.0),
            )
        })
        .collect();
    let expected: f64 = events.iter().map(|e| e.weight).sum();
    let added = h.add_events(&events, true);
    assert_relative_eq!(added, expected, max_relative = 1e-12);
    assert_relative_eq!(h.total(), expected, max_relative = 1e-12);
    assert_eq!(h.num_added(), 20_000);
    let grid_sum: f64 = h.grid().iter().map(|&v| f64::from(v)).sum();
    assert_relative_eq!(grid_sum, expected, max_relative = 1e-5);
}

#[test]
fn test_out_of_range_events_are_discarded() {
    let mut h = cube(-1.0, 1.0, 8);
    h.add_events(&[QEvent::new(0.0, 0.0, 0.0)], true);
    let before = h.grid().to_owned();
    let added = h.add_events(
        &[
            QEvent::new(1.0, 0.0, 0.0),
            QEvent::new(0.0, -1.01, 0.0),
            QEvent::new(0.0, 0.0, 5.0),
            QEvent::new(f64::NAN, 0.0, 0.0),
        ],
        true,
    );
    assert_relative_eq!(added, 0.0);
    assert_relative_eq!(h.total(), 1.0);
    assert_eq!(h.num_added(), 1);
    assert_eq!(h.grid(), before.view());
}

#[test]
fn test_degradation_terminates() {
    let bins = 1 << 20;
    let edges = [
        ProjectionBinner::new(Vec3::X, -1.0, 1.0, bins).unwrap(),
        ProjectionBinner::new(Vec3::Y, -1.0, 1.0, bins).unwrap(),
        ProjectionBinner::new(Vec3::Z, -1.0, 1.0, bins).unwrap(),
    ];
    let budget = MemoryBudget::default().with_memory_budget_bytes(1 << 20);
    let mut retries = Vec::new();
    let h = Histogram3D::with_budget(edges, &budget, &mut |r| retries.push(r.failed)).unwrap();
    assert_eq!(h.shape(), GridShape::new(64, 64, 64));
    assert_eq!(retries.len(), 14);
    assert_eq!(retries[0], GridShape::new(bins, bins, bins));
    assert_eq!(h.edges()[0].num_bins(), 64);
    assert_relative_eq!(h.edges()[0].binner().max(), 1.0);
}

#[test]
fn test_sphere_integrals_are_monotonic() {
    let mut h = cube(-5.0, 5.0, 30);
    let mut rng = Lcg(11);
    let events: Vec<QEvent> = (0..50_000)
        .map(|_| QEvent::new(rng.next_in(-2.0, 2.0), rng.next_in(-2.0, 2.0), rng.next_in(-2.0, 2.0)))
        .collect();
    h.add_events(&events, true);
    let radii = [0.2, 0.5, 0.9, 1.4, 2.0, 3.0];
    let s = h.sphere_integrals(Vec3::new(0.1, -0.2, 0.3), &radii).unwrap().unwrap();
    for w in s.sums.windows(2) {
        assert!(w[0] <= w[1], "sums not monotonic: {:?}", s.sums);
    }
    for w in s.volumes.windows(2) {
        assert!(w[0] <= w[1], "volumes not monotonic: {:?}", s.volumes);
    }
    // Volumes approach 4/3 π r³ once many bins are covered.
    let sphere = 4.0 / 3.0 * std::f64::consts::PI * 27.0;
    assert_relative_eq!(s.volumes[5], sphere, max_relative = 0.05);
}

#[test]
fn test_single_bin_at_origin() {
    let mut h = cube(-5.5, 5.5, 11);
    h.add_events(&[QEvent::weighted(0.0, 0.0, 0.0, 7.0)], true);
    let s = h.sphere_integrals(Vec3::zero(), &[0.5, 1.5, 2.5]).unwrap().unwrap();
    for sum in &s.sums {
        assert_relative_eq!(*sum, 7.0);
    }
    assert_eq!(s.bin_counts, vec![1, 19, 81]);
    assert!(s.volumes[0] < s.volumes[1]);
    assert!(s.volumes[1] < s.volumes[2]);
}

#[test]
fn test_sphere_excludes_bins_on_its_surface() {
    let mut h = cube(-5.5, 5.5, 11);
    h.add_events(
        &[
            QEvent::weighted(0.0, 0.0, 0.0, 1.0),
            QEvent::weighted(1.0, 0.0, 0.0, 10.0),
        ],
        true,
    );
    let on_surface = h.sphere_integrals(Vec3::zero(), &[1.0]).unwrap().unwrap();
    assert_eq!(on_surface.bin_counts[0], 1);
    assert_relative_eq!(on_surface.sums[0], 1.0);

    let past_surface = h.sphere_integrals(Vec3::zero(), &[1.0 + 1e-9]).unwrap().unwrap();
    assert_eq!(past_surface.bin_counts[0], 7);
    assert_relative_eq!(past_surface.sums[0], 11.0);
}

#[test]
fn test_peak_finder_prefers_larger_peak() {
    let mut h = cube(-1.0, 1.0, 20);
    h.add_events(
        &[
            QEvent::weighted(-0.55, 0.45, 0.05, 50.0),
            QEvent::weighted(0.45, -0.35, -0.55, 100.0),
        ],
        true,
    );
    let finder = PeakFinder::new(PeakSearchConfig::default().with_max_peaks(1));
    for _ in 0..5 {
        let result = finder.find_peaks(&h);
        assert_eq!(result.peaks.len(), 1);
        let peak = result.peaks[0];
        assert_relative_eq!(peak.intensity, 100.0);
        assert_eq!(h.bin_index(peak.position()), h.bin_index(Vec3::new(0.45, -0.35, -0.55)));
    }
}

#[test]
fn test_end_to_end_thousand_events() {
    let mut h = cube(-1.0, 1.0, 10);
    let mut rng = Lcg(3);
    let events: Vec<QEvent> = (0..1000)
        .map(|_| QEvent::new(rng.next_in(-1.0, 1.0), rng.next_in(-1.0, 1.0), rng.next_in(-1.0, 1.0)))
        .collect();
    h.add_events(&events, false);
    assert_eq!(h.num_added(), 1000);
    assert_relative_eq!(h.total(), 1000.0);
    let stats = h.scan();
    assert_relative_eq!(stats.total, 1000.0);
    assert!(stats.max >= 1.0);
    for e in &events {
        let [col, row, page] = h.bin_index(e.q()).unwrap();
        assert!(col < 10 && row < 10 && page < 10);
    }
    let pages: f32 = (0..10).map(|p| h.page_slice(p).unwrap().sum()).sum();
    assert_relative_eq!(pages, 1000.0);
}
