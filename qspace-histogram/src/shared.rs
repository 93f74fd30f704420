//! The histogram as shared mutable state.

use crate::histogram::Histogram3D;
use qspace_core::QEvent;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

/// A histogram behind one lock. Every mutation and every multi-cell read
/// goes through [`SharedHistogram::lock`].
#[derive(Clone, Debug)]
pub struct SharedHistogram {
    inner: Arc<Mutex<Histogram3D>>,
}

impl SharedHistogram {
    /// Wraps a histogram.
    #[must_use]
    pub fn new(histogram: Histogram3D) -> Self {
        Self {
            inner: Arc::new(Mutex::new(histogram)),
        }
    }

    /// Locks the histogram. A panic in another holder leaves the grid
    /// structurally valid, so poisoning is ignored.
    pub fn lock(&self) -> MutexGuard<'_, Histogram3D> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Adds events under the lock. Returns the weight added.
    pub fn add_events(&self, events: &[QEvent], use_weights: bool) -> f64 {
        self.lock().add_events(events, use_weights)
    }

    /// Largest bin value.
    #[must_use]
    pub fn max_value(&self) -> f32 {
        self.lock().max_value()
    }

    /// Zeroes the histogram.
    pub fn clear(&self) {
        self.lock().clear();
    }

    /// Copy of the current state.
    #[must_use]
    pub fn snapshot(&self) -> Histogram3D {
        self.lock().clone()
    }

    /// Swaps in a new histogram, returning the old one.
    pub fn replace(&self, histogram: Histogram3D) -> Histogram3D {
        std::mem::replace(&mut *self.lock(), histogram)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ProjectionBinner;
    use qspace_core::Vec3;

    fn small() -> Histogram3D {
        Histogram3D::new([
            ProjectionBinner::new(Vec3::X, -1.0, 1.0, 4).unwrap(),
            ProjectionBinner::new(Vec3::Y, -1.0, 1.0, 4).unwrap(),
            ProjectionBinner::new(Vec3::Z, -1.0, 1.0, 4).unwrap(),
        ])
        .unwrap()
    }

    #[test]
    fn test_concurrent_adds_are_serialized() {
        let shared = SharedHistogram::new(small());
        std::thread::scope(|scope| {
            for _ in 0..8 {
                let shared = shared.clone();
                scope.spawn(move || {
                    let events = vec![QEvent::new(0.1, 0.1, 0.1); 1000];
                    shared.add_events(&events, true);
                });
            }
        });
        let h = shared.lock();
        assert_eq!(h.num_added(), 8000);
        assert!((h.max_value() - 8000.0).abs() < f32::EPSILON);
    }

    #[test]
    fn test_poisoned_lock_recovers() {
        let shared = SharedHistogram::new(small());
        let clone = shared.clone();
        let _ = std::thread::spawn(move || {
            let _guard = clone.lock();
            panic!("worker failed");
        })
        .join();
        shared.add_events(&[QEvent::new(0.1, 0.1, 0.1)], true);
        assert_eq!(shared.lock().num_added(), 1);
    }

    #[test]
    fn test_replace_and_clear() {
        let shared = SharedHistogram::new(small());
        shared.add_events(&[QEvent::new(0.1, 0.1, 0.1)], true);
        let old = shared.replace(small());
        assert_eq!(old.num_added(), 1);
        assert_eq!(shared.snapshot().num_added(), 0);
        shared.add_events(&[QEvent::new(0.1, 0.1, 0.1)], true);
        shared.clear();
        assert!(shared.max_value().abs() < f32::EPSILON);
    }
}
