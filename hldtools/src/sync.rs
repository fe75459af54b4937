//! Sync-marker queue and local-to-global time conversion

use crate::{CoreError, GlobalTime, LocalTime};

/// One recognized synchronization pulse: the anchor pair tying a board's
/// local clock to the shared timeline.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct SyncMarker {
    /// Pulse identifier, unwrapped to a full sequence number
    pub id: u32,
    pub local_tm: LocalTime,
    pub global_tm: GlobalTime,
}

/// Whether a converted time was bracketed by ready markers or projected
/// past the known range
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TimeRef {
    Interpolated,
    Extrapolated,
}

/// Ordered queue of sync markers. A marker is *ready* once a later marker
/// brackets it; the tail marker is never ready, so conversion inside the
/// covered range always interpolates between a ready marker and its
/// successor.
#[derive(Debug)]
pub struct SyncQueue {
    items: Vec<SyncMarker>,
    capacity: usize,
}

impl SyncQueue {
    pub fn new(capacity: usize) -> Self {
        SyncQueue {
            items: Vec::new(),
            capacity,
        }
    }

    /// Append a marker in strict time order. Out-of-order markers are a
    /// protocol violation: downstream interpolation assumes monotonicity,
    /// so the queue rejects instead of silently reordering.
    pub fn add(&mut self, marker: SyncMarker) -> Result<(), CoreError> {
        if self.items.len() == self.capacity {
            return Err(CoreError::QueueFull {
                capacity: self.capacity,
            });
        }
        if let Some(last) = self.items.last() {
            if marker.local_tm <= last.local_tm {
                return Err(CoreError::SyncOutOfOrder {
                    prev: last.local_tm.as_secs(),
                    next: marker.local_tm.as_secs(),
                });
            }
        }
        self.items.push(marker);
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Markers safe to use as left interpolation anchors
    pub fn num_ready(&self) -> usize {
        self.items.len().saturating_sub(1)
    }

    pub fn get(&self, idx: usize) -> Option<&SyncMarker> {
        self.items.get(idx)
    }

    pub fn last(&self) -> Option<&SyncMarker> {
        self.items.last()
    }

    pub fn find_with_id(&self, id: u32) -> Option<usize> {
        self.items.iter().position(|m| m.id == id)
    }

    /// True when `local_tm` lies inside the bracketed range, i.e. conversion
    /// will interpolate rather than extrapolate
    pub fn covers(&self, local_tm: LocalTime) -> bool {
        match (self.items.first(), self.items.last()) {
            (Some(first), Some(last)) => {
                self.num_ready() > 0 && local_tm >= first.local_tm && local_tm <= last.local_tm
            }
            _ => false,
        }
    }

    /// Map a board-local time onto the shared timeline. Inside the covered
    /// range this interpolates linearly between the bracketing pair; before
    /// the first or past the last marker it projects from the nearest one
    /// and reports the lower confidence.
    pub fn local_to_global(&self, local_tm: LocalTime) -> Result<(GlobalTime, TimeRef), CoreError> {
        let first = match self.items.first() {
            Some(m) => m,
            None => return Err(CoreError::NotReady("sync markers")),
        };
        if local_tm < first.local_tm {
            let g = first.global_tm.offset(local_tm.as_secs() - first.local_tm.as_secs());
            return Ok((g, TimeRef::Extrapolated));
        }
        for pair in self.items.windows(2) {
            let (a, b) = (&pair[0], &pair[1]);
            if local_tm <= b.local_tm {
                let frac = (local_tm.as_secs() - a.local_tm.as_secs())
                    / (b.local_tm.as_secs() - a.local_tm.as_secs());
                let g = a.global_tm.offset(frac * b.global_tm.delta(a.global_tm));
                return Ok((g, TimeRef::Interpolated));
            }
        }
        match self.items.last() {
            Some(last) => {
                let g = last.global_tm.offset(local_tm.as_secs() - last.local_tm.as_secs());
                Ok((g, TimeRef::Extrapolated))
            }
            None => Err(CoreError::NotReady("sync markers")),
        }
    }

    /// Remove the marker at `idx`; used to drop a spurious pulse
    pub fn erase_at(&mut self, idx: usize) -> bool {
        if idx < self.items.len() {
            self.items.remove(idx);
            true
        } else {
            false
        }
    }

    /// Retire the oldest `n` markers once no buffer depends on them
    pub fn erase_first(&mut self, n: usize) {
        self.items.drain(..n.min(self.items.len()));
    }

    pub fn clear(&mut self) {
        self.items.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn marker(id: u32, local: f64, global: f64) -> SyncMarker {
        SyncMarker {
            id,
            local_tm: LocalTime::from_secs(local),
            global_tm: GlobalTime::from_secs(global),
        }
    }

    #[test]
    fn ready_watermark_trails_by_one() {
        let mut q = SyncQueue::new(16);
        assert_eq!(q.num_ready(), 0);
        let mut ready = 0;
        for (i, local) in [0.0, 100.0, 200.0].into_iter().enumerate() {
            q.add(marker(i as u32, local, 1000.0 + local)).unwrap();
            // Non-decreasing and strictly less than the total
            assert!(q.num_ready() >= ready);
            ready = q.num_ready();
            assert!(ready < q.len());
        }
        assert_eq!(q.num_ready(), 2);
    }

    #[test]
    fn out_of_order_marker_rejected() {
        let mut q = SyncQueue::new(16);
        q.add(marker(0, 10.0, 10.0)).unwrap();
        assert!(matches!(
            q.add(marker(1, 5.0, 11.0)),
            Err(CoreError::SyncOutOfOrder { .. })
        ));
        // Equal stamps violate strict ordering too
        assert!(matches!(
            q.add(marker(1, 10.0, 11.0)),
            Err(CoreError::SyncOutOfOrder { .. })
        ));
        assert_eq!(q.len(), 1);
    }

    #[test]
    fn interpolation_stays_between_anchors() {
        let mut q = SyncQueue::new(16);
        q.add(marker(0, 0.0, 1000.0)).unwrap();
        q.add(marker(1, 100.0, 1100.0)).unwrap();
        q.add(marker(2, 200.0, 1250.0)).unwrap();
        for local in [1.0, 50.0, 99.0, 101.0, 150.0, 199.0] {
            let (g, r) = q.local_to_global(LocalTime::from_secs(local)).unwrap();
            assert_eq!(r, TimeRef::Interpolated);
            let lo = if local < 100.0 { 1000.0 } else { 1100.0 };
            let hi = if local < 100.0 { 1100.0 } else { 1250.0 };
            assert!(g.as_secs() > lo && g.as_secs() < hi);
        }
        // The second segment runs 1.5x fast
        let (g, _) = q.local_to_global(LocalTime::from_secs(150.0)).unwrap();
        assert!((g.as_secs() - 1175.0).abs() < 1e-9);
    }

    #[test]
    fn out_of_range_extrapolates_from_nearest() {
        let mut q = SyncQueue::new(16);
        q.add(marker(0, 100.0, 1100.0)).unwrap();
        q.add(marker(1, 200.0, 1200.0)).unwrap();
        let (g, r) = q.local_to_global(LocalTime::from_secs(90.0)).unwrap();
        assert_eq!(r, TimeRef::Extrapolated);
        assert!((g.as_secs() - 1090.0).abs() < 1e-9);
        let (g, r) = q.local_to_global(LocalTime::from_secs(260.0)).unwrap();
        assert_eq!(r, TimeRef::Extrapolated);
        assert!((g.as_secs() - 1260.0).abs() < 1e-9);
    }

    #[test]
    fn conversion_without_markers_is_not_ready() {
        let q = SyncQueue::new(16);
        assert!(matches!(
            q.local_to_global(LocalTime::from_secs(1.0)),
            Err(CoreError::NotReady(_))
        ));
    }

    #[test]
    fn capacity_enforced_without_corruption() {
        let mut q = SyncQueue::new(2);
        q.add(marker(0, 0.0, 0.0)).unwrap();
        q.add(marker(1, 1.0, 1.0)).unwrap();
        assert!(matches!(
            q.add(marker(2, 2.0, 2.0)),
            Err(CoreError::QueueFull { capacity: 2 })
        ));
        assert_eq!(q.len(), 2);
        assert_eq!(q.get(1).unwrap().id, 1);
    }

    #[test]
    fn retirement() {
        let mut q = SyncQueue::new(8);
        for i in 0..4 {
            q.add(marker(i, i as f64, i as f64)).unwrap();
        }
        assert_eq!(q.find_with_id(2), Some(2));
        q.erase_first(2);
        assert_eq!(q.len(), 2);
        assert_eq!(q.find_with_id(2), Some(0));
        assert!(q.erase_at(1));
        assert!(!q.erase_at(5));
        assert_eq!(q.len(), 1);
    }
}
