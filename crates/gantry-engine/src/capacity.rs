//! Node capacity accounting
//!
//! Tracks how much memory, disk, and how many container slots remain on
//! this node. Reservation is all-or-nothing: either every dimension admits
//! the request or nothing changes.

use serde::{Deserialize, Serialize};

/// A point-in-time amount of node resources
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Capacity {
    pub memory_mb: u64,
    pub disk_mb: u64,
    pub containers: u64,
}

/// Remaining-vs-total bookkeeping. Not internally synchronized; lives
/// under the registry lock.
#[derive(Debug, Clone)]
pub struct CapacityTracker {
    total: Capacity,
    remaining: Capacity,
}

impl CapacityTracker {
    pub fn new(total: Capacity) -> Self {
        Self {
            total,
            remaining: total,
        }
    }

    pub fn total(&self) -> Capacity {
        self.total
    }

    pub fn remaining(&self) -> Capacity {
        self.remaining
    }

    /// Claim one container slot plus the given memory and disk.
    /// Returns false (and changes nothing) when any dimension falls short.
    pub fn reserve(&mut self, memory_mb: u64, disk_mb: u64) -> bool {
        if self.remaining.memory_mb < memory_mb
            || self.remaining.disk_mb < disk_mb
            || self.remaining.containers < 1
        {
            return false;
        }
        self.remaining.memory_mb -= memory_mb;
        self.remaining.disk_mb -= disk_mb;
        self.remaining.containers -= 1;
        true
    }

    /// Return a reservation. Clamps at the configured total.
    pub fn release(&mut self, memory_mb: u64, disk_mb: u64) {
        self.remaining.memory_mb = (self.remaining.memory_mb + memory_mb).min(self.total.memory_mb);
        self.remaining.disk_mb = (self.remaining.disk_mb + disk_mb).min(self.total.disk_mb);
        self.remaining.containers = (self.remaining.containers + 1).min(self.total.containers);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tracker() -> CapacityTracker {
        CapacityTracker::new(Capacity {
            memory_mb: 1024,
            disk_mb: 2048,
            containers: 2,
        })
    }

    #[test]
    fn reserve_claims_all_dimensions() {
        let mut tracker = tracker();
        assert!(tracker.reserve(512, 1024));
        assert_eq!(
            tracker.remaining(),
            Capacity {
                memory_mb: 512,
                disk_mb: 1024,
                containers: 1,
            }
        );
    }

    #[test]
    fn rejection_is_total() {
        let mut tracker = tracker();
        // Disk fits, memory does not: nothing changes
        assert!(!tracker.reserve(2048, 10));
        assert_eq!(tracker.remaining(), tracker.total());
    }

    #[test]
    fn container_slots_run_out() {
        let mut tracker = tracker();
        assert!(tracker.reserve(1, 1));
        assert!(tracker.reserve(1, 1));
        assert!(!tracker.reserve(1, 1));
    }

    #[test]
    fn release_restores_and_clamps() {
        let mut tracker = tracker();
        assert!(tracker.reserve(512, 1024));
        tracker.release(512, 1024);
        assert_eq!(tracker.remaining(), tracker.total());

        // Spurious releases never exceed the total
        tracker.release(512, 1024);
        assert_eq!(tracker.remaining(), tracker.total());
    }
}
