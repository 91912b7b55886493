//! Allocator statistics

use crate::AreaList;
use core::sync::atomic::{AtomicU64, Ordering};

/// Snapshot of the allocator's state and lifetime counters.
#[derive(Debug, Default, Copy, Clone, Eq, PartialEq)]
pub struct VmallocStats {
    /// Live areas.
    pub areas: usize,
    /// Bytes reserved by live areas, guard pages included.
    pub reserved_bytes: u64,
    /// Pages owned by live areas.
    pub owned_pages: usize,
    /// Successful reservations since start.
    pub reservations: u64,
    /// Releases since start.
    pub releases: u64,
    /// Mapping requests that failed and were unwound.
    pub failed_maps: u64,
    /// Consistency violations seen by page-table walks.
    pub consistency_violations: u64,
}

impl VmallocStats {
    /// Bytes of the live areas that can be mapped (guard pages excluded).
    #[must_use]
    pub const fn usable_bytes(&self) -> u64 {
        self.reserved_bytes - self.areas as u64 * kernel_pgtable::PAGE_SIZE
    }
}

/// Lifetime counters, updated without the list lock.
pub(crate) struct Counters {
    reservations: AtomicU64,
    releases: AtomicU64,
    failed_maps: AtomicU64,
    violations: AtomicU64,
}

impl Counters {
    pub(crate) const fn new() -> Self {
        Self {
            reservations: AtomicU64::new(0),
            releases: AtomicU64::new(0),
            failed_maps: AtomicU64::new(0),
            violations: AtomicU64::new(0),
        }
    }

    pub(crate) fn reserved(&self) {
        self.reservations.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn released(&self) {
        self.releases.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn map_failed(&self) {
        self.failed_maps.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn violations(&self, n: usize) {
        if n != 0 {
            self.violations.fetch_add(n as u64, Ordering::Relaxed);
        }
    }

    pub(crate) fn snapshot(&self, list: &AreaList) -> VmallocStats {
        let areas = list.snapshot();
        VmallocStats {
            areas: areas.len(),
            reserved_bytes: areas.iter().map(|a| a.size).sum(),
            owned_pages: areas.iter().map(|a| a.page_count).sum(),
            reservations: self.reservations.load(Ordering::Relaxed),
            releases: self.releases.load(Ordering::Relaxed),
            failed_maps: self.failed_maps.load(Ordering::Relaxed),
            consistency_violations: self.violations.load(Ordering::Relaxed),
        }
    }
}
