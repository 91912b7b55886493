//! # Populate / depopulate
//!
//! Binds or unbinds one physical page per virtual page across a byte range,
//! walking top → middle → leaf in fixed strides:
//!
//! ```text
//! [start ............................................ end)
//!  ├── top_end ──────────────┤├── top_end ───────────┤
//!  ├ middle_end ┤├ middle_end ┤ ...
//!  │4K│4K│4K│...                      one leaf slot per page
//! ```
//!
//! - [`populate`] creates missing middle/leaf tables and binds pages taken
//!   in order from a page source. It does **not** roll back on failure; the
//!   caller tears the partial range down with [`depopulate`].
//! - [`depopulate`] clears every leaf slot in the range, skipping spans whose
//!   tables were never created, and hands back the pages that were bound.
//!   It flushes caches before and the TLB once after the whole range.
//! - [`translate`] looks a single address up without modifying anything.
//!
//! Both mutating walks report consistency violations through the returned
//! [`WalkReport`] and the [`CONSISTENCY_TARGET`](crate::CONSISTENCY_TARGET)
//! log channel instead of failing.
//!
//! The walk holds no lock of its own. Table allocation is serialized inside
//! the backend, and the page source is consulted between slot updates, so
//! walks over disjoint ranges interleave freely.

use crate::{
    CONSISTENCY_TARGET, Directory, LeafTable, PAGE_SIZE, PageTableBackend, PageTableError,
    PagingLayout, PhysicalPage, Protection, VirtualAddress,
};
use alloc::vec::Vec;

/// What kind of inconsistency the walk ran into.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum ViolationKind {
    /// `populate` found a leaf already bound to `existing`; the new binding
    /// replaced it.
    AlreadyPopulated { existing: PhysicalPage },
    /// A leaf slot held bits but was not present ("swapped out" kernel page).
    NotPresent { raw: u64 },
}

/// One logged consistency violation.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct ConsistencyViolation {
    pub addr: VirtualAddress,
    pub kind: ViolationKind,
}

/// Findings of a walk that completed.
#[derive(Debug, Default, Clone, Eq, PartialEq)]
pub struct WalkReport {
    pub violations: Vec<ConsistencyViolation>,
}

impl WalkReport {
    #[must_use]
    pub fn is_clean(&self) -> bool {
        self.violations.is_empty()
    }

    fn record(&mut self, addr: VirtualAddress, kind: ViolationKind) {
        match kind {
            ViolationKind::AlreadyPopulated { existing } => log::error!(
                target: CONSISTENCY_TARGET,
                "{addr}: leaf already maps {existing}; overwriting"
            ),
            ViolationKind::NotPresent { raw } => log::error!(
                target: CONSISTENCY_TARGET,
                "{addr}: non-present leaf {raw:#018x} in kernel page table"
            ),
        }
        self.violations.push(ConsistencyViolation { addr, kind });
    }
}

/// Result of [`depopulate`].
#[derive(Debug, Default, Clone, Eq, PartialEq)]
pub struct Depopulated {
    /// Pages that were bound in the range, in address order.
    pub pages: Vec<PhysicalPage>,
    pub report: WalkReport,
}

/// Bind `size` bytes starting at `start` to pages drawn from `pages`.
///
/// `start` and `size` must be page aligned. The cache is prepared for the new
/// mapping (`flush_cache_vmap`) once the walk stops, whether or not it
/// succeeded.
///
/// # Errors
/// - [`PageTableError::TableAllocation`] if a middle or leaf table could not be allocated.
/// - [`PageTableError::OutOfPages`] if `pages` ran dry before the range was covered.
///
/// The part of the range walked before the error stays populated.
pub fn populate<B, I>(
    pt: &B,
    start: VirtualAddress,
    size: u64,
    prot: Protection,
    pages: &mut I,
) -> Result<WalkReport, PageTableError>
where
    B: PageTableBackend + ?Sized,
    I: Iterator<Item = PhysicalPage>,
{
    debug_assert!(start.is_page_aligned() && size % PAGE_SIZE == 0);
    let end = start + size;
    let mut report = WalkReport::default();

    let result = populate_top(pt, start, end, prot, pages, &mut report);
    pt.flush_cache_vmap(start, end);
    result.map(|()| report)
}

fn populate_top<B, I>(
    pt: &B,
    start: VirtualAddress,
    end: VirtualAddress,
    prot: Protection,
    pages: &mut I,
    report: &mut WalkReport,
) -> Result<(), PageTableError>
where
    B: PageTableBackend + ?Sized,
    I: Iterator<Item = PhysicalPage>,
{
    let mut addr = start;
    while addr < end {
        let next = B::Layout::top_end(addr, end);
        let dir = pt.ensure_middle(B::Layout::top_index(addr))?;
        populate_middle(pt, dir, addr, next, prot, pages, report)?;
        addr = next;
    }
    Ok(())
}

fn populate_middle<B, I>(
    pt: &B,
    dir: Directory,
    start: VirtualAddress,
    end: VirtualAddress,
    prot: Protection,
    pages: &mut I,
    report: &mut WalkReport,
) -> Result<(), PageTableError>
where
    B: PageTableBackend + ?Sized,
    I: Iterator<Item = PhysicalPage>,
{
    let mut addr = start;
    while addr < end {
        let next = B::Layout::middle_end(addr, end);
        let leaf = pt.ensure_leaf(dir, B::Layout::middle_index(addr))?;
        populate_leaf(pt, leaf, addr, next, prot, pages, report)?;
        addr = next;
    }
    Ok(())
}

fn populate_leaf<B, I>(
    pt: &B,
    leaf: LeafTable,
    start: VirtualAddress,
    end: VirtualAddress,
    prot: Protection,
    pages: &mut I,
    report: &mut WalkReport,
) -> Result<(), PageTableError>
where
    B: PageTableBackend + ?Sized,
    I: Iterator<Item = PhysicalPage>,
{
    let mut addr = start;
    while addr < end {
        let index = B::Layout::leaf_index(addr);
        let existing = pt.leaf(leaf, index);
        if !existing.is_none() {
            let kind = existing.page().map_or(
                ViolationKind::NotPresent {
                    raw: existing.into_bits(),
                },
                |existing| ViolationKind::AlreadyPopulated { existing },
            );
            report.record(addr, kind);
        }

        let page = pages.next().ok_or(PageTableError::OutOfPages(addr))?;
        pt.bind_leaf(leaf, index, page, prot);
        addr = addr + PAGE_SIZE;
    }
    Ok(())
}

/// Clear every leaf slot of `size` bytes starting at `start`.
///
/// Issues `flush_cache_vunmap` before touching any entry and a single
/// `flush_tlb_kernel_range` after the whole range is cleared.
pub fn depopulate<B>(pt: &B, start: VirtualAddress, size: u64) -> Depopulated
where
    B: PageTableBackend + ?Sized,
{
    debug_assert!(start.is_page_aligned() && size % PAGE_SIZE == 0);
    let end = start + size;
    let mut out = Depopulated::default();

    pt.flush_cache_vunmap(start, end);

    let mut addr = start;
    while addr < end {
        let next = B::Layout::top_end(addr, end);
        if let Some(dir) = pt.find_middle(B::Layout::top_index(addr)) {
            depopulate_middle(pt, dir, addr, next, &mut out);
        }
        addr = next;
    }

    pt.flush_tlb_kernel_range(start, end);
    out
}

fn depopulate_middle<B>(
    pt: &B,
    dir: Directory,
    start: VirtualAddress,
    end: VirtualAddress,
    out: &mut Depopulated,
) where
    B: PageTableBackend + ?Sized,
{
    let mut addr = start;
    while addr < end {
        let next = B::Layout::middle_end(addr, end);
        if let Some(leaf) = pt.find_leaf(dir, B::Layout::middle_index(addr)) {
            depopulate_leaf(pt, leaf, addr, next, out);
        }
        addr = next;
    }
}

fn depopulate_leaf<B>(
    pt: &B,
    leaf: LeafTable,
    start: VirtualAddress,
    end: VirtualAddress,
    out: &mut Depopulated,
) where
    B: PageTableBackend + ?Sized,
{
    let mut addr = start;
    while addr < end {
        let old = pt.clear_leaf(leaf, B::Layout::leaf_index(addr));
        if let Some(page) = old.page() {
            out.pages.push(page);
        } else if !old.is_none() {
            out.report.record(
                addr,
                ViolationKind::NotPresent {
                    raw: old.into_bits(),
                },
            );
        }
        addr = addr + PAGE_SIZE;
    }
}

/// Look up the page and protection bound at `addr` (`vmalloc_to_page`).
#[must_use]
pub fn translate<B>(pt: &B, addr: VirtualAddress) -> Option<(PhysicalPage, Protection)>
where
    B: PageTableBackend + ?Sized,
{
    let dir = pt.find_middle(B::Layout::top_index(addr))?;
    let leaf = pt.find_leaf(dir, B::Layout::middle_index(addr))?;
    let entry = pt.leaf(leaf, B::Layout::leaf_index(addr));
    entry.page().map(|page| (page, entry.protection()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{Folded, SoftPageTable, ThreeLevel};

    fn frames(first: u64, n: u64) -> Vec<PhysicalPage> {
        (first..first + n).map(PhysicalPage::from_pfn).collect()
    }

    fn round_trip<L: PagingLayout>(start: u64) {
        let pt = SoftPageTable::<L>::new();
        let start = VirtualAddress::new(start);
        let pages = frames(100, 6);
        let size = 6 * PAGE_SIZE;

        let report = populate(
            &pt,
            start,
            size,
            Protection::KERNEL,
            &mut pages.iter().copied(),
        )
        .unwrap();
        assert!(report.is_clean());

        for (i, page) in pages.iter().enumerate() {
            let va = start + i as u64 * PAGE_SIZE;
            assert_eq!(translate(&pt, va), Some((*page, Protection::KERNEL)));
        }
        assert_eq!(translate(&pt, start + size), None);

        let out = depopulate(&pt, start, size);
        assert_eq!(out.pages, pages);
        assert!(out.report.is_clean());
        assert_eq!(pt.present_leaves(), 0);
        assert_eq!(pt.flushes().cache_vmap, 1);
        assert_eq!(pt.flushes().cache_vunmap, 1);
        assert_eq!(pt.flushes().tlb_kernel_range, 1);
    }

    #[test]
    fn three_level_round_trip_across_leaf_table_boundary() {
        // starts 2 pages before a 2 MiB boundary: spans two leaf tables
        round_trip::<ThreeLevel>(0xFFFF_FFD0_0020_0000 - 2 * PAGE_SIZE);
    }

    #[test]
    fn three_level_round_trip_across_top_boundary() {
        round_trip::<ThreeLevel>(0xFFFF_FFD0_4000_0000 - 3 * PAGE_SIZE);
    }

    #[test]
    fn folded_round_trip_across_leaf_table_boundary() {
        round_trip::<Folded>(0xF840_0000 - 2 * PAGE_SIZE);
    }

    #[test]
    fn populate_without_enough_pages_keeps_partial_work() {
        let pt = SoftPageTable::<ThreeLevel>::new();
        let start = VirtualAddress::new(0xFFFF_FFD0_0000_0000);
        let pages = frames(1, 2);

        let err = populate(
            &pt,
            start,
            4 * PAGE_SIZE,
            Protection::KERNEL,
            &mut pages.iter().copied(),
        )
        .unwrap_err();
        assert_eq!(err, PageTableError::OutOfPages(start + 2 * PAGE_SIZE));
        assert_eq!(pt.present_leaves(), 2);
        // the cache hook runs even on failure
        assert_eq!(pt.flushes().cache_vmap, 1);

        let out = depopulate(&pt, start, 4 * PAGE_SIZE);
        assert_eq!(out.pages, pages);
    }

    #[test]
    fn table_allocation_failure_surfaces() {
        let pt = SoftPageTable::<ThreeLevel>::with_table_budget(1);
        let start = VirtualAddress::new(0xFFFF_FFD0_0000_0000);
        let err = populate(
            &pt,
            start,
            PAGE_SIZE,
            Protection::KERNEL,
            &mut frames(1, 1).into_iter(),
        )
        .unwrap_err();
        assert_eq!(err, PageTableError::TableAllocation);
    }

    #[test]
    fn populate_over_existing_binding_reports_and_continues() {
        let pt = SoftPageTable::<ThreeLevel>::new();
        let start = VirtualAddress::new(0xFFFF_FFD0_0000_0000);
        populate(
            &pt,
            start + PAGE_SIZE,
            PAGE_SIZE,
            Protection::KERNEL,
            &mut frames(7, 1).into_iter(),
        )
        .unwrap();

        let report = populate(
            &pt,
            start,
            3 * PAGE_SIZE,
            Protection::KERNEL,
            &mut frames(20, 3).into_iter(),
        )
        .unwrap();
        assert_eq!(
            report.violations,
            [ConsistencyViolation {
                addr: start + PAGE_SIZE,
                kind: ViolationKind::AlreadyPopulated {
                    existing: PhysicalPage::from_pfn(7)
                },
            }]
        );
        // the walk went on and the new binding won
        assert_eq!(
            translate(&pt, start + 2 * PAGE_SIZE).map(|(p, _)| p),
            Some(PhysicalPage::from_pfn(22))
        );
        assert_eq!(
            translate(&pt, start + PAGE_SIZE).map(|(p, _)| p),
            Some(PhysicalPage::from_pfn(21))
        );
    }

    #[test]
    fn depopulate_skips_missing_tables() {
        let pt = SoftPageTable::<ThreeLevel>::new();
        let out = depopulate(&pt, VirtualAddress::new(0xFFFF_FFD0_0000_0000), 1 << 30);
        assert!(out.pages.is_empty());
        assert!(out.report.is_clean());
        assert_eq!(pt.tables_allocated(), 0);
        assert_eq!(pt.flushes().tlb_kernel_range, 1);
    }

    #[test]
    fn depopulate_reports_non_present_entries() {
        let pt = SoftPageTable::<ThreeLevel>::new();
        let start = VirtualAddress::new(0xFFFF_FFD0_0000_0000);
        populate(
            &pt,
            start,
            PAGE_SIZE,
            Protection::KERNEL,
            &mut frames(3, 1).into_iter(),
        )
        .unwrap();

        let dir = pt.find_middle(ThreeLevel::top_index(start)).unwrap();
        let leaf = pt.find_leaf(dir, ThreeLevel::middle_index(start)).unwrap();
        let stale = crate::LeafEntry::new().with_os_available(1);
        pt.poke_leaf(leaf, ThreeLevel::leaf_index(start), stale);

        let out = depopulate(&pt, start, PAGE_SIZE);
        assert!(out.pages.is_empty());
        assert_eq!(
            out.report.violations[0].kind,
            ViolationKind::NotPresent {
                raw: stale.into_bits()
            }
        );
    }
}
