//! # Software page tables
//!
//! [`SoftPageTable`] keeps a page-table tree in ordinary memory: one root
//! table, plus arenas of middle and leaf tables that are allocated on demand
//! and never freed (kernel page tables for the vmalloc window are kept for
//! the lifetime of the system). It stands in for the architecture's tables
//! on hosts and in tests, and counts every cache/TLB hook so callers can
//! check their maintenance discipline.
//!
//! ## Locking
//!
//! ```text
//! tree: RwSpinLock<Tree>
//!   ├─ write: ensure_middle / ensure_leaf that must allocate
//!   └─ read:  lookups and leaf slot updates (AtomicU64 per slot)
//! ```
//!
//! Only table allocation is exclusive. Walks over disjoint ranges touch
//! disjoint leaf slots and run side by side under shared holds.
//!
//! An optional table budget makes table allocation fail after a fixed
//! number of tables, to exercise the out-of-memory paths of the walk.

use crate::backend::DirectoryTable;
use crate::{
    DefaultLayout, Directory, LeafEntry, LeafTable, PageTableBackend, PageTableError,
    PagingLayout, PhysicalPage, Protection, VirtualAddress,
};
use alloc::boxed::Box;
use alloc::vec;
use alloc::vec::Vec;
use core::marker::PhantomData;
use core::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use kernel_sync::RwSpinLock;

/// How often each maintenance hook ran.
#[derive(Debug, Default, Copy, Clone, Eq, PartialEq)]
pub struct FlushCounters {
    pub cache_vmap: usize,
    pub cache_vunmap: usize,
    pub tlb_kernel_range: usize,
}

#[derive(Debug, Default)]
struct Flushes {
    cache_vmap: AtomicUsize,
    cache_vunmap: AtomicUsize,
    tlb_kernel_range: AtomicUsize,
}

type LeafSlots = Box<[AtomicU64]>;

struct Tree {
    /// Top-level slots: middle table ids, or leaf table ids when folded.
    root: Vec<Option<u32>>,
    middles: Vec<Vec<Option<u32>>>,
    leaves: Vec<LeafSlots>,
    /// Remaining tables that may be allocated; `None` is unbounded.
    budget: Option<usize>,
}

impl Tree {
    fn take_budget(&mut self) -> Result<(), PageTableError> {
        match &mut self.budget {
            Some(0) => Err(PageTableError::TableAllocation),
            Some(left) => {
                *left -= 1;
                Ok(())
            }
            None => Ok(()),
        }
    }

    fn dir_slot(&self, dir: Directory, index: usize) -> Option<u32> {
        match dir.table {
            DirectoryTable::Root => self.root[dir.base + index],
            DirectoryTable::Middle(m) => self.middles[m as usize][dir.base + index],
        }
    }

    fn dir_slot_mut(&mut self, dir: Directory, index: usize) -> &mut Option<u32> {
        match dir.table {
            DirectoryTable::Root => &mut self.root[dir.base + index],
            DirectoryTable::Middle(m) => &mut self.middles[m as usize][dir.base + index],
        }
    }

    fn slot(&self, table: LeafTable, index: usize) -> &AtomicU64 {
        &self.leaves[table.0 as usize][index]
    }
}

/// Page-table tree held in ordinary memory.
pub struct SoftPageTable<L: PagingLayout = DefaultLayout> {
    tree: RwSpinLock<Tree>,
    flushes: Flushes,
    _layout: PhantomData<L>,
}

impl<L: PagingLayout> Default for SoftPageTable<L> {
    fn default() -> Self {
        Self::new()
    }
}

impl<L: PagingLayout> SoftPageTable<L> {
    /// An empty tree with unbounded table allocation.
    #[must_use]
    pub fn new() -> Self {
        Self::build(None)
    }

    /// An empty tree that can allocate at most `tables` middle and leaf tables.
    #[must_use]
    pub fn with_table_budget(tables: usize) -> Self {
        Self::build(Some(tables))
    }

    fn build(budget: Option<usize>) -> Self {
        Self {
            tree: RwSpinLock::new(Tree {
                root: vec![None; L::TOP_ENTRIES],
                middles: Vec::new(),
                leaves: Vec::new(),
                budget,
            }),
            flushes: Flushes::default(),
            _layout: PhantomData,
        }
    }

    /// Number of middle and leaf tables allocated so far.
    #[must_use]
    pub fn tables_allocated(&self) -> usize {
        self.tree.with_read(|t| t.middles.len() + t.leaves.len())
    }

    #[must_use]
    pub fn flushes(&self) -> FlushCounters {
        FlushCounters {
            cache_vmap: self.flushes.cache_vmap.load(Ordering::Relaxed),
            cache_vunmap: self.flushes.cache_vunmap.load(Ordering::Relaxed),
            tlb_kernel_range: self.flushes.tlb_kernel_range.load(Ordering::Relaxed),
        }
    }

    /// Number of present leaf entries in the whole tree.
    #[must_use]
    pub fn present_leaves(&self) -> usize {
        self.tree.with_read(|t| {
            t.leaves
                .iter()
                .flat_map(|slots| slots.iter())
                .filter(|slot| LeafEntry::from_bits(slot.load(Ordering::Acquire)).present())
                .count()
        })
    }

    /// Write a raw leaf entry, bypassing the walk.
    ///
    /// Only meant for injecting corrupted state when testing the
    /// consistency-violation channel.
    pub fn poke_leaf(&self, table: LeafTable, index: usize, entry: LeafEntry) {
        self.tree
            .with_read(|t| t.slot(table, index).store(entry.into_bits(), Ordering::Release));
    }

    fn alloc_middle(tree: &mut Tree) -> Result<u32, PageTableError> {
        tree.take_budget()?;
        let id = u32::try_from(tree.middles.len()).map_err(|_| PageTableError::TableAllocation)?;
        tree.middles.push(vec![None; L::MIDDLE_ENTRIES]);
        log::trace!("allocated middle table #{id} ({})", L::NAME);
        Ok(id)
    }

    fn alloc_leaf(tree: &mut Tree) -> Result<u32, PageTableError> {
        tree.take_budget()?;
        let id = u32::try_from(tree.leaves.len()).map_err(|_| PageTableError::TableAllocation)?;
        tree.leaves
            .push((0..L::LEAF_ENTRIES).map(|_| AtomicU64::new(0)).collect());
        log::trace!("allocated leaf table #{id} ({})", L::NAME);
        Ok(id)
    }
}

impl<L: PagingLayout> PageTableBackend for SoftPageTable<L> {
    type Layout = L;

    fn ensure_middle(&self, top: usize) -> Result<Directory, PageTableError> {
        if let Some(dir) = self.find_middle(top) {
            return Ok(dir);
        }
        let id = self.tree.with_write(|t| -> Result<u32, PageTableError> {
            // another walk may have allocated it since the shared lookup
            if let Some(id) = t.root[top] {
                return Ok(id);
            }
            let id = Self::alloc_middle(t)?;
            t.root[top] = Some(id);
            Ok(id)
        })?;
        Ok(Directory {
            table: DirectoryTable::Middle(id),
            base: 0,
        })
    }

    fn find_middle(&self, top: usize) -> Option<Directory> {
        if L::is_folded() {
            // pmd_offset(pgd) == (pmd_t *)pgd
            return Some(Directory {
                table: DirectoryTable::Root,
                base: top,
            });
        }
        self.tree.with_read(|t| t.root[top]).map(|id| Directory {
            table: DirectoryTable::Middle(id),
            base: 0,
        })
    }

    fn ensure_leaf(&self, dir: Directory, index: usize) -> Result<LeafTable, PageTableError> {
        if let Some(leaf) = self.find_leaf(dir, index) {
            return Ok(leaf);
        }
        self.tree.with_write(|t| -> Result<LeafTable, PageTableError> {
            if let Some(id) = t.dir_slot(dir, index) {
                return Ok(LeafTable(id));
            }
            let id = Self::alloc_leaf(t)?;
            *t.dir_slot_mut(dir, index) = Some(id);
            Ok(LeafTable(id))
        })
    }

    fn find_leaf(&self, dir: Directory, index: usize) -> Option<LeafTable> {
        self.tree.with_read(|t| t.dir_slot(dir, index)).map(LeafTable)
    }

    fn leaf(&self, table: LeafTable, index: usize) -> LeafEntry {
        let raw = self
            .tree
            .with_read(|t| t.slot(table, index).load(Ordering::Acquire));
        LeafEntry::from_bits(raw)
    }

    fn bind_leaf(
        &self,
        table: LeafTable,
        index: usize,
        page: PhysicalPage,
        prot: Protection,
    ) -> LeafEntry {
        let new = LeafEntry::make(page, prot).into_bits();
        let old = self
            .tree
            .with_read(|t| t.slot(table, index).swap(new, Ordering::AcqRel));
        LeafEntry::from_bits(old)
    }

    fn clear_leaf(&self, table: LeafTable, index: usize) -> LeafEntry {
        let old = self
            .tree
            .with_read(|t| t.slot(table, index).swap(0, Ordering::AcqRel));
        LeafEntry::from_bits(old)
    }

    fn flush_cache_vmap(&self, _start: VirtualAddress, _end: VirtualAddress) {
        self.flushes.cache_vmap.fetch_add(1, Ordering::Relaxed);
    }

    fn flush_cache_vunmap(&self, _start: VirtualAddress, _end: VirtualAddress) {
        self.flushes.cache_vunmap.fetch_add(1, Ordering::Relaxed);
    }

    fn flush_tlb_kernel_range(&self, _start: VirtualAddress, _end: VirtualAddress) {
        self.flushes.tlb_kernel_range.fetch_add(1, Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{Folded, ThreeLevel};

    #[test]
    fn three_level_allocates_middle_then_leaf() {
        let pt = SoftPageTable::<ThreeLevel>::new();
        assert!(pt.find_middle(3).is_none());

        let dir = pt.ensure_middle(3).unwrap();
        assert_eq!(pt.find_middle(3), Some(dir));
        let leaf = pt.ensure_leaf(dir, 5).unwrap();
        assert_eq!(pt.find_leaf(dir, 5), Some(leaf));
        assert_eq!(pt.tables_allocated(), 2);

        // second ensure reuses the existing tables
        let again = pt.ensure_middle(3).unwrap();
        assert_eq!(pt.ensure_leaf(again, 5).unwrap(), leaf);
        assert_eq!(pt.tables_allocated(), 2);
    }

    #[test]
    fn folded_never_allocates_a_middle_table() {
        let pt = SoftPageTable::<Folded>::new();
        let dir = pt.ensure_middle(7).unwrap();
        assert!(pt.find_leaf(dir, 0).is_none());
        let leaf = pt.ensure_leaf(dir, 0).unwrap();
        assert_eq!(pt.find_middle(7).and_then(|d| pt.find_leaf(d, 0)), Some(leaf));
        assert_eq!(pt.tables_allocated(), 1);
    }

    #[test]
    fn budget_exhaustion_fails_cleanly() {
        let pt = SoftPageTable::<ThreeLevel>::with_table_budget(1);
        let dir = pt.ensure_middle(0).unwrap();
        assert_eq!(pt.ensure_leaf(dir, 0), Err(PageTableError::TableAllocation));
        assert!(pt.find_leaf(dir, 0).is_none());
    }

    #[test]
    fn bind_and_clear_return_previous() {
        let pt = SoftPageTable::<ThreeLevel>::new();
        let dir = pt.ensure_middle(0).unwrap();
        let leaf = pt.ensure_leaf(dir, 0).unwrap();
        let page = PhysicalPage::from_pfn(42);

        assert!(pt.bind_leaf(leaf, 1, page, Protection::KERNEL).is_none());
        assert_eq!(pt.leaf(leaf, 1).page(), Some(page));
        assert_eq!(pt.present_leaves(), 1);
        assert_eq!(pt.clear_leaf(leaf, 1).page(), Some(page));
        assert!(pt.leaf(leaf, 1).is_none());
        assert_eq!(pt.present_leaves(), 0);
    }
}
