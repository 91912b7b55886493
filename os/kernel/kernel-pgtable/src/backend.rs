//! # Page-table backend interface
//!
//! The architecture-facing half of the walk. A backend owns the tables and
//! knows how to create them, read and write leaf slots, and perform the cache
//! and TLB maintenance around a mapping change. The walk in [`crate::walk`]
//! only speaks this interface.
//!
//! ## Handles
//!
//! - [`Directory`]: a middle-level directory. On a folded layout this is a
//!   view of a single top-level slot, so "middle index 0" addresses the top
//!   entry itself.
//! - [`LeafTable`]: a leaf-level table.
//!
//! ## Synchronization
//!
//! Every method takes `&self`. A backend serializes table allocation on the
//! architecture page-table lock and updates leaf slots atomically, so walks
//! over non-overlapping ranges run in parallel. Walks over the same range are
//! not ordered against each other.

use crate::{LeafEntry, PageTableError, PagingLayout, PhysicalPage, Protection, VirtualAddress};

/// Where a directory's entries live.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub(crate) enum DirectoryTable {
    /// The root table (folded layouts).
    Root,
    /// A separately allocated middle table.
    Middle(u32),
}

/// Handle to a middle-level directory.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct Directory {
    pub(crate) table: DirectoryTable,
    /// First slot of the directory inside `table`.
    pub(crate) base: usize,
}

/// Handle to a leaf-level table.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct LeafTable(pub(crate) u32);

/// Architecture page-table backend.
pub trait PageTableBackend {
    /// Index geometry of this backend's tree.
    type Layout: PagingLayout;

    /// Middle directory below top slot `top`, allocating it if absent (`pmd_alloc`).
    ///
    /// # Errors
    /// [`PageTableError::TableAllocation`] if no table could be allocated.
    fn ensure_middle(&self, top: usize) -> Result<Directory, PageTableError>;

    /// Middle directory below top slot `top`, if present.
    fn find_middle(&self, top: usize) -> Option<Directory>;

    /// Leaf table below slot `index` of `dir`, allocating it if absent (`pte_alloc_kernel`).
    ///
    /// # Errors
    /// [`PageTableError::TableAllocation`] if no table could be allocated.
    fn ensure_leaf(&self, dir: Directory, index: usize) -> Result<LeafTable, PageTableError>;

    /// Leaf table below slot `index` of `dir`, if present.
    fn find_leaf(&self, dir: Directory, index: usize) -> Option<LeafTable>;

    /// Read leaf slot `index`.
    fn leaf(&self, table: LeafTable, index: usize) -> LeafEntry;

    /// Bind leaf slot `index` to `page` with `prot`; returns the previous entry.
    fn bind_leaf(
        &self,
        table: LeafTable,
        index: usize,
        page: PhysicalPage,
        prot: Protection,
    ) -> LeafEntry;

    /// Clear leaf slot `index`; returns the previous entry (`ptep_get_and_clear`).
    fn clear_leaf(&self, table: LeafTable, index: usize) -> LeafEntry;

    /// Make freshly written mappings of `[start, end)` visible to virtually
    /// indexed caches (`flush_cache_vmap`).
    fn flush_cache_vmap(&self, start: VirtualAddress, end: VirtualAddress);

    /// Write back and invalidate cache lines of `[start, end)` before its
    /// mappings are removed (`flush_cache_vunmap`).
    fn flush_cache_vunmap(&self, start: VirtualAddress, end: VirtualAddress);

    /// Invalidate cached translations of `[start, end)` (`flush_tlb_kernel_range`).
    fn flush_tlb_kernel_range(&self, start: VirtualAddress, end: VirtualAddress);
}
