//! # Virtual Memory Areas
//!
//! A [`VmArea`] is one reserved range of the vmalloc window:
//!
//! ```text
//! addr                                   addr + size
//! ├──────────── usable ────────────┬─ guard ─┤
//! │ page │ page │ ...       │ page │ unmapped│
//! ```
//!
//! The trailing guard page is part of `size` and is never mapped.

use alloc::vec::Vec;
use kernel_pgtable::{PAGE_SIZE, PhysicalAddress, PhysicalPage, VirtualAddress};

/// How an area came to be, and therefore what teardown owes it.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum AreaKind {
    /// Backed by pages the allocator acquired itself (`vmalloc`).
    Alloc,
    /// Maps a caller-supplied page array (`vmap`).
    Map,
    /// I/O-remap reservation; aligned to its size, may carry a physical base.
    IoRemap,
}

impl AreaKind {
    /// Whether teardown frees the area's pages by default.
    #[must_use]
    pub const fn owns_pages(self) -> bool {
        matches!(self, Self::Alloc)
    }
}

/// A live reservation, owned by the area list.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VmArea {
    pub(crate) addr: VirtualAddress,
    pub(crate) size: u64,
    pub(crate) kind: AreaKind,
    pub(crate) pages: Vec<PhysicalPage>,
    pub(crate) phys_addr: Option<PhysicalAddress>,
}

impl VmArea {
    #[must_use]
    pub const fn addr(&self) -> VirtualAddress {
        self.addr
    }

    /// Reserved length, guard page included.
    #[must_use]
    pub const fn size(&self) -> u64 {
        self.size
    }

    /// Mappable length: `size` minus the guard page.
    #[must_use]
    pub const fn usable_size(&self) -> u64 {
        self.size - PAGE_SIZE
    }

    #[must_use]
    pub const fn kind(&self) -> AreaKind {
        self.kind
    }

    /// Pages owned by this area, in address order.
    #[must_use]
    pub fn pages(&self) -> &[PhysicalPage] {
        &self.pages
    }

    #[must_use]
    pub fn page_count(&self) -> usize {
        self.pages.len()
    }

    #[must_use]
    pub const fn phys_addr(&self) -> Option<PhysicalAddress> {
        self.phys_addr
    }

    /// Take the owned pages out of the record.
    #[must_use]
    pub fn into_pages(self) -> Vec<PhysicalPage> {
        self.pages
    }

    /// End of the whole reservation (guard page included).
    #[inline]
    pub(crate) fn end(&self) -> u64 {
        self.addr.as_u64() + self.size
    }

    /// End of the usable range.
    #[inline]
    pub(crate) fn usable_end(&self) -> u64 {
        self.end() - PAGE_SIZE
    }

    #[must_use]
    pub fn info(&self) -> VmAreaInfo {
        VmAreaInfo {
            addr: self.addr,
            size: self.size,
            kind: self.kind,
            page_count: self.pages.len(),
            phys_addr: self.phys_addr,
        }
    }
}

/// Copy of an area's bookkeeping, handed out by lookups so that no reference
/// into the list outlives the list lock.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct VmAreaInfo {
    pub addr: VirtualAddress,
    pub size: u64,
    pub kind: AreaKind,
    pub page_count: usize,
    pub phys_addr: Option<PhysicalAddress>,
}

impl VmAreaInfo {
    #[must_use]
    pub const fn usable_size(&self) -> u64 {
        self.size - PAGE_SIZE
    }

    /// Whether `addr` falls in the usable range (guard page excluded).
    #[must_use]
    pub const fn contains(&self, addr: VirtualAddress) -> bool {
        let a = addr.as_u64();
        a >= self.addr.as_u64() && a - self.addr.as_u64() < self.usable_size()
    }
}
