//! # Physical-Page Acquisition
//!
//! The allocator does not manage physical memory itself. It asks a
//! [`PageAllocator`] for one page at a time and reaches page contents through
//! [`PhysMemory`]. [`acquire_pages`] keeps exact accounting of a partial
//! success, so that an aborted allocation can hand back precisely what it got.

use alloc::vec::Vec;
use bitfield_struct::bitfield;
use kernel_pgtable::{PAGE_SIZE, PhysicalPage};

/// Bytes of one page, as seen through [`PhysMemory`].
#[allow(clippy::cast_possible_truncation)]
pub type PageFrame = [u8; PAGE_SIZE as usize];

/// Page allocation modifiers (`gfp_t`).
#[bitfield(u8)]
#[derive(PartialEq, Eq)]
pub struct AllocFlags {
    /// Hand out the page filled with zeros.
    pub zero: bool,
    /// Only pages addressable with 32 bits.
    pub dma32: bool,
    #[bits(6)]
    __: u8,
}

impl AllocFlags {
    /// Ordinary kernel allocation.
    pub const KERNEL: Self = Self::new();
    /// Zeroed kernel allocation.
    pub const ZEROED: Self = Self::new().with_zero(true);
    /// Allocation from the 32-bit addressable zone (`vmalloc_32`).
    pub const DMA32: Self = Self::new().with_dma32(true);
}

/// Source of physical pages.
pub trait PageAllocator {
    /// One page, or `None` when exhausted.
    fn alloc_page(&self, flags: AllocFlags) -> Option<PhysicalPage>;

    /// Return a page obtained from [`PageAllocator::alloc_page`].
    fn free_page(&self, page: PhysicalPage);

    /// Number of pages the system has in total.
    fn total_pages(&self) -> u64;
}

/// Access to the contents of physical pages.
pub trait PhysMemory {
    /// Run `f` on the bytes of `page`; `None` if `page` is not backed by memory.
    fn with_page<R>(&self, page: PhysicalPage, f: impl FnOnce(&mut PageFrame) -> R) -> Option<R>;
}

/// An acquisition that ran out part way.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("acquired {} of {wanted} pages", .acquired.len())]
pub struct PartialAcquire {
    /// Pages obtained before the allocator ran dry, in order.
    pub acquired: Vec<PhysicalPage>,
    pub wanted: usize,
}

/// Take `count` pages from `alloc`, one at a time.
///
/// # Errors
/// [`PartialAcquire`] with every page obtained before the allocator failed.
pub fn acquire_pages<A>(
    alloc: &A,
    count: usize,
    flags: AllocFlags,
) -> Result<Vec<PhysicalPage>, PartialAcquire>
where
    A: PageAllocator + ?Sized,
{
    let mut acquired = Vec::with_capacity(count);
    for _ in 0..count {
        match alloc.alloc_page(flags) {
            Some(page) => acquired.push(page),
            None => {
                return Err(PartialAcquire {
                    acquired,
                    wanted: count,
                });
            }
        }
    }
    Ok(acquired)
}

/// Return each of `pages` to `alloc`. Returns how many were freed.
pub fn release_pages<A, I>(alloc: &A, pages: I) -> usize
where
    A: PageAllocator + ?Sized,
    I: IntoIterator<Item = PhysicalPage>,
{
    let mut freed = 0;
    for page in pages {
        alloc.free_page(page);
        freed += 1;
    }
    freed
}
