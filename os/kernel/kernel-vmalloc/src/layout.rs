//! # vmalloc Window Layout

use kernel_pgtable::{DefaultLayout, PAGE_SHIFT, PAGE_SIZE, PagingLayout};

/// First address of the vmalloc window.
#[cfg(not(feature = "folded-pmd"))]
pub const VMALLOC_START: u64 = 0xffff_ffd0_0000_0000;

/// End (exclusive) of the vmalloc window.
#[cfg(not(feature = "folded-pmd"))]
pub const VMALLOC_END: u64 = 0xffff_ffe0_0000_0000;

/// First address of the vmalloc window (32-bit, above the direct map).
#[cfg(feature = "folded-pmd")]
pub const VMALLOC_START: u64 = 0xf800_0000;

/// End (exclusive) of the vmalloc window, below the fixmap.
#[cfg(feature = "folded-pmd")]
pub const VMALLOC_END: u64 = 0xff80_0000;

/// Largest alignment order applied to I/O-remap reservations (128 pages).
pub const IOREMAP_MAX_ORDER: u32 = 7 + PAGE_SHIFT;

const _: () = {
    assert!(VMALLOC_START.is_multiple_of(PAGE_SIZE));
    assert!(VMALLOC_END.is_multiple_of(PAGE_SIZE));
    assert!(VMALLOC_END > VMALLOC_START);
    // the window must not alias in the page-table indices
    assert!(VMALLOC_START >> DefaultLayout::VA_BITS == (VMALLOC_END - 1) >> DefaultLayout::VA_BITS);
    assert!(IOREMAP_MAX_ORDER >= PAGE_SHIFT && IOREMAP_MAX_ORDER < u64::BITS);
};
