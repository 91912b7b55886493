//! # Allocator Configuration
//!
//! [`VmallocConfig`] defaults to the build-time layout in [`crate::layout`].
//! A different window can be chosen with [`VmallocConfig::with_window`]; it
//! is checked against the paging layout when the allocator is built.

use crate::VmallocError;
use crate::layout::{IOREMAP_MAX_ORDER, VMALLOC_END, VMALLOC_START};
use kernel_pgtable::{PAGE_SHIFT, PagingLayout, VirtualAddress};

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct VmallocConfig {
    /// First address handed out.
    pub start: VirtualAddress,
    /// End (exclusive) of the window; guard pages stay below it.
    pub end: VirtualAddress,
    /// Alignment cap for I/O-remap reservations, as a power of two.
    pub ioremap_max_order: u32,
}

impl Default for VmallocConfig {
    fn default() -> Self {
        Self {
            start: VirtualAddress::new(VMALLOC_START),
            end: VirtualAddress::new(VMALLOC_END),
            ioremap_max_order: IOREMAP_MAX_ORDER,
        }
    }
}

impl VmallocConfig {
    #[must_use]
    pub fn with_window(start: VirtualAddress, end: VirtualAddress) -> Self {
        Self {
            start,
            end,
            ..Self::default()
        }
    }

    #[must_use]
    pub const fn with_ioremap_max_order(mut self, order: u32) -> Self {
        self.ioremap_max_order = order;
        self
    }

    /// Check the window against the paging layout `L`.
    ///
    /// # Errors
    /// [`VmallocError::InvalidWindow`] if the window is empty, not page
    /// aligned, or spans more than one translated region of `L`, or if the
    /// I/O-remap order is out of range.
    pub fn validate<L: PagingLayout>(&self) -> Result<(), VmallocError> {
        let ok = self.start.is_page_aligned()
            && self.end.is_page_aligned()
            && L::covers(self.start, self.end)
            && (PAGE_SHIFT..u64::BITS).contains(&self.ioremap_max_order);
        if ok {
            Ok(())
        } else {
            Err(VmallocError::InvalidWindow {
                start: self.start,
                end: self.end,
            })
        }
    }
}
