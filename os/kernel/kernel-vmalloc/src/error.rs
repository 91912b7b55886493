use kernel_pgtable::{PageTableError, VirtualAddress};

#[derive(Debug, Copy, Clone, Eq, PartialEq, thiserror::Error)]
pub enum VmallocError {
    /// Zero size, size arithmetic overflow, or more pages than the system has.
    #[error("invalid allocation size")]
    InvalidSize,
    /// No gap of the requested size in the window.
    #[error("out of vmalloc space")]
    OutOfSpace,
    /// A physical page or an intermediate page table could not be allocated.
    #[error("out of memory")]
    OutOfMemory,
    /// Teardown of an address that has no live area.
    #[error("no vm area at {0}")]
    NotFound(VirtualAddress),
    /// Teardown of an address that is not page aligned.
    #[error("bad address {0}")]
    BadAddress(VirtualAddress),
    /// The configured or requested window is unusable.
    #[error("invalid vmalloc window {start}..{end}")]
    InvalidWindow {
        start: VirtualAddress,
        end: VirtualAddress,
    },
}

impl From<PageTableError> for VmallocError {
    fn from(value: PageTableError) -> Self {
        match value {
            PageTableError::TableAllocation | PageTableError::OutOfPages(_) => Self::OutOfMemory,
        }
    }
}
