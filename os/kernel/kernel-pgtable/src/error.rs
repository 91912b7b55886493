use crate::VirtualAddress;

#[derive(Debug, Copy, Clone, Eq, PartialEq, thiserror::Error)]
pub enum PageTableError {
    /// An intermediate (middle or leaf) table could not be allocated.
    #[error("out of memory allocating a page table")]
    TableAllocation,
    /// The page source ran out before the range was covered.
    #[error("no page left to map at {0}")]
    OutOfPages(VirtualAddress),
}
