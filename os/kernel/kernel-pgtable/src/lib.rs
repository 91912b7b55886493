//! # Kernel Page-Table Walk
//!
//! Page-table plumbing for the kernel's virtually contiguous mappings
//! (vmalloc/vmap). This crate binds and unbinds one physical page per virtual
//! page across a range, walking a three-level tree:
//!
//! ```text
//!  top  →  middle  →  leaf  →  Physical Page
//!   │        │         │
//!   │        │         └───► leaf entry: maps one 4 KiB page
//!   │        └─────────────► middle entry: points to a leaf table
//!   └──────────────────────► top entry: points to a middle table
//! ```
//!
//! Some architectures have no separate middle level. There the middle level
//! is **folded** into the top level: a top entry is viewed as a middle
//! directory with exactly one entry, and points straight at a leaf table. The
//! walk in [`walk`] is written once against [`PagingLayout`] and does not care
//! which of the two shapes it is running on.
//!
//! ## What you get
//! - Address newtypes ([`VirtualAddress`], [`PhysicalAddress`], [`PhysicalPage`]).
//! - Leaf entry and protection bitfields ([`LeafEntry`], [`Protection`]).
//! - Two layouts ([`ThreeLevel`], [`Folded`]) and the build-time
//!   [`DefaultLayout`] (feature `folded-pmd`).
//! - The architecture backend interface ([`PageTableBackend`]) with its cache
//!   and TLB maintenance hooks.
//! - A software backend ([`SoftPageTable`]) that keeps the tables in an arena.
//! - [`walk::populate`], [`walk::depopulate`] and [`walk::translate`].
//!
//! ## Consistency violations
//!
//! Finding a leaf already populated where none was expected (or a non-empty
//! entry that is not present) points at a kernel bug. The walk does not abort:
//! it logs the finding under [`CONSISTENCY_TARGET`] at error level, records it
//! in the returned [`WalkReport`], and carries on.

#![cfg_attr(not(any(test, doctest)), no_std)]
#![allow(clippy::inline_always)]

extern crate alloc;

mod addresses;
mod backend;
mod entry;
mod error;
mod layout;
mod soft;
pub mod walk;

pub use crate::addresses::{PAGE_SHIFT, PAGE_SIZE, PhysicalAddress, PhysicalPage, VirtualAddress};
pub use crate::backend::{Directory, LeafTable, PageTableBackend};
pub use crate::entry::{LeafEntry, Protection};
pub use crate::error::PageTableError;
pub use crate::layout::{DefaultLayout, Folded, PagingLayout, ThreeLevel};
pub use crate::soft::{FlushCounters, SoftPageTable};
pub use crate::walk::{ConsistencyViolation, Depopulated, ViolationKind, WalkReport};

/// Log target of the consistency-violation channel.
pub const CONSISTENCY_TARGET: &str = "vmalloc::consistency";

/// Align `x` down to the nearest multiple of `a`.
///
/// ### Preconditions
/// - `a` must be **non-zero** and a **power of two**.
///
/// ### Examples
/// ```rust
/// # use kernel_pgtable::align_down;
/// assert_eq!(align_down(0,      4096), 0);
/// assert_eq!(align_down(4095,   4096), 0);
/// assert_eq!(align_down(8191,   4096), 4096);
/// assert_eq!(align_down(0x12345,   16), 0x12340);
/// ```
#[inline(always)]
#[must_use]
pub const fn align_down(x: u64, a: u64) -> u64 {
    x & !(a - 1)
}

/// Align `x` up to the nearest multiple of `a`, or `None` on overflow.
///
/// ### Preconditions
/// - `a` must be **non-zero** and a **power of two**.
///
/// ### Examples
/// ```rust
/// # use kernel_pgtable::checked_align_up;
/// assert_eq!(checked_align_up(0,    4096), Some(0));
/// assert_eq!(checked_align_up(1,    4096), Some(4096));
/// assert_eq!(checked_align_up(4097, 4096), Some(8192));
/// assert_eq!(checked_align_up(u64::MAX, 4096), None);
/// ```
#[inline(always)]
#[must_use]
pub const fn checked_align_up(x: u64, a: u64) -> Option<u64> {
    match x.checked_add(a - 1) {
        Some(v) => Some(v & !(a - 1)),
        None => None,
    }
}

/// Number of pages needed to cover `bytes`, or `None` on overflow.
#[inline]
#[must_use]
pub const fn pages_for(bytes: u64) -> Option<u64> {
    match checked_align_up(bytes, PAGE_SIZE) {
        Some(v) => Some(v >> PAGE_SHIFT),
        None => None,
    }
}
