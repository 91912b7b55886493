//! # Kernel Virtually Contiguous Memory (vmalloc / vmap)
//!
//! This crate hands out ranges of kernel virtual address space that are
//! contiguous in the virtual address space but backed by arbitrary physical
//! pages. It is the kernel's answer to "I need N bytes in one piece, and I do
//! not care where the frames are".
//!
//! ## Architecture Overview
//!
//! ```text
//! ┌─────────────────────────────────────────────────────┐
//! │                 Vmalloc (this crate)                │
//! │    • vmalloc / vmap / ioremap, vfree / vunmap       │
//! │    • unwinding of partial failures                  │
//! └───────┬──────────────────┬───────────────────┬──────┘
//!         │                  │                   │
//! ┌───────▼────────┐ ┌───────▼────────┐ ┌────────▼───────┐
//! │   AreaList     │ │ kernel-pgtable │ │  PageAllocator │
//! │ sorted areas,  │ │ populate /     │ │  + PhysMemory  │
//! │ first fit,     │ │ depopulate     │ │  (FramePool)   │
//! │ guard pages    │ │ walk           │ │                │
//! └────────────────┘ └────────────────┘ └────────────────┘
//! ```
//!
//! ## Core Components
//!
//! ### Area List ([`AreaList`])
//!
//! The sorted list of live [`VmArea`]s in the vmalloc window. Every area is
//! followed by one unmapped guard page that counts towards its size, so an
//! overrun faults instead of silently landing in the neighbor. The list also
//! implements the diagnostic `vread`/`vwrite` walk over all areas
//! ([`Vmalloc::read_through`], [`Vmalloc::write_through`]).
//!
//! ### Page Acquisition ([`pages`])
//!
//! Pages come one at a time from a [`PageAllocator`]; an allocation that runs
//! dry part way reports exactly which pages it got ([`PartialAcquire`]).
//! [`FramePool`] is a bitmap-tracked pool of frames in ordinary memory that
//! implements both collaborator traits.
//!
//! ### Allocator ([`Vmalloc`])
//!
//! Composes the above with the page-table walk from `kernel-pgtable`:
//!
//! * [`Vmalloc::allocate_and_map`] / [`Vmalloc::vmalloc`]: reserve, acquire,
//!   populate. Any failure is fully unwound.
//! * [`Vmalloc::map_fixed_pages`] / [`Vmalloc::vmap`]: map caller pages.
//! * [`Vmalloc::unmap`], [`Vmalloc::vfree`], [`Vmalloc::vunmap`],
//!   [`Vmalloc::free_mapping`]: unlink, depopulate with one TLB flush, and
//!   optionally free the pages.
//! * [`Vmalloc::reserve`], [`Vmalloc::get_vm_area`], [`Vmalloc::release`],
//!   [`Vmalloc::remove_vm_area`]: bare reservations.
//!
//! ## Memory Layout Integration
//!
//! ```text
//! VMALLOC_START ┌───────────────────────────┐
//!               │ area │g│ area   │g│       │
//!               │      free     │ area │g│  │
//! VMALLOC_END   └───────────────────────────┘
//! ```
//!
//! The window comes from [`layout`]; [`VmallocConfig`] can move it. With the
//! `folded-pmd` feature the page tables are two-level and the window sits at
//! the top of a 32-bit address space.
//!
//! ## Usage
//!
//! ```rust
//! use kernel_vmalloc::{FramePool, Vmalloc};
//!
//! let vm = Vmalloc::with_pages(FramePool::new(64));
//! let addr = vm.vmalloc(3 * 4096).unwrap();
//!
//! assert_eq!(vm.write_through(addr, b"hello"), 5);
//! let mut buf = [0u8; 5];
//! assert_eq!(vm.read_through(&mut buf, addr), 5);
//! assert_eq!(&buf, b"hello");
//!
//! vm.vfree(addr).unwrap();
//! assert_eq!(vm.area_count(), 0);
//! ```
//!
//! ## Diagnostics
//!
//! Allocator events are logged through the `log` facade. Page-table
//! consistency violations are logged by `kernel-pgtable` under
//! [`kernel_pgtable::CONSISTENCY_TARGET`] and counted in [`VmallocStats`].

#![cfg_attr(not(any(test, doctest)), no_std)]

extern crate alloc;

mod area;
mod area_list;
mod config;
mod error;
mod frame_pool;
pub mod layout;
pub mod pages;
mod stats;
mod vmalloc;

pub use crate::area::{AreaKind, VmArea, VmAreaInfo};
pub use crate::area_list::AreaList;
pub use crate::config::VmallocConfig;
pub use crate::error::VmallocError;
pub use crate::frame_pool::{BASE_PFN, FramePool, PoolStats};
pub use crate::pages::{AllocFlags, PageAllocator, PartialAcquire, PhysMemory};
pub use crate::stats::VmallocStats;
pub use crate::vmalloc::Vmalloc;
pub use kernel_pgtable::{PAGE_SIZE, PhysicalAddress, PhysicalPage, Protection, VirtualAddress};
