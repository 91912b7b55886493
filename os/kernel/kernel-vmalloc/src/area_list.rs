//! # Area List
//!
//! The sorted set of live [`VmArea`]s. Reservation is first fit: a candidate
//! address starts at the (aligned) window start and is pushed past every area
//! it touches until a gap of the requested size (guard page included) opens
//! up before the next area or before the window end.
//!
//! ```text
//! window start                                            window end
//! │ [area A|g]   [area B    |g]      [new  |g]   [area C|g]        │
//!               ▲ candidate pushed past A, then past B, fits before C
//! ```
//!
//! The list itself is not synchronized. The allocator keeps it behind a
//! reader/writer spin lock and does all page-table work after the lock is
//! dropped: every method here returns owned values.
//!
//! ## Reading and writing through the list
//!
//! [`AreaList::read_through`] and [`AreaList::write_through`] walk the areas
//! in address order starting at the requested address. Bytes in the gaps
//! between usable ranges read as zero and are dropped on write. The walk
//! stops at the end of the last area's usable range, so the returned count
//! may be smaller than the buffer. Page contents are reached through a
//! caller-provided accessor that never sees a chunk crossing a page boundary.

use crate::{AreaKind, VmArea, VmAreaInfo, VmallocError};
use alloc::vec::Vec;
use core::ops::Range;
use kernel_pgtable::{
    PAGE_SHIFT, PAGE_SIZE, PhysicalAddress, PhysicalPage, VirtualAddress, checked_align_up,
};

pub struct AreaList {
    /// Ascending by `addr`, non-overlapping.
    areas: Vec<VmArea>,
    ioremap_max_order: u32,
}

impl AreaList {
    #[must_use]
    pub const fn new(ioremap_max_order: u32) -> Self {
        Self {
            areas: Vec::new(),
            ioremap_max_order,
        }
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.areas.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.areas.is_empty()
    }

    /// Bookkeeping of every live area, ascending.
    #[must_use]
    pub fn snapshot(&self) -> Vec<VmAreaInfo> {
        self.areas.iter().map(VmArea::info).collect()
    }

    /// Reserve `size` bytes plus a guard page inside `[start, end)`.
    ///
    /// # Errors
    /// - [`VmallocError::InvalidSize`] for a zero size or on size overflow.
    /// - [`VmallocError::OutOfSpace`] if no gap fits.
    pub fn reserve(
        &mut self,
        size: u64,
        kind: AreaKind,
        start: VirtualAddress,
        end: VirtualAddress,
    ) -> Result<VmAreaInfo, VmallocError> {
        self.insert(size, kind, None, start, end)
    }

    /// Reserve an [`AreaKind::IoRemap`] range that records its physical base.
    ///
    /// # Errors
    /// As [`AreaList::reserve`].
    pub fn reserve_phys(
        &mut self,
        size: u64,
        phys_addr: PhysicalAddress,
        start: VirtualAddress,
        end: VirtualAddress,
    ) -> Result<VmAreaInfo, VmallocError> {
        self.insert(size, AreaKind::IoRemap, Some(phys_addr), start, end)
    }

    /// Unlink the area based exactly at `addr`.
    ///
    /// # Errors
    /// [`VmallocError::NotFound`] if no area starts at `addr`.
    pub fn release(&mut self, addr: VirtualAddress) -> Result<VmArea, VmallocError> {
        let index = self.index_of(addr).ok_or(VmallocError::NotFound(addr))?;
        let area = self.areas.remove(index);
        log::debug!(
            "released {:?} area {}+{:#x}",
            area.kind,
            area.addr,
            area.size
        );
        Ok(area)
    }

    /// Area based exactly at `addr`.
    #[must_use]
    pub fn find(&self, addr: VirtualAddress) -> Option<VmAreaInfo> {
        self.index_of(addr).map(|i| self.areas[i].info())
    }

    /// Area whose usable range contains `addr`.
    #[must_use]
    pub fn containing(&self, addr: VirtualAddress) -> Option<VmAreaInfo> {
        let after = self.areas.partition_point(|a| a.addr <= addr);
        let info = self.areas[..after].last()?.info();
        info.contains(addr).then_some(info)
    }

    /// Hand the pages backing a freshly populated area to its record.
    ///
    /// Done once per area. If the area is gone (or already has pages), the
    /// pages come back to the caller.
    ///
    /// # Errors
    /// The pages themselves, when they could not be attached.
    pub fn attach_pages(
        &mut self,
        addr: VirtualAddress,
        pages: Vec<PhysicalPage>,
    ) -> Result<(), Vec<PhysicalPage>> {
        let Some(index) = self.index_of(addr) else {
            return Err(pages);
        };
        let area = &mut self.areas[index];
        if !area.pages.is_empty() {
            return Err(pages);
        }
        debug_assert!(pages.len() as u64 * PAGE_SIZE >= area.usable_size());
        area.pages = pages;
        Ok(())
    }

    /// Copy bytes starting at `addr` into `buf` (`vread`).
    ///
    /// `read_page(va, chunk)` fills `chunk` with the bytes mapped at `va`;
    /// `chunk` never crosses a page boundary. Returns the number of bytes
    /// produced.
    pub fn read_through<F>(&self, buf: &mut [u8], addr: VirtualAddress, mut read_page: F) -> usize
    where
        F: FnMut(VirtualAddress, &mut [u8]),
    {
        let count = clamp_count(addr, buf.len());
        self.walk_usable(addr, count, |span| match span {
            Span::Gap(range) => buf[range].fill(0),
            Span::Mapped(va, range) => {
                for_each_page_chunk(va, range, |va, chunk| read_page(va, &mut buf[chunk]));
            }
        })
    }

    /// Copy `buf` to the areas starting at `addr` (`vwrite`).
    ///
    /// `write_page(va, chunk)` stores `chunk` at `va`; `chunk` never crosses a
    /// page boundary. Bytes landing in gaps are dropped but still counted.
    /// Returns the number of bytes consumed from `buf`.
    pub fn write_through<F>(&self, addr: VirtualAddress, buf: &[u8], mut write_page: F) -> usize
    where
        F: FnMut(VirtualAddress, &[u8]),
    {
        let count = clamp_count(addr, buf.len());
        self.walk_usable(addr, count, |span| {
            if let Span::Mapped(va, range) = span {
                for_each_page_chunk(va, range, |va, chunk| write_page(va, &buf[chunk]));
            }
        })
    }

    fn index_of(&self, addr: VirtualAddress) -> Option<usize> {
        self.areas.binary_search_by_key(&addr, |a| a.addr).ok()
    }

    fn alignment(&self, kind: AreaKind, size: u64) -> u64 {
        if kind == AreaKind::IoRemap {
            // fls(size), clamped to [PAGE_SHIFT, ioremap_max_order]
            let bit = (u64::BITS - size.leading_zeros()).clamp(PAGE_SHIFT, self.ioremap_max_order);
            1 << bit
        } else {
            PAGE_SIZE
        }
    }

    fn insert(
        &mut self,
        size: u64,
        kind: AreaKind,
        phys_addr: Option<PhysicalAddress>,
        start: VirtualAddress,
        end: VirtualAddress,
    ) -> Result<VmAreaInfo, VmallocError> {
        if size == 0 {
            return Err(VmallocError::InvalidSize);
        }
        let align = self.alignment(kind, size);
        let size = checked_align_up(size, PAGE_SIZE)
            .and_then(|s| s.checked_add(PAGE_SIZE))
            .ok_or(VmallocError::InvalidSize)?;

        let Some((index, addr)) = self.find_gap(size, align, start.as_u64(), end.as_u64()) else {
            log::warn!("allocation failed: out of vmalloc space ({size:#x} bytes in {start}..{end})");
            return Err(VmallocError::OutOfSpace);
        };

        let area = VmArea {
            addr: VirtualAddress::new(addr),
            size,
            kind,
            pages: Vec::new(),
            phys_addr,
        };
        let info = area.info();
        self.areas.insert(index, area);
        log::debug!("reserved {kind:?} area {}+{size:#x}", info.addr);
        Ok(info)
    }

    /// First fit for `size` bytes aligned to `align` in `[start, end)`.
    ///
    /// Returns the insertion index and the address.
    fn find_gap(&self, size: u64, align: u64, start: u64, end: u64) -> Option<(usize, u64)> {
        let mut addr = checked_align_up(start, align)?;
        for (index, area) in self.areas.iter().enumerate() {
            let base = area.addr.as_u64();
            if base < addr {
                if area.end() >= addr {
                    addr = checked_align_up(area.end(), align)?;
                }
                continue;
            }
            let last = addr.checked_add(size)?;
            if last <= base {
                return (last <= end).then_some((index, addr));
            }
            addr = checked_align_up(area.end(), align)?;
            if addr.checked_add(size)? > end {
                return None;
            }
        }
        let last = addr.checked_add(size)?;
        (last <= end).then_some((self.areas.len(), addr))
    }

    /// Walk `count` bytes from `addr` across the usable ranges, reporting
    /// buffer ranges as gaps or mapped spans. Returns the bytes covered.
    fn walk_usable(&self, addr: VirtualAddress, count: usize, mut visit: impl FnMut(Span)) -> usize {
        let mut cursor = addr.as_u64();
        let mut done = 0;

        for area in &self.areas {
            if done == count {
                break;
            }
            let (base, usable_end) = (area.addr.as_u64(), area.usable_end());
            if cursor >= usable_end {
                continue;
            }
            if cursor < base {
                let gap = clamp_len(base - cursor, count - done);
                visit(Span::Gap(done..done + gap));
                done += gap;
                cursor += gap as u64;
                if done == count {
                    break;
                }
            }
            let n = clamp_len(usable_end - cursor, count - done);
            visit(Span::Mapped(VirtualAddress::new(cursor), done..done + n));
            done += n;
            cursor += n as u64;
        }
        done
    }
}

/// A stretch of the caller's buffer during [`AreaList::walk_usable`].
enum Span {
    /// Outside every usable range.
    Gap(Range<usize>),
    /// Inside a usable range, starting at the given address.
    Mapped(VirtualAddress, Range<usize>),
}

/// Limit `len` so that `addr + len` does not wrap the address space.
fn clamp_count(addr: VirtualAddress, len: usize) -> usize {
    let room = 0u64.wrapping_sub(addr.as_u64());
    if addr.is_null() {
        len
    } else {
        clamp_len(room, len)
    }
}

fn clamp_len(span: u64, len: usize) -> usize {
    usize::try_from(span).map_or(len, |span| span.min(len))
}

/// Split the buffer range `range`, mapped from `va` on, at page boundaries.
fn for_each_page_chunk(
    va: VirtualAddress,
    range: Range<usize>,
    mut f: impl FnMut(VirtualAddress, Range<usize>),
) {
    let mut va = va;
    let mut at = range.start;
    while at < range.end {
        let in_page = clamp_len(PAGE_SIZE - va.page_offset(), range.end - at);
        f(va, at..at + in_page);
        at += in_page;
        va = va + in_page as u64;
    }
}
