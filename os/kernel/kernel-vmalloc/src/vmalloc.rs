//! # The vmalloc Allocator
//!
//! [`Vmalloc`] ties the area list, the page-table walk and the page source
//! together.
//!
//! ```text
//! allocate_and_map(size)
//!   ├─ reserve         areas.write  → VmAreaInfo        (lock dropped)
//!   ├─ acquire_pages   page source  → Vec<PhysicalPage>
//!   ├─ populate        page_table   → leaf entries
//!   └─ attach_pages    areas.write  → area owns its pages
//!
//! unmap(addr)
//!   ├─ release         areas.write  → VmArea            (lock dropped)
//!   ├─ depopulate      page_table   → unbound pages, one TLB flush
//!   └─ release_pages   page source  (if asked to)
//! ```
//!
//! ## Locking
//!
//! | Lock | Protects | Taken by |
//! |------|----------|----------|
//! | `areas` (reader/writer) | the area list | reserve/release/attach (write), lookups and read/write-through (read) |
//! | backend tree (reader/writer) | page-table structure | allocation of a middle or leaf table (write), every other slot access (read) |
//!
//! The backend lock lives inside the backend and is held for one table
//! operation at a time, so populate and depopulate walks of different areas
//! proceed in parallel. Lock order is area list, then backend, then page
//! source.
//!
//! Page-table work never runs with the list lock held for writing. A
//! released range is free for reuse as soon as it is unlinked, before its
//! entries have been cleared; callers must not use an address after handing
//! it to teardown.

use crate::pages::{AllocFlags, PageAllocator, PhysMemory, acquire_pages, release_pages};
use crate::stats::Counters;
use crate::{AreaKind, AreaList, VmArea, VmAreaInfo, VmallocConfig, VmallocError, VmallocStats};
use alloc::vec::Vec;
use kernel_pgtable::walk::{self, WalkReport};
use kernel_pgtable::{
    PAGE_SHIFT, PAGE_SIZE, PageTableBackend, PageTableError, PhysicalAddress, PhysicalPage,
    Protection, SoftPageTable, VirtualAddress, checked_align_up, pages_for,
};
use kernel_sync::RwSpinLock;

/// What teardown does with the pages it unbinds.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
enum Teardown {
    KeepPages,
    FreePages,
    /// Free them if the area owns its pages.
    ByKind,
}

/// Kernel virtual memory area allocator.
pub struct Vmalloc<P, B = SoftPageTable>
where
    B: PageTableBackend,
{
    config: VmallocConfig,
    areas: RwSpinLock<AreaList>,
    page_table: B,
    pages: P,
    counters: Counters,
}

impl<P> Vmalloc<P, SoftPageTable>
where
    P: PageAllocator + PhysMemory,
{
    /// Allocator over the build-time window with a fresh software page table.
    pub fn with_pages(pages: P) -> Self {
        // the default window is checked against the default layout at compile time
        Self::build(VmallocConfig::default(), SoftPageTable::new(), pages)
    }
}

impl<P, B> Vmalloc<P, B>
where
    P: PageAllocator + PhysMemory,
    B: PageTableBackend,
{
    /// Allocator over `config`'s window, mapping through `backend`.
    ///
    /// # Errors
    /// [`VmallocError::InvalidWindow`] if the window does not fit the
    /// backend's paging layout.
    pub fn new(config: VmallocConfig, backend: B, pages: P) -> Result<Self, VmallocError> {
        config.validate::<B::Layout>()?;
        Ok(Self::build(config, backend, pages))
    }

    fn build(config: VmallocConfig, backend: B, pages: P) -> Self {
        log::info!(
            "vmalloc window {}..{}, {} pages of physical memory",
            config.start,
            config.end,
            pages.total_pages()
        );
        Self {
            areas: RwSpinLock::new(AreaList::new(config.ioremap_max_order)),
            page_table: backend,
            pages,
            counters: Counters::new(),
            config,
        }
    }

    #[must_use]
    pub const fn config(&self) -> &VmallocConfig {
        &self.config
    }

    /// The page source backing this allocator.
    #[must_use]
    pub const fn page_source(&self) -> &P {
        &self.pages
    }

    /// The page-table backend the allocator maps through.
    #[must_use]
    pub const fn page_table(&self) -> &B {
        &self.page_table
    }

    /// Number of live areas.
    #[must_use]
    pub fn area_count(&self) -> usize {
        self.areas.with_read(AreaList::len)
    }

    /// Bookkeeping of every live area, ascending.
    #[must_use]
    pub fn areas(&self) -> Vec<VmAreaInfo> {
        self.areas.with_read(AreaList::snapshot)
    }

    /// Area based exactly at `addr` (`find_vm_area`).
    #[must_use]
    pub fn find(&self, addr: VirtualAddress) -> Option<VmAreaInfo> {
        self.areas.with_read(|list| list.find(addr))
    }

    /// Area whose usable range contains `addr`.
    #[must_use]
    pub fn containing(&self, addr: VirtualAddress) -> Option<VmAreaInfo> {
        self.areas.with_read(|list| list.containing(addr))
    }

    #[must_use]
    pub fn stats(&self) -> VmallocStats {
        self.areas.with_read(|list| self.counters.snapshot(list))
    }

    /// Reserve `size` bytes (plus a guard page) inside `[start, end)`.
    ///
    /// Nothing is mapped.
    ///
    /// # Errors
    /// - [`VmallocError::InvalidWindow`] if `[start, end)` does not fit the paging layout.
    /// - [`VmallocError::InvalidSize`] for a zero or overflowing size.
    /// - [`VmallocError::OutOfSpace`] if no gap fits.
    pub fn reserve(
        &self,
        size: u64,
        kind: AreaKind,
        start: VirtualAddress,
        end: VirtualAddress,
    ) -> Result<VmAreaInfo, VmallocError> {
        VmallocConfig {
            start,
            end,
            ..self.config
        }
        .validate::<B::Layout>()?;
        self.reserve_unchecked(size, kind, start, end)
    }

    /// Reserve `size` bytes (plus a guard page) in the vmalloc window.
    ///
    /// # Errors
    /// As [`Vmalloc::reserve`].
    pub fn get_vm_area(&self, size: u64, kind: AreaKind) -> Result<VmAreaInfo, VmallocError> {
        self.reserve_unchecked(size, kind, self.config.start, self.config.end)
    }

    fn reserve_unchecked(
        &self,
        size: u64,
        kind: AreaKind,
        start: VirtualAddress,
        end: VirtualAddress,
    ) -> Result<VmAreaInfo, VmallocError> {
        let info = self
            .areas
            .with_write(|list| list.reserve(size, kind, start, end))?;
        self.counters.reserved();
        Ok(info)
    }

    /// Unlink the area based at `addr`, leaving its page-table entries alone.
    ///
    /// The range is free for reuse when this returns.
    ///
    /// # Errors
    /// [`VmallocError::NotFound`] if no area starts at `addr`.
    pub fn release(&self, addr: VirtualAddress) -> Result<VmArea, VmallocError> {
        let area = self.areas.with_write(|list| list.release(addr))?;
        self.counters.released();
        Ok(area)
    }

    /// Unlink the area based at `addr` and clear its mappings.
    ///
    /// Owned pages are not freed; they travel with the returned record.
    ///
    /// # Errors
    /// [`VmallocError::NotFound`] if no area starts at `addr`.
    pub fn remove_vm_area(&self, addr: VirtualAddress) -> Result<VmArea, VmallocError> {
        let area = self.release(addr)?;
        self.depopulate(area.addr(), area.usable_size());
        Ok(area)
    }

    /// Copy bytes starting at `addr` into `buf` (`vread`).
    ///
    /// Bytes outside every usable range, and bytes of pages with no mapping,
    /// read as zero. Stops at the end of the last area's usable range and
    /// returns the number of bytes produced.
    pub fn read_through(&self, buf: &mut [u8], addr: VirtualAddress) -> usize {
        self.areas.with_read(|list| {
            list.read_through(buf, addr, |va, chunk| self.read_mapped(va, chunk))
        })
    }

    /// Copy `buf` to the areas starting at `addr` (`vwrite`).
    ///
    /// Bytes outside every usable range, and bytes of pages with no mapping,
    /// are dropped. Returns the number of bytes consumed from `buf`.
    pub fn write_through(&self, addr: VirtualAddress, buf: &[u8]) -> usize {
        self.areas.with_read(|list| {
            list.write_through(addr, buf, |va, chunk| self.write_mapped(va, chunk))
        })
    }

    /// Map `pages` at a fresh virtually contiguous range.
    ///
    /// The pages stay the caller's; tearing the mapping down with
    /// [`Vmalloc::vunmap`] leaves them untouched.
    ///
    /// # Errors
    /// - [`VmallocError::InvalidSize`] for an empty or oversized page array.
    /// - [`VmallocError::OutOfSpace`] if the window is full.
    /// - [`VmallocError::OutOfMemory`] if a page table could not be allocated;
    ///   nothing stays reserved or mapped.
    pub fn map_fixed_pages(
        &self,
        pages: &[PhysicalPage],
        kind: AreaKind,
        prot: Protection,
    ) -> Result<VirtualAddress, VmallocError> {
        let count = pages.len() as u64;
        if count > self.pages.total_pages() {
            return Err(VmallocError::InvalidSize);
        }
        let area = self.get_vm_area(count * PAGE_SIZE, kind)?;

        if let Err(err) = self.populate(area.addr, count * PAGE_SIZE, prot, pages.iter().copied()) {
            self.counters.map_failed();
            if let Ok(area) = self.release(area.addr) {
                self.depopulate(area.addr(), area.usable_size());
            }
            return Err(err.into());
        }
        Ok(area.addr)
    }

    /// Allocate `size` bytes of virtually contiguous memory backed by fresh
    /// pages, mapped with `prot`.
    ///
    /// # Errors
    /// - [`VmallocError::InvalidSize`] for a zero size or more pages than
    ///   the system has.
    /// - [`VmallocError::OutOfSpace`] if the window is full.
    /// - [`VmallocError::OutOfMemory`] if pages or page tables ran out. The
    ///   request is fully unwound: every acquired page is returned and the
    ///   range is released.
    pub fn allocate_and_map(
        &self,
        size: u64,
        flags: AllocFlags,
        prot: Protection,
    ) -> Result<VirtualAddress, VmallocError> {
        let count = pages_for(size)
            .filter(|&n| n != 0)
            .ok_or(VmallocError::InvalidSize)?;
        if count > self.pages.total_pages() {
            log::warn!("vmalloc of {size:#x} bytes exceeds physical memory");
            return Err(VmallocError::InvalidSize);
        }
        let wanted = usize::try_from(count).map_err(|_| VmallocError::InvalidSize)?;
        let area = self.get_vm_area(count * PAGE_SIZE, AreaKind::Alloc)?;

        let (pages, complete) = match acquire_pages(&self.pages, wanted, flags) {
            Ok(pages) => (pages, true),
            Err(partial) => {
                log::warn!("vmalloc of {size:#x} bytes at {}: {partial}", area.addr);
                (partial.acquired, false)
            }
        };

        // map whatever was obtained, so the unwind below covers the same range
        let mapped = pages.len() as u64 * PAGE_SIZE;
        let populated = self.populate(area.addr, mapped, prot, pages.iter().copied());

        let pages = match populated {
            Ok(()) if complete => {
                let attached = self
                    .areas
                    .with_write(|list| list.attach_pages(area.addr, pages));
                if attached.is_ok() {
                    return Ok(area.addr);
                }
                // whoever unlinked the area tore it down and freed what it found bound
                log::error!("vm area {} vanished while being populated", area.addr);
                let unbound = self.depopulate(area.addr, area.usable_size());
                release_pages(&self.pages, unbound);
                self.counters.map_failed();
                return Err(VmallocError::NotFound(area.addr));
            }
            _ => pages,
        };

        self.counters.map_failed();
        self.depopulate(area.addr, area.usable_size());
        let freed = release_pages(&self.pages, pages);
        if self.release(area.addr).is_err() {
            log::error!("vm area {} vanished while being unwound", area.addr);
        }
        log::debug!("unwound vmalloc at {}: {freed} pages returned", area.addr);

        Err(populated.err().map_or(VmallocError::OutOfMemory, VmallocError::from))
    }

    /// Tear down the mapping at `addr`.
    ///
    /// With `also_free_pages`, every page the mapping bound is returned to
    /// the page source.
    ///
    /// # Errors
    /// - [`VmallocError::BadAddress`] if `addr` is not page aligned.
    /// - [`VmallocError::NotFound`] if no area starts at `addr`.
    ///
    /// Either error is logged and leaves all state untouched.
    pub fn unmap(&self, addr: VirtualAddress, also_free_pages: bool) -> Result<(), VmallocError> {
        let teardown = if also_free_pages {
            Teardown::FreePages
        } else {
            Teardown::KeepPages
        };
        self.teardown(addr, teardown).map(drop)
    }

    /// Tear down the mapping at `addr`, freeing its pages if the area owns
    /// them ([`AreaKind::Alloc`]).
    ///
    /// # Errors
    /// As [`Vmalloc::unmap`].
    pub fn free_mapping(&self, addr: VirtualAddress) -> Result<(), VmallocError> {
        self.teardown(addr, Teardown::ByKind).map(drop)
    }

    /// Kernel read/write allocation.
    ///
    /// # Errors
    /// As [`Vmalloc::allocate_and_map`].
    pub fn vmalloc(&self, size: u64) -> Result<VirtualAddress, VmallocError> {
        self.allocate_and_map(size, AllocFlags::KERNEL, Protection::KERNEL)
    }

    /// Allocation backed by 32-bit addressable pages.
    ///
    /// # Errors
    /// As [`Vmalloc::allocate_and_map`].
    pub fn vmalloc_32(&self, size: u64) -> Result<VirtualAddress, VmallocError> {
        self.allocate_and_map(size, AllocFlags::DMA32, Protection::KERNEL)
    }

    /// Executable allocation (module text).
    ///
    /// # Errors
    /// As [`Vmalloc::allocate_and_map`].
    pub fn vmalloc_exec(&self, size: u64) -> Result<VirtualAddress, VmallocError> {
        self.allocate_and_map(size, AllocFlags::KERNEL, Protection::KERNEL_EXEC)
    }

    /// Map caller pages contiguously.
    ///
    /// # Errors
    /// As [`Vmalloc::map_fixed_pages`].
    pub fn vmap(
        &self,
        pages: &[PhysicalPage],
        prot: Protection,
    ) -> Result<VirtualAddress, VmallocError> {
        self.map_fixed_pages(pages, AreaKind::Map, prot)
    }

    /// Free memory from [`Vmalloc::vmalloc`]. A null address is ignored.
    ///
    /// # Errors
    /// As [`Vmalloc::unmap`].
    pub fn vfree(&self, addr: VirtualAddress) -> Result<(), VmallocError> {
        if addr.is_null() {
            return Ok(());
        }
        self.unmap(addr, true)
    }

    /// Undo [`Vmalloc::vmap`]; the pages are left alone.
    ///
    /// # Errors
    /// As [`Vmalloc::unmap`].
    pub fn vunmap(&self, addr: VirtualAddress) -> Result<(), VmallocError> {
        self.unmap(addr, false)
    }

    /// Map `size` bytes of device memory at `phys` uncached.
    ///
    /// Returns the address of `phys` itself, i.e. including its offset into
    /// the first page.
    ///
    /// # Errors
    /// - [`VmallocError::InvalidSize`] for a zero size or a range wrapping
    ///   the physical address space.
    /// - [`VmallocError::OutOfSpace`] / [`VmallocError::OutOfMemory`] as for
    ///   [`Vmalloc::map_fixed_pages`].
    pub fn ioremap(&self, phys: PhysicalAddress, size: u64) -> Result<VirtualAddress, VmallocError> {
        let last = size
            .checked_sub(1)
            .and_then(|s| phys.as_u64().checked_add(s))
            .ok_or(VmallocError::InvalidSize)?;
        let offset = phys.as_u64() & (PAGE_SIZE - 1);
        let base = phys.as_u64() - offset;
        let span = last
            .checked_add(1)
            .and_then(|end| checked_align_up(end, PAGE_SIZE))
            .ok_or(VmallocError::InvalidSize)?
            - base;

        let area = self.areas.with_write(|list| {
            list.reserve_phys(
                span,
                PhysicalAddress::new(base),
                self.config.start,
                self.config.end,
            )
        })?;
        self.counters.reserved();

        let first = base >> PAGE_SHIFT;
        let frames = (first..first + span / PAGE_SIZE).map(PhysicalPage::from_pfn);
        if let Err(err) = self.populate(area.addr, span, Protection::KERNEL_NOCACHE, frames) {
            self.counters.map_failed();
            if let Ok(area) = self.release(area.addr) {
                self.depopulate(area.addr(), area.usable_size());
            }
            return Err(err.into());
        }
        Ok(area.addr + offset)
    }

    /// Undo [`Vmalloc::ioremap`]; accepts any address inside the first page.
    ///
    /// # Errors
    /// As [`Vmalloc::unmap`].
    pub fn iounmap(&self, addr: VirtualAddress) -> Result<(), VmallocError> {
        self.unmap(addr.page_base(), false)
    }

    /// Page mapped at `addr`, if any (`vmalloc_to_page`).
    #[must_use]
    pub fn vmalloc_to_page(&self, addr: VirtualAddress) -> Option<PhysicalPage> {
        self.translate(addr).map(|(page, _)| page)
    }

    /// Page and protection mapped at `addr`, if any.
    #[must_use]
    pub fn translate(&self, addr: VirtualAddress) -> Option<(PhysicalPage, Protection)> {
        walk::translate(&self.page_table, addr)
    }

    fn teardown(&self, addr: VirtualAddress, teardown: Teardown) -> Result<VmArea, VmallocError> {
        if !addr.is_page_aligned() {
            log::warn!("trying to free bad address ({addr})");
            return Err(VmallocError::BadAddress(addr));
        }
        let area = self.release(addr).inspect_err(|_| {
            log::warn!("trying to free nonexistent vm area ({addr})");
        })?;

        let unbound = self.depopulate(area.addr(), area.usable_size());
        let free = match teardown {
            Teardown::KeepPages => false,
            Teardown::FreePages => true,
            Teardown::ByKind => area.kind().owns_pages(),
        };
        if free {
            let freed = release_pages(&self.pages, unbound);
            log::debug!("freed {freed} pages of {:?} area {addr}", area.kind());
        }
        Ok(area)
    }

    fn populate(
        &self,
        addr: VirtualAddress,
        size: u64,
        prot: Protection,
        pages: impl IntoIterator<Item = PhysicalPage>,
    ) -> Result<(), PageTableError> {
        let mut pages = pages.into_iter();
        let report = walk::populate(&self.page_table, addr, size, prot, &mut pages)?;
        self.note(&report);
        Ok(())
    }

    fn depopulate(&self, addr: VirtualAddress, size: u64) -> Vec<PhysicalPage> {
        let out = walk::depopulate(&self.page_table, addr, size);
        self.note(&out.report);
        out.pages
    }

    fn note(&self, report: &WalkReport) {
        self.counters.violations(report.violations.len());
    }

    #[allow(clippy::cast_possible_truncation)]
    fn read_mapped(&self, va: VirtualAddress, chunk: &mut [u8]) {
        let offset = va.page_offset() as usize;
        let copied = self.translate(va).and_then(|(page, _)| {
            self.pages.with_page(page, |frame| {
                chunk.copy_from_slice(&frame[offset..offset + chunk.len()]);
            })
        });
        if copied.is_none() {
            chunk.fill(0);
        }
    }

    #[allow(clippy::cast_possible_truncation)]
    fn write_mapped(&self, va: VirtualAddress, chunk: &[u8]) {
        let offset = va.page_offset() as usize;
        if let Some((page, _)) = self.translate(va) {
            self.pages.with_page(page, |frame| {
                frame[offset..offset + chunk.len()].copy_from_slice(chunk);
            });
        }
    }
}
