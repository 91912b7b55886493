#![allow(clippy::cast_possible_truncation)]

use kernel_pgtable::{SoftPageTable, ThreeLevel};
use kernel_vmalloc::layout::{VMALLOC_END, VMALLOC_START};
use kernel_vmalloc::pages::release_pages;
use kernel_vmalloc::{
    AllocFlags, AreaKind, FramePool, PAGE_SIZE, PageAllocator, PhysMemory, PhysicalAddress,
    PhysicalPage, Protection, VirtualAddress, Vmalloc, VmallocConfig, VmallocError,
};

fn vm(frames: usize) -> Vmalloc<FramePool> {
    Vmalloc::with_pages(FramePool::new(frames))
}

fn window() -> (VirtualAddress, VirtualAddress) {
    (
        VirtualAddress::new(VMALLOC_START),
        VirtualAddress::new(VMALLOC_END),
    )
}

fn pattern(len: usize, seed: u8) -> Vec<u8> {
    (0..len)
        .map(|i| (i as u8).wrapping_mul(31).wrapping_add(seed))
        .collect()
}

#[test]
fn hello_through_a_three_page_allocation() {
    let vm = vm(64);
    let (start, end) = window();
    let reserved = vm
        .reserve(3 * PAGE_SIZE, AreaKind::Alloc, start, end)
        .unwrap();

    let a = vm
        .allocate_and_map(3 * PAGE_SIZE, AllocFlags::KERNEL, Protection::KERNEL)
        .unwrap();
    assert!(a.is_page_aligned());
    assert_ne!(a, reserved.addr);

    assert_eq!(vm.write_through(a, b"hello"), 5);
    let mut buf = [0u8; 5];
    assert_eq!(vm.read_through(&mut buf, a), 5);
    assert_eq!(&buf, b"hello");

    vm.unmap(a, true).unwrap();
    assert_eq!(vm.release(a).unwrap_err(), VmallocError::NotFound(a));
    // the bare reservation is still there
    assert_eq!(vm.areas(), [reserved]);
}

#[test]
fn zero_size_is_rejected_without_touching_the_list() {
    let vm = vm(16);
    vm.vmalloc(PAGE_SIZE).unwrap();
    let before = vm.area_count();

    assert_eq!(
        vm.allocate_and_map(0, AllocFlags::KERNEL, Protection::KERNEL),
        Err(VmallocError::InvalidSize)
    );
    assert_eq!(vm.vmap(&[], Protection::KERNEL), Err(VmallocError::InvalidSize));
    assert_eq!(vm.area_count(), before);
    assert_eq!(vm.page_source().stats().live, 1);
}

#[test]
fn round_trip_for_aligned_and_unaligned_sizes() {
    let vm = vm(64);
    for (i, size) in [PAGE_SIZE, 3 * PAGE_SIZE, 100, PAGE_SIZE + 1, 5 * PAGE_SIZE - 7]
        .into_iter()
        .enumerate()
    {
        let addr = vm.vmalloc(size).unwrap();
        let data = pattern(size as usize, i as u8);
        assert_eq!(vm.write_through(addr, &data), data.len());

        let mut back = vec![0u8; data.len()];
        assert_eq!(vm.read_through(&mut back, addr), back.len());
        assert_eq!(back, data, "size {size:#x}");

        let pages = size.div_ceil(PAGE_SIZE) as usize;
        assert_eq!(vm.find(addr).unwrap().page_count, pages);
    }
}

#[test]
fn unaligned_round_trip_at_an_offset() {
    let vm = vm(16);
    let addr = vm.vmalloc(3 * PAGE_SIZE).unwrap();
    let data = pattern(2 * PAGE_SIZE as usize, 9);
    let at = addr + 0x7FF;
    assert_eq!(vm.write_through(at, &data), data.len());
    let mut back = vec![0u8; data.len()];
    vm.read_through(&mut back, at);
    assert_eq!(back, data);
}

#[test]
fn guard_page_keeps_writes_out_of_the_next_area() {
    let vm = vm(16);
    let a = vm.vmalloc(PAGE_SIZE).unwrap();
    let b = vm.vmalloc(PAGE_SIZE).unwrap();
    assert_eq!(b, a + 2 * PAGE_SIZE);

    let head = pattern(64, 3);
    vm.write_through(b, &head);

    // one byte past the usable end of `a` is its guard page
    assert_eq!(vm.write_through(a + PAGE_SIZE, &[0xEE]), 1);
    // a long write from `a` runs through the guard and stops short of `b`
    vm.write_through(a, &vec![0xEE; 2 * PAGE_SIZE as usize]);

    let mut back = vec![0u8; 64];
    vm.read_through(&mut back, b);
    assert_eq!(back, head);

    let mut guard = [0xAAu8; 16];
    vm.read_through(&mut guard, a + PAGE_SIZE);
    assert_eq!(guard, [0; 16]);
    assert_eq!(vm.vmalloc_to_page(a + PAGE_SIZE), None);
}

#[test]
fn second_unmap_is_not_found_and_frees_nothing() {
    let vm = vm(16);
    let a = vm.vmalloc(2 * PAGE_SIZE).unwrap();
    assert_eq!(vm.page_source().stats().live, 2);

    vm.unmap(a, true).unwrap();
    let after_first = vm.page_source().stats();
    assert_eq!(after_first.live, 0);
    assert_eq!(after_first.frees, 2);

    assert_eq!(vm.unmap(a, true), Err(VmallocError::NotFound(a)));
    assert_eq!(vm.vfree(a), Err(VmallocError::NotFound(a)));
    let after_second = vm.page_source().stats();
    assert_eq!(after_second, after_first);
    assert_eq!(after_second.bad_frees, 0);
}

#[test]
fn page_exhaustion_part_way_is_fully_unwound() {
    let vm = vm(64);
    vm.page_source().set_alloc_budget(Some(3));

    assert_eq!(vm.vmalloc(5 * PAGE_SIZE), Err(VmallocError::OutOfMemory));

    let pool = vm.page_source().stats();
    assert_eq!(pool.allocations, 3);
    assert_eq!(pool.frees, 3);
    assert_eq!(pool.live, 0);
    assert_eq!(vm.area_count(), 0);
    assert_eq!(vm.page_table().present_leaves(), 0);
    assert_eq!(vm.stats().failed_maps, 1);

    // the very range that was attempted is free again
    let again = vm.get_vm_area(5 * PAGE_SIZE, AreaKind::Alloc).unwrap();
    assert_eq!(again.addr, VirtualAddress::new(VMALLOC_START));
}

#[test]
fn page_table_exhaustion_is_fully_unwound() {
    let pool = FramePool::new(16);
    let vm = Vmalloc::new(
        VmallocConfig::default(),
        SoftPageTable::<ThreeLevel>::with_table_budget(1),
        pool,
    )
    .unwrap();

    // needs a middle and a leaf table; only one can be had
    assert_eq!(vm.vmalloc(PAGE_SIZE), Err(VmallocError::OutOfMemory));
    assert_eq!(vm.page_source().stats().live, 0);
    assert_eq!(vm.area_count(), 0);

    let page = vm.page_source().alloc_page(AllocFlags::KERNEL).unwrap();
    assert_eq!(vm.vmap(&[page], Protection::KERNEL), Err(VmallocError::OutOfMemory));
    assert_eq!(vm.area_count(), 0);
    assert!(vm.page_source().is_allocated(page));
}

/// Pages covered by one leaf table on the three-level layout.
const LEAF_SPAN_PAGES: usize = 512;

fn table_limited(frames: usize, tables: usize) -> Vmalloc<FramePool, SoftPageTable<ThreeLevel>> {
    Vmalloc::new(
        VmallocConfig::default(),
        SoftPageTable::<ThreeLevel>::with_table_budget(tables),
        FramePool::new(frames),
    )
    .unwrap()
}

#[test]
fn vmap_failing_on_the_second_leaf_table_clears_the_first() {
    // a middle table and the first leaf table; the second leaf table is refused
    let vm = table_limited(LEAF_SPAN_PAGES + 8, 2);
    let pool = vm.page_source();
    let pages: Vec<PhysicalPage> = (0..=LEAF_SPAN_PAGES)
        .map(|_| pool.alloc_page(AllocFlags::KERNEL).unwrap())
        .collect();

    assert_eq!(vm.vmap(&pages, Protection::KERNEL), Err(VmallocError::OutOfMemory));

    let pt = vm.page_table();
    assert_eq!(pt.tables_allocated(), 2);
    assert_eq!(pt.present_leaves(), 0);
    assert_eq!(vm.area_count(), 0);
    assert_eq!(vm.stats().failed_maps, 1);
    assert!(pages.iter().all(|&page| pool.is_allocated(page)));
    assert_eq!(pool.stats().frees, 0);
}

#[test]
fn ioremap_failing_on_the_second_leaf_table_clears_the_first() {
    let vm = table_limited(4, 2);
    let span = (LEAF_SPAN_PAGES as u64 + 1) * PAGE_SIZE;

    assert_eq!(
        vm.ioremap(PhysicalAddress::new(0xfe00_0000), span),
        Err(VmallocError::OutOfMemory)
    );
    assert_eq!(vm.page_table().present_leaves(), 0);
    assert_eq!(vm.area_count(), 0);

    // the tables that did get allocated serve a mapping that fits them
    let addr = vm.ioremap(PhysicalAddress::new(0xfe00_0000), PAGE_SIZE).unwrap();
    assert_eq!(vm.vmalloc_to_page(addr), Some(PhysicalPage::from_pfn(0xfe000)));
    vm.iounmap(addr).unwrap();
}

#[test]
fn fixed_pages_stay_with_the_caller() {
    let vm = vm(16);
    let pool = vm.page_source();
    let pages: Vec<PhysicalPage> = (0..3)
        .map(|i| {
            let page = pool.alloc_page(AllocFlags::KERNEL).unwrap();
            pool.with_page(page, |frame| frame.fill(0x10 + i)).unwrap();
            page
        })
        .collect();

    let addr = vm.vmap(&pages, Protection::KERNEL_RO).unwrap();
    let mut buf = vec![0u8; 3 * PAGE_SIZE as usize];
    assert_eq!(vm.read_through(&mut buf, addr), buf.len());
    for (i, chunk) in buf.chunks(PAGE_SIZE as usize).enumerate() {
        assert!(chunk.iter().all(|&b| usize::from(b) == 0x10 + i));
    }
    assert_eq!(vm.translate(addr + PAGE_SIZE), Some((pages[1], Protection::KERNEL_RO)));

    vm.vunmap(addr).unwrap();
    assert_eq!(vm.vmalloc_to_page(addr), None);
    assert_eq!(pool.stats().frees, 0);
    for (i, page) in pages.iter().enumerate() {
        assert!(pool.is_allocated(*page));
        let first = pool.with_page(*page, |frame| frame[0]).unwrap();
        assert_eq!(usize::from(first), 0x10 + i);
    }
}

#[test]
fn free_mapping_frees_only_owned_pages() {
    let vm = vm(16);
    let owned = vm.vmalloc(2 * PAGE_SIZE).unwrap();
    let page = vm.page_source().alloc_page(AllocFlags::KERNEL).unwrap();
    let mapped = vm.vmap(&[page], Protection::KERNEL).unwrap();
    assert_eq!(vm.page_source().stats().live, 3);

    vm.free_mapping(owned).unwrap();
    assert_eq!(vm.page_source().stats().live, 1);
    vm.free_mapping(mapped).unwrap();
    assert!(vm.page_source().is_allocated(page));
    assert_eq!(vm.area_count(), 0);
}

#[test]
fn misaligned_teardown_is_a_logged_no_op() {
    let vm = vm(16);
    let a = vm.vmalloc(PAGE_SIZE).unwrap();
    let bad = a + 0x10;

    assert_eq!(vm.unmap(bad, true), Err(VmallocError::BadAddress(bad)));
    assert_eq!(vm.vfree(bad), Err(VmallocError::BadAddress(bad)));
    assert!(vm.find(a).is_some());
    assert!(vm.vmalloc_to_page(a).is_some());
    assert_eq!(vm.page_source().stats().live, 1);
}

#[test]
fn null_vfree_is_ignored() {
    let vm = vm(4);
    assert_eq!(vm.vfree(VirtualAddress::zero()), Ok(()));
}

#[test]
fn requests_larger_than_memory_are_invalid() {
    let vm = vm(8);
    assert_eq!(vm.vmalloc(9 * PAGE_SIZE), Err(VmallocError::InvalidSize));
    assert_eq!(vm.vmalloc(u64::MAX), Err(VmallocError::InvalidSize));

    let pages: Vec<_> = (0..9).map(PhysicalPage::from_pfn).collect();
    assert_eq!(vm.vmap(&pages, Protection::KERNEL), Err(VmallocError::InvalidSize));
    assert_eq!(vm.area_count(), 0);
}

#[test]
fn full_window_is_out_of_space() {
    let start = VirtualAddress::new(VMALLOC_START);
    let config = VmallocConfig::with_window(start, start + 4 * PAGE_SIZE);
    let vm = Vmalloc::new(config, SoftPageTable::<ThreeLevel>::new(), FramePool::new(16)).unwrap();

    let a = vm.vmalloc(3 * PAGE_SIZE).unwrap();
    assert_eq!(a, start);
    assert_eq!(vm.vmalloc(PAGE_SIZE), Err(VmallocError::OutOfSpace));
    // no pages were taken for the failed request
    assert_eq!(vm.page_source().stats().live, 3);

    vm.vfree(a).unwrap();
    assert_eq!(vm.vmalloc(PAGE_SIZE), Ok(start));
}

#[test]
fn explicit_windows_are_validated() {
    let vm = vm(4);
    let (start, _) = window();
    assert!(matches!(
        vm.reserve(PAGE_SIZE, AreaKind::Map, start, start),
        Err(VmallocError::InvalidWindow { .. })
    ));
    assert!(matches!(
        Vmalloc::new(
            VmallocConfig::with_window(start + 1, start + PAGE_SIZE),
            SoftPageTable::<ThreeLevel>::new(),
            FramePool::new(4),
        ),
        Err(VmallocError::InvalidWindow { .. })
    ));
}

#[test]
fn exec_allocation_maps_executable_pages() {
    let vm = vm(16);
    let a = vm.vmalloc_exec(2 * PAGE_SIZE).unwrap();
    let info = vm.find(a).unwrap();
    assert_eq!(info.kind, AreaKind::Alloc);
    assert_eq!(info.page_count, 2);
    assert_eq!(info.usable_size(), 2 * PAGE_SIZE);

    let (first, prot) = vm.translate(a).unwrap();
    assert_eq!(prot, Protection::KERNEL_EXEC);
    let second = vm.vmalloc_to_page(a + PAGE_SIZE + 5).unwrap();
    assert_ne!(first, second);
    assert_eq!(vm.containing(a + PAGE_SIZE + 5), Some(info));
    assert_eq!(vm.containing(a + 2 * PAGE_SIZE), None);
}

#[test]
fn vmalloc_32_uses_the_low_zone() {
    let vm = Vmalloc::with_pages(FramePool::new(16).with_dma32_frames(2));
    let a = vm.vmalloc_32(2 * PAGE_SIZE).unwrap();
    for offset in [0, PAGE_SIZE] {
        let page = vm.vmalloc_to_page(a + offset).unwrap();
        assert!(vm.page_source().is_dma32(page));
    }
    assert_eq!(vm.vmalloc_32(PAGE_SIZE), Err(VmallocError::OutOfMemory));
    assert!(vm.vmalloc(PAGE_SIZE).is_ok());
}

#[test]
fn ioremap_maps_device_frames_uncached() {
    let vm = vm(4);
    let phys = PhysicalAddress::new(0xFEB0_0123);
    let addr = vm.ioremap(phys, 0x20).unwrap();
    assert_eq!(addr.page_offset(), 0x123);

    let (page, prot) = vm.translate(addr).unwrap();
    assert_eq!(page, PhysicalPage::from_pfn(0xFEB00));
    assert_eq!(prot, Protection::KERNEL_NOCACHE);

    let info = vm.containing(addr).unwrap();
    assert_eq!(info.kind, AreaKind::IoRemap);
    assert_eq!(info.phys_addr, Some(PhysicalAddress::new(0xFEB0_0000)));
    assert_eq!(info.usable_size(), PAGE_SIZE);

    // device memory is not behind the frame pool: reads come back as zero
    let mut buf = [0xAAu8; 4];
    assert_eq!(vm.read_through(&mut buf, addr), 4);
    assert_eq!(buf, [0; 4]);

    vm.iounmap(addr).unwrap();
    assert_eq!(vm.area_count(), 0);
    assert_eq!(vm.ioremap(phys, 0), Err(VmallocError::InvalidSize));
}

#[test]
fn remove_vm_area_hands_the_pages_back() {
    let vm = vm(16);
    let a = vm.vmalloc(2 * PAGE_SIZE).unwrap();
    let area = vm.remove_vm_area(a).unwrap();
    assert_eq!(area.addr(), a);
    assert_eq!(area.page_count(), 2);
    assert_eq!(vm.vmalloc_to_page(a), None);

    let pool = vm.page_source();
    assert!(area.pages().iter().all(|p| pool.is_allocated(*p)));
    assert_eq!(release_pages(pool, area.into_pages()), 2);
    assert_eq!(pool.stats().live, 0);
}

#[test]
fn cache_and_tlb_hooks_bracket_each_mapping() {
    let vm = vm(16);
    let a = vm.vmalloc(3 * PAGE_SIZE).unwrap();
    let mapped = vm.page_table().flushes();
    assert_eq!(mapped.cache_vmap, 1);
    assert_eq!(mapped.tlb_kernel_range, 0);

    vm.vfree(a).unwrap();
    let unmapped = vm.page_table().flushes();
    assert_eq!(unmapped.cache_vunmap, 1);
    assert_eq!(unmapped.tlb_kernel_range, 1);
}

#[test]
fn stats_track_live_areas() {
    let vm = vm(16);
    let a = vm.vmalloc(2 * PAGE_SIZE).unwrap();
    vm.get_vm_area(PAGE_SIZE, AreaKind::IoRemap).unwrap();

    let stats = vm.stats();
    assert_eq!(stats.areas, 2);
    assert_eq!(stats.owned_pages, 2);
    assert_eq!(stats.reserved_bytes, 5 * PAGE_SIZE);
    assert_eq!(stats.usable_bytes(), 3 * PAGE_SIZE);
    assert_eq!(stats.reservations, 2);

    vm.vfree(a).unwrap();
    let stats = vm.stats();
    assert_eq!(stats.areas, 1);
    assert_eq!(stats.releases, 1);
    assert_eq!(stats.consistency_violations, 0);
}
