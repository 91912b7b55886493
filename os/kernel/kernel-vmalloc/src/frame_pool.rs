//! # Frame Pool
//!
//! A fixed pool of 4 KiB frames held in ordinary memory, tracked with one bit
//! per frame. It implements both [`PageAllocator`] and [`PhysMemory`] and is
//! what the allocator runs on when there is no real physical memory manager
//! underneath (hosted builds, tests).
//!
//! ```text
//! pfn:    BASE_PFN ... BASE_PFN + dma32 ... BASE_PFN + frames
//!         ├── DMA32 zone ──┤
//!         normal allocations are served from the top down
//! ```
//!
//! An optional allocation budget makes the pool fail after a given number of
//! successful allocations, to simulate memory pressure.

use crate::pages::{AllocFlags, PageAllocator, PageFrame, PhysMemory};
use alloc::boxed::Box;
use alloc::vec;
use alloc::vec::Vec;
use kernel_pgtable::{PAGE_SIZE, PhysicalPage};
use kernel_sync::SpinLock;

/// Frame number of the pool's first frame (1 MiB).
pub const BASE_PFN: u64 = 0x100;

#[allow(clippy::cast_possible_truncation)]
const FRAME_BYTES: usize = PAGE_SIZE as usize;

/// Allocation counters of a [`FramePool`].
#[derive(Debug, Default, Copy, Clone, Eq, PartialEq)]
pub struct PoolStats {
    /// Frames currently handed out.
    pub live: usize,
    pub allocations: u64,
    pub frees: u64,
    /// Allocation requests that could not be served.
    pub failures: u64,
    /// Frees of frames that were not allocated (double or foreign frees).
    pub bad_frees: u64,
}

struct PoolState {
    used: Vec<u64>,
    memory: Vec<Box<PageFrame>>,
    budget: Option<usize>,
    stats: PoolStats,
}

impl PoolState {
    fn is_used(&self, index: usize) -> bool {
        self.used[index / 64] & (1 << (index % 64)) != 0
    }

    fn set_used(&mut self, index: usize, used: bool) {
        let bit = 1 << (index % 64);
        if used {
            self.used[index / 64] |= bit;
        } else {
            self.used[index / 64] &= !bit;
        }
    }

    fn frame_mut(&mut self, index: usize) -> &mut PageFrame {
        &mut self.memory[index]
    }
}

pub struct FramePool {
    frames: usize,
    dma32_frames: usize,
    state: SpinLock<PoolState>,
}

impl FramePool {
    /// A pool of `frames` zeroed frames, all of them in the DMA32 zone.
    #[must_use]
    pub fn new(frames: usize) -> Self {
        Self {
            frames,
            dma32_frames: frames,
            state: SpinLock::new(PoolState {
                used: vec![0; frames.div_ceil(64)],
                memory: (0..frames).map(|_| Box::new([0; FRAME_BYTES])).collect(),
                budget: None,
                stats: PoolStats::default(),
            }),
        }
    }

    /// Restrict the DMA32 zone to the lowest `frames` frames.
    #[must_use]
    pub fn with_dma32_frames(mut self, frames: usize) -> Self {
        self.dma32_frames = frames.min(self.frames);
        self
    }

    /// Allow at most `allocations` more successful allocations; `None` lifts the limit.
    pub fn set_alloc_budget(&self, allocations: Option<usize>) {
        self.state.with_lock(|s| s.budget = allocations);
    }

    #[must_use]
    pub fn stats(&self) -> PoolStats {
        self.state.with_lock(|s| s.stats)
    }

    /// Whether `page` is currently handed out.
    #[must_use]
    pub fn is_allocated(&self, page: PhysicalPage) -> bool {
        self.index(page)
            .is_some_and(|i| self.state.with_lock(|s| s.is_used(i)))
    }

    /// Whether `page` lies in the DMA32 zone.
    #[must_use]
    pub fn is_dma32(&self, page: PhysicalPage) -> bool {
        self.index(page).is_some_and(|i| i < self.dma32_frames)
    }

    fn index(&self, page: PhysicalPage) -> Option<usize> {
        let index = usize::try_from(page.pfn().checked_sub(BASE_PFN)?).ok()?;
        (index < self.frames).then_some(index)
    }

    fn page(index: usize) -> PhysicalPage {
        PhysicalPage::from_pfn(BASE_PFN + index as u64)
    }
}

impl PageAllocator for FramePool {
    fn alloc_page(&self, flags: AllocFlags) -> Option<PhysicalPage> {
        let page = self.state.with_lock(|s| {
            if s.budget == Some(0) {
                s.stats.failures += 1;
                return None;
            }
            let found = if flags.dma32() {
                (0..self.dma32_frames).find(|&i| !s.is_used(i))
            } else {
                (0..self.frames).rev().find(|&i| !s.is_used(i))
            };
            let Some(index) = found else {
                s.stats.failures += 1;
                return None;
            };

            s.set_used(index, true);
            if let Some(left) = &mut s.budget {
                *left -= 1;
            }
            if flags.zero() {
                s.frame_mut(index).fill(0);
            }
            s.stats.live += 1;
            s.stats.allocations += 1;
            Some(Self::page(index))
        });

        if page.is_none() {
            log::debug!("frame pool exhausted ({flags:?})");
        }
        page
    }

    fn free_page(&self, page: PhysicalPage) {
        let index = self.index(page);
        let freed = self.state.with_lock(|s| match index {
            Some(index) if s.is_used(index) => {
                s.set_used(index, false);
                s.stats.live -= 1;
                s.stats.frees += 1;
                true
            }
            _ => {
                s.stats.bad_frees += 1;
                false
            }
        });
        if !freed {
            log::error!("freeing frame {page} that is not allocated from this pool");
        }
    }

    fn total_pages(&self) -> u64 {
        self.frames as u64
    }
}

impl PhysMemory for FramePool {
    fn with_page<R>(&self, page: PhysicalPage, f: impl FnOnce(&mut PageFrame) -> R) -> Option<R> {
        let index = self.index(page)?;
        Some(self.state.with_lock(|s| f(s.frame_mut(index))))
    }
}
