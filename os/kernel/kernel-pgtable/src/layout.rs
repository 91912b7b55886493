//! # Paging layouts
//!
//! A [`PagingLayout`] fixes how a virtual address splits into table indices.
//! Two shapes are provided:
//!
//! ```text
//! ThreeLevel (39-bit VA):
//! | 38‒30 | 29‒21  | 20‒12 | 11‒0   |
//! |  top  | middle |  leaf | offset |
//!
//! Folded (32-bit VA, middle folded into top):
//! | 31‒22 | 21‒12 | 11‒0   |
//! |  top  |  leaf | offset |
//! ```
//!
//! With a folded middle level, `MIDDLE_ENTRIES == 1`, `MIDDLE_SHIFT ==
//! TOP_SHIFT`, and the middle index is always zero.

use crate::addresses::{PAGE_SHIFT, VirtualAddress};

/// Index geometry of a page-table tree.
pub trait PagingLayout: Send + Sync + 'static {
    /// Human-readable name for logs.
    const NAME: &'static str;
    /// Bits of virtual address translated by the tree.
    const VA_BITS: u32;
    /// Shift of the span covered by one top entry.
    const TOP_SHIFT: u32;
    /// Shift of the span covered by one middle entry (one leaf table).
    const MIDDLE_SHIFT: u32;
    const TOP_ENTRIES: usize;
    /// `1` when the middle level is folded.
    const MIDDLE_ENTRIES: usize;
    const LEAF_ENTRIES: usize;

    /// Whether the middle level is folded into the top level.
    #[inline]
    #[must_use]
    fn is_folded() -> bool {
        Self::MIDDLE_ENTRIES == 1
    }

    #[inline]
    #[must_use]
    #[allow(clippy::cast_possible_truncation)]
    fn top_index(va: VirtualAddress) -> usize {
        ((va.as_u64() >> Self::TOP_SHIFT) as usize) & (Self::TOP_ENTRIES - 1)
    }

    #[inline]
    #[must_use]
    #[allow(clippy::cast_possible_truncation)]
    fn middle_index(va: VirtualAddress) -> usize {
        ((va.as_u64() >> Self::MIDDLE_SHIFT) as usize) & (Self::MIDDLE_ENTRIES - 1)
    }

    #[inline]
    #[must_use]
    #[allow(clippy::cast_possible_truncation)]
    fn leaf_index(va: VirtualAddress) -> usize {
        ((va.as_u64() >> PAGE_SHIFT) as usize) & (Self::LEAF_ENTRIES - 1)
    }

    /// End of the top-entry span containing `addr`, clamped to `end` (`pgd_addr_end`).
    #[inline]
    #[must_use]
    fn top_end(addr: VirtualAddress, end: VirtualAddress) -> VirtualAddress {
        span_end(addr, end, Self::TOP_SHIFT)
    }

    /// End of the middle-entry span containing `addr`, clamped to `end` (`pmd_addr_end`).
    #[inline]
    #[must_use]
    fn middle_end(addr: VirtualAddress, end: VirtualAddress) -> VirtualAddress {
        span_end(addr, end, Self::MIDDLE_SHIFT)
    }

    /// Whether `[start, end)` lies inside one translated span, so that no two
    /// addresses in it share table indices.
    #[inline]
    #[must_use]
    fn covers(start: VirtualAddress, end: VirtualAddress) -> bool {
        if end <= start {
            return false;
        }
        let last = end.as_u64() - 1;
        start.as_u64() >> Self::VA_BITS == last >> Self::VA_BITS
    }
}

#[inline]
fn span_end(addr: VirtualAddress, end: VirtualAddress, shift: u32) -> VirtualAddress {
    let span = 1u64 << shift;
    let boundary = (addr.as_u64() & !(span - 1)).checked_add(span);
    match boundary {
        // the boundary - 1 < end - 1 form survives an `end` of zero (wrapped top)
        Some(b) if b - 1 < end.as_u64().wrapping_sub(1) => VirtualAddress::new(b),
        _ => end,
    }
}

/// Three levels, 512 entries each, 4 KiB leaves (Sv39-like).
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct ThreeLevel;

impl PagingLayout for ThreeLevel {
    const NAME: &'static str = "three-level";
    const VA_BITS: u32 = 39;
    const TOP_SHIFT: u32 = 30;
    const MIDDLE_SHIFT: u32 = 21;
    const TOP_ENTRIES: usize = 512;
    const MIDDLE_ENTRIES: usize = 512;
    const LEAF_ENTRIES: usize = 512;
}

/// Two levels with the middle folded into the top (i386-like).
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct Folded;

impl PagingLayout for Folded {
    const NAME: &'static str = "folded";
    const VA_BITS: u32 = 32;
    const TOP_SHIFT: u32 = 22;
    const MIDDLE_SHIFT: u32 = 22;
    const TOP_ENTRIES: usize = 1024;
    const MIDDLE_ENTRIES: usize = 1;
    const LEAF_ENTRIES: usize = 1024;
}

/// Layout selected at build time.
#[cfg(not(feature = "folded-pmd"))]
pub type DefaultLayout = ThreeLevel;

/// Layout selected at build time.
#[cfg(feature = "folded-pmd")]
pub type DefaultLayout = Folded;

const _: () = {
    assert!(ThreeLevel::TOP_SHIFT + 9 == ThreeLevel::VA_BITS);
    assert!(ThreeLevel::MIDDLE_SHIFT + 9 == ThreeLevel::TOP_SHIFT);
    assert!(PAGE_SHIFT + 9 == ThreeLevel::MIDDLE_SHIFT);
    assert!(Folded::TOP_SHIFT + 10 == Folded::VA_BITS);
    assert!(PAGE_SHIFT + 10 == Folded::TOP_SHIFT);
};

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn three_level_indices() {
        let va = VirtualAddress::new((3 << 30) | (5 << 21) | (7 << 12) | 0x123);
        assert_eq!(ThreeLevel::top_index(va), 3);
        assert_eq!(ThreeLevel::middle_index(va), 5);
        assert_eq!(ThreeLevel::leaf_index(va), 7);
        assert!(!ThreeLevel::is_folded());
    }

    #[test]
    fn folded_middle_is_always_zero() {
        let va = VirtualAddress::new((9 << 22) | (1000 << 12));
        assert_eq!(Folded::top_index(va), 9);
        assert_eq!(Folded::middle_index(va), 0);
        assert_eq!(Folded::leaf_index(va), 1000);
        assert!(Folded::is_folded());
    }

    #[test]
    fn span_ends_clamp() {
        let start = VirtualAddress::new(0x1F_F000);
        let end = VirtualAddress::new(0x40_0000);
        assert_eq!(ThreeLevel::middle_end(start, end), VirtualAddress::new(0x20_0000));
        assert_eq!(ThreeLevel::top_end(start, end), end);

        // top of the address space: the next boundary would overflow
        let hi = VirtualAddress::new(u64::MAX & !0xFFF);
        assert_eq!(ThreeLevel::middle_end(hi, VirtualAddress::new(0)), VirtualAddress::new(0));
    }

    #[test]
    fn covers_single_span_only() {
        let base = 0xFFFF_FFD0_0000_0000;
        assert!(ThreeLevel::covers(
            VirtualAddress::new(base),
            VirtualAddress::new(base + (1 << 30))
        ));
        assert!(!Folded::covers(
            VirtualAddress::new(0xF000_0000),
            VirtualAddress::new(0x1_1000_0000)
        ));
        assert!(Folded::covers(
            VirtualAddress::new(0xF000_0000),
            VirtualAddress::new(0x1_0000_0000)
        ));
    }
}
