//! # Leaf entries and protection modes
//!
//! [`Protection`] is what a caller asks for ("kernel read/write", "kernel
//! executable", "uncached I/O"). [`LeafEntry`] is what ends up in a leaf
//! table slot: the frame number plus the hardware bits derived from the
//! protection.
//!
//! ### Leaf entry bit layout
//!
//! | Bits   | Field              |
//! |--------|--------------------|
//! | 0      | present            |
//! | 1      | writable           |
//! | 2      | user               |
//! | 3      | write-through      |
//! | 4      | cache disabled     |
//! | 5      | accessed           |
//! | 6      | dirty              |
//! | 7      | (PAT, unused)      |
//! | 8      | global             |
//! | 9–11   | OS available       |
//! | 12–51  | frame number       |
//! | 52–62  | reserved           |
//! | 63     | no-execute         |

use crate::PhysicalPage;
use bitfield_struct::bitfield;

/// Protection mode requested for a mapping.
#[bitfield(u8)]
#[derive(PartialEq, Eq)]
pub struct Protection {
    /// Writes allowed.
    pub writable: bool,
    /// Instruction fetch allowed.
    pub executable: bool,
    /// Reachable from user mode.
    pub user: bool,
    /// Bypass the caches (device memory).
    pub cache_disabled: bool,
    /// Survives address-space switches in the TLB.
    pub global: bool,
    #[bits(3)]
    __: u8,
}

impl Protection {
    /// Kernel read/write, not executable (`PAGE_KERNEL`).
    pub const KERNEL: Self = Self::new().with_writable(true).with_global(true);

    /// Kernel read/write/execute (`PAGE_KERNEL_EXEC`).
    pub const KERNEL_EXEC: Self = Self::KERNEL.with_executable(true);

    /// Kernel read-only (`PAGE_KERNEL_RO`).
    pub const KERNEL_RO: Self = Self::new().with_global(true);

    /// Uncached kernel read/write, used for I/O remaps (`PAGE_KERNEL_NOCACHE`).
    pub const KERNEL_NOCACHE: Self = Self::KERNEL.with_cache_disabled(true);
}

/// A single leaf-table entry.
#[bitfield(u64)]
#[derive(PartialEq, Eq)]
pub struct LeafEntry {
    /// Present (bit 0).
    pub present: bool,
    /// Writable (bit 1).
    pub writable: bool,
    /// User (bit 2).
    pub user: bool,
    /// Write-through (bit 3).
    pub write_through: bool,
    /// Cache disabled (bit 4).
    pub cache_disabled: bool,
    /// Accessed (bit 5).
    pub accessed: bool,
    /// Dirty (bit 6).
    pub dirty: bool,
    #[bits(1)]
    __pat: u8,
    /// Global (bit 8).
    pub global: bool,
    /// OS available (bits 9..11).
    #[bits(3)]
    pub os_available: u8,
    /// Frame number (bits 12..51).
    #[bits(40)]
    frame: u64,
    #[bits(11)]
    __reserved: u16,
    /// No-execute (bit 63).
    pub no_execute: bool,
}

impl LeafEntry {
    /// An empty slot (`pte_none`).
    #[inline]
    #[must_use]
    pub const fn none() -> Self {
        Self::new()
    }

    /// A present entry mapping `page` with `prot` (`mk_pte`).
    #[inline]
    #[must_use]
    pub const fn make(page: PhysicalPage, prot: Protection) -> Self {
        Self::new()
            .with_present(true)
            .with_writable(prot.writable())
            .with_user(prot.user())
            .with_cache_disabled(prot.cache_disabled())
            .with_global(prot.global())
            .with_no_execute(!prot.executable())
            .with_frame(page.pfn())
    }

    /// `true` if no bit at all is set.
    #[inline]
    #[must_use]
    pub const fn is_none(self) -> bool {
        self.into_bits() == 0
    }

    /// The mapped frame, if the entry is present.
    #[inline]
    #[must_use]
    pub const fn page(self) -> Option<PhysicalPage> {
        if self.present() {
            Some(PhysicalPage::from_pfn(self.frame()))
        } else {
            None
        }
    }

    /// The protection this entry was built from.
    #[inline]
    #[must_use]
    pub const fn protection(self) -> Protection {
        Protection::new()
            .with_writable(self.writable())
            .with_executable(!self.no_execute())
            .with_user(self.user())
            .with_cache_disabled(self.cache_disabled())
            .with_global(self.global())
    }
}
