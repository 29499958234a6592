//! # x86-64 Page Directory (PD / L2)
//!
//! - [`L2Index`]: index type for virtual-address bits `[29:21]`.
//! - [`PdEntry`]: a PD entry pointing to a page table.
//! - [`PageDirectory`]: 512 entries, 4 KiB-aligned.

use crate::page_table::{ENTRIES, MAX_FRAME_NUMBER};
use bitfield_struct::bitfield;
use kernel_memory_addresses::{PhysicalPage, VirtualAddress};

/// L2 **PDE**: pointer to a **PT** (2 MiB leaves are not used).
#[doc(alias = "PDE")]
#[bitfield(u64)]
pub struct PdEntry {
    /// Present (bit 0).
    pub present: bool,
    /// Writable (bit 1).
    pub writable: bool,
    /// User (bit 2).
    pub user: bool,
    /// Write-Through (bit 3).
    pub write_through: bool,
    /// Cache Disable (bit 4).
    pub cache_disable: bool,
    /// Accessed (bit 5).
    pub accessed: bool,
    #[bits(1)]
    __ignored: u8,
    #[bits(1)]
    __ps: u8,
    #[bits(1)]
    __global_ignored: u8,
    /// OS-available (bits 9..11).
    #[bits(3)]
    pub os_available_low: u8,
    /// Page table frame number (bits 12..47).
    #[bits(36)]
    frame_number: u64,
    #[bits(4)]
    __reserved: u8,
    /// OS-available (bits 52..62).
    #[bits(11)]
    pub os_available_high: u16,
    /// No-Execute (bit 63).
    pub no_execute: bool,
}

/// Index into the page directory (virtual-address bits `[29:21]`).
#[repr(transparent)]
#[derive(Copy, Clone, Debug, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct L2Index(u16);

/// The page directory.
#[doc(alias = "PD")]
#[repr(C, align(4096))]
pub struct PageDirectory {
    entries: [PdEntry; ENTRIES],
}

impl L2Index {
    #[inline]
    #[must_use]
    pub const fn from(va: VirtualAddress) -> Self {
        Self::new(((va.as_u64() >> 21) & 0x1FF) as u16)
    }

    #[inline]
    #[must_use]
    pub const fn new(v: u16) -> Self {
        debug_assert!(v < 512);
        Self(v)
    }

    #[inline]
    #[must_use]
    pub const fn as_usize(self) -> usize {
        self.0 as usize
    }
}

impl PdEntry {
    #[inline]
    #[must_use]
    pub const fn zero() -> Self {
        Self::new()
    }

    /// Present, writable, user-accessible link to the page table in `next`.
    #[inline]
    #[must_use]
    pub const fn link(next: PhysicalPage) -> Self {
        Self::new()
            .with_present(true)
            .with_writable(true)
            .with_user(true)
            .with_frame(next)
    }

    #[inline]
    #[must_use]
    pub const fn next_table(self) -> Option<PhysicalPage> {
        if self.present() {
            Some(self.frame())
        } else {
            None
        }
    }

    #[inline]
    #[must_use]
    pub const fn with_frame(self, frame: PhysicalPage) -> Self {
        debug_assert!(frame.frame_number() <= MAX_FRAME_NUMBER);
        self.with_frame_number(frame.frame_number())
    }

    #[inline]
    #[must_use]
    pub const fn frame(self) -> PhysicalPage {
        PhysicalPage::from_frame_number(self.frame_number())
    }
}

impl PageDirectory {
    #[inline]
    #[must_use]
    pub const fn zeroed() -> Self {
        Self {
            entries: [PdEntry::zero(); ENTRIES],
        }
    }

    #[inline]
    #[must_use]
    pub const fn get(&self, i: L2Index) -> PdEntry {
        self.entries[i.as_usize()]
    }

    #[inline]
    pub const fn set(&mut self, i: L2Index, e: PdEntry) {
        self.entries[i.as_usize()] = e;
    }

    #[inline]
    #[must_use]
    pub const fn index_of(va: VirtualAddress) -> L2Index {
        L2Index::from(va)
    }
}
