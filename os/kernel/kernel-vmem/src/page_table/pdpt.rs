//! # x86-64 Page Directory Pointer Table (PDPT / L3)
//!
//! - [`L3Index`]: index type for virtual-address bits `[38:30]`.
//! - [`PdptEntry`]: a PDPT entry pointing to a page directory.
//! - [`PageDirectoryPointerTable`]: 512 entries, 4 KiB-aligned.
//!
//! 1 GiB leaves (`PS=1`) are never created by this kernel; every present
//! PDPTE links to a page directory.

use crate::page_table::{ENTRIES, MAX_FRAME_NUMBER};
use bitfield_struct::bitfield;
use kernel_memory_addresses::{PhysicalPage, VirtualAddress};

/// L3 **PDPTE**: pointer to a **PD**.
#[doc(alias = "PDPTE")]
#[bitfield(u64)]
pub struct PdptEntry {
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
    /// Bit 6: ignored in non-leaf entries.
    #[bits(1)]
    __ignored: u8,
    /// Bit 7: PS. Kept 0, no 1 GiB pages.
    #[bits(1)]
    __ps: u8,
    /// Bit 8: ignored in non-leaf entries.
    #[bits(1)]
    __global_ignored: u8,
    /// OS-available (bits 9..11).
    #[bits(3)]
    pub os_available_low: u8,
    /// Page directory frame number (bits 12..47).
    #[bits(36)]
    frame_number: u64,
    /// Bits 48..51: reserved.
    #[bits(4)]
    __reserved: u8,
    /// OS-available (bits 52..62).
    #[bits(11)]
    pub os_available_high: u16,
    /// No-Execute (bit 63).
    pub no_execute: bool,
}

/// Index into the PDPT (virtual-address bits `[38:30]`).
#[repr(transparent)]
#[derive(Copy, Clone, Debug, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct L3Index(u16);

/// The page directory pointer table.
#[doc(alias = "PDPT")]
#[repr(C, align(4096))]
pub struct PageDirectoryPointerTable {
    entries: [PdptEntry; ENTRIES],
}

impl L3Index {
    #[inline]
    #[must_use]
    pub const fn from(va: VirtualAddress) -> Self {
        Self::new(((va.as_u64() >> 30) & 0x1FF) as u16)
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

impl PdptEntry {
    #[inline]
    #[must_use]
    pub const fn zero() -> Self {
        Self::new()
    }

    /// Present, writable, user-accessible link to the directory in `next`.
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

impl PageDirectoryPointerTable {
    #[inline]
    #[must_use]
    pub const fn zeroed() -> Self {
        Self {
            entries: [PdptEntry::zero(); ENTRIES],
        }
    }

    #[inline]
    #[must_use]
    pub const fn get(&self, i: L3Index) -> PdptEntry {
        self.entries[i.as_usize()]
    }

    #[inline]
    pub const fn set(&mut self, i: L3Index, e: PdptEntry) {
        self.entries[i.as_usize()] = e;
    }

    #[inline]
    #[must_use]
    pub const fn index_of(va: VirtualAddress) -> L3Index {
        L3Index::from(va)
    }
}
