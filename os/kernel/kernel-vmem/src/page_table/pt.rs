//! # x86-64 Page Table (PT / L1)
//!
//! This module models the lowest paging level (L1, Page Table).
//!
//! - [`L1Index`]: index type for VA bits `[20:12]`.
//! - [`PtEntry`]: a PT entry (PTE); every present entry maps one 4 KiB page.
//! - [`PageTable`]: a 4 KiB-aligned array of 512 PTEs.
//!
//! ## Invariants & Notes
//!
//! - Unmapping clears `present` only. The frame number stays in the entry so
//!   the last translation can still be inspected.
//! - After modifying active mappings, the caller must invalidate the TLB entry.

use crate::page_table::{ENTRIES, MAX_FRAME_NUMBER, PageFlags};
use bitfield_struct::bitfield;
use kernel_memory_addresses::{PhysicalPage, VirtualAddress};

/// L1 **PTE**: maps one 4 KiB page.
#[doc(alias = "PTE")]
#[bitfield(u64)]
#[derive(Eq, PartialEq)]
pub struct PtEntry {
    /// **Present** (bit 0).
    pub present: bool,
    /// **Writable** (bit 1).
    pub writable: bool,
    /// **User/Supervisor** (bit 2).
    pub user: bool,
    /// **Page Write-Through** (bit 3).
    pub write_through: bool,
    /// **Page Cache Disable** (bit 4).
    pub cache_disable: bool,
    /// **Accessed** (bit 5): set by the CPU on access.
    pub accessed: bool,
    /// **Dirty** (bit 6): set by the CPU on first write.
    pub dirty: bool,
    /// **PAT** (bit 7): page attribute table selector.
    pub pat: bool,
    /// **Global** (bit 8): survives CR3 reloads when CR4.PGE is set.
    pub global: bool,
    /// OS-available (bits 9..11).
    #[bits(3)]
    pub os_available_low: u8,
    /// Mapped frame number (bits 12..47).
    #[bits(36)]
    frame_number: u64,
    /// Bits 48..51: reserved.
    #[bits(4)]
    __reserved: u8,
    /// OS-available (bits 52..62).
    #[bits(11)]
    pub os_available_high: u16,
    /// **No-Execute** (bit 63).
    pub no_execute: bool,
}

/// Index into the Page Table (derived from VA bits `[20:12]`).
#[repr(transparent)]
#[derive(Copy, Clone, Debug, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct L1Index(u16);

/// The Page Table (L1): 512 entries, 4 KiB-aligned.
#[doc(alias = "PT")]
#[repr(C, align(4096))]
pub struct PageTable {
    entries: [PtEntry; ENTRIES],
}

impl L1Index {
    /// Build an index from a virtual address (extracts bits `[20:12]`).
    #[inline]
    #[must_use]
    pub const fn from(va: VirtualAddress) -> Self {
        Self::new(((va.as_u64() >> 12) & 0x1FF) as u16)
    }

    /// ### Debug assertions
    /// - Asserts `v < 512` in debug builds.
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

impl PtEntry {
    /// Create a zero (non-present) entry.
    #[inline]
    #[must_use]
    pub const fn zero() -> Self {
        Self::new()
    }

    /// A present leaf mapping `frame` with `flags`.
    #[inline]
    #[must_use]
    pub const fn leaf(frame: PhysicalPage, flags: PageFlags) -> Self {
        Self::new()
            .with_present(true)
            .with_writable(flags.writable)
            .with_user(flags.user)
            .with_write_through(flags.write_through)
            .with_cache_disable(flags.cache_disable)
            .with_global(flags.global)
            .with_no_execute(flags.no_execute)
            .with_frame(frame)
    }

    /// The mapped frame, if present.
    #[inline]
    #[must_use]
    pub const fn page(self) -> Option<PhysicalPage> {
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

    /// The frame number field, regardless of `present`.
    #[inline]
    #[must_use]
    pub const fn frame(self) -> PhysicalPage {
        PhysicalPage::from_frame_number(self.frame_number())
    }
}

impl PageTable {
    /// Create a fully zeroed Page Table (all entries non-present).
    #[inline]
    #[must_use]
    pub const fn zeroed() -> Self {
        Self {
            entries: [PtEntry::zero(); ENTRIES],
        }
    }

    /// Reset every entry to zero in place.
    #[inline]
    pub fn clear(&mut self) {
        self.entries.fill(PtEntry::zero());
    }

    /// Read the entry at `i`.
    #[inline]
    #[must_use]
    pub const fn get(&self, i: L1Index) -> PtEntry {
        self.entries[i.as_usize()]
    }

    /// Write the entry at `i`.
    ///
    /// Caller must handle any required TLB invalidation when changing active mappings.
    #[inline]
    pub const fn set(&mut self, i: L1Index, e: PtEntry) {
        self.entries[i.as_usize()] = e;
    }

    /// Derive the PT index from a virtual address.
    #[inline]
    #[must_use]
    pub const fn index_of(va: VirtualAddress) -> L1Index {
        L1Index::from(va)
    }
}
