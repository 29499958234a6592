//! # x86-64 Page Map Level 4 (PML4)
//!
//! - [`L4Index`]: index type for bits 47..39 of a virtual address.
//! - [`Pml4Entry`]: a PML4 entry; always points to a PDPT.
//! - [`PageMapLevel4`]: a 4 KiB-aligned array of 512 PML4 entries.
//!
//! One PML4 exists per address space. Its frame is what CR3 points at.

use crate::page_table::ENTRIES;
use bitfield_struct::bitfield;
use kernel_memory_addresses::{PhysicalPage, VirtualAddress};

/// L4 **PML4E**: pointer to a **PDPT** (non-leaf; PS **must be 0**).
///
/// ```text
/// 63  62..52  51..48  47........12  11..9  8  7  6  5  4  3  2  1  0
/// XD  avail   rsvd    frame number  avail  -  0  -  A PCD PWT U W  P
/// ```
#[doc(alias = "PML4E")]
#[bitfield(u64)]
pub struct Pml4Entry {
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
    /// **Accessed** (bit 5): set by the CPU.
    pub accessed: bool,
    /// Bit 6: ignored.
    #[bits(1)]
    __ignored: u8,
    /// Bit 7: PS, must be 0.
    #[bits(1)]
    __ps_must_be_0: u8,
    /// Bit 8: ignored.
    #[bits(1)]
    __global_ignored: u8,
    /// **OS-available low** (bits 9..11).
    #[bits(3)]
    pub os_available_low: u8,
    /// **PDPT frame number** (bits 12..47).
    #[bits(36)]
    frame_number: u64,
    /// Bits 48..51: reserved, must be 0.
    #[bits(4)]
    __reserved: u8,
    /// **OS-available high** (bits 52..62).
    #[bits(11)]
    pub os_available_high: u16,
    /// **No-Execute** (bit 63).
    pub no_execute: bool,
}

/// Index into the PML4 table (virtual-address bits `[47:39]`).
#[repr(transparent)]
#[derive(Copy, Clone, Debug, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct L4Index(u16);

/// The top-level page map (PML4).
#[doc(alias = "PML4")]
#[repr(C, align(4096))]
pub struct PageMapLevel4 {
    entries: [Pml4Entry; ENTRIES],
}

impl L4Index {
    /// Extract bits `[47:39]` of `va`.
    #[inline]
    #[must_use]
    pub const fn from(va: VirtualAddress) -> Self {
        Self::new(((va.as_u64() >> 39) & 0x1FF) as u16)
    }

    /// ### Debug assertions
    /// - Asserts `v < 512`.
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

impl Pml4Entry {
    #[inline]
    #[must_use]
    pub const fn zero() -> Self {
        Self::new()
    }

    /// Present, writable, user-accessible link to the PDPT in `next`.
    #[inline]
    #[must_use]
    pub const fn link(next: PhysicalPage) -> Self {
        Self::new()
            .with_present(true)
            .with_writable(true)
            .with_user(true)
            .with_frame(next)
    }

    /// The PDPT this entry points to, if present.
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
        debug_assert!(frame.frame_number() <= crate::page_table::MAX_FRAME_NUMBER);
        self.with_frame_number(frame.frame_number())
    }

    #[inline]
    #[must_use]
    pub const fn frame(self) -> PhysicalPage {
        PhysicalPage::from_frame_number(self.frame_number())
    }
}

impl PageMapLevel4 {
    #[inline]
    #[must_use]
    pub const fn zeroed() -> Self {
        Self {
            entries: [Pml4Entry::zero(); ENTRIES],
        }
    }

    /// Plain load; no TLB synchronization.
    #[inline]
    #[must_use]
    pub const fn get(&self, i: L4Index) -> Pml4Entry {
        self.entries[i.as_usize()]
    }

    /// Plain store; the caller handles TLB invalidation.
    #[inline]
    pub const fn set(&mut self, i: L4Index, e: Pml4Entry) {
        self.entries[i.as_usize()] = e;
    }

    #[inline]
    #[must_use]
    pub const fn index_of(va: VirtualAddress) -> L4Index {
        L4Index::from(va)
    }
}
