//! # Page Table Levels
//!
//! One module per paging level. Every level provides an index newtype, a
//! `#[bitfield(u64)]` entry whose `from_bits`/`into_bits` are the explicit
//! encode/decode of the 8-byte hardware record, and a 4 KiB-aligned table of
//! 512 entries.
//!
//! All four entry kinds share the same frame number field: 36 bits at
//! positions 12..48, i.e. tables and pages anywhere in the first 256 TiB of
//! physical memory.

pub mod pd;
pub mod pdpt;
pub mod pml4;
pub mod pt;

use core::fmt;
use kernel_memory_addresses::VirtualAddress;
use pd::L2Index;
use pdpt::L3Index;
use pml4::L4Index;
use pt::L1Index;

/// Number of entries in every table.
pub const ENTRIES: usize = 512;

/// Largest frame number an entry can encode.
pub const MAX_FRAME_NUMBER: u64 = (1 << 36) - 1;

/// Split a virtual address into its four table indices.
#[inline]
#[must_use]
pub const fn split_indices(va: VirtualAddress) -> (L4Index, L3Index, L2Index, L1Index) {
    (
        L4Index::from(va),
        L3Index::from(va),
        L2Index::from(va),
        L1Index::from(va),
    )
}

/// Which structure a walk was working on.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum TableLevel {
    /// A page-directory-pointer table hanging off the PML4.
    Pdpt,
    /// A page directory hanging off a PDPT.
    Pd,
    /// A page table hanging off a page directory.
    Pt,
    /// The data frame behind a leaf entry.
    Page,
}

impl fmt::Display for TableLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Pdpt => "PDPT",
            Self::Pd => "PD",
            Self::Pt => "PT",
            Self::Page => "page",
        })
    }
}

/// Permissions and caching applied to a leaf mapping.
///
/// Intermediate entries are always present, writable and user-accessible so
/// the leaf alone decides the effective access rights.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct PageFlags {
    pub writable: bool,
    pub user: bool,
    pub write_through: bool,
    pub cache_disable: bool,
    pub global: bool,
    pub no_execute: bool,
}

impl PageFlags {
    /// Default kernel mapping: present, writable, user-accessible.
    pub const DEFAULT: Self = Self {
        writable: true,
        user: true,
        write_through: false,
        cache_disable: false,
        global: false,
        no_execute: false,
    };

    /// Device memory: uncached and never executable.
    pub const MMIO: Self = Self {
        writable: true,
        user: false,
        write_through: true,
        cache_disable: true,
        global: false,
        no_execute: true,
    };
}

impl Default for PageFlags {
    fn default() -> Self {
        Self::DEFAULT
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn indices_follow_nine_bit_slices() {
        let va = VirtualAddress::new(0xFFFF_C900_0020_3000);
        let (i4, i3, i2, i1) = split_indices(va);
        assert_eq!(i4.as_usize(), 0x192);
        assert_eq!(i3.as_usize(), 0);
        assert_eq!(i2.as_usize(), 1);
        assert_eq!(i1.as_usize(), 3);
    }

    #[test]
    fn indices_of_direct_map_base() {
        let va = VirtualAddress::new(0xFFFF_8800_0000_0000);
        let (i4, i3, i2, i1) = split_indices(va);
        assert_eq!(i4.as_usize(), 0x110);
        assert_eq!((i3.as_usize(), i2.as_usize(), i1.as_usize()), (0, 0, 0));
    }
}
