//! # Boot Memory Map
//!
//! The loader leaves a count followed by an array of [`MemoryMapEntry`]
//! records. The kernel only ever allocates from entries of type
//! [`MemoryKind::Usable`]; [`collect_usable`] turns the raw map into the
//! list of [`MemoryRange`]s the physical allocator consumes once at boot.

use core::fmt;
use kernel_memory_addresses::PhysicalAddress;

/// One raw firmware memory map record.
///
/// Keep this `#[repr(C)]`; it is read straight out of loader memory.
#[repr(C)]
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct MemoryMapEntry {
    /// Physical start of the range.
    pub base: u64,
    /// Length in bytes.
    pub length: u64,
    /// Raw type code, see [`MemoryKind`].
    pub kind: u32,
    /// Extended ACPI attributes.
    pub acpi: u32,
}

/// Firmware memory type codes.
#[repr(u32)]
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum MemoryKind {
    Usable = 1,
    Reserved = 2,
    AcpiReclaimable = 3,
    AcpiNvs = 4,
    BadMemory = 5,
}

/// A physically contiguous, usable memory region.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct MemoryRange {
    pub base: PhysicalAddress,
    pub size: u64,
}

impl MemoryMapEntry {
    /// Decoded type, `None` for codes the kernel does not know.
    #[inline]
    #[must_use]
    pub const fn memory_kind(&self) -> Option<MemoryKind> {
        MemoryKind::from_raw(self.kind)
    }

    #[inline]
    #[must_use]
    pub const fn is_usable(&self) -> bool {
        matches!(self.memory_kind(), Some(MemoryKind::Usable))
    }

    #[inline]
    #[must_use]
    pub const fn range(&self) -> MemoryRange {
        MemoryRange::new(PhysicalAddress::new(self.base), self.length)
    }
}

impl MemoryKind {
    #[must_use]
    pub const fn from_raw(code: u32) -> Option<Self> {
        match code {
            1 => Some(Self::Usable),
            2 => Some(Self::Reserved),
            3 => Some(Self::AcpiReclaimable),
            4 => Some(Self::AcpiNvs),
            5 => Some(Self::BadMemory),
            _ => None,
        }
    }

    /// Name used in boot diagnostics.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Usable => "usable",
            Self::Reserved => "reserved",
            Self::AcpiReclaimable => "acpi data",
            Self::AcpiNvs => "acpi nvs",
            Self::BadMemory => "bad",
        }
    }
}

impl fmt::Display for MemoryKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl MemoryRange {
    /// An empty range, handy for initializing fixed-size arrays.
    pub const EMPTY: Self = Self::new(PhysicalAddress::zero(), 0);

    #[inline]
    #[must_use]
    pub const fn new(base: PhysicalAddress, size: u64) -> Self {
        Self { base, size }
    }

    /// Exclusive end address.
    #[inline]
    #[must_use]
    pub const fn end(&self) -> PhysicalAddress {
        PhysicalAddress::new(self.base.as_u64() + self.size)
    }

    #[inline]
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.size == 0
    }

    #[inline]
    #[must_use]
    pub const fn contains(&self, addr: PhysicalAddress) -> bool {
        addr.as_u64() >= self.base.as_u64() && addr.as_u64() - self.base.as_u64() < self.size
    }
}

/// Iterate the usable, non-empty ranges of a memory map in map order.
pub fn usable_ranges(entries: &[MemoryMapEntry]) -> impl Iterator<Item = MemoryRange> + '_ {
    entries
        .iter()
        .filter(|e| e.is_usable() && e.length != 0)
        .map(MemoryMapEntry::range)
}

/// Copy the usable ranges of `entries` into `out`, returning the filled prefix.
///
/// Ranges that do not fit into `out` are dropped.
pub fn collect_usable<'o>(entries: &[MemoryMapEntry], out: &'o mut [MemoryRange]) -> &'o [MemoryRange] {
    let mut n = 0;
    for (slot, range) in out.iter_mut().zip(usable_ranges(entries)) {
        *slot = range;
        n += 1;
    }
    &out[..n]
}

#[cfg(test)]
mod tests {
    use super::*;

    const fn entry(base: u64, length: u64, kind: u32) -> MemoryMapEntry {
        MemoryMapEntry {
            base,
            length,
            kind,
            acpi: 1,
        }
    }

    #[test]
    fn entry_layout_matches_loader() {
        assert_eq!(size_of::<MemoryMapEntry>(), 24);
    }

    #[test]
    fn kind_names() {
        assert_eq!(MemoryKind::from_raw(1).map(MemoryKind::as_str), Some("usable"));
        assert_eq!(MemoryKind::from_raw(3).map(MemoryKind::as_str), Some("acpi data"));
        assert_eq!(MemoryKind::from_raw(5).map(MemoryKind::as_str), Some("bad"));
        assert_eq!(MemoryKind::from_raw(0), None);
        assert_eq!(MemoryKind::from_raw(6), None);
    }

    #[test]
    fn collects_only_usable_ranges_in_order() {
        let map = [
            entry(0, 0x9_fc00, 1),
            entry(0x9_fc00, 0x400, 2),
            entry(0xf_0000, 0x1_0000, 2),
            entry(0x10_0000, 0x7ee_0000, 1),
            entry(0x7fe_0000, 0x2_0000, 3),
            entry(0x800_0000, 0, 1),
            entry(0xfffc_0000, 0x4_0000, 2),
        ];
        let mut out = [MemoryRange::EMPTY; 8];
        let usable = collect_usable(&map, &mut out);
        assert_eq!(
            usable,
            &[
                MemoryRange::new(PhysicalAddress::new(0), 0x9_fc00),
                MemoryRange::new(PhysicalAddress::new(0x10_0000), 0x7ee_0000),
            ]
        );
    }

    #[test]
    fn collect_truncates_to_capacity() {
        let map = [entry(0, 0x1000, 1), entry(0x2000, 0x1000, 1)];
        let mut out = [MemoryRange::EMPTY; 1];
        assert_eq!(collect_usable(&map, &mut out).len(), 1);
    }

    #[test]
    fn range_contains_is_half_open() {
        let r = MemoryRange::new(PhysicalAddress::new(0x1000), 0x2000);
        assert!(r.contains(PhysicalAddress::new(0x1000)));
        assert!(r.contains(PhysicalAddress::new(0x2fff)));
        assert!(!r.contains(PhysicalAddress::new(0x3000)));
        assert!(!r.contains(PhysicalAddress::new(0xfff)));
        assert_eq!(r.end(), PhysicalAddress::new(0x3000));
    }
}
