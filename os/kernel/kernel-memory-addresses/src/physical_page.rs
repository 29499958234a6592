use crate::{PAGE_SHIFT, PAGE_SIZE, PhysicalAddress};
use core::fmt;

/// A 4 KiB physical frame, identified by its page-aligned base.
///
/// ### Invariants
/// - The low [`PAGE_SHIFT`] bits of the base are always zero.
///
/// ### Examples
/// ```rust
/// # use kernel_memory_addresses::*;
/// let frame = PhysicalPage::from_frame_number(0x100);
/// assert_eq!(frame.base().as_u64(), 0x10_0000);
/// assert_eq!(frame.add_pages(1).frame_number(), 0x101);
/// ```
#[repr(transparent)]
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct PhysicalPage(PhysicalAddress);

impl PhysicalPage {
    /// Wrap an address that is already page aligned.
    ///
    /// Debug builds assert the alignment.
    #[inline]
    #[must_use]
    pub const fn from_addr(base: PhysicalAddress) -> Self {
        debug_assert!(base.is_page_aligned(), "frame base must be 4K-aligned");
        Self(base)
    }

    /// The frame that contains `addr` (aligns down).
    #[inline]
    #[must_use]
    pub const fn containing_address(addr: PhysicalAddress) -> Self {
        Self(addr.align_down_to_page())
    }

    #[inline]
    #[must_use]
    pub const fn from_frame_number(pfn: u64) -> Self {
        Self(PhysicalAddress::new(pfn << PAGE_SHIFT))
    }

    /// Physical frame number (`base >> 12`).
    #[inline]
    #[must_use]
    pub const fn frame_number(self) -> u64 {
        self.0.as_u64() >> PAGE_SHIFT
    }

    #[inline]
    #[must_use]
    pub const fn base(self) -> PhysicalAddress {
        self.0
    }

    /// The frame `n` pages above this one.
    #[inline]
    #[must_use]
    pub const fn add_pages(self, n: u64) -> Self {
        Self(PhysicalAddress::new(self.0.as_u64() + n * PAGE_SIZE))
    }
}

impl fmt::Debug for PhysicalPage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PhysicalPage(0x{:016X})", self.0.as_u64())
    }
}

impl fmt::Display for PhysicalPage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.0, f)
    }
}

impl TryFrom<PhysicalAddress> for PhysicalPage {
    type Error = PhysicalAddress;

    /// Fails with the offending address if it is not page aligned.
    #[inline]
    fn try_from(pa: PhysicalAddress) -> Result<Self, Self::Error> {
        if pa.is_page_aligned() {
            Ok(Self(pa))
        } else {
            Err(pa)
        }
    }
}
