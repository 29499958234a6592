use crate::{PAGE_SIZE, VirtualAddress};
use core::fmt;

/// A 4 KiB virtual page, identified by its page-aligned base.
///
/// ### Invariants
/// - The low 12 bits of the base are always zero.
#[repr(transparent)]
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct VirtualPage(VirtualAddress);

impl VirtualPage {
    /// Wrap an address that is already page aligned.
    ///
    /// Debug builds assert the alignment.
    #[inline]
    #[must_use]
    pub const fn from_addr(base: VirtualAddress) -> Self {
        debug_assert!(base.is_page_aligned(), "page base must be 4K-aligned");
        Self(base)
    }

    /// Page that contains `addr` (aligns down to page boundary).
    #[inline]
    #[must_use]
    pub const fn containing_address(addr: VirtualAddress) -> Self {
        Self(addr.align_down_to_page())
    }

    #[inline]
    #[must_use]
    pub const fn base(self) -> VirtualAddress {
        self.0
    }

    /// The page `n` pages above this one.
    #[inline]
    #[must_use]
    pub const fn add_pages(self, n: u64) -> Self {
        Self(VirtualAddress::new(self.0.as_u64() + n * PAGE_SIZE))
    }
}

impl fmt::Debug for VirtualPage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "VirtualPage(0x{:016X})", self.0.as_u64())
    }
}

impl fmt::Display for VirtualPage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.0, f)
    }
}

impl TryFrom<VirtualAddress> for VirtualPage {
    type Error = VirtualAddress;

    #[inline]
    fn try_from(va: VirtualAddress) -> Result<Self, Self::Error> {
        if va.is_page_aligned() {
            Ok(Self(va))
        } else {
            Err(va)
        }
    }
}
