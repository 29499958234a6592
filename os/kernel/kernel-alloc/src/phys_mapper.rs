//! # Direct-Map PhysMapper
//!
//! After bring-up, every usable physical range is mapped at
//! `PHYSMEM_VIRTUAL_BASE + pa`. Page tables and any other physical memory are
//! reached through that window.
//!
//! Before the direct map exists (or for frames outside usable RAM) this mapper
//! must not be used.

use kernel_info::memory::PHYSMEM_VIRTUAL_BASE;
use kernel_memory_addresses::{PhysicalAddress, VirtualAddress};
use kernel_vmem::PhysMapper;

/// [`PhysMapper`] over the kernel's direct map.
///
/// # Safety
/// - The direct map must cover the referenced physical range.
/// - The returned reference must only be used for mapped, writable memory.
#[derive(Debug, Default, Copy, Clone)]
pub struct DirectMapPhysMapper;

impl DirectMapPhysMapper {
    /// Where `pa` is visible in the direct map.
    #[inline]
    #[must_use]
    pub const fn virt_of(pa: PhysicalAddress) -> VirtualAddress {
        VirtualAddress::new(PHYSMEM_VIRTUAL_BASE + pa.as_u64())
    }
}

impl PhysMapper for DirectMapPhysMapper {
    unsafe fn phys_to_mut<'a, T>(&self, pa: PhysicalAddress) -> &'a mut T {
        let va = Self::virt_of(pa).as_mut_ptr::<T>();
        // SAFETY: the caller guarantees the direct map covers `pa`.
        unsafe { &mut *va }
    }
}
