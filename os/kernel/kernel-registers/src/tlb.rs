//! # TLB Maintenance
//!
//! Local-core only. Nothing here shoots down translations cached by other
//! cores.

use crate::cr3::Cr3;
use crate::{LoadRegisterUnsafe, StoreRegisterUnsafe};
use kernel_memory_addresses::VirtualAddress;

/// Drop the cached translation for the page containing `va`.
///
/// # Safety
/// Executes `invlpg`; requires ring 0.
#[inline]
pub unsafe fn invalidate_page(va: VirtualAddress) {
    unsafe {
        core::arch::asm!("invlpg [{}]", in(reg) va.as_u64(), options(nostack, preserves_flags));
    }
}

/// Drop all non-global cached translations by reloading CR3.
///
/// # Safety
/// Requires ring 0.
#[inline]
pub unsafe fn flush_all() {
    unsafe {
        let cr3 = Cr3::load_unsafe();
        cr3.store_unsafe();
    }
}
