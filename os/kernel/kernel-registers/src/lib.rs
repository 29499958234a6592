//! # Typed `X86_64` Paging Registers
//!
//! The paging control surface the memory subsystem touches: CR3 (root of the
//! active translation tree) and the TLB invalidation instructions. Register
//! access needs ring 0, so every load/store is `unsafe`.

#![cfg_attr(not(any(test, doctest)), no_std)]
#![allow(unsafe_code)]

#[cfg(feature = "cr3")]
pub mod cr3;

#[cfg(all(feature = "asm", feature = "cr3", target_arch = "x86_64"))]
pub mod tlb;

pub trait LoadRegisterUnsafe {
    /// # Safety
    /// The register access is privileged and requires kernel mode (Ring 0).
    unsafe fn load_unsafe() -> Self;
}

pub trait StoreRegisterUnsafe {
    /// # Safety
    /// The caller must uphold the register-specific requirements, e.g. that a
    /// new CR3 value points at a valid page-table tree that maps the code
    /// currently executing.
    unsafe fn store_unsafe(self);
}
