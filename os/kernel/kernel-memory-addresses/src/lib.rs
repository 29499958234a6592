//! # Virtual and Physical Memory Address Types
//!
//! Strongly typed wrappers for raw memory addresses and 4 KiB page bases used
//! by the frame allocator, the page-table manager and the kernel heap.
//!
//! ## Overview
//!
//! | Type | Meaning |
//! |------|---------|
//! | [`PhysicalAddress`] | A byte address in physical memory (RAM or MMIO). |
//! | [`PhysicalPage`] | A 4 KiB-aligned physical frame; exposes its frame number. |
//! | [`VirtualAddress`] | A byte address in the current (translated) address space. |
//! | [`VirtualPage`] | A 4 KiB-aligned virtual page base. |
//!
//! All four are `#[repr(transparent)]` wrappers around `u64`, so they cost
//! nothing at runtime but make it a type error to hand a virtual address to
//! code that expects a physical one.
//!
//! ## Typical Usage
//!
//! ```rust
//! # use kernel_memory_addresses::*;
//! let pa = PhysicalAddress::new(0x0000_0010_2000_0042);
//! let frame = pa.page();
//! assert_eq!(frame.base().as_u64(), 0x0000_0010_2000_0000);
//! assert_eq!(frame.frame_number(), 0x0000_0010_2000_0000 >> PAGE_SHIFT);
//! assert_eq!(frame.base() + pa.page_offset(), pa);
//!
//! let va = VirtualAddress::new(0xFFFF_C900_0000_1234);
//! assert_eq!(va.page().base().as_u64(), 0xFFFF_C900_0000_1000);
//! assert!(!va.is_page_aligned());
//! ```
//!
//! ## Design Notes
//!
//! - Only the 4 KiB base granularity is modelled; the buddy allocator expresses
//!   larger blocks as an order over 4 KiB frames instead of distinct page types.
//! - Alignment and offset helpers are `const fn` so they can be used in layout
//!   constants.

#![cfg_attr(not(any(test, doctest)), no_std)]
#![deny(unsafe_code)]

mod physical_address;
mod physical_page;
mod virtual_address;
mod virtual_page;

pub use physical_address::PhysicalAddress;
pub use physical_page::PhysicalPage;
pub use virtual_address::VirtualAddress;
pub use virtual_page::VirtualPage;

/// Size of a base page / frame in bytes.
pub const PAGE_SIZE: u64 = 4096;

/// log2([`PAGE_SIZE`]).
pub const PAGE_SHIFT: u32 = 12;

const _: () = assert!(1 << PAGE_SHIFT == PAGE_SIZE);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn physical_page_round_trip() {
        let pa = PhysicalAddress::new(0x1234_5678);
        let page = pa.page();
        assert_eq!(page.base().as_u64(), 0x1234_5000);
        assert_eq!(pa.page_offset(), 0x678);
        assert_eq!(page.base() + pa.page_offset(), pa);
        assert_eq!(PhysicalPage::from_frame_number(page.frame_number()), page);
    }

    #[test]
    fn virtual_page_round_trip() {
        let va = VirtualAddress::new(0xFFFF_8800_0000_2ABC);
        let page = va.page();
        assert_eq!(page.base().as_u64(), 0xFFFF_8800_0000_2000);
        assert_eq!(page.base() + va.page_offset(), va);
        assert_eq!(page.add_pages(2).base().as_u64(), 0xFFFF_8800_0000_4000);
    }

    #[test]
    fn alignment_helpers() {
        assert!(PhysicalAddress::new(0x3000).is_page_aligned());
        assert!(!PhysicalAddress::new(0x3001).is_page_aligned());
        assert_eq!(VirtualAddress::new(0x1001).align_up_to_page().as_u64(), 0x2000);
        assert_eq!(VirtualAddress::new(0x1fff).align_down_to_page().as_u64(), 0x1000);
        assert_eq!(PhysicalAddress::new(0x2000).align_up_to_page().as_u64(), 0x2000);
    }

    #[test]
    fn signed_arithmetic_checks_bounds() {
        let va = VirtualAddress::new(0x1000);
        assert_eq!(va.checked_add_signed(-0x1000), Some(VirtualAddress::zero()));
        assert_eq!(va.checked_add_signed(-0x1001), None);
        assert_eq!(VirtualAddress::new(u64::MAX).checked_add(1), None);
        assert_eq!(VirtualAddress::new(0x3000) - VirtualAddress::new(0x1000), 0x2000);
    }

    #[test]
    fn formatting() {
        assert_eq!(
            format!("{:?}", PhysicalAddress::new(0x1000)),
            "PA(0x0000000000001000)"
        );
        assert_eq!(
            format!("{}", VirtualAddress::new(0xFFFF_8800_0000_0000)),
            "0xFFFF880000000000"
        );
    }
}
