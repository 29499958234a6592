//! # Virtual Memory Support
//!
//! x86-64 four-level paging for the kernel memory subsystem.
//!
//! ## What you get
//! - An [`address space`](address_space) describing a `PML4` root page table,
//!   with map/unmap/translate over 4 KiB pages.
//! - Typed tables and entries for every level in [`page_table`], encoded and
//!   decoded explicitly as `u64` through `bitfield-struct`.
//! - Leaf [`PageFlags`] for normal and device memory.
//! - The seams the walker needs from its environment: [`FrameAlloc`] for table
//!   frames, [`PhysMapper`] to touch physical memory and [`TlbFlush`] for
//!   translation cache maintenance.
//!
//! ## x86-64 Virtual Address → Physical Address Walk
//!
//! Each 48-bit virtual address is divided into five fields:
//!
//! ```text
//! | 47‒39 | 38‒30 | 29‒21 | 20‒12 | 11‒0   |
//! |  PML4 |  PDPT |   PD  |   PT  | Offset |
//! ```
//!
//! The CPU uses these fields as **indices** into four levels of page tables,
//! each level containing 512 (2⁹) entries of 8 bytes (64 bits) each.
//!
//! ```text
//!  PML4  →  PDPT  →  PD  →  PT  →  Physical Page
//!   │        │        │        │
//!   │        │        │        └───► PTE   (Page Table Entry)  → maps 4 KiB page
//!   │        │        └────────────► PDE   (Page Directory Entry)
//!   │        └─────────────────────► PDPTE (Page Directory Pointer Table Entry)
//!   └──────────────────────────────► PML4E (Page Map Level 4 Entry)
//! ```
//!
//! Only 4 KiB leaves are created. Every PML4E, PDPTE and PDE points to the
//! next table level.
//!
//! ### Offset
//!
//! The final **Offset** field (bits 11–0) selects the byte inside the 4 KiB page.

#![cfg_attr(not(any(test, doctest)), no_std)]
#![allow(unsafe_code, clippy::inline_always)]

pub mod address_space;
pub mod page_table;

pub use crate::address_space::{AddressSpace, MapError};
pub use crate::page_table::pt::{PageTable, PtEntry};
pub use crate::page_table::{PageFlags, TableLevel};
use kernel_memory_addresses::{PhysicalAddress, PhysicalPage, VirtualPage};

/// Source of **physical** 4 KiB frames for page tables and mapped pages.
///
/// Returned frames **must** be 4 KiB aligned. Returns `None` on out-of-memory.
pub trait FrameAlloc {
    /// Allocate one 4 KiB *physical* frame.
    fn alloc_frame(&mut self) -> Option<PhysicalPage>;

    /// Return a frame obtained from [`alloc_frame`](Self::alloc_frame).
    fn free_frame(&mut self, frame: PhysicalPage);
}

/// Converts physical addresses to *temporarily* usable pointers in the current
/// virtual address space (e.g., via the direct map at `PHYSMEM_VIRTUAL_BASE`).
///
/// # Safety
/// - You must ensure `pa` is mapped as writable in the current page tables
///   for `&mut T`.
/// - Lifetime `'a` is purely borrow-checked; the mapping must remain valid
///   for `'a`.
/// - Type `T` must match the bytes at `pa` (no aliasing UB).
pub trait PhysMapper {
    /// Convert a *physical* address to a usable mutable reference.
    ///
    /// # Safety
    /// See the trait documentation.
    unsafe fn phys_to_mut<'a, T>(&self, pa: PhysicalAddress) -> &'a mut T;
}

/// Invalidation of cached translations after a page-table change.
pub trait TlbFlush {
    /// Drop the cached translation for `page`.
    fn flush_page(&self, page: VirtualPage);
}

/// [`TlbFlush`] on the executing core via `invlpg`.
#[cfg(target_arch = "x86_64")]
#[derive(Debug)]
pub struct LocalTlb(());

#[cfg(target_arch = "x86_64")]
impl LocalTlb {
    /// # Safety
    /// Must only be used at CPL0; `invlpg` faults in user mode.
    #[inline]
    #[must_use]
    pub const unsafe fn new() -> Self {
        Self(())
    }
}

#[cfg(target_arch = "x86_64")]
impl TlbFlush for LocalTlb {
    #[inline]
    fn flush_page(&self, page: VirtualPage) {
        // SAFETY: constructing a `LocalTlb` asserts ring 0.
        unsafe { kernel_registers::tlb::invalidate_page(page.base()) }
    }
}

/// Align `x` down to the nearest multiple of `a`.
///
/// ### Preconditions
/// - `a` must be **non-zero** and a **power of two**.
///
/// ### Examples
/// ```rust
/// # use kernel_vmem::align_down;
/// assert_eq!(align_down(0,      4096), 0);
/// assert_eq!(align_down(4095,   4096), 0);
/// assert_eq!(align_down(8191,   4096), 4096);
/// assert_eq!(align_down(0x12345,   16), 0x12340);
/// ```
#[inline(always)]
#[must_use]
pub const fn align_down(x: u64, a: u64) -> u64 {
    x & !(a - 1)
}

/// Align `x` up to the nearest multiple of `a`.
///
/// ### Preconditions
/// - `a` must be **non-zero** and a **power of two**.
/// - `x + (a - 1)` must **not overflow** `u64`.
///
/// ### Examples
/// ```rust
/// # use kernel_vmem::align_up;
/// assert_eq!(align_up(0,       4096), 0);
/// assert_eq!(align_up(1,       4096), 4096);
/// assert_eq!(align_up(4096,    4096), 4096);
/// assert_eq!(align_up(0x12345,   16), 0x12350);
/// ```
#[inline(always)]
#[must_use]
pub const fn align_up(x: u64, a: u64) -> u64 {
    (x + a - 1) & !(a - 1)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::page_table::pd::PageDirectory;
    use crate::page_table::pdpt::PageDirectoryPointerTable;
    use crate::page_table::pml4::PageMapLevel4;
    use crate::page_table::split_indices;
    use core::cell::RefCell;
    use kernel_memory_addresses::VirtualAddress;

    /// A trivial **bump** allocator: always hands out the next 4 KiB frame.
    ///
    /// Freed frames are only recorded, never reused.
    struct BumpAlloc {
        /// Next free physical byte address (must remain 4 KiB aligned)
        next: u64,
        /// Exclusive end (bounds check)
        end: u64,
        freed: Vec<PhysicalPage>,
    }

    impl BumpAlloc {
        fn new(start: u64, end: u64) -> Self {
            Self {
                next: start,
                end,
                freed: Vec::new(),
            }
        }
    }

    impl FrameAlloc for BumpAlloc {
        fn alloc_frame(&mut self) -> Option<PhysicalPage> {
            if self.next + 4096 > self.end {
                return None;
            }
            let p = self.next;
            self.next += 4096;
            Some(PhysicalPage::from_addr(PhysicalAddress::new(p)))
        }

        fn free_frame(&mut self, frame: PhysicalPage) {
            self.freed.push(frame);
        }
    }

    /// A 4 KiB-aligned raw frame. We use this as our "physical RAM" backing store in tests.
    #[repr(align(4096))]
    struct Aligned4K(#[allow(dead_code)] [u8; 4096]);

    /// A tiny in-memory "RAM": physical address `pa` lives in frame `pa / 4096`.
    ///
    /// The frames are leaked so references handed out by the mapper never
    /// alias a live borrow of the backing vector.
    struct TestPhys {
        frames: *mut Aligned4K,
        count: usize,
    }

    impl TestPhys {
        fn with_frames(n: usize) -> Self {
            let v: Vec<Aligned4K> = (0..n).map(|_| Aligned4K([0; 4096])).collect();
            let frames = Vec::leak(v).as_mut_ptr();
            Self { frames, count: n }
        }
    }

    impl PhysMapper for TestPhys {
        unsafe fn phys_to_mut<'a, T>(&self, pa: PhysicalAddress) -> &'a mut T {
            let idx = (pa.as_u64() >> 12) as usize;
            let off = (pa.as_u64() & 0xfff) as usize;
            assert!(idx < self.count, "{pa} outside test RAM");
            // SAFETY: the frame is in bounds; the caller promises `T` matches.
            unsafe { &mut *self.frames.add(idx).cast::<u8>().add(off).cast::<T>() }
        }
    }

    /// Remembers every flushed page.
    #[derive(Default)]
    struct RecordingTlb {
        flushed: RefCell<Vec<VirtualPage>>,
    }

    impl TlbFlush for RecordingTlb {
        fn flush_page(&self, page: VirtualPage) {
            self.flushed.borrow_mut().push(page);
        }
    }

    fn page(va: u64) -> VirtualPage {
        VirtualPage::from_addr(VirtualAddress::new(va))
    }

    fn frame(pa: u64) -> PhysicalPage {
        PhysicalPage::from_addr(PhysicalAddress::new(pa))
    }

    /// Frame 0 is the zeroed root; tables come from frames 1.. of `phys`.
    fn setup(n: usize) -> (TestPhys, BumpAlloc) {
        let phys = TestPhys::with_frames(n);
        let alloc = BumpAlloc::new(0x1000, (n as u64) << 12);
        (phys, alloc)
    }

    #[test]
    fn map_creates_tables_and_leaf() {
        let (phys, mut alloc) = setup(64);
        let aspace = AddressSpace::new(&phys, frame(0), RecordingTlb::default());

        let va = VirtualAddress::new(0xffff_8000_0000_0000);
        aspace
            .map_virtual_page(&mut alloc, frame(0x30_0000), va.page())
            .expect("map");

        let (i4, i3, i2, i1) = split_indices(va);
        unsafe {
            let pml4: &mut PageMapLevel4 = phys.phys_to_mut(PhysicalAddress::zero());
            let e4 = pml4.get(i4);
            assert!(e4.present() && e4.writable() && e4.user());

            let pdpt: &mut PageDirectoryPointerTable = phys.phys_to_mut(e4.frame().base());
            let e3 = pdpt.get(i3);
            assert!(e3.present());

            let pd: &mut PageDirectory = phys.phys_to_mut(e3.frame().base());
            let e2 = pd.get(i2);
            assert!(e2.present());

            let pt: &mut PageTable = phys.phys_to_mut(e2.frame().base());
            let e1 = pt.get(i1);
            assert!(e1.present() && e1.writable() && e1.user());
            assert_eq!(e1.frame(), frame(0x30_0000));
        }

        // PDPT, PD and PT frames.
        assert_eq!(alloc.next, 0x4000);
        assert_eq!(*aspace.tlb().flushed.borrow(), [va.page()]);
    }

    #[test]
    fn translate_round_trip_and_unmap() {
        let (phys, mut alloc) = setup(64);
        let aspace = AddressSpace::new(&phys, frame(0), RecordingTlb::default());

        let va = page(0xffff_c900_0000_0000);
        aspace
            .map_virtual_page(&mut alloc, frame(0x7000), va)
            .expect("map");
        assert_eq!(
            aspace.translate(va.base() + 0x123),
            Some(PhysicalAddress::new(0x7123))
        );

        assert_eq!(aspace.unmap_virtual_page(va), Some(frame(0x7000)));
        assert_eq!(aspace.translate(va.base()), None);

        // Only `present` was cleared; the frame number stays.
        let entry = aspace.get_page_entry(va).expect("tables are kept");
        assert!(!entry.present());
        assert_eq!(entry.frame(), frame(0x7000));
        assert_eq!(aspace.tlb().flushed.borrow().len(), 2);
    }

    #[test]
    fn unmapping_a_non_present_leaf_changes_nothing() {
        let (phys, mut alloc) = setup(16);
        let aspace = AddressSpace::new(&phys, frame(0), RecordingTlb::default());
        let va = page(0x4000_0000);

        aspace
            .map_virtual_page(&mut alloc, frame(0x7000), va)
            .expect("map");
        assert_eq!(aspace.unmap_virtual_page(va), Some(frame(0x7000)));
        let before = aspace.get_page_entry(va).expect("tables are kept");

        // The table exists but the leaf is already clear.
        assert_eq!(aspace.unmap_virtual_page(va), None);
        assert_eq!(aspace.get_page_entry(va), Some(before));
        assert_eq!(aspace.tlb().flushed.borrow().len(), 2);
    }

    #[test]
    fn neighbours_share_intermediate_tables() {
        let (phys, mut alloc) = setup(64);
        let aspace = AddressSpace::new(&phys, frame(0), RecordingTlb::default());

        aspace
            .map_virtual_region(&mut alloc, frame(0x20_0000), page(0x4000_0000), 16)
            .expect("map");
        assert_eq!(alloc.next, 0x4000);
        for i in 0..16 {
            assert_eq!(
                aspace.translate(VirtualAddress::new(0x4000_0000 + i * 4096)),
                Some(PhysicalAddress::new(0x20_0000 + i * 4096))
            );
        }

        aspace.unmap_virtual_region(page(0x4000_0000), 16);
        assert_eq!(aspace.translate(VirtualAddress::new(0x4000_0000)), None);
        assert_eq!(aspace.tlb().flushed.borrow().len(), 32);
    }

    #[test]
    fn remap_overwrites_present_leaf() {
        let (phys, mut alloc) = setup(16);
        let aspace = AddressSpace::new(&phys, frame(0), RecordingTlb::default());
        let va = page(0x1000_0000);

        aspace.map_virtual_page(&mut alloc, frame(0x5000), va).unwrap();
        aspace.map_virtual_page(&mut alloc, frame(0x6000), va).unwrap();
        assert_eq!(aspace.translate(va.base()), Some(PhysicalAddress::new(0x6000)));
    }

    #[test]
    fn unmap_of_unmapped_page_is_harmless() {
        let (phys, _) = setup(4);
        let aspace = AddressSpace::new(&phys, frame(0), RecordingTlb::default());
        assert_eq!(aspace.unmap_virtual_page(page(0x1234_5000)), None);
        assert_eq!(aspace.get_page_entry(page(0x1234_5000)), None);
        assert!(aspace.tlb().flushed.borrow().is_empty());
    }

    #[test]
    fn failed_walk_keeps_installed_levels() {
        // Root plus room for exactly two tables.
        let phys = TestPhys::with_frames(3);
        let mut alloc = BumpAlloc::new(0x1000, 0x3000);
        let aspace = AddressSpace::new(&phys, frame(0), RecordingTlb::default());

        let err = aspace
            .map_virtual_page(&mut alloc, frame(0x9000), page(0x8000_0000))
            .unwrap_err();
        assert_eq!(err, MapError::OutOfMemory { level: TableLevel::Pt });

        let pml4: &mut PageMapLevel4 = unsafe { phys.phys_to_mut(PhysicalAddress::zero()) };
        let (i4, ..) = split_indices(VirtualAddress::new(0x8000_0000));
        assert!(pml4.get(i4).present());
        assert!(aspace.tlb().flushed.borrow().is_empty());
    }

    #[test]
    fn alloc_virtual_page_returns_frame_on_failure() {
        // The data frame is the last one; no room for any table.
        let phys = TestPhys::with_frames(2);
        let mut alloc = BumpAlloc::new(0x1000, 0x2000);
        let aspace = AddressSpace::new(&phys, frame(0), RecordingTlb::default());

        let err = aspace
            .alloc_virtual_page(&mut alloc, page(0x4000_0000))
            .unwrap_err();
        assert_eq!(err, MapError::OutOfMemory { level: TableLevel::Pdpt });
        assert_eq!(alloc.freed, [frame(0x1000)]);
    }

    #[test]
    fn free_virtual_page_releases_frame_once() {
        let (phys, mut alloc) = setup(16);
        let aspace = AddressSpace::new(&phys, frame(0), RecordingTlb::default());
        let va = page(0x4000_0000);

        let data = aspace.alloc_virtual_page(&mut alloc, va).expect("alloc");
        assert_eq!(aspace.translate(va.base()), Some(data.base()));

        aspace.free_virtual_page(&mut alloc, va);
        aspace.free_virtual_page(&mut alloc, va);
        assert_eq!(alloc.freed, [data]);
        assert_eq!(aspace.translate(va.base()), None);
    }

    #[test]
    fn mmio_flags_reach_the_leaf() {
        let (phys, mut alloc) = setup(16);
        let aspace = AddressSpace::new(&phys, frame(0), RecordingTlb::default());
        let va = page(0xffff_e900_fee0_0000);

        aspace
            .map_virtual_page_with(&mut alloc, frame(0xfee0_0000), va, PageFlags::MMIO)
            .unwrap();
        let e = aspace.get_page_entry(va).unwrap();
        assert!(e.cache_disable() && e.no_execute() && !e.user());
    }

    #[test]
    fn align_helpers() {
        assert_eq!(align_up(0x1001, 0x1000), 0x2000);
        assert_eq!(align_down(0x1fff, 0x1000), 0x1000);
    }
}
