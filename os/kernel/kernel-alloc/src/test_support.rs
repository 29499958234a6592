//! Host-side fakes shared by the unit tests.

use crate::frame_alloc::PhysicalMemory;
use crate::heap::{HeapBacking, KernelHeap};
use core::cell::RefCell;
use core::ptr::NonNull;
use kernel_info::boot::MemoryRange;
use kernel_memory_addresses::{PhysicalAddress, PhysicalPage, VirtualPage};
use kernel_vmem::{AddressSpace, PhysMapper, TlbFlush};

/// A leaked, zeroed, 16-byte aligned buffer.
pub(crate) fn leak_region(bytes: usize) -> &'static mut [u8] {
    let words: &'static mut [u128] = vec![0u128; bytes.div_ceil(16)].leak();
    // SAFETY: the leaked words cover at least `bytes` bytes.
    unsafe { core::slice::from_raw_parts_mut(words.as_mut_ptr().cast::<u8>(), bytes) }
}

/// A heap over a fresh buffer of exactly `bytes` bytes.
pub(crate) fn test_heap(bytes: usize) -> KernelHeap {
    KernelHeap::from_static(leak_region(bytes))
}

/// Grows the heap from leaked buffers and records every request.
#[derive(Default)]
pub(crate) struct VecBacking {
    pub grown: Vec<usize>,
    pub fail: bool,
}

impl HeapBacking for VecBacking {
    fn grow(&mut self, bytes: usize) -> Option<NonNull<u8>> {
        if self.fail {
            return None;
        }
        self.grown.push(bytes);
        Some(NonNull::from(leak_region(bytes)).cast())
    }
}

#[repr(align(4096))]
struct Aligned4K(#[allow(dead_code)] [u8; 4096]);

/// Host RAM: physical address `pa` lives in frame `pa / 4096`.
pub(crate) struct TestPhys {
    frames: *mut Aligned4K,
    count: usize,
}

impl TestPhys {
    /// Leaked, so references from the mapper never alias a live borrow.
    pub(crate) fn leaked(count: usize) -> &'static Self {
        let v: Vec<Aligned4K> = (0..count).map(|_| Aligned4K([0; 4096])).collect();
        let frames = Vec::leak(v).as_mut_ptr();
        Box::leak(Box::new(Self { frames, count }))
    }

    pub(crate) const fn size(&self) -> u64 {
        (self.count as u64) << 12
    }
}

impl PhysMapper for TestPhys {
    unsafe fn phys_to_mut<'a, T>(&self, pa: PhysicalAddress) -> &'a mut T {
        let idx = (pa.as_u64() >> 12) as usize;
        let off = (pa.as_u64() & 0xfff) as usize;
        assert!(idx < self.count, "{pa} outside test RAM");
        // SAFETY: in bounds; the caller promises `T` matches.
        unsafe { &mut *self.frames.add(idx).cast::<u8>().add(off).cast::<T>() }
    }
}

#[derive(Default)]
pub(crate) struct RecordingTlb {
    pub flushed: RefCell<Vec<VirtualPage>>,
}

impl TlbFlush for RecordingTlb {
    fn flush_page(&self, page: VirtualPage) {
        self.flushed.borrow_mut().push(page);
    }
}

pub(crate) type TestSpace = AddressSpace<'static, TestPhys, RecordingTlb>;

/// `count` frames of RAM managed by a buddy allocator, with an address space
/// rooted at the first frame it hands out.
pub(crate) fn machine(count: usize) -> (PhysicalMemory, TestSpace) {
    let ram = TestPhys::leaked(count);
    let range = MemoryRange::new(PhysicalAddress::zero(), ram.size());
    let mut phys = PhysicalMemory::new(&[range], &mut test_heap(256 * 1024)).expect("zones");
    let root = phys.alloc_page().expect("root frame");
    let aspace = AddressSpace::new(ram, PhysicalPage::from_addr(root), RecordingTlb::default());
    (phys, aspace)
}
