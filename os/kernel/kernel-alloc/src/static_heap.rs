//! # Static Heap
//!
//! The bootstrap region backing the heap's first subheap. It lives in the
//! kernel image, so it is usable before any frame allocator or page table
//! exists, and it can be taken exactly once.

use crate::heap::KernelHeap;
use core::sync::atomic::{AtomicBool, Ordering};
use kernel_info::memory::INITIAL_HEAP_SIZE;

/// Heap storage with the payload alignment of the heap.
#[repr(align(16))]
struct HeapMem([u8; INITIAL_HEAP_SIZE]);

/// Backing storage, placed in a dedicated `.bss` section in the kernel image.
#[cfg_attr(target_os = "none", unsafe(link_section = ".bss.heap"))]
static mut HEAP: HeapMem = HeapMem([0; INITIAL_HEAP_SIZE]);

static TAKEN: AtomicBool = AtomicBool::new(false);

/// Hand out the bootstrap region. `None` on every call after the first.
#[must_use]
pub fn take_initial_heap() -> Option<&'static mut [u8]> {
    if TAKEN.swap(true, Ordering::AcqRel) {
        return None;
    }
    // SAFETY: the flag guarantees this is the only reference ever created.
    Some(unsafe { &mut (*(&raw mut HEAP)).0 })
}

impl KernelHeap {
    /// A heap over the bootstrap region, or `None` if it was already taken.
    #[must_use]
    pub fn initial() -> Option<Self> {
        take_initial_heap().map(Self::from_static)
    }
}
