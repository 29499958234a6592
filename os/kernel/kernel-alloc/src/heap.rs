//! # Kernel Heap
//!
//! Byte-granular allocation over a set of [subheaps](crate::subheap). The
//! first subheap is the static bootstrap region; further subheaps are
//! requested from a [`HeapBacking`] whenever no free block is large enough.
//!
//! Allocation is **best fit** across all subheaps: the smallest free block
//! that holds the (16-byte rounded) request wins; ties go to the earliest
//! subheap and the lowest offset. A block is split when the remainder can
//! hold a header plus payload. Freeing merges with free neighbours.
//!
//! Payloads are aligned to [`HEAP_ALIGNMENT`]. Blocks never move and never
//! change subheap; subheaps are never returned.

use crate::subheap::{Block, HEADER_SIZE, Subheap, SubheapId};
use core::ptr::NonNull;
use kernel_info::memory::{HEAP_ALIGNMENT, HEAP_GROWTH_MIN, MAX_SUBHEAPS, PAGE_SIZE};

/// Supplier of fresh memory for new subheaps.
pub trait HeapBacking {
    /// Provide `bytes` of writable memory, page aligned, owned by the heap
    /// from now on. `None` when no more memory can be had.
    fn grow(&mut self, bytes: usize) -> Option<NonNull<u8>>;
}

/// A backing that never grows; the heap stays within its current subheaps.
#[derive(Debug, Default, Copy, Clone)]
pub struct NoGrowth;

impl HeapBacking for NoGrowth {
    #[inline]
    fn grow(&mut self, _bytes: usize) -> Option<NonNull<u8>> {
        None
    }
}

/// Usage snapshot over all subheaps.
#[derive(Debug, Default, Copy, Clone, PartialEq, Eq)]
pub struct HeapStats {
    pub subheaps: usize,
    pub blocks: usize,
    pub used_blocks: usize,
    /// Payload bytes in used blocks.
    pub used_bytes: usize,
    /// Payload bytes in free blocks.
    pub free_bytes: usize,
    /// Payload of the largest free block.
    pub largest_free: usize,
}

/// The kernel heap.
pub struct KernelHeap {
    subheaps: [Option<Subheap>; MAX_SUBHEAPS],
    count: usize,
}

// SAFETY: the heap exclusively owns every subheap span; access is serialized
// through `&mut self`.
unsafe impl Send for KernelHeap {}

impl Default for KernelHeap {
    fn default() -> Self {
        Self::new()
    }
}

impl KernelHeap {
    /// A heap without any memory.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            subheaps: [const { None }; MAX_SUBHEAPS],
            count: 0,
        }
    }

    /// A heap whose first subheap is `region`.
    #[must_use]
    pub fn from_static(region: &'static mut [u8]) -> Self {
        let mut heap = Self::new();
        let size = region.len();
        // SAFETY: a `'static mut` borrow is exclusive for the rest of the program.
        let added = unsafe { heap.add_region(NonNull::from(region).cast(), size) };
        debug_assert!(added.is_some(), "static heap region of {size} bytes is unusable");
        heap
    }

    /// Add `[base, base + size)` as a new subheap. The start is aligned up to
    /// [`HEAP_ALIGNMENT`] and the size trimmed to a multiple of it.
    ///
    /// Returns `None` if the arena is full or the trimmed span cannot hold a
    /// block.
    ///
    /// # Safety
    /// The span must be valid, writable and never used by anything else.
    pub unsafe fn add_region(&mut self, base: NonNull<u8>, size: usize) -> Option<SubheapId> {
        if self.count == MAX_SUBHEAPS {
            log::warn!("subheap arena full; dropping region at {base:p}");
            return None;
        }

        let addr = base.as_ptr().addr();
        let skip = addr.checked_next_multiple_of(HEAP_ALIGNMENT)? - addr;
        let size = size.checked_sub(skip)? & !(HEAP_ALIGNMENT - 1);
        if size <= HEADER_SIZE {
            log::warn!("heap region at {base:p} too small ({size} bytes)");
            return None;
        }

        // SAFETY: `skip < HEAP_ALIGNMENT <= size` of the caller's span.
        let start = unsafe { base.add(skip) };
        let id = SubheapId(self.count);
        // SAFETY: forwarded from the caller; start and size are aligned.
        self.subheaps[self.count] = Some(unsafe { Subheap::init(start, size) });
        self.count += 1;

        log::debug!("subheap {} at {start:p}, {size:#x} bytes", id.0);
        Some(id)
    }

    /// Number of subheaps.
    #[inline]
    #[must_use]
    pub const fn subheap_count(&self) -> usize {
        self.count
    }

    /// Total size of a subheap, headers included.
    #[must_use]
    pub fn subheap_size(&self, id: SubheapId) -> Option<usize> {
        self.subheap(id).map(Subheap::size)
    }

    fn subheap(&self, id: SubheapId) -> Option<&Subheap> {
        self.subheaps.get(id.0)?.as_ref()
    }

    fn subheap_mut(&mut self, id: SubheapId) -> Option<&mut Subheap> {
        self.subheaps.get_mut(id.0)?.as_mut()
    }

    fn iter(&self) -> impl Iterator<Item = (SubheapId, &Subheap)> {
        self.subheaps[..self.count]
            .iter()
            .enumerate()
            .filter_map(|(i, h)| Some((SubheapId(i), h.as_ref()?)))
    }

    /// Allocate `size` bytes.
    ///
    /// Returns `None` for `size == 0` and when neither the heap nor `backing`
    /// can satisfy the request.
    pub fn kmalloc<B: HeapBacking + ?Sized>(
        &mut self,
        backing: &mut B,
        size: usize,
    ) -> Option<NonNull<u8>> {
        if size == 0 {
            return None;
        }
        let size = size.checked_next_multiple_of(HEAP_ALIGNMENT)?;

        let (id, offset) = match self.best_fit(size) {
            Some(found) => found,
            None => {
                let id = self.grow(backing, size)?;
                // A misaligned span is trimmed and may end up short.
                let Some((offset, _)) = self.subheap(id)?.best_fit(size) else {
                    log::debug!("grown subheap {} cannot hold {size} bytes", id.0);
                    return None;
                };
                (id, offset)
            }
        };

        let heap = self.subheap_mut(id)?;
        heap.take(offset, size);
        Some(heap.payload(offset))
    }

    /// [`kmalloc`](Self::kmalloc) with the payload zeroed.
    pub fn kzalloc<B: HeapBacking + ?Sized>(
        &mut self,
        backing: &mut B,
        size: usize,
    ) -> Option<NonNull<u8>> {
        let ptr = self.kmalloc(backing, size)?;
        // SAFETY: the block holds at least `size` payload bytes.
        unsafe { ptr.write_bytes(0, size) };
        Some(ptr)
    }

    /// Copy `s` into a fresh NUL-terminated allocation.
    pub fn kstrdup<B: HeapBacking + ?Sized>(
        &mut self,
        backing: &mut B,
        s: &str,
    ) -> Option<NonNull<u8>> {
        let len = s.len();
        let ptr = self.kmalloc(backing, len.checked_add(1)?)?;
        // SAFETY: the block holds `len + 1` bytes and cannot overlap `s`,
        // which is borrowed from outside the free space.
        unsafe {
            ptr.copy_from_nonoverlapping(NonNull::from(s.as_bytes()).cast(), len);
            ptr.add(len).write(0);
        }
        Some(ptr)
    }

    /// Return an allocation. Null is ignored; pointers outside every subheap
    /// are reported and ignored.
    ///
    /// # Safety
    /// `ptr` must be null or a live allocation of this heap.
    pub unsafe fn kfree(&mut self, ptr: *mut u8) {
        if ptr.is_null() {
            return;
        }
        let Some((id, offset)) = self.locate(ptr) else {
            log::warn!("kfree of {ptr:p}, which no subheap owns");
            return;
        };
        let Some(heap) = self.subheap_mut(id) else {
            return;
        };
        debug_assert!(heap.header(offset).used, "double free of {ptr:p}");
        heap.release(offset);
    }

    /// Zeroed storage for `words` 64-bit words, living until handed to
    /// [`free_words`](Self::free_words).
    pub fn alloc_words<B: HeapBacking + ?Sized>(
        &mut self,
        backing: &mut B,
        words: usize,
    ) -> Option<&'static mut [u64]> {
        let ptr = self.kzalloc(backing, words.checked_mul(size_of::<u64>())?)?;
        // SAFETY: zeroed, 16-byte aligned and exclusively ours until freed.
        Some(unsafe { core::slice::from_raw_parts_mut(ptr.cast::<u64>().as_ptr(), words) })
    }

    /// Return storage from [`alloc_words`](Self::alloc_words).
    ///
    /// # Safety
    /// `words` must come from `alloc_words` on this heap.
    pub unsafe fn free_words(&mut self, words: &'static mut [u64]) {
        // SAFETY: forwarded from the caller.
        unsafe { self.kfree(words.as_mut_ptr().cast()) }
    }

    /// The block whose payload starts at `ptr`.
    #[must_use]
    pub fn block_of(&self, ptr: *const u8) -> Option<Block> {
        let (id, offset) = self.locate(ptr)?;
        let h = self.subheap(id)?.header(offset);
        Some(Block {
            subheap: id,
            offset,
            size: h.size,
            used: h.used,
        })
    }

    /// Blocks of one subheap in address order.
    pub fn blocks(&self, id: SubheapId) -> impl Iterator<Item = Block> + '_ {
        self.subheap(id).into_iter().flat_map(move |heap| {
            heap.offsets().map(move |offset| {
                let h = heap.header(offset);
                Block {
                    subheap: id,
                    offset,
                    size: h.size,
                    used: h.used,
                }
            })
        })
    }

    #[must_use]
    pub fn stats(&self) -> HeapStats {
        let mut stats = HeapStats {
            subheaps: self.count,
            ..HeapStats::default()
        };
        for block in self.iter().flat_map(|(id, _)| self.blocks(id)) {
            stats.blocks += 1;
            if block.used {
                stats.used_blocks += 1;
                stats.used_bytes += block.size;
            } else {
                stats.free_bytes += block.size;
                stats.largest_free = stats.largest_free.max(block.size);
            }
        }
        stats
    }

    fn locate(&self, ptr: *const u8) -> Option<(SubheapId, usize)> {
        let (id, heap) = self.iter().find(|(_, h)| h.contains(ptr))?;
        Some((id, heap.offset_of(ptr)?))
    }

    fn best_fit(&self, size: usize) -> Option<(SubheapId, usize)> {
        let mut best: Option<(SubheapId, usize, usize)> = None;
        for (id, heap) in self.iter() {
            if let Some((offset, found)) = heap.best_fit(size)
                && best.is_none_or(|(_, _, s)| found < s)
            {
                best = Some((id, offset, found));
            }
        }
        best.map(|(id, offset, _)| (id, offset))
    }

    /// Add a subheap large enough for a `size` byte block.
    fn grow<B: HeapBacking + ?Sized>(&mut self, backing: &mut B, size: usize) -> Option<SubheapId> {
        if self.count == MAX_SUBHEAPS {
            log::debug!("heap exhausted: subheap arena full");
            return None;
        }

        let bytes = size
            .checked_add(HEADER_SIZE)?
            .max(HEAP_GROWTH_MIN)
            .checked_next_multiple_of(PAGE_SIZE as usize)?;

        let Some(base) = backing.grow(bytes) else {
            log::debug!("heap exhausted: no backing for {bytes:#x} bytes");
            return None;
        };

        // SAFETY: the backing hands over exclusive ownership of the span.
        unsafe { self.add_region(base, bytes) }
    }
}

impl core::fmt::Debug for KernelHeap {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("KernelHeap")
            .field("stats", &self.stats())
            .finish_non_exhaustive()
    }
}
