//! # Subheaps
//!
//! One contiguous span of heap memory, tiled by blocks. Every block starts
//! with a [`BlockHeader`]; the payload follows immediately:
//!
//! ```text
//! +--------+-----------+--------+-----------+-----+--------+-----------+
//! | header | payload   | header | payload   | ... | header | payload   |
//! +--------+-----------+--------+-----------+-----+--------+-----------+
//! ^ offset 0                                                    size ^
//! ```
//!
//! Blocks link to their address neighbours by **offset** within the subheap,
//! not by pointer. All header reads and writes go through
//! [`Subheap::header`] / [`Subheap::set_header`], which check bounds and
//! alignment.
//!
//! # Invariants
//! - Blocks tile the span: the sum of `HEADER_SIZE + size` over all blocks is
//!   the subheap size.
//! - Offsets and sizes are multiples of [`HEAP_ALIGNMENT`].
//! - `prev`/`next` form an address-ordered doubly linked list.

use core::ptr::NonNull;
use kernel_info::memory::HEAP_ALIGNMENT;

/// Link value for "no neighbour".
pub const NIL: usize = usize::MAX;

/// Size of the in-band block header.
pub const HEADER_SIZE: usize = size_of::<BlockHeader>();

const _: () = assert!(HEADER_SIZE.is_multiple_of(HEAP_ALIGNMENT));

/// Index of a subheap in the heap's arena.
#[repr(transparent)]
#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SubheapId(pub(crate) usize);

impl SubheapId {
    /// The subheap at `index` in creation order; the bootstrap region is 0.
    #[inline]
    #[must_use]
    pub const fn new(index: usize) -> Self {
        Self(index)
    }

    #[inline]
    #[must_use]
    pub const fn as_usize(self) -> usize {
        self.0
    }
}

/// Header stored in front of every block.
#[repr(C, align(16))]
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct BlockHeader {
    /// Payload bytes following the header.
    pub size: usize,
    /// Offset of the previous block, or [`NIL`].
    pub prev: usize,
    /// Offset of the next block, or [`NIL`].
    pub next: usize,
    pub used: bool,
}

/// A block as seen from outside: `(subheap, offset)` plus its header state.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct Block {
    pub subheap: SubheapId,
    /// Offset of the header within the subheap.
    pub offset: usize,
    /// Payload size.
    pub size: usize,
    pub used: bool,
}

/// One span of heap memory.
pub struct Subheap {
    base: NonNull<u8>,
    size: usize,
}

impl Subheap {
    /// Take over `[base, base + size)` as a single free block.
    ///
    /// # Safety
    /// - The span must be valid, writable and exclusively owned by the heap
    ///   for the rest of its lifetime.
    /// - `base` must be aligned to [`HEAP_ALIGNMENT`], `size` a multiple of it
    ///   and larger than [`HEADER_SIZE`].
    #[must_use]
    pub unsafe fn init(base: NonNull<u8>, size: usize) -> Self {
        debug_assert!(base.as_ptr().addr().is_multiple_of(HEAP_ALIGNMENT));
        debug_assert!(size.is_multiple_of(HEAP_ALIGNMENT) && size > HEADER_SIZE);

        let mut heap = Self { base, size };
        heap.set_header(
            0,
            BlockHeader {
                size: size - HEADER_SIZE,
                prev: NIL,
                next: NIL,
                used: false,
            },
        );
        heap
    }

    /// Total bytes, headers included.
    #[inline]
    #[must_use]
    pub const fn size(&self) -> usize {
        self.size
    }

    /// First byte of the span.
    #[inline]
    #[must_use]
    pub const fn base(&self) -> NonNull<u8> {
        self.base
    }

    /// Whether `ptr` points into the span.
    #[inline]
    #[must_use]
    pub fn contains(&self, ptr: *const u8) -> bool {
        let start = self.base.as_ptr().addr();
        ptr.addr().wrapping_sub(start) < self.size
    }

    /// Read the header at `offset`.
    ///
    /// # Panics
    /// If `offset` is misaligned or the header would leave the span.
    #[must_use]
    pub fn header(&self, offset: usize) -> BlockHeader {
        self.check(offset);
        // SAFETY: in bounds and aligned; the span is owned by this subheap.
        unsafe { self.base.add(offset).cast::<BlockHeader>().read() }
    }

    /// Write the header at `offset`.
    ///
    /// # Panics
    /// If `offset` is misaligned or the header would leave the span.
    pub fn set_header(&mut self, offset: usize, header: BlockHeader) {
        self.check(offset);
        // SAFETY: see `header`.
        unsafe { self.base.add(offset).cast::<BlockHeader>().write(header) }
    }

    #[inline]
    fn check(&self, offset: usize) {
        assert!(
            offset.is_multiple_of(HEAP_ALIGNMENT) && offset + HEADER_SIZE <= self.size,
            "block header at {offset:#x} outside subheap of {:#x} bytes",
            self.size
        );
    }

    /// Payload address of the block at `offset`.
    #[inline]
    #[must_use]
    pub fn payload(&self, offset: usize) -> NonNull<u8> {
        // SAFETY: `offset + HEADER_SIZE <= size` for every block.
        unsafe { self.base.add(offset + HEADER_SIZE) }
    }

    /// Header offset of the block whose payload starts at `ptr`.
    #[must_use]
    pub fn offset_of(&self, ptr: *const u8) -> Option<usize> {
        let rel = ptr.addr().checked_sub(self.base.as_ptr().addr())?;
        let offset = rel.checked_sub(HEADER_SIZE)?;
        (offset.is_multiple_of(HEAP_ALIGNMENT) && offset + HEADER_SIZE <= self.size)
            .then_some(offset)
    }

    /// Offsets of all blocks in address order.
    pub fn offsets(&self) -> impl Iterator<Item = usize> + '_ {
        core::iter::successors(Some(0), move |&off| {
            let next = self.header(off).next;
            (next != NIL).then_some(next)
        })
    }

    /// The smallest free block holding at least `size` bytes, as
    /// `(offset, block size)`. Ties go to the lowest offset.
    #[must_use]
    pub fn best_fit(&self, size: usize) -> Option<(usize, usize)> {
        let mut best: Option<(usize, usize)> = None;
        for off in self.offsets() {
            let h = self.header(off);
            if !h.used && h.size >= size && best.is_none_or(|(_, s)| h.size < s) {
                best = Some((off, h.size));
            }
        }
        best
    }

    /// Mark the free block at `offset` used, splitting off the tail when it
    /// can hold a header and at least one payload granule.
    pub fn take(&mut self, offset: usize, size: usize) {
        let mut h = self.header(offset);
        debug_assert!(!h.used && h.size >= size);

        if h.size > size + HEADER_SIZE {
            let tail = offset + HEADER_SIZE + size;
            self.set_header(
                tail,
                BlockHeader {
                    size: h.size - size - HEADER_SIZE,
                    prev: offset,
                    next: h.next,
                    used: false,
                },
            );
            if h.next != NIL {
                let mut next = self.header(h.next);
                next.prev = tail;
                self.set_header(h.next, next);
            }
            h.next = tail;
            h.size = size;
        }

        h.used = true;
        self.set_header(offset, h);
    }

    /// Mark the block at `offset` free and merge it with a free predecessor,
    /// then with a free successor.
    pub fn release(&mut self, offset: usize) {
        let mut off = offset;
        let mut h = self.header(off);
        h.used = false;
        self.set_header(off, h);

        if h.prev != NIL {
            let prev = self.header(h.prev);
            if !prev.used {
                off = h.prev;
                h = self.absorb(off, prev, h);
            }
        }

        if h.next != NIL {
            let next = self.header(h.next);
            if !next.used {
                self.absorb(off, h, next);
            }
        }
    }

    /// Merge `right` into its predecessor `left` at `left_off`.
    fn absorb(&mut self, left_off: usize, mut left: BlockHeader, right: BlockHeader) -> BlockHeader {
        left.size += HEADER_SIZE + right.size;
        left.next = right.next;
        if right.next != NIL {
            let mut after = self.header(right.next);
            after.prev = left_off;
            self.set_header(right.next, after);
        }
        self.set_header(left_off, left);
        left
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::leak_region;

    fn subheap(size: usize) -> Subheap {
        let region = leak_region(size);
        unsafe { Subheap::init(NonNull::from(region).cast(), size) }
    }

    fn sizes(h: &Subheap) -> Vec<(usize, bool)> {
        h.offsets()
            .map(|o| {
                let hdr = h.header(o);
                (hdr.size, hdr.used)
            })
            .collect()
    }

    fn tiles(h: &Subheap) -> bool {
        h.offsets().map(|o| HEADER_SIZE + h.header(o).size).sum::<usize>() == h.size()
    }

    #[test]
    fn header_is_two_granules() {
        assert_eq!(HEADER_SIZE, 32);
    }

    #[test]
    fn fresh_subheap_is_one_free_block() {
        let h = subheap(16384);
        assert_eq!(sizes(&h), [(16384 - 32, false)]);
    }

    #[test]
    fn take_splits_when_tail_fits_a_header() {
        let mut h = subheap(16384);
        h.take(0, 112);
        assert_eq!(sizes(&h), [(112, true), (16384 - 32 - 112 - 32, false)]);
        assert!(tiles(&h));
    }

    #[test]
    fn take_consumes_small_remainder() {
        let mut h = subheap(256);
        // 224 payload bytes; 224 - 192 = 32 is not more than a header.
        h.take(0, 192);
        assert_eq!(sizes(&h), [(224, true)]);
    }

    #[test]
    fn release_merges_both_sides() {
        let mut h = subheap(1024);
        h.take(0, 64);
        let b = h.header(0).next;
        h.take(b, 64);
        let c = h.header(b).next;
        h.take(c, 64);
        assert_eq!(sizes(&h).len(), 4);

        h.release(0);
        h.release(c);
        assert_eq!(sizes(&h).len(), 3);
        h.release(b);
        assert_eq!(sizes(&h), [(1024 - 32, false)]);
        assert!(tiles(&h));
    }

    #[test]
    fn best_fit_prefers_smallest_then_lowest() {
        let mut h = subheap(2048);
        let mut offs = Vec::new();
        let mut off = 0;
        for size in [128, 32, 64, 32, 64] {
            h.take(off, size);
            offs.push(off);
            off = h.header(off).next;
        }
        // Free 128, 64 and the second 64: smallest fit for 48 is the first 64.
        h.release(offs[0]);
        h.release(offs[2]);
        h.release(offs[4]);
        assert_eq!(h.best_fit(48), Some((offs[2], 64)));
        assert_eq!(h.best_fit(100), Some((offs[0], 128)));
    }

    #[test]
    fn offset_of_maps_payload_back() {
        let mut h = subheap(1024);
        h.take(0, 64);
        let next = h.header(0).next;
        let p = h.payload(next);
        assert_eq!(h.offset_of(p.as_ptr()), Some(next));
        assert!(h.contains(p.as_ptr()));
        assert_eq!(h.offset_of(h.base().as_ptr()), None);
    }

    #[test]
    #[should_panic(expected = "outside subheap")]
    fn header_access_is_bounds_checked() {
        let h = subheap(256);
        let _ = h.header(256 - 16);
    }
}
