//! # Buddy Zones
//!
//! A zone covers one usable physical range. It tracks blocks of `2^o` frames
//! for every order `o` in `0..=max_order`, one [`Bitmap`] per order.
//!
//! ## Bitmap invariant
//!
//! Bit `i` of order `o` is set exactly when at least one frame of block
//! `[base + i·2^o·4K, base + (i+1)·2^o·4K)` is allocated. Hence a block is free
//! when its own bit is clear, and a coarser bit is the OR of its two children.
//!
//! - Allocating a block sets its own bit, every finer bit it covers and every
//!   coarser bit above it.
//! - Freeing a block clears its own and finer bits, then walks upward clearing
//!   each parent whose two halves are clear.
//!
//! Buddies merge implicitly: a block becomes allocatable as soon as both of
//! its halves are clear.

use crate::bitmap::Bitmap;
use crate::frame_alloc::FrameAllocError;
use crate::heap::{KernelHeap, NoGrowth};
use kernel_info::boot::MemoryRange;
use kernel_info::memory::{MAX_ORDER, PAGE_SHIFT};
use kernel_memory_addresses::PhysicalAddress;

/// Geometry of a zone, derived from its memory range.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct ZoneLayout {
    /// First managed frame (range base rounded up to a page).
    pub base: PhysicalAddress,
    /// Largest order; every block of every order is naturally aligned.
    pub max_order: usize,
    /// Number of blocks of `max_order`.
    pub block_count: usize,
}

impl ZoneLayout {
    /// Compute the layout of `range`, or `None` if it holds no whole page.
    #[must_use]
    pub fn of(range: &MemoryRange) -> Option<Self> {
        let start = range.base.align_up_to_page();
        let end = range.end().align_down_to_page();
        if end <= start {
            return None;
        }

        let pages = (end - start) >> PAGE_SHIFT;
        let size_order = (u64::BITS - 1 - pages.leading_zeros()) as usize;
        let align_order = if start.as_u64() == 0 {
            MAX_ORDER
        } else {
            start.as_u64().trailing_zeros() as usize - PAGE_SHIFT as usize
        };
        let max_order = MAX_ORDER.min(size_order).min(align_order);
        if align_order < MAX_ORDER.min(size_order) {
            log::debug!("zone at {start}: base alignment limits the order to {max_order}");
        }
        let block_count = usize::try_from(pages >> max_order).ok()?;

        Some(Self {
            base: start,
            max_order,
            block_count,
        })
    }

    /// Managed frames.
    #[inline]
    #[must_use]
    pub const fn pages(&self) -> usize {
        self.block_count << self.max_order
    }

    /// Managed bytes: whole maximal blocks only.
    #[inline]
    #[must_use]
    pub const fn mem_size(&self) -> u64 {
        (self.pages() as u64) << PAGE_SHIFT
    }

    /// Bits in the bitmap of `order`.
    #[inline]
    #[must_use]
    pub const fn bits(&self, order: usize) -> usize {
        self.block_count << (self.max_order - order)
    }
}

/// One buddy-managed physical range.
pub struct Zone {
    layout: ZoneLayout,
    bitmaps: [Option<Bitmap>; MAX_ORDER + 1],
}

impl Zone {
    /// Create a zone with all blocks free, taking its bitmaps from `heap`.
    ///
    /// # Errors
    /// [`FrameAllocError::BitmapAlloc`] if the heap cannot hold the bitmaps;
    /// bitmaps allocated up to that point are returned to the heap.
    pub fn new(layout: ZoneLayout, heap: &mut KernelHeap) -> Result<Self, FrameAllocError> {
        let mut zone = Self {
            layout,
            bitmaps: [const { None }; MAX_ORDER + 1],
        };

        for order in (0..=layout.max_order).rev() {
            let bits = layout.bits(order);
            let Some(words) = heap.alloc_words(&mut NoGrowth, Bitmap::words_for(bits)) else {
                log::warn!("no heap left for the order {order} bitmap of zone {}", layout.base);
                zone.release(heap);
                return Err(FrameAllocError::BitmapAlloc);
            };
            zone.bitmaps[order] = Some(Bitmap::new(words, bits));
        }

        Ok(zone)
    }

    /// Return the bitmaps to `heap`.
    pub fn release(mut self, heap: &mut KernelHeap) {
        for slot in &mut self.bitmaps {
            if let Some(bitmap) = slot.take() {
                // SAFETY: every bitmap was taken from `heap` in `new`.
                unsafe { heap.free_words(bitmap.into_words()) };
            }
        }
    }

    #[inline]
    #[must_use]
    pub const fn layout(&self) -> &ZoneLayout {
        &self.layout
    }

    #[inline]
    #[must_use]
    pub const fn base(&self) -> PhysicalAddress {
        self.layout.base
    }

    #[inline]
    #[must_use]
    pub const fn mem_size(&self) -> u64 {
        self.layout.mem_size()
    }

    #[inline]
    #[must_use]
    pub const fn max_order(&self) -> usize {
        self.layout.max_order
    }

    /// Whether `addr` falls inside the managed span.
    #[inline]
    #[must_use]
    pub fn contains(&self, addr: PhysicalAddress) -> bool {
        addr >= self.base() && addr - self.base() < self.mem_size()
    }

    /// Order-0 index of the frame at `addr`.
    #[inline]
    fn page_index(&self, addr: PhysicalAddress) -> usize {
        ((addr - self.base()) >> PAGE_SHIFT) as usize
    }

    /// The bitmap of `order`, if the zone has that order.
    #[inline]
    #[must_use]
    pub fn bitmap(&self, order: usize) -> Option<&Bitmap> {
        self.bitmaps.get(order)?.as_ref()
    }

    #[inline]
    fn map(&self, order: usize) -> &Bitmap {
        match &self.bitmaps[order] {
            Some(b) => b,
            None => unreachable!("zone without order {order} bitmap"),
        }
    }

    #[inline]
    fn map_mut(&mut self, order: usize) -> &mut Bitmap {
        match &mut self.bitmaps[order] {
            Some(b) => b,
            None => unreachable!("zone without order {order} bitmap"),
        }
    }

    /// Whether any frame of block `index` at `order` is in use, looking at
    /// the block's own bit and every finer bit it covers.
    #[must_use]
    pub fn test_buddies(&self, order: usize, index: usize) -> bool {
        (0..=order).any(|level| {
            let shift = order - level;
            self.map(level).any_in(index << shift, 1 << shift)
        })
    }

    fn set_buddies(&mut self, order: usize, index: usize) {
        for level in 0..=order {
            let shift = order - level;
            self.map_mut(level).set_range(index << shift, 1 << shift);
        }
        for level in order + 1..=self.max_order() {
            self.map_mut(level).set(index >> (level - order));
        }
    }

    fn clear_buddies(&mut self, order: usize, index: usize) {
        for level in 0..=order {
            let shift = order - level;
            self.map_mut(level).clear_range(index << shift, 1 << shift);
        }
        for level in order + 1..=self.max_order() {
            let parent = index >> (level - order);
            if !self.refresh(level, parent) {
                break;
            }
        }
    }

    /// Recompute bit `parent` at `level` from its two children; returns
    /// whether it ended up clear.
    fn refresh(&mut self, level: usize, parent: usize) -> bool {
        let used = self.map(level - 1).any_in(parent * 2, 2);
        let map = self.map_mut(level);
        if used {
            map.set(parent);
        } else {
            map.clear(parent);
        }
        !used
    }

    /// Allocate the lowest free block of `order`.
    pub fn alloc(&mut self, order: usize) -> Option<PhysicalAddress> {
        if order > self.max_order() {
            return None;
        }

        let mut from = 0;
        while let Some(index) = self.map(order).first_clear(from) {
            if !self.test_buddies(order, index) {
                self.set_buddies(order, index);
                return Some(self.base() + (((index as u64) << order) << PAGE_SHIFT));
            }
            from = index + 1;
        }
        None
    }

    /// Free the block of `order` at `addr`.
    pub fn free(&mut self, addr: PhysicalAddress, order: usize) {
        if order > self.max_order() {
            log::warn!("free of order {order} block {addr} in a zone of order {}", self.max_order());
            return;
        }
        let index = self.page_index(addr) >> order;
        self.clear_buddies(order, index);
    }

    /// Mark the frames `[addr, addr + count pages)` used.
    ///
    /// # Errors
    /// - [`FrameAllocError::OutOfBounds`] if the range leaves the zone.
    /// - [`FrameAllocError::RegionInUse`] if any frame is already in use.
    pub fn reserve(&mut self, addr: PhysicalAddress, count: usize) -> Result<(), FrameAllocError> {
        let first = self.page_index(addr);
        first
            .checked_add(count)
            .filter(|&end| end <= self.layout.pages())
            .ok_or(FrameAllocError::OutOfBounds)?;
        if count == 0 {
            return Ok(());
        }
        if self.map(0).any_in(first, count) {
            return Err(FrameAllocError::RegionInUse);
        }

        self.map_mut(0).set_range(first, count);
        let last = first + count - 1;
        for level in 1..=self.max_order() {
            let lo = first >> level;
            let hi = last >> level;
            self.map_mut(level).set_range(lo, hi - lo + 1);
        }
        Ok(())
    }

    /// Mark the frames `[addr, addr + count pages)` free, clamped to the zone.
    pub fn unreserve(&mut self, addr: PhysicalAddress, count: usize) {
        let first = self.page_index(addr);
        let count = count.min(self.layout.pages().saturating_sub(first));
        if count == 0 {
            return;
        }

        self.map_mut(0).clear_range(first, count);
        let last = first + count - 1;
        for level in 1..=self.max_order() {
            for parent in (first >> level)..=(last >> level) {
                self.refresh(level, parent);
            }
        }
    }

    /// Frames not in use.
    #[must_use]
    pub fn free_frames(&self) -> usize {
        self.layout.pages() - self.map(0).count_ones()
    }
}

impl core::fmt::Debug for Zone {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Zone")
            .field("base", &self.base())
            .field("mem_size", &self.mem_size())
            .field("max_order", &self.max_order())
            .field("free_frames", &self.free_frames())
            .finish()
    }
}
