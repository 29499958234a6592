//! # Physical Frame Allocator
//!
//! Buddy allocation over the usable physical ranges reported at boot. Each
//! range becomes a [`Zone`]; requests are served from the first zone, in
//! discovery order, that has a free block of the requested order.
//!
//! ```text
//!  order 2  [        0        |        1        ]
//!  order 1  [   0    |   1    |   2    |   3    ]
//!  order 0  [ 0 | 1  | 2 | 3  | 4 | 5  | 6 | 7  ]
//!            ▲ one bit per block, per order
//! ```
//!
//! The zone bitmaps live in the kernel heap. They are carved from it once,
//! while the heap is still confined to its bootstrap region.
//!
//! Misuse (orders above [`MAX_ORDER`], unaligned addresses) panics.

use crate::heap::KernelHeap;
use crate::zone::{Zone, ZoneLayout};
use kernel_info::boot::MemoryRange;
use kernel_info::memory::{MAX_ORDER, MAX_ZONES, PAGE_SHIFT};
use kernel_memory_addresses::{PhysicalAddress, PhysicalPage};
use kernel_vmem::FrameAlloc;

/// Failures of the physical allocator.
#[derive(Debug, Copy, Clone, PartialEq, Eq, thiserror::Error)]
pub enum FrameAllocError {
    /// No zone has a free block of this order.
    #[error("no free block of order {order}")]
    OutOfMemory { order: usize },
    /// The region extends past the end of its zone.
    #[error("region leaves its zone")]
    OutOfBounds,
    /// Some frame of the region is already allocated.
    #[error("region is already in use")]
    RegionInUse,
    /// More usable ranges than zone slots.
    #[error("more than {MAX_ZONES} usable memory ranges")]
    TooManyZones,
    /// The heap could not hold the zone bitmaps.
    #[error("out of heap memory for zone bitmaps")]
    BitmapAlloc,
}

/// The buddy allocator over all zones.
pub struct PhysicalMemory {
    zones: [Option<Zone>; MAX_ZONES],
    count: usize,
}

impl PhysicalMemory {
    /// Build one zone per usable range (**`init_phys_mem`**).
    ///
    /// Ranges holding less than one page are skipped.
    ///
    /// # Errors
    /// - [`FrameAllocError::BitmapAlloc`] if the bitmaps don't fit the heap.
    /// - [`FrameAllocError::TooManyZones`] if `ranges` has more than
    ///   [`MAX_ZONES`] usable entries.
    ///
    /// On failure every bitmap allocated so far is returned to `heap`.
    pub fn new(ranges: &[MemoryRange], heap: &mut KernelHeap) -> Result<Self, FrameAllocError> {
        let mut phys = Self {
            zones: [const { None }; MAX_ZONES],
            count: 0,
        };

        for range in ranges {
            let Some(layout) = ZoneLayout::of(range) else {
                log::warn!("skipping memory range {} (+{:#x}): no whole page", range.base, range.size);
                continue;
            };
            if phys.count == MAX_ZONES {
                phys.release(heap);
                return Err(FrameAllocError::TooManyZones);
            }

            let zone = match Zone::new(layout, heap) {
                Ok(zone) => zone,
                Err(e) => {
                    phys.release(heap);
                    return Err(e);
                }
            };
            log::info!(
                "zone {}: {} .. {} ({} blocks of order {})",
                phys.count,
                layout.base,
                layout.base + layout.mem_size(),
                layout.block_count,
                layout.max_order
            );
            phys.zones[phys.count] = Some(zone);
            phys.count += 1;
        }

        Ok(phys)
    }

    /// Return every bitmap to `heap`.
    fn release(&mut self, heap: &mut KernelHeap) {
        for slot in &mut self.zones[..self.count] {
            if let Some(zone) = slot.take() {
                zone.release(heap);
            }
        }
        self.count = 0;
    }

    /// The zones, in discovery order.
    pub fn zones(&self) -> impl Iterator<Item = &Zone> {
        self.zones[..self.count].iter().flatten()
    }

    fn zones_mut(&mut self) -> impl Iterator<Item = &mut Zone> {
        self.zones[..self.count].iter_mut().flatten()
    }

    #[inline]
    #[must_use]
    pub const fn zone_count(&self) -> usize {
        self.count
    }

    fn zone_of(&mut self, addr: PhysicalAddress) -> Option<&mut Zone> {
        self.zones_mut().find(|z| z.contains(addr))
    }

    /// Allocate a block of `2^order` frames.
    ///
    /// # Errors
    /// [`FrameAllocError::OutOfMemory`] if no zone has a free block of `order`.
    ///
    /// # Panics
    /// If `order` exceeds [`MAX_ORDER`].
    pub fn alloc_pages(&mut self, order: usize) -> Result<PhysicalAddress, FrameAllocError> {
        assert!(order <= MAX_ORDER, "order {order} above the maximum {MAX_ORDER}");
        if let Some(addr) = self.zones_mut().find_map(|z| z.alloc(order)) {
            return Ok(addr);
        }
        log::debug!("out of physical memory for order {order}");
        Err(FrameAllocError::OutOfMemory { order })
    }

    /// Free a block returned by [`alloc_pages`](Self::alloc_pages).
    ///
    /// # Panics
    /// If `addr` is not page aligned or `order` exceeds [`MAX_ORDER`].
    pub fn free_pages(&mut self, addr: PhysicalAddress, order: usize) {
        assert!(addr.is_page_aligned(), "free of unaligned address {addr}");
        assert!(order <= MAX_ORDER, "order {order} above the maximum {MAX_ORDER}");
        match self.zone_of(addr) {
            Some(zone) => zone.free(addr, order),
            None => log::warn!("free of {addr} outside every zone"),
        }
    }

    /// Allocate one frame.
    ///
    /// # Errors
    /// [`FrameAllocError::OutOfMemory`] if every zone is exhausted.
    #[inline]
    pub fn alloc_page(&mut self) -> Result<PhysicalAddress, FrameAllocError> {
        self.alloc_pages(0)
    }

    /// Free one frame.
    #[inline]
    pub fn free_page(&mut self, addr: PhysicalAddress) {
        self.free_pages(addr, 0);
    }

    /// Mark `count` frames from `addr` as used.
    ///
    /// Memory outside every zone is not managed; reserving it succeeds.
    ///
    /// # Errors
    /// - [`FrameAllocError::RegionInUse`] if any frame is already in use.
    /// - [`FrameAllocError::OutOfBounds`] if the region leaves its zone.
    ///
    /// # Panics
    /// If `addr` is not page aligned.
    pub fn alloc_region(&mut self, addr: PhysicalAddress, count: u64) -> Result<(), FrameAllocError> {
        assert!(addr.is_page_aligned(), "region at unaligned address {addr}");
        let Some(zone) = self.zone_of(addr) else {
            return Ok(());
        };
        let count = usize::try_from(count).map_err(|_| FrameAllocError::OutOfBounds)?;
        zone.reserve(addr, count)?;
        log::debug!("reserved {count} frames at {addr}");
        Ok(())
    }

    /// Release `count` frames from `addr`.
    ///
    /// # Panics
    /// If `addr` is not page aligned.
    pub fn free_region(&mut self, addr: PhysicalAddress, count: u64) {
        assert!(addr.is_page_aligned(), "region at unaligned address {addr}");
        if let Some(zone) = self.zone_of(addr) {
            zone.unreserve(addr, usize::try_from(count).unwrap_or(usize::MAX));
        }
    }

    /// Free frames across all zones.
    #[must_use]
    pub fn free_frames(&self) -> usize {
        self.zones().map(Zone::free_frames).sum()
    }

    /// Managed frames across all zones.
    #[must_use]
    pub fn total_frames(&self) -> usize {
        self.zones().map(|z| (z.mem_size() >> PAGE_SHIFT) as usize).sum()
    }
}

impl FrameAlloc for PhysicalMemory {
    #[inline]
    fn alloc_frame(&mut self) -> Option<PhysicalPage> {
        self.alloc_page().ok().map(PhysicalPage::from_addr)
    }

    #[inline]
    fn free_frame(&mut self, frame: PhysicalPage) {
        self.free_page(frame.base());
    }
}

impl core::fmt::Debug for PhysicalMemory {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_list().entries(self.zones()).finish()
    }
}
