//! # Kernel Memory Context
//!
//! [`KernelMemory`] owns every piece of memory management state: the heap,
//! the buddy allocator, the kernel address space, the growth break and the
//! I/O resource tables. All entry points take `&mut self` (or `&self` for
//! queries), so exclusive access is checked by the compiler; callers that
//! reach it from interrupt context serialize access themselves.
//!
//! ## Bring-up
//!
//! [`KernelMemory::init`] runs once, right after the boot loader handed over
//! with paging enabled:
//!
//! 1. Build buddy zones from the usable ranges. The zone bitmaps come from
//!    the bootstrap heap.
//! 2. Reserve the frames of the kernel image and of the boot page tables.
//! 3. Map every usable range at `PHYSMEM_VIRTUAL_BASE + base`.
//! 4. Drop the loader's low identity window.
//!
//! Any failure is returned as is; the boot path has nothing to fall back to
//! and halts.

use crate::frame_alloc::{FrameAllocError, PhysicalMemory};
use crate::heap::{HeapBacking, KernelHeap};
use crate::resource::{IoResources, MmioRegion, Resource, ResourceError};
use crate::vmm::{BreakError, VirtualBreak};
use core::ptr::NonNull;
use kernel_info::boot::MemoryRange;
use kernel_info::memory::{
    BOOT_PAGE_TABLE_FRAMES, BOOT_PAGE_TABLES_BASE, IDENTITY_MAP_SIZE, KERNEL_PHYSICAL_BASE,
    KERNEL_SIZE, PAGE_SHIFT, PHYSMEM_VIRTUAL_BASE,
};
use kernel_memory_addresses::{PhysicalAddress, PhysicalPage, VirtualAddress, VirtualPage};
use kernel_vmem::{AddressSpace, MapError, PhysMapper, PtEntry, TlbFlush};

#[derive(Debug, Copy, Clone, PartialEq, Eq, thiserror::Error)]
pub enum MemoryError {
    #[error("physical memory: {0}")]
    Frame(#[from] FrameAllocError),
    #[error("page tables: {0}")]
    Map(#[from] MapError),
    #[error("break: {0}")]
    Break(#[from] BreakError),
    #[error("resources: {0}")]
    Resource(#[from] ResourceError),
}

/// Where the loader left things.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct BootLayout {
    pub kernel_image: PhysicalAddress,
    pub kernel_size: u64,
    /// First frame of the loader's page tables.
    pub boot_tables: PhysicalAddress,
    pub boot_table_frames: u64,
    /// Base of the direct map.
    pub physmem_base: VirtualAddress,
    /// Size of the low identity window to drop.
    pub identity_size: u64,
}

impl BootLayout {
    pub const DEFAULT: Self = Self {
        kernel_image: PhysicalAddress::new(KERNEL_PHYSICAL_BASE),
        kernel_size: KERNEL_SIZE,
        boot_tables: PhysicalAddress::new(BOOT_PAGE_TABLES_BASE),
        boot_table_frames: BOOT_PAGE_TABLE_FRAMES,
        physmem_base: VirtualAddress::new(PHYSMEM_VIRTUAL_BASE),
        identity_size: IDENTITY_MAP_SIZE,
    };
}

impl Default for BootLayout {
    fn default() -> Self {
        Self::DEFAULT
    }
}

/// Grows the heap by moving the break.
pub struct BreakBacking<'a, 'm, M: PhysMapper, T: TlbFlush> {
    pub aspace: &'a AddressSpace<'m, M, T>,
    pub frames: &'a mut PhysicalMemory,
    pub brk: &'a mut VirtualBreak,
}

impl<M: PhysMapper, T: TlbFlush> BreakBacking<'_, '_, M, T> {
    /// Move a mid-page break to the next page, then grow it by `increment`.
    fn grow_aligned(&mut self, increment: i64) -> Result<VirtualAddress, BreakError> {
        let start = self.brk.brk().align_up_to_page();
        self.brk.vbrk(self.aspace, self.frames, start)?;
        self.brk.vsbrk(self.aspace, self.frames, increment)
    }
}

impl<M: PhysMapper, T: TlbFlush> HeapBacking for BreakBacking<'_, '_, M, T> {
    fn grow(&mut self, bytes: usize) -> Option<NonNull<u8>> {
        let increment = i64::try_from(bytes).ok()?;
        match self.grow_aligned(increment) {
            Ok(prev) => NonNull::new(prev.as_mut_ptr()),
            Err(e) => {
                log::debug!("heap growth by {bytes:#x} bytes failed: {e}");
                None
            }
        }
    }
}

/// The kernel's memory management state.
pub struct KernelMemory<'m, M: PhysMapper, T: TlbFlush> {
    heap: KernelHeap,
    phys: PhysicalMemory,
    aspace: AddressSpace<'m, M, T>,
    brk: VirtualBreak,
    io: IoResources,
}

impl<'m, M: PhysMapper, T: TlbFlush> KernelMemory<'m, M, T> {
    /// Bring up memory management.
    ///
    /// `heap` is the bootstrap heap, `ranges` the usable physical ranges in
    /// map order and `aspace` the loader's address space.
    ///
    /// # Errors
    /// - [`MemoryError::Frame`] if the zones cannot be built or a boot
    ///   reservation collides.
    /// - [`MemoryError::Map`] if the direct map runs out of table frames.
    pub fn init(
        mut heap: KernelHeap,
        ranges: &[MemoryRange],
        aspace: AddressSpace<'m, M, T>,
        layout: &BootLayout,
    ) -> Result<Self, MemoryError> {
        let mut phys = PhysicalMemory::new(ranges, &mut heap)?;
        log::info!(
            "physical memory: {} frames in {} zones",
            phys.total_frames(),
            phys.zone_count()
        );

        phys.alloc_region(layout.kernel_image, layout.kernel_size >> PAGE_SHIFT)?;
        phys.alloc_region(layout.boot_tables, layout.boot_table_frames)?;
        log::info!(
            "reserved kernel image at {} and {} boot table frames at {}",
            layout.kernel_image,
            layout.boot_table_frames,
            layout.boot_tables
        );

        for range in ranges {
            let start = range.base.align_up_to_page();
            let end = range.end().align_down_to_page();
            if end <= start {
                continue;
            }
            aspace.map_virtual_region(
                &mut phys,
                PhysicalPage::from_addr(start),
                VirtualPage::from_addr(layout.physmem_base + start.as_u64()),
                (end - start) >> PAGE_SHIFT,
            )?;
        }
        log::info!("physical memory mapped at {}", layout.physmem_base);

        aspace.unmap_virtual_region(
            VirtualPage::from_addr(VirtualAddress::zero()),
            layout.identity_size >> PAGE_SHIFT,
        );
        log::info!("identity window of {:#x} bytes removed", layout.identity_size);

        Ok(Self {
            heap,
            phys,
            aspace,
            brk: VirtualBreak::kernel(),
            io: IoResources::new(),
        })
    }

    #[inline]
    #[must_use]
    pub const fn heap(&self) -> &KernelHeap {
        &self.heap
    }

    #[inline]
    #[must_use]
    pub const fn phys(&self) -> &PhysicalMemory {
        &self.phys
    }

    #[inline]
    #[must_use]
    pub const fn aspace(&self) -> &AddressSpace<'m, M, T> {
        &self.aspace
    }

    #[inline]
    #[must_use]
    pub const fn brk(&self) -> &VirtualBreak {
        &self.brk
    }

    #[inline]
    #[must_use]
    pub const fn io(&self) -> &IoResources {
        &self.io
    }

    // Frames

    /// # Errors
    /// See [`PhysicalMemory::alloc_pages`].
    pub fn alloc_pages(&mut self, order: usize) -> Result<PhysicalAddress, FrameAllocError> {
        self.phys.alloc_pages(order)
    }

    pub fn free_pages(&mut self, addr: PhysicalAddress, order: usize) {
        self.phys.free_pages(addr, order);
    }

    /// # Errors
    /// See [`PhysicalMemory::alloc_page`].
    pub fn alloc_page(&mut self) -> Result<PhysicalAddress, FrameAllocError> {
        self.phys.alloc_page()
    }

    pub fn free_page(&mut self, addr: PhysicalAddress) {
        self.phys.free_page(addr);
    }

    /// # Errors
    /// See [`PhysicalMemory::alloc_region`].
    pub fn alloc_region(&mut self, addr: PhysicalAddress, count: u64) -> Result<(), FrameAllocError> {
        self.phys.alloc_region(addr, count)
    }

    pub fn free_region(&mut self, addr: PhysicalAddress, count: u64) {
        self.phys.free_region(addr, count);
    }

    // Page tables

    /// # Errors
    /// See [`AddressSpace::map_virtual_page`].
    pub fn map_virtual_page(&mut self, phys: PhysicalPage, virt: VirtualPage) -> Result<(), MapError> {
        self.aspace.map_virtual_page(&mut self.phys, phys, virt)
    }

    /// # Errors
    /// See [`AddressSpace::map_virtual_region`].
    pub fn map_virtual_region(
        &mut self,
        phys: PhysicalPage,
        virt: VirtualPage,
        count: u64,
    ) -> Result<(), MapError> {
        self.aspace.map_virtual_region(&mut self.phys, phys, virt, count)
    }

    pub fn unmap_virtual_page(&mut self, virt: VirtualPage) -> Option<PhysicalPage> {
        self.aspace.unmap_virtual_page(virt)
    }

    pub fn unmap_virtual_region(&mut self, virt: VirtualPage, count: u64) {
        self.aspace.unmap_virtual_region(virt, count);
    }

    /// # Errors
    /// See [`AddressSpace::alloc_virtual_page`].
    pub fn alloc_virtual_page(&mut self, virt: VirtualPage) -> Result<PhysicalPage, MapError> {
        self.aspace.alloc_virtual_page(&mut self.phys, virt)
    }

    pub fn free_virtual_page(&mut self, virt: VirtualPage) {
        self.aspace.free_virtual_page(&mut self.phys, virt);
    }

    #[must_use]
    pub fn get_page_entry(&self, virt: VirtualPage) -> Option<PtEntry> {
        self.aspace.get_page_entry(virt)
    }

    #[must_use]
    pub fn translate(&self, va: VirtualAddress) -> Option<PhysicalAddress> {
        self.aspace.translate(va)
    }

    // Break

    /// # Errors
    /// See [`VirtualBreak::vsbrk`].
    pub fn vsbrk(&mut self, increment: i64) -> Result<VirtualAddress, BreakError> {
        self.brk.vsbrk(&self.aspace, &mut self.phys, increment)
    }

    /// # Errors
    /// See [`VirtualBreak::vbrk`].
    pub fn vbrk(&mut self, addr: VirtualAddress) -> Result<(), BreakError> {
        self.brk.vbrk(&self.aspace, &mut self.phys, addr)
    }

    // Heap

    fn backing(&mut self) -> (&mut KernelHeap, BreakBacking<'_, 'm, M, T>) {
        (
            &mut self.heap,
            BreakBacking {
                aspace: &self.aspace,
                frames: &mut self.phys,
                brk: &mut self.brk,
            },
        )
    }

    pub fn kmalloc(&mut self, size: usize) -> Option<NonNull<u8>> {
        let (heap, mut backing) = self.backing();
        heap.kmalloc(&mut backing, size)
    }

    pub fn kzalloc(&mut self, size: usize) -> Option<NonNull<u8>> {
        let (heap, mut backing) = self.backing();
        heap.kzalloc(&mut backing, size)
    }

    pub fn kstrdup(&mut self, s: &str) -> Option<NonNull<u8>> {
        let (heap, mut backing) = self.backing();
        heap.kstrdup(&mut backing, s)
    }

    /// # Safety
    /// See [`KernelHeap::kfree`].
    pub unsafe fn kfree(&mut self, ptr: *mut u8) {
        // SAFETY: forwarded from the caller.
        unsafe { self.heap.kfree(ptr) }
    }

    // I/O resources

    /// # Errors
    /// See [`IoResources::request_port_region`].
    pub fn request_port_region(&mut self, base: u64, size: u64) -> Result<Resource, ResourceError> {
        self.io.request_port_region(base, size)
    }

    pub fn release_port_region(&mut self, res: &Resource) -> bool {
        self.io.release_port_region(res)
    }

    /// # Errors
    /// See [`IoResources::request_mem_region`].
    pub fn request_mem_region(
        &mut self,
        base: PhysicalAddress,
        size: u64,
    ) -> Result<MmioRegion, ResourceError> {
        self.io
            .request_mem_region(&self.aspace, &mut self.phys, base, size)
    }

    pub fn release_mem_region(&mut self, region: &MmioRegion) -> bool {
        self.io.release_mem_region(&self.aspace, region)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{RecordingTlb, TestPhys, machine, test_heap};
    use kernel_info::memory::{MMIO_VIRTUAL_BASE, PML4_BASE_ADDR, VAS_BASE};
    use kernel_vmem::FrameAlloc;

    /// 8 MiB of RAM.
    const FRAMES: usize = 2048;

    /// Hands out the loader's table frames.
    struct LoaderFrames {
        next: u64,
        end: u64,
    }

    impl FrameAlloc for LoaderFrames {
        fn alloc_frame(&mut self) -> Option<PhysicalPage> {
            (self.next < self.end).then(|| {
                self.next += 1;
                PhysicalPage::from_frame_number(self.next - 1)
            })
        }

        fn free_frame(&mut self, _frame: PhysicalPage) {}
    }

    /// The state the loader leaves behind: PML4 at 0x1000, tables from the
    /// following boot frames and the low 2 MiB identity mapped.
    fn loader_space() -> (&'static TestPhys, AddressSpace<'static, TestPhys, RecordingTlb>) {
        let ram = TestPhys::leaked(FRAMES);
        let root = PhysicalPage::from_addr(PhysicalAddress::new(PML4_BASE_ADDR));
        let aspace = AddressSpace::new(ram, root, RecordingTlb::default());
        let mut frames = LoaderFrames {
            next: 2,
            end: BOOT_PAGE_TABLE_FRAMES,
        };
        aspace
            .map_virtual_region(
                &mut frames,
                PhysicalPage::from_addr(PhysicalAddress::zero()),
                VirtualPage::from_addr(VirtualAddress::zero()),
                IDENTITY_MAP_SIZE >> PAGE_SHIFT,
            )
            .expect("identity map");
        (ram, aspace)
    }

    fn boot() -> KernelMemory<'static, TestPhys, RecordingTlb> {
        let (ram, aspace) = loader_space();
        let ranges = [MemoryRange::new(PhysicalAddress::zero(), ram.size())];
        KernelMemory::init(test_heap(256 * 1024), &ranges, aspace, &BootLayout::DEFAULT)
            .expect("init")
    }

    #[test]
    fn boot_reserves_kernel_image_and_tables() {
        let mut mm = boot();
        let kernel = PhysicalAddress::new(KERNEL_PHYSICAL_BASE);
        let last = kernel + (KERNEL_SIZE - 4096);
        assert_eq!(mm.alloc_region(kernel, 1), Err(FrameAllocError::RegionInUse));
        assert_eq!(mm.alloc_region(last, 1), Err(FrameAllocError::RegionInUse));
        assert_eq!(
            mm.alloc_region(PhysicalAddress::new(PML4_BASE_ADDR), 1),
            Err(FrameAllocError::RegionInUse)
        );

        for _ in 0..64 {
            let frame = mm.alloc_page().expect("frame");
            assert!(frame.as_u64() >= BOOT_PAGE_TABLE_FRAMES << PAGE_SHIFT);
            let image = KERNEL_PHYSICAL_BASE..KERNEL_PHYSICAL_BASE + KERNEL_SIZE;
            assert!(!image.contains(&frame.as_u64()));
        }
    }

    #[test]
    fn physical_memory_is_visible_in_direct_map() {
        let mm = boot();
        for pa in [0u64, 0x1234, 0x20_0000, 0x7f_f123] {
            assert_eq!(
                mm.translate(VirtualAddress::new(PHYSMEM_VIRTUAL_BASE + pa)),
                Some(PhysicalAddress::new(pa))
            );
        }
        assert!(mm.translate(VirtualAddress::new(PHYSMEM_VIRTUAL_BASE + 0x80_0000)).is_none());
    }

    #[test]
    fn identity_window_is_removed() {
        let mm = boot();
        assert!(mm.translate(VirtualAddress::new(0x1000)).is_none());
        assert!(mm.translate(VirtualAddress::new(IDENTITY_MAP_SIZE - 1)).is_none());

        // The leaf keeps its frame number; only the present bit is cleared.
        let entry = mm.get_page_entry(VirtualAddress::new(0x5000).page()).expect("leaf");
        assert!(!entry.present());
        assert_eq!(entry.frame(), PhysicalPage::from_frame_number(5));
    }

    #[test]
    fn colliding_reservations_fail_bring_up() {
        let (ram, aspace) = loader_space();
        let ranges = [MemoryRange::new(PhysicalAddress::zero(), ram.size())];
        let layout = BootLayout {
            kernel_image: PhysicalAddress::zero(),
            ..BootLayout::DEFAULT
        };
        assert!(matches!(
            KernelMemory::init(test_heap(256 * 1024), &ranges, aspace, &layout),
            Err(MemoryError::Frame(FrameAllocError::RegionInUse))
        ));
    }

    #[test]
    fn break_grows_into_vas_window() {
        let mut mm = boot();
        let free = mm.phys().free_frames();
        assert_eq!(mm.vsbrk(3 * 4096), Ok(VirtualAddress::new(VAS_BASE)));
        assert!(mm.translate(VirtualAddress::new(VAS_BASE + 2 * 4096)).is_some());
        assert!(mm.phys().free_frames() < free - 2);

        mm.vbrk(VirtualAddress::new(VAS_BASE)).expect("shrink");
        assert!(mm.translate(VirtualAddress::new(VAS_BASE)).is_none());
    }

    #[test]
    fn heap_entry_points_use_bootstrap_heap() {
        let mut mm = boot();
        let used = mm.heap().stats().used_blocks;
        let p = mm.kzalloc(48).expect("alloc");
        let s = mm.kstrdup("mm").expect("dup");
        assert_eq!(mm.heap().stats().used_blocks, used + 2);
        unsafe {
            mm.kfree(s.as_ptr());
            mm.kfree(p.as_ptr());
        }
        assert_eq!(mm.heap().stats().used_blocks, used);
        assert_eq!(mm.brk().brk(), VirtualAddress::new(VAS_BASE));
    }

    #[test]
    fn mmio_regions_map_into_window() {
        let mut mm = boot();
        let region = mm
            .request_mem_region(PhysicalAddress::new(0xfebf_1000), 0x100)
            .expect("claim");
        assert_eq!(region.virt, VirtualAddress::new(MMIO_VIRTUAL_BASE + 0xfebf_1000));
        assert_eq!(mm.translate(region.virt), Some(region.phys()));

        assert!(mm.release_mem_region(&region));
        assert!(mm.translate(region.virt).is_none());
    }

    #[test]
    fn port_regions_round_trip() {
        let mut mm = boot();
        let res = mm.request_port_region(0xcf8, 8).expect("claim");
        assert_eq!(mm.request_port_region(0xcfc, 4), Err(ResourceError::Conflict));
        assert!(mm.release_port_region(&res));
        assert!(mm.io().ports().is_empty());
    }

    #[test]
    fn page_entry_points_share_the_frame_allocator() {
        let mut mm = boot();
        let va = VirtualAddress::new(0xffff_a000_0000_0000).page();
        let frame = mm.alloc_virtual_page(va).expect("map");
        assert_eq!(mm.translate(va.base()), Some(frame.base()));
        mm.free_virtual_page(va);
        assert!(mm.translate(va.base()).is_none());
        assert_eq!(mm.unmap_virtual_page(va), None);

        let frame = PhysicalPage::from_addr(mm.alloc_page().expect("frame"));
        mm.map_virtual_region(frame, va, 1).expect("map");
        assert_eq!(mm.unmap_virtual_page(va), Some(frame));
    }

    #[test]
    fn break_backing_hands_out_page_aligned_spans() {
        let (mut phys, aspace) = machine(64);
        let mut brk = VirtualBreak::kernel();
        brk.vsbrk(&aspace, &mut phys, 100).expect("nudge");

        let mut backing = BreakBacking {
            aspace: &aspace,
            frames: &mut phys,
            brk: &mut brk,
        };
        let span = backing.grow(2 * 4096).expect("grown");

        let start = VAS_BASE + 4096;
        assert_eq!(span.as_ptr().addr() as u64, start);
        assert_eq!(brk.brk(), VirtualAddress::new(start + 2 * 4096));
        for va in [start, start + 4096] {
            assert!(aspace.translate(VirtualAddress::new(va)).is_some());
        }
        assert!(aspace.translate(VirtualAddress::new(start + 2 * 4096)).is_none());
    }

    #[test]
    fn break_backing_reports_exhaustion() {
        let (mut phys, aspace) = machine(8);
        let mut brk = VirtualBreak::kernel();
        let mut backing = BreakBacking {
            aspace: &aspace,
            frames: &mut phys,
            brk: &mut brk,
        };
        assert!(backing.grow(16 * 4096).is_none());
        assert_eq!(brk.brk(), VirtualAddress::new(VAS_BASE));
    }
}
