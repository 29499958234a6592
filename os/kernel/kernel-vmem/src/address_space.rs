//! # Address Space (x86-64, PML4-rooted)
//!
//! Strongly-typed helpers to build and manipulate a **single** virtual address
//! space (tree rooted at a PML4), on top of the typed paging levels
//! ([`PageMapLevel4`], [`PageDirectoryPointerTable`], [`PageDirectory`],
//! [`PageTable`]).
//!
//! ## Highlights
//!
//! - [`AddressSpace::map_virtual_page`] installs one 4 KiB mapping, creating
//!   missing intermediate tables on the way down.
//! - [`AddressSpace::unmap_virtual_page`] clears the present bit of a leaf.
//! - [`AddressSpace::alloc_virtual_page`] / [`AddressSpace::free_virtual_page`]
//!   pair a mapping with a frame from the frame allocator.
//! - [`AddressSpace::translate`] resolves a VA to its PA.
//!
//! ## Design
//!
//! - Intermediate entries are always present, writable and user-accessible.
//!   The leaf alone decides the effective rights.
//! - New table frames are zeroed through the [`PhysMapper`] before they are
//!   linked into their parent.
//! - Table levels are never reclaimed, not even when their last leaf goes.
//! - A failing walk leaves the levels it already installed in place.
//! - Every map and every unmap ends with a single-page TLB invalidation
//!   through the [`TlbFlush`] seam.

use crate::page_table::pd::{PageDirectory, PdEntry};
use crate::page_table::pdpt::{PageDirectoryPointerTable, PdptEntry};
use crate::page_table::pml4::{PageMapLevel4, Pml4Entry};
use crate::page_table::pt::{PageTable, PtEntry};
use crate::page_table::{PageFlags, TableLevel, split_indices};
use crate::{FrameAlloc, PhysMapper, TlbFlush};
use kernel_memory_addresses::{PhysicalAddress, PhysicalPage, VirtualAddress, VirtualPage};

/// Failure while installing a mapping.
#[derive(Debug, Copy, Clone, PartialEq, Eq, thiserror::Error)]
pub enum MapError {
    /// No frame was available for a missing table level.
    #[error("out of memory while allocating a {level} frame")]
    OutOfMemory { level: TableLevel },
}

/// Handle to a single, concrete address space.
pub struct AddressSpace<'m, M: PhysMapper, T: TlbFlush> {
    root: PhysicalPage, // PML4 frame
    mapper: &'m M,
    tlb: T,
}

impl<'m, M: PhysMapper, T: TlbFlush> AddressSpace<'m, M, T> {
    /// Wrap an existing PML4 frame.
    #[inline]
    pub const fn new(mapper: &'m M, root: PhysicalPage, tlb: T) -> Self {
        Self { root, mapper, tlb }
    }

    /// View the **currently active** address space by reading CR3.
    ///
    /// # Safety
    /// - Must run at CPL0 with paging enabled.
    /// - Assumes CR3 points at a valid PML4 frame.
    #[cfg(target_arch = "x86_64")]
    #[inline]
    pub unsafe fn from_current(mapper: &'m M, tlb: T) -> Self {
        use kernel_registers::LoadRegisterUnsafe;
        let cr3 = unsafe { kernel_registers::cr3::Cr3::load_unsafe() };
        Self::new(mapper, cr3.pml4(), tlb)
    }

    /// Load CR3 with this address space's root.
    ///
    /// # Safety
    /// The code and data in use must be mapped identically in the target space.
    #[cfg(target_arch = "x86_64")]
    #[inline]
    pub unsafe fn activate(&self) {
        use kernel_registers::StoreRegisterUnsafe;
        let cr3 = kernel_registers::cr3::Cr3::from_pml4(self.root);
        unsafe { cr3.store_unsafe() };
    }

    /// Physical page of the PML4.
    #[inline]
    pub const fn root(&self) -> PhysicalPage {
        self.root
    }

    /// The TLB invalidation backend.
    #[inline]
    pub const fn tlb(&self) -> &T {
        &self.tlb
    }

    /// Borrow the table stored in `page`.
    ///
    /// # Safety
    /// `page` must hold a table of type `X` reachable through the mapper, and
    /// no other reference to it may be live.
    #[inline]
    unsafe fn table<'a, X>(&self, page: PhysicalPage) -> &'a mut X {
        unsafe { self.mapper.phys_to_mut::<X>(page.base()) }
    }

    /// Allocate and zero a frame for a new table at `level`.
    fn new_table<A: FrameAlloc>(
        &self,
        frames: &mut A,
        level: TableLevel,
    ) -> Result<PhysicalPage, MapError> {
        let frame = frames.alloc_frame().ok_or(MapError::OutOfMemory { level })?;
        // SAFETY: a freshly allocated frame is not referenced by anything else.
        unsafe { self.table::<PageTable>(frame) }.clear();
        log::trace!("new {level} table at {frame}");
        Ok(frame)
    }

    /// Walk down to the page table covering `va`, creating missing levels.
    fn ensure_page_table<'a, A: FrameAlloc>(
        &self,
        frames: &mut A,
        va: VirtualAddress,
    ) -> Result<&'a mut PageTable, MapError> {
        let (i4, i3, i2, _) = split_indices(va);

        // SAFETY: `root` holds the PML4; every linked frame holds the next level.
        let pml4 = unsafe { self.table::<PageMapLevel4>(self.root) };
        let pdpt_page = if let Some(page) = pml4.get(i4).next_table() {
            page
        } else {
            let page = self.new_table(frames, TableLevel::Pdpt)?;
            pml4.set(i4, Pml4Entry::link(page));
            page
        };

        let pdpt = unsafe { self.table::<PageDirectoryPointerTable>(pdpt_page) };
        let pd_page = if let Some(page) = pdpt.get(i3).next_table() {
            page
        } else {
            let page = self.new_table(frames, TableLevel::Pd)?;
            pdpt.set(i3, PdptEntry::link(page));
            page
        };

        let pd = unsafe { self.table::<PageDirectory>(pd_page) };
        let pt_page = if let Some(page) = pd.get(i2).next_table() {
            page
        } else {
            let page = self.new_table(frames, TableLevel::Pt)?;
            pd.set(i2, PdEntry::link(page));
            page
        };

        Ok(unsafe { self.table::<PageTable>(pt_page) })
    }

    /// Walk down to the page table covering `va` without allocating.
    fn find_page_table<'a>(&self, va: VirtualAddress) -> Option<&'a mut PageTable> {
        let (i4, i3, i2, _) = split_indices(va);

        // SAFETY: see `ensure_page_table`.
        let pml4 = unsafe { self.table::<PageMapLevel4>(self.root) };
        let pdpt = unsafe { self.table::<PageDirectoryPointerTable>(pml4.get(i4).next_table()?) };
        let pd = unsafe { self.table::<PageDirectory>(pdpt.get(i3).next_table()?) };
        Some(unsafe { self.table::<PageTable>(pd.get(i2).next_table()?) })
    }

    /// Map `virt → phys` as a present, writable, user-accessible page.
    ///
    /// A present leaf at `virt` is overwritten.
    ///
    /// # Errors
    /// [`MapError::OutOfMemory`] if a missing table level could not be allocated.
    #[inline]
    pub fn map_virtual_page<A: FrameAlloc>(
        &self,
        frames: &mut A,
        phys: PhysicalPage,
        virt: VirtualPage,
    ) -> Result<(), MapError> {
        self.map_virtual_page_with(frames, phys, virt, PageFlags::DEFAULT)
    }

    /// Map `virt → phys` with explicit leaf `flags`.
    ///
    /// # Errors
    /// [`MapError::OutOfMemory`] if a missing table level could not be allocated.
    pub fn map_virtual_page_with<A: FrameAlloc>(
        &self,
        frames: &mut A,
        phys: PhysicalPage,
        virt: VirtualPage,
        flags: PageFlags,
    ) -> Result<(), MapError> {
        let va = virt.base();
        let pt = self.ensure_page_table(frames, va)?;
        pt.set(PageTable::index_of(va), PtEntry::leaf(phys, flags));
        self.flush_tlb_entry(virt);
        Ok(())
    }

    /// Map `count` consecutive pages starting at `virt → phys`.
    ///
    /// # Errors
    /// Stops at the first failing page; earlier pages stay mapped.
    #[inline]
    pub fn map_virtual_region<A: FrameAlloc>(
        &self,
        frames: &mut A,
        phys: PhysicalPage,
        virt: VirtualPage,
        count: u64,
    ) -> Result<(), MapError> {
        self.map_virtual_region_with(frames, phys, virt, count, PageFlags::DEFAULT)
    }

    /// [`map_virtual_region`](Self::map_virtual_region) with explicit leaf `flags`.
    ///
    /// # Errors
    /// Stops at the first failing page; earlier pages stay mapped.
    pub fn map_virtual_region_with<A: FrameAlloc>(
        &self,
        frames: &mut A,
        phys: PhysicalPage,
        virt: VirtualPage,
        count: u64,
        flags: PageFlags,
    ) -> Result<(), MapError> {
        for i in 0..count {
            self.map_virtual_page_with(frames, phys.add_pages(i), virt.add_pages(i), flags)?;
        }
        Ok(())
    }

    /// Clear the present bit of the leaf at `virt`.
    ///
    /// The frame number and all table frames stay in place. Returns the frame
    /// that was mapped, if the leaf was present.
    pub fn unmap_virtual_page(&self, virt: VirtualPage) -> Option<PhysicalPage> {
        let va = virt.base();
        let pt = self.find_page_table(va)?;
        let i1 = PageTable::index_of(va);
        let entry = pt.get(i1);
        if !entry.present() {
            return None;
        }
        pt.set(i1, entry.with_present(false));
        self.flush_tlb_entry(virt);
        entry.page()
    }

    /// Unmap `count` consecutive pages starting at `virt`.
    pub fn unmap_virtual_region(&self, virt: VirtualPage, count: u64) {
        for i in 0..count {
            self.unmap_virtual_page(virt.add_pages(i));
        }
    }

    /// Allocate a frame and map it at `virt`.
    ///
    /// # Errors
    /// [`MapError::OutOfMemory`] with [`TableLevel::Page`] if no data frame is
    /// available, or the level that failed during the walk. In the latter case
    /// the data frame is returned to `frames`.
    pub fn alloc_virtual_page<A: FrameAlloc>(
        &self,
        frames: &mut A,
        virt: VirtualPage,
    ) -> Result<PhysicalPage, MapError> {
        let frame = frames.alloc_frame().ok_or(MapError::OutOfMemory {
            level: TableLevel::Page,
        })?;
        if let Err(e) = self.map_virtual_page(frames, frame, virt) {
            frames.free_frame(frame);
            return Err(e);
        }
        Ok(frame)
    }

    /// Release the frame mapped at `virt` and unmap it. No-op if not present.
    pub fn free_virtual_page<A: FrameAlloc>(&self, frames: &mut A, virt: VirtualPage) {
        if let Some(frame) = self.get_page_entry(virt).and_then(PtEntry::page) {
            frames.free_frame(frame);
            self.unmap_virtual_page(virt);
        }
    }

    /// The leaf entry for `virt`, if all three parent levels exist.
    #[must_use]
    pub fn get_page_entry(&self, virt: VirtualPage) -> Option<PtEntry> {
        let va = virt.base();
        self.find_page_table(va).map(|pt| pt.get(PageTable::index_of(va)))
    }

    /// Translate a `VirtualAddress` to a `PhysicalAddress` if mapped.
    #[must_use]
    pub fn translate(&self, va: VirtualAddress) -> Option<PhysicalAddress> {
        let frame = self
            .get_page_entry(VirtualPage::containing_address(va))?
            .page()?;
        Some(frame.base() + va.page_offset())
    }

    /// Invalidate the cached translation for `virt`.
    #[inline]
    pub fn flush_tlb_entry(&self, virt: VirtualPage) {
        self.tlb.flush_page(virt);
    }
}
