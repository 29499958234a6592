//! # I/O Resources
//!
//! Bookkeeping for I/O port ranges and device memory apertures claimed by
//! drivers. Claims in one table never overlap. Requesting exactly an
//! existing claim returns that claim again.
//!
//! Device memory is made reachable through the MMIO window: a claim at
//! physical `base` is visible at `MMIO_VIRTUAL_BASE + base`, mapped with
//! [`PageFlags::MMIO`].

use kernel_info::memory::{MAX_IO_RESOURCES, MMIO_VIRTUAL_BASE, MMIO_VIRTUAL_LIMIT, PAGE_SHIFT};
use kernel_memory_addresses::{PhysicalAddress, PhysicalPage, VirtualAddress, VirtualPage};
use kernel_vmem::{AddressSpace, FrameAlloc, MapError, PageFlags, PhysMapper, TlbFlush};

#[derive(Debug, Copy, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ResourceError {
    #[error("empty resource request")]
    Empty,
    /// The range wraps around the end of the address space.
    #[error("resource range wraps around")]
    Wraps,
    /// The range overlaps a different claim.
    #[error("resource range conflicts with an existing claim")]
    Conflict,
    #[error("resource table full")]
    TableFull,
    /// The aperture does not fit the MMIO window.
    #[error("device memory outside the MMIO window")]
    OutsideWindow,
    #[error(transparent)]
    Map(#[from] MapError),
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum ResourceKind {
    Port,
    Memory,
}

/// A claimed range `[base, base + size)`.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct Resource {
    pub base: u64,
    pub size: u64,
    pub kind: ResourceKind,
}

impl Resource {
    /// Exclusive end. Never wraps for a claimed resource.
    #[inline]
    #[must_use]
    pub const fn end(&self) -> u64 {
        self.base + self.size
    }

    #[inline]
    #[must_use]
    pub const fn overlaps(&self, base: u64, end: u64) -> bool {
        base < self.end() && self.base < end
    }
}

/// Fixed-capacity table of non-overlapping claims of one kind.
#[derive(Debug)]
pub struct ResourceTable {
    kind: ResourceKind,
    slots: [Option<Resource>; MAX_IO_RESOURCES],
}

impl ResourceTable {
    #[must_use]
    pub const fn new(kind: ResourceKind) -> Self {
        Self {
            kind,
            slots: [None; MAX_IO_RESOURCES],
        }
    }

    /// Claim `[base, base + size)`.
    ///
    /// # Errors
    /// - [`ResourceError::Empty`] for `size == 0`.
    /// - [`ResourceError::Wraps`] if the end overflows.
    /// - [`ResourceError::Conflict`] if the range overlaps a different claim.
    /// - [`ResourceError::TableFull`] if no slot is left.
    pub fn request(&mut self, base: u64, size: u64) -> Result<Resource, ResourceError> {
        if size == 0 {
            return Err(ResourceError::Empty);
        }
        let end = base.checked_add(size).ok_or(ResourceError::Wraps)?;

        if let Some(existing) = self.iter().find(|r| r.overlaps(base, end)) {
            return if existing.base == base && existing.size == size {
                Ok(*existing)
            } else {
                Err(ResourceError::Conflict)
            };
        }

        let res = Resource {
            base,
            size,
            kind: self.kind,
        };
        let slot = self
            .slots
            .iter_mut()
            .find(|s| s.is_none())
            .ok_or(ResourceError::TableFull)?;
        *slot = Some(res);
        log::debug!("claimed {:?} region {base:#x}+{size:#x}", self.kind);
        Ok(res)
    }

    /// Drop a claim. Returns whether it was held.
    pub fn release(&mut self, res: &Resource) -> bool {
        match self.slots.iter_mut().find(|s| s.as_ref() == Some(res)) {
            Some(slot) => {
                *slot = None;
                true
            }
            None => false,
        }
    }

    #[must_use]
    pub fn contains(&self, res: &Resource) -> bool {
        self.iter().any(|r| r == res)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Resource> {
        self.slots.iter().flatten()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.iter().count()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// A claimed device memory aperture and where it is mapped.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct MmioRegion {
    pub resource: Resource,
    /// Virtual address of the aperture's first byte.
    pub virt: VirtualAddress,
}

impl MmioRegion {
    #[inline]
    #[must_use]
    pub const fn phys(&self) -> PhysicalAddress {
        PhysicalAddress::new(self.resource.base)
    }

    /// First page and page count of the mapping covering the aperture.
    fn pages(res: &Resource) -> (u64, u64) {
        let first = PhysicalAddress::new(res.base).align_down_to_page();
        let end = PhysicalAddress::new(res.end()).align_up_to_page();
        (first.as_u64(), (end - first) >> PAGE_SHIFT)
    }
}

/// Port and memory claim tables.
#[derive(Debug)]
pub struct IoResources {
    ports: ResourceTable,
    memory: ResourceTable,
}

impl Default for IoResources {
    fn default() -> Self {
        Self::new()
    }
}

impl IoResources {
    #[must_use]
    pub const fn new() -> Self {
        Self {
            ports: ResourceTable::new(ResourceKind::Port),
            memory: ResourceTable::new(ResourceKind::Memory),
        }
    }

    #[must_use]
    pub const fn ports(&self) -> &ResourceTable {
        &self.ports
    }

    #[must_use]
    pub const fn memory(&self) -> &ResourceTable {
        &self.memory
    }

    /// Claim an I/O port range.
    ///
    /// # Errors
    /// See [`ResourceTable::request`].
    pub fn request_port_region(&mut self, base: u64, size: u64) -> Result<Resource, ResourceError> {
        self.ports.request(base, size)
    }

    pub fn release_port_region(&mut self, res: &Resource) -> bool {
        self.ports.release(res)
    }

    /// Claim device memory `[base, base + size)` and map it into the MMIO
    /// window. Requesting an existing claim again returns it unchanged.
    ///
    /// # Errors
    /// - [`ResourceError::OutsideWindow`] if the mapping would pass
    ///   `MMIO_VIRTUAL_LIMIT`.
    /// - Claim errors as [`ResourceTable::request`].
    /// - [`ResourceError::Map`] if a table frame cannot be allocated; the
    ///   claim is dropped, pages mapped so far stay mapped.
    pub fn request_mem_region<M, T, A>(
        &mut self,
        aspace: &AddressSpace<'_, M, T>,
        frames: &mut A,
        base: PhysicalAddress,
        size: u64,
    ) -> Result<MmioRegion, ResourceError>
    where
        M: PhysMapper,
        T: TlbFlush,
        A: FrameAlloc,
    {
        let end = base.as_u64().checked_add(size).ok_or(ResourceError::Wraps)?;
        let window = MMIO_VIRTUAL_LIMIT - MMIO_VIRTUAL_BASE;
        if PhysicalAddress::new(end).align_up_to_page().as_u64() > window {
            return Err(ResourceError::OutsideWindow);
        }

        let held = self.memory.iter().any(|r| r.base == base.as_u64() && r.size == size);
        let resource = self.memory.request(base.as_u64(), size)?;
        let region = MmioRegion {
            resource,
            virt: VirtualAddress::new(MMIO_VIRTUAL_BASE + base.as_u64()),
        };
        if held {
            return Ok(region);
        }

        let (first, count) = MmioRegion::pages(&resource);
        let phys = PhysicalPage::from_addr(PhysicalAddress::new(first));
        let virt = VirtualPage::from_addr(VirtualAddress::new(MMIO_VIRTUAL_BASE + first));
        if let Err(e) = aspace.map_virtual_region_with(frames, phys, virt, count, PageFlags::MMIO) {
            log::debug!("mapping device memory {base}+{size:#x} failed: {e}");
            self.memory.release(&resource);
            return Err(e.into());
        }
        Ok(region)
    }

    /// Drop a device memory claim and unmap it. Returns whether it was held.
    pub fn release_mem_region<M, T>(
        &mut self,
        aspace: &AddressSpace<'_, M, T>,
        region: &MmioRegion,
    ) -> bool
    where
        M: PhysMapper,
        T: TlbFlush,
    {
        if !self.memory.release(&region.resource) {
            return false;
        }
        let (first, count) = MmioRegion::pages(&region.resource);
        let virt = VirtualPage::from_addr(VirtualAddress::new(MMIO_VIRTUAL_BASE + first));
        aspace.unmap_virtual_region(virt, count);
        true
    }
}
