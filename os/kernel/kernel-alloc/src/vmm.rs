//! # Virtual Break
//!
//! A `brk`-style allocator for the kernel heap's growth window. The break
//! (`pbrk`) moves within `[base, limit)`; every page below the mapped limit
//! (`plimit`) is backed by a frame.
//!
//! ```text
//! base                     pbrk        plimit                 limit
//!  |=========================|-----------|. . . . . . . . . . . .|
//!   in use by the heap        mapped,     unmapped
//!                             unused
//! ```
//!
//! Growth maps one page at a time. If a page cannot be mapped, the call
//! fails with the pages mapped so far left in place above `pbrk`; the next
//! successful call trims them. Shrinking unmaps whole pages down to the page
//! boundary at or above the new break.

use kernel_info::memory::{PAGE_SIZE, VAS_BASE, VAS_LIMIT};
use kernel_memory_addresses::{VirtualAddress, VirtualPage};
use kernel_vmem::{AddressSpace, FrameAlloc, MapError, PhysMapper, TlbFlush};

#[derive(Debug, Copy, Clone, PartialEq, Eq, thiserror::Error)]
pub enum BreakError {
    /// The new break would leave the growth window.
    #[error("break outside of the growth window")]
    OutOfRange,
    #[error(transparent)]
    Map(#[from] MapError),
}

/// Break state over one window.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct VirtualBreak {
    base: VirtualAddress,
    limit: VirtualAddress,
    pbrk: VirtualAddress,
    plimit: VirtualAddress,
}

impl VirtualBreak {
    /// A break at `base` with nothing mapped.
    ///
    /// ### Debug assertions
    /// - `base` is page aligned and below `limit`.
    #[must_use]
    pub const fn new(base: VirtualAddress, limit: VirtualAddress) -> Self {
        debug_assert!(base.is_page_aligned());
        debug_assert!(base.as_u64() < limit.as_u64());
        Self {
            base,
            limit,
            pbrk: base,
            plimit: base,
        }
    }

    /// The kernel heap growth window `[VAS_BASE, VAS_LIMIT)`.
    #[must_use]
    pub const fn kernel() -> Self {
        Self::new(VirtualAddress::new(VAS_BASE), VirtualAddress::new(VAS_LIMIT))
    }

    /// Current break.
    #[inline]
    #[must_use]
    pub const fn brk(&self) -> VirtualAddress {
        self.pbrk
    }

    /// End of the mapped range.
    #[inline]
    #[must_use]
    pub const fn mapped_limit(&self) -> VirtualAddress {
        self.plimit
    }

    #[inline]
    const fn in_window(&self, addr: VirtualAddress) -> bool {
        self.base.as_u64() <= addr.as_u64() && addr.as_u64() < self.limit.as_u64()
    }

    /// Move the break by `increment` bytes and return the previous break.
    ///
    /// # Errors
    /// - [`BreakError::OutOfRange`] if the new break leaves the window; no
    ///   state changes.
    /// - [`BreakError::Map`] if a page cannot be mapped while growing; the
    ///   break stays put, pages mapped so far stay mapped.
    pub fn vsbrk<M, T, A>(
        &mut self,
        aspace: &AddressSpace<'_, M, T>,
        frames: &mut A,
        increment: i64,
    ) -> Result<VirtualAddress, BreakError>
    where
        M: PhysMapper,
        T: TlbFlush,
        A: FrameAlloc,
    {
        let prev = self.pbrk;
        let next = prev
            .checked_add_signed(increment)
            .filter(|&a| self.in_window(a))
            .ok_or(BreakError::OutOfRange)?;

        while self.plimit < next {
            aspace.alloc_virtual_page(frames, VirtualPage::from_addr(self.plimit))?;
            self.plimit += PAGE_SIZE;
        }

        self.pbrk = next;

        while self.plimit - self.pbrk >= PAGE_SIZE {
            self.plimit -= PAGE_SIZE;
            aspace.free_virtual_page(frames, VirtualPage::from_addr(self.plimit));
        }

        log::trace!("break {prev} -> {next}, mapped up to {}", self.plimit);
        Ok(prev)
    }

    /// Set the break to `addr`.
    ///
    /// # Errors
    /// As [`vsbrk`](Self::vsbrk).
    pub fn vbrk<M, T, A>(
        &mut self,
        aspace: &AddressSpace<'_, M, T>,
        frames: &mut A,
        addr: VirtualAddress,
    ) -> Result<(), BreakError>
    where
        M: PhysMapper,
        T: TlbFlush,
        A: FrameAlloc,
    {
        if !self.in_window(addr) {
            return Err(BreakError::OutOfRange);
        }
        let delta = addr.as_u64().wrapping_sub(self.pbrk.as_u64()).cast_signed();
        self.vsbrk(aspace, frames, delta).map(|_| ())
    }
}

impl Default for VirtualBreak {
    fn default() -> Self {
        Self::kernel()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::machine;
    use kernel_vmem::TableLevel;

    const BASE: u64 = VAS_BASE;

    fn va(v: u64) -> VirtualAddress {
        VirtualAddress::new(v)
    }

    #[test]
    fn starts_empty_at_window_base() {
        let brk = VirtualBreak::kernel();
        assert_eq!(brk.brk(), va(VAS_BASE));
        assert_eq!(brk.mapped_limit(), va(VAS_BASE));
    }

    #[test]
    fn growth_maps_whole_pages() {
        let (mut phys, aspace) = machine(256);
        let mut brk = VirtualBreak::kernel();

        assert_eq!(brk.vsbrk(&aspace, &mut phys, 100), Ok(va(BASE)));
        assert_eq!(brk.brk(), va(BASE + 100));
        assert_eq!(brk.mapped_limit(), va(BASE + 4096));
        assert!(aspace.translate(va(BASE + 99)).is_some());

        assert_eq!(brk.vsbrk(&aspace, &mut phys, 8000), Ok(va(BASE + 100)));
        assert_eq!(brk.mapped_limit(), va(BASE + 3 * 4096));
        assert!(aspace.translate(va(BASE + 8099)).is_some());
        assert!(aspace.translate(va(BASE + 3 * 4096)).is_none());
    }

    #[test]
    fn mapped_pages_are_distinct_frames() {
        let (mut phys, aspace) = machine(256);
        let mut brk = VirtualBreak::kernel();
        brk.vsbrk(&aspace, &mut phys, 4 * 4096).expect("grow");

        let mut frames: Vec<_> = (0..4)
            .map(|i| aspace.translate(va(BASE + i * 4096)).expect("mapped"))
            .collect();
        frames.sort_unstable();
        frames.dedup();
        assert_eq!(frames.len(), 4);
    }

    #[test]
    fn shrinking_frees_pages_above_break() {
        let (mut phys, aspace) = machine(256);
        let mut brk = VirtualBreak::kernel();
        brk.vsbrk(&aspace, &mut phys, 5 * 4096).expect("grow");
        let free_before = phys.free_frames();

        brk.vsbrk(&aspace, &mut phys, -(2 * 4096 + 10)).expect("shrink");
        // Break sits 10 bytes into page 2; page 2 stays, pages 3 and 4 go.
        assert_eq!(brk.brk(), va(BASE + 3 * 4096 - 10));
        assert_eq!(brk.mapped_limit(), va(BASE + 3 * 4096));
        assert_eq!(phys.free_frames(), free_before + 2);
        assert!(aspace.translate(va(BASE + 3 * 4096)).is_none());
        assert!(aspace.translate(va(BASE + 2 * 4096)).is_some());
    }

    #[test]
    fn zero_increment_reports_break() {
        let (mut phys, aspace) = machine(64);
        let mut brk = VirtualBreak::kernel();
        brk.vsbrk(&aspace, &mut phys, 48).expect("grow");
        assert_eq!(brk.vsbrk(&aspace, &mut phys, 0), Ok(va(BASE + 48)));
    }

    #[test]
    fn leaving_the_window_fails_without_change() {
        let (mut phys, aspace) = machine(64);
        let mut brk = VirtualBreak::kernel();
        let before = brk;

        assert_eq!(brk.vsbrk(&aspace, &mut phys, -1), Err(BreakError::OutOfRange));
        let span = (VAS_LIMIT - VAS_BASE).cast_signed();
        assert_eq!(brk.vsbrk(&aspace, &mut phys, span), Err(BreakError::OutOfRange));
        assert_eq!(brk.vbrk(&aspace, &mut phys, va(VAS_LIMIT)), Err(BreakError::OutOfRange));
        assert_eq!(brk, before);
    }

    #[test]
    fn vbrk_moves_to_absolute_address() {
        let (mut phys, aspace) = machine(64);
        let mut brk = VirtualBreak::kernel();
        brk.vbrk(&aspace, &mut phys, va(BASE + 5000)).expect("grow");
        assert_eq!(brk.mapped_limit(), va(BASE + 8192));
        brk.vbrk(&aspace, &mut phys, va(BASE)).expect("shrink");
        assert_eq!(brk.brk(), va(BASE));
        assert_eq!(brk.mapped_limit(), va(BASE));
    }

    #[test]
    fn failed_growth_keeps_break_and_partial_pages() {
        // Root + PDPT + PD + PT leave four data frames.
        let (mut phys, aspace) = machine(8);
        let mut brk = VirtualBreak::kernel();

        let err = brk.vsbrk(&aspace, &mut phys, 10 * 4096);
        assert_eq!(
            err,
            Err(BreakError::Map(MapError::OutOfMemory {
                level: TableLevel::Page
            }))
        );
        assert_eq!(brk.brk(), va(BASE));
        assert_eq!(brk.mapped_limit(), va(BASE + 4 * 4096));
        assert_eq!(phys.free_frames(), 0);

        // The next successful call trims the excess.
        brk.vsbrk(&aspace, &mut phys, 0).expect("trim");
        assert_eq!(brk.mapped_limit(), va(BASE));
        assert_eq!(phys.free_frames(), 4);
    }
}
