use bitfield_struct::bitfield;
use kernel_memory_addresses::{PhysicalAddress, PhysicalPage};

/// CR3: Page-Map Level-4 Base Register (IA-32e, PCID disabled).
///
/// Holds the physical frame of the active PML4 and the cache-control flags
/// used for accesses to it.
#[bitfield(u64)]
pub struct Cr3 {
    /// Bits 0–2: Reserved (must be 0).
    #[bits(3)]
    __reserved0: u8,

    /// Bit 3: PWT: Page-level Write-Through for the PML4.
    pub pwt: bool,

    /// Bit 4: PCD: Page-level Cache Disable for the PML4.
    pub pcd: bool,

    /// Bits 5–11: Reserved.
    #[bits(7)]
    __reserved1: u8,

    /// Bits 12–51: PML4 frame number.
    #[bits(40)]
    pml4_frame: u64,

    /// Bits 52–63: Reserved.
    #[bits(12)]
    __reserved2: u16,
}

impl Cr3 {
    /// CR3 value selecting `pml4` as the translation root, write-back cached.
    #[must_use]
    pub const fn from_pml4(pml4: PhysicalPage) -> Self {
        Self::new().with_pml4_frame(pml4.frame_number())
    }

    /// The frame holding the active PML4.
    #[must_use]
    pub const fn pml4(&self) -> PhysicalPage {
        PhysicalPage::from_frame_number(self.pml4_frame())
    }

    #[must_use]
    pub const fn pml4_phys(&self) -> PhysicalAddress {
        self.pml4().base()
    }
}

#[cfg(all(feature = "asm", target_arch = "x86_64"))]
impl crate::LoadRegisterUnsafe for Cr3 {
    unsafe fn load_unsafe() -> Self {
        let cr3: u64;
        unsafe {
            core::arch::asm!("mov {}, cr3", out(reg) cr3, options(nomem, nostack, preserves_flags));
        }
        Self::from_bits(cr3)
    }
}

#[cfg(all(feature = "asm", target_arch = "x86_64"))]
impl crate::StoreRegisterUnsafe for Cr3 {
    unsafe fn store_unsafe(self) {
        let cr3 = self.into_bits();
        unsafe {
            core::arch::asm!("mov cr3, {}", in(reg) cr3, options(nostack, preserves_flags));
        }
    }
}
