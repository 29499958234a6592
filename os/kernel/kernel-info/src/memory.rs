//! # Memory Layout

pub use kernel_memory_addresses::{PAGE_SHIFT, PAGE_SIZE};

const KIB: u64 = 1024;
const MIB: u64 = 1024 * KIB;

/// All usable physical memory is mapped at `PHYSMEM_VIRTUAL_BASE + pa`.
pub const PHYSMEM_VIRTUAL_BASE: u64 = 0xffff_8800_0000_0000;

/// Where the loader places the kernel image in physical memory.
pub const KERNEL_PHYSICAL_BASE: u64 = 0x0010_0000; // 1 MiB

/// Where the kernel executes; the image is reached through the direct map.
pub const KERNEL_VIRTUAL_BASE: u64 = PHYSMEM_VIRTUAL_BASE + KERNEL_PHYSICAL_BASE;

/// Physical memory reserved for the kernel image.
pub const KERNEL_SIZE: u64 = 2 * MIB;

/// First frame of the page tables built by the boot loader.
pub const BOOT_PAGE_TABLES_BASE: u64 = 0;

/// Number of frames the boot loader uses for its page tables.
pub const BOOT_PAGE_TABLE_FRAMES: u64 = 8;

/// Physical address of the boot PML4.
pub const PML4_BASE_ADDR: u64 = 0x1000;

/// Low identity mapping kept by the loader across the paging switch.
pub const IDENTITY_MAP_SIZE: u64 = 2 * MIB;

/// Start of the heap growth window.
pub const VAS_BASE: u64 = 0xffff_c900_0000_0000;

/// Exclusive end of the heap growth window.
pub const VAS_LIMIT: u64 = 0xffff_e900_0000_0000;

/// Device apertures are mapped at `MMIO_VIRTUAL_BASE + pa`.
pub const MMIO_VIRTUAL_BASE: u64 = 0xffff_e900_0000_0000;

/// Exclusive end of the MMIO window.
pub const MMIO_VIRTUAL_LIMIT: u64 = 0xffff_ea00_0000_0000;

/// Largest buddy order; blocks go up to `PAGE_SIZE << MAX_ORDER` (16 MiB).
pub const MAX_ORDER: usize = 12;

/// Size of the largest buddy block.
pub const MAX_BLOCK_SIZE: u64 = PAGE_SIZE << MAX_ORDER;

/// Maximum number of zones (usable memory ranges) tracked.
pub const MAX_ZONES: usize = 32;

/// Size of the statically reserved bootstrap heap.
pub const INITIAL_HEAP_SIZE: usize = 1 << 19; // 512 KiB

/// Alignment of every heap payload.
pub const HEAP_ALIGNMENT: usize = 16;

/// Smallest span requested from the growth window when the heap runs dry.
#[allow(clippy::cast_possible_truncation)]
pub const HEAP_GROWTH_MIN: usize = (128 * KIB) as usize;

/// Maximum number of subheaps (bootstrap region included).
pub const MAX_SUBHEAPS: usize = 512;

/// Capacity of each I/O resource table (ports, memory).
pub const MAX_IO_RESOURCES: usize = 64;

const _: () = {
    assert!(MAX_BLOCK_SIZE == 16 * MIB);
    assert!(HEAP_ALIGNMENT.is_power_of_two());
    assert!(INITIAL_HEAP_SIZE.is_multiple_of(HEAP_ALIGNMENT));
    assert!(HEAP_GROWTH_MIN.is_multiple_of(PAGE_SIZE as usize));
    assert!(PML4_BASE_ADDR >= BOOT_PAGE_TABLES_BASE);
    assert!(PML4_BASE_ADDR < BOOT_PAGE_TABLES_BASE + BOOT_PAGE_TABLE_FRAMES * PAGE_SIZE);
    assert!(KERNEL_PHYSICAL_BASE.is_multiple_of(PAGE_SIZE));
    assert!(KERNEL_SIZE.is_multiple_of(PAGE_SIZE));
    assert!(VAS_BASE > PHYSMEM_VIRTUAL_BASE);
    assert!(VAS_BASE < VAS_LIMIT);
    assert!(VAS_LIMIT <= MMIO_VIRTUAL_BASE);
    assert!(MMIO_VIRTUAL_BASE < MMIO_VIRTUAL_LIMIT);
};
