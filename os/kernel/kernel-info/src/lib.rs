//! # Kernel Memory Layout and Boot Memory Map
//!
//! This crate is the single source of truth for the fixed virtual memory
//! layout of the kernel and for the physical memory map handed over by the
//! boot loader. Every memory-management crate reads its windows, orders and
//! capacities from here, so a layout change happens in exactly one place.
//!
//! ## Modules
//!
//! ### Memory Layout ([`memory`])
//! Compile-time constants:
//! * **Windows**: the physical direct map, the heap growth window and the
//!   MMIO window, each a fixed slice of the higher half.
//! * **Boot reservations**: where the kernel image and the boot page tables
//!   live in physical memory.
//! * **Allocator tuning**: maximum buddy order, heap alignment, bootstrap
//!   heap size and table capacities.
//!
//! ### Boot Memory Map ([`boot`])
//! The firmware memory map as received from the loader:
//! * **Entries**: raw `{base, length, type}` records in `#[repr(C)]` form.
//! * **Types**: usable, reserved, ACPI reclaimable, ACPI NVS and bad memory,
//!   with their human-readable names.
//! * **Usable ranges**: the filtered list of [`MemoryRange`](boot::MemoryRange)s
//!   the physical allocator builds its zones from.
//!
//! ## Virtual Memory Layout
//!
//! ```text
//! 0x0000_0000_0000_0000 ┌─────────────────────────────────┐
//!                       │  Identity window (boot only,    │
//!                       │  removed after bring-up)        │
//!                       ├─────────────────────────────────┤
//!                       │           Unused                │
//! PHYSMEM_VIRTUAL_BASE  ├─────────────────────────────────┤ 0xffff_8800_0000_0000
//!                       │   Direct map of usable RAM      │
//!                       │   (kernel image lives here too) │
//! VAS_BASE              ├─────────────────────────────────┤ 0xffff_c900_0000_0000
//!                       │   Heap growth window (vsbrk)    │
//! VAS_LIMIT             ├─────────────────────────────────┤ 0xffff_e900_0000_0000
//! MMIO_VIRTUAL_BASE     │   MMIO apertures                │
//! MMIO_VIRTUAL_LIMIT    ├─────────────────────────────────┤ 0xffff_ea00_0000_0000
//!                       │           Unused                │
//! 0xFFFF_FFFF_FFFF_FFFF └─────────────────────────────────┘
//! ```
//!
//! ## Physical Memory Layout
//!
//! ```text
//! 0x0000_0000 ┌─────────────────────────────────┐
//!             │ Boot page tables (8 frames,     │
//!             │ PML4 at 0x1000)                 │
//!             ├─────────────────────────────────┤
//!             │ Low memory                      │
//! 0x0010_0000 ├─────────────────────────────────┤ KERNEL_PHYSICAL_BASE
//!             │ Kernel image (2 MiB)            │
//!             ├─────────────────────────────────┤
//!             │ Available RAM                   │
//!             │ (managed by the buddy allocator)│
//!             └─────────────────────────────────┘
//! ```
//!
//! ## Safety Guarantees
//! * **Disjoint windows**: `const` assertions reject overlapping windows at
//!   compile time.
//! * **No unsafe code**: marked `#![deny(unsafe_code)]`.

#![cfg_attr(not(any(test, doctest)), no_std)]
#![deny(unsafe_code)]

pub mod boot;
pub mod memory;
