//! # Kernel Memory Allocation
//!
//! Physical frame allocation, kernel heap and address space growth for the
//! kernel, tied together by one owned context.
//!
//! ## Architecture Overview
//!
//! ```text
//! ┌─────────────────────────────────────────────────────┐
//! │                 KernelMemory (mm)                   │
//! │    • Boot bring-up                                  │
//! │    • Single owner of all state below                │
//! └──┬──────────────┬──────────────┬─────────────┬──────┘
//!    │              │              │             │
//! ┌──▼─────────┐ ┌──▼─────────┐ ┌──▼────────┐ ┌──▼───────┐
//! │ KernelHeap │ │ Virtual-   │ │ I/O       │ │ Address- │
//! │ (heap)     ├─► Break      │ │ resources │ │ Space    │
//! │            │ │ (vmm)      │ │           │ │ (vmem)   │
//! └──────┬─────┘ └──┬─────────┘ └──┬────────┘ └──▲───────┘
//!        │          └──────────────┴─────────────┘
//!        │ zone bitmaps            │ table frames
//! ┌──────▼─────────────────────────▼─────────────────────┐
//! │          PhysicalMemory (frame_alloc, zone)          │
//! │    • Buddy allocator, one zone per usable range      │
//! └──────────────────────────────────────────────────────┘
//! ```
//!
//! ## Core Components
//!
//! ### Physical Frame Allocator ([`frame_alloc`], [`zone`], [`bitmap`])
//! * **Zones**: one per usable physical range, capped at [`MAX_ZONES`].
//! * **Buddy bitmaps**: one bitmap per order; a bit is set when any frame of
//!   the block is in use.
//! * **Regions**: arbitrary frame runs can be reserved (kernel image, boot
//!   page tables) and released.
//!
//! ### Kernel Heap ([`heap`], [`subheap`], [`static_heap`])
//! * **Best fit** over all subheaps with 16-byte payload alignment.
//! * **Subheaps** addressed by index; blocks by `(subheap, offset)`.
//! * **Bootstrap**: the first subheap is a static region in the kernel image.
//! * **Growth** through the [`HeapBacking`](heap::HeapBacking) seam.
//!
//! ### Virtual Break ([`vmm`])
//! `vsbrk`/`vbrk` over the growth window `[VAS_BASE, VAS_LIMIT)`. It is the
//! only supplier of new memory for the heap.
//!
//! ### I/O Resources ([`resource`])
//! Non-overlapping port and device memory claims. Device memory is mapped
//! into the MMIO window.
//!
//! ### Physical Mapper ([`phys_mapper`])
//! Reaches physical memory through the direct map at `PHYSMEM_VIRTUAL_BASE`.
//!
//! ## Usage
//!
//! ```rust,no_run
//! use kernel_alloc::heap::KernelHeap;
//! use kernel_alloc::mm::{BootLayout, KernelMemory};
//! use kernel_alloc::phys_mapper::DirectMapPhysMapper;
//! use kernel_info::boot::MemoryRange;
//! use kernel_vmem::{AddressSpace, LocalTlb};
//!
//! # fn usable_ranges() -> &'static [MemoryRange] { &[] }
//! let mapper = DirectMapPhysMapper;
//! let heap = KernelHeap::initial().expect("bootstrap heap taken twice");
//! let aspace = unsafe { AddressSpace::from_current(&mapper, LocalTlb::new()) };
//! let mut mm = KernelMemory::init(heap, usable_ranges(), aspace, &BootLayout::DEFAULT)
//!     .expect("memory bring-up failed");
//!
//! let buf = mm.kzalloc(128);
//! ```
//!
//! [`MAX_ZONES`]: kernel_info::memory::MAX_ZONES

#![cfg_attr(not(any(test, doctest)), no_std)]
#![allow(unsafe_code, clippy::cast_possible_truncation)]

pub mod bitmap;
pub mod frame_alloc;
pub mod heap;
pub mod mm;
pub mod phys_mapper;
pub mod resource;
pub mod static_heap;
pub mod subheap;
pub mod vmm;
pub mod zone;

#[cfg(test)]
mod test_support;

pub use crate::frame_alloc::{FrameAllocError, PhysicalMemory};
pub use crate::heap::{HeapBacking, HeapStats, KernelHeap, NoGrowth};
pub use crate::mm::{BootLayout, KernelMemory, MemoryError};
