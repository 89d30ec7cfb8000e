//! Memory subsystem: the bitmap frame allocator, the recursive paging
//! engine, the kernel heap, kernel stacks, TLB shootdown, and the named
//! address-range views in [`layout`].
//!
//! [`init`] brings these up in the order the rest of the kernel depends on:
//! frames before anything that allocates, the heap before the first
//! `alloc::vec::Vec`/`Box`, kernel stacks last since nothing before process
//! creation needs one.

pub mod frame_allocator;
pub mod heap;
pub mod kernel_stack;
pub mod layout;
pub mod paging;
pub mod tlb;

use crate::boot::BootstrapSpace;

/// Brings up frame allocation, the heap, and the kernel stack pool. Must
/// run after the bootloader's recursive self-map is in place and before
/// any process is created.
pub fn init(bootstrap: &BootstrapSpace) {
    log::info!("initializing memory management");
    frame_allocator::init(bootstrap.memory_regions);
    heap::init().expect("heap initialization failed");
    kernel_stack::init();
}
