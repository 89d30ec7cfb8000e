//! Kernel heap: a fixed virtual range inside the kernel region, backed by
//! freshly allocated frames and handed to a free-list allocator.
//!
//! Grounded in the same `paging::map_and_allocate` idiom the loader and the
//! memory syscalls use for populating a fresh range page by page, rather
//! than a separate offset-mapped heap walker.

use linked_list_allocator::LockedHeap;
use x86_64::structures::paging::{Page, PageTableFlags, Size4KiB};
use x86_64::VirtAddr;

use crate::config::KERNEL_REGION_START;
use crate::memory::paging;

pub const HEAP_START: u64 = KERNEL_REGION_START + 0x1000_0000;
pub const HEAP_SIZE: u64 = 8 * 1024 * 1024;

#[global_allocator]
static ALLOCATOR: LockedHeap = LockedHeap::empty();

/// Maps `HEAP_SIZE` bytes of fresh frames starting at `HEAP_START` and hands
/// the range to the allocator. Must run after the frame allocator and
/// before the first `alloc::vec::Vec`/`Box` use.
pub fn init() -> Result<(), crate::error::OutOfMemory> {
    let heap_start = VirtAddr::new(HEAP_START);
    let heap_end = heap_start + HEAP_SIZE;
    let flags = PageTableFlags::PRESENT | PageTableFlags::WRITABLE;

    for page in Page::<Size4KiB>::range_inclusive(
        Page::containing_address(heap_start),
        Page::containing_address(heap_end - 1u64),
    ) {
        paging::map_and_allocate(page.start_address(), flags)?;
    }

    unsafe {
        ALLOCATOR.lock().init(HEAP_START as *mut u8, HEAP_SIZE as usize);
    }
    log::info!("heap mapped at {:#x}, {} KiB", HEAP_START, HEAP_SIZE / 1024);
    Ok(())
}

#[alloc_error_handler]
fn alloc_error_handler(layout: core::alloc::Layout) -> ! {
    panic!("allocation error: {:?}", layout)
}
