//! Bitmap allocator for the kernel stacks backing each thread while it is
//! not running in user mode.
//!
//! One slot per stack, each slot sized stack-plus-guard-page so overflow
//! faults on the unmapped guard rather than corrupting the next stack.
//! Mirrors the bit-per-slot idiom of [`crate::memory::frame_allocator`]
//! rather than carrying its own free list.

use x86_64::structures::paging::PageTableFlags;
use x86_64::VirtAddr;

use crate::config::{KERNEL_REGION_END, PAGE_SIZE};
use crate::error::OutOfMemory;
use crate::memory::paging;
use crate::spinlock::SpinLock;

const STACK_SIZE: u64 = 4 * PAGE_SIZE;
const GUARD_SIZE: u64 = PAGE_SIZE;
const SLOT_SIZE: u64 = STACK_SIZE + GUARD_SIZE;
const SLOT_COUNT: usize = 256;
const REGION_BASE: u64 = KERNEL_REGION_END - SLOT_SIZE * SLOT_COUNT as u64;

static BITMAP: SpinLock<[u64; SLOT_COUNT.div_ceil(64)]> = SpinLock::new([0; SLOT_COUNT.div_ceil(64)]);

/// A mapped, guarded kernel stack. Dropping it frees the slot (but not the
/// frames: kernel stacks live for the lifetime of the kernel binary image
/// today, so nothing reclaims the underlying pages either).
pub struct KernelStack {
    index: usize,
    top: VirtAddr,
}

impl KernelStack {
    pub fn top(&self) -> VirtAddr {
        self.top
    }
}

impl Drop for KernelStack {
    fn drop(&mut self) {
        let mut bitmap = BITMAP.lock();
        bitmap[self.index / 64] &= !(1 << (self.index % 64));
    }
}

/// Claims a free slot, maps its stack pages (not its guard page), and
/// returns the mapped stack's top address.
pub fn allocate_kernel_stack() -> Result<KernelStack, OutOfMemory> {
    let index = {
        let mut bitmap = BITMAP.lock();
        let mut found = None;
        'search: for (word_index, word) in bitmap.iter().enumerate() {
            if *word != u64::MAX {
                for bit in 0..64 {
                    let candidate = word_index * 64 + bit;
                    if candidate >= SLOT_COUNT {
                        break 'search;
                    }
                    if word & (1 << bit) == 0 {
                        found = Some(candidate);
                        break 'search;
                    }
                }
            }
        }
        let index = found.ok_or(OutOfMemory)?;
        bitmap[index / 64] |= 1 << (index % 64);
        index
    };

    let slot_base = REGION_BASE + index as u64 * SLOT_SIZE;
    let stack_bottom = slot_base + GUARD_SIZE;
    let flags = PageTableFlags::PRESENT | PageTableFlags::WRITABLE | PageTableFlags::NO_EXECUTE;
    for page in 0..STACK_SIZE / PAGE_SIZE {
        paging::map_and_allocate(VirtAddr::new(stack_bottom + page * PAGE_SIZE), flags)?;
    }

    Ok(KernelStack { index, top: VirtAddr::new(stack_bottom + STACK_SIZE) })
}

pub fn init() {
    log::info!("kernel stack allocator initialized ({SLOT_COUNT} slots, {} KiB each)", STACK_SIZE / 1024);
}
