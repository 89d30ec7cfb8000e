//! Process lifecycle: allocation, kernel-region mirroring, and teardown.
//!
//! `destroy_process` follows the four-step order from
//! `original_source/kernel64/process.h`'s `destroy_process`: remove the
//! process from scheduling first so no CPU can select it mid-teardown,
//! unmap (and free, where owned) every registered mapping, free the page
//! tables themselves, then release the process's bucket slot last so a
//! concurrent lookup never sees a half-torn-down process.

use x86_64::structures::paging::PhysFrame;
use x86_64::{PhysAddr, VirtAddr};

use crate::config::{KERNEL_REGION_START, PROCESS_BUCKET_SIZE};
use crate::error::{InvalidProcessId, KernelError};
use crate::memory::frame_allocator;
use crate::memory::paging;
use crate::process::bucket::{BucketArray, Handle};
use crate::process::process::{MappingDescriptor, Process, ProcessId};

static PROCESSES: BucketArray<Process, PROCESS_BUCKET_SIZE> = BucketArray::new();
static NEXT_PROCESS_ID: core::sync::atomic::AtomicU64 = core::sync::atomic::AtomicU64::new(1);

/// Allocates a fresh PML4, mirrors the kernel region into it, and
/// registers a new process. The process owns no mappings yet; the loader
/// registers them as it maps segments, the stack, and the GOT.
pub fn allocate_process() -> Result<(ProcessId, Handle), crate::error::OutOfMemory> {
    let pml4_frame = frame_allocator::allocate_frame()?;
    unsafe {
        core::ptr::write_bytes(
            pml4_frame.start_address().as_u64() as *mut u8,
            0,
            crate::config::PAGE_SIZE as usize,
        );
    }

    let id = ProcessId(NEXT_PROCESS_ID.fetch_add(1, core::sync::atomic::Ordering::Relaxed));
    mirror_kernel_region(pml4_frame.start_address());

    let process = Process::new(id, pml4_frame.start_address());
    let handle = PROCESSES.insert(process);
    Ok((id, handle))
}

/// Copies the kernel's PML4 entries covering
/// `[KERNEL_REGION_START, KERNEL_REGION_END)` into `pml4_phys`, so every
/// process can run kernel code and access kernel data without a CR3
/// switch on syscall entry.
pub fn mirror_kernel_region(pml4_phys: PhysAddr) {
    paging::mirror_pml4_range(
        pml4_phys,
        crate::config::KERNEL_REGION_START,
        crate::config::KERNEL_REGION_END,
    );
}

pub fn lookup(handle: Handle) -> Option<&'static Process> {
    PROCESSES.get(handle)
}

/// Finds a process by id, but only once the loader has finished building
/// it (see [`Process::ready`]) — a process still under construction must
/// stay invisible to lookups, `DoesProcessExist`, and the scheduler.
pub fn find_by_id(id: ProcessId) -> Option<(Handle, &'static Process)> {
    PROCESSES.iter().find(|(_, p)| p.id == id && p.is_ready())
}

pub fn exists(id: ProcessId) -> bool {
    find_by_id(id).is_some()
}

/// Iterates every ready, live process, in bucket order. The scheduler
/// treats this order as the process list it cycles through; it carries no
/// other meaning (insertion order, not priority). A process still being
/// built by the loader is skipped until [`Process::mark_ready`] runs.
pub fn all_processes() -> impl Iterator<Item = (Handle, &'static Process)> {
    PROCESSES.iter().filter(|(_, p)| p.is_ready())
}

/// Registers a mapping the process now owns (or shares), so teardown knows
/// to unmap it later.
pub fn register_mapping(process: &Process, descriptor: MappingDescriptor) -> Handle {
    process.register_mapping(descriptor)
}

/// Tears down a process: unschedule, unmap every registered mapping
/// (freeing frames for owned mappings only), free the PML4 chain itself,
/// then release the bucket slot.
pub fn destroy_process(handle: Handle) -> Result<(), KernelError> {
    let process = PROCESSES.get(handle).ok_or(InvalidProcessId)?;

    crate::task::scheduler::remove_all_threads_of(process.id);

    for (_, mapping) in &process.mappings {
        let mut page = mapping.start_page;
        for _ in 0..mapping.page_count {
            paging::unmap_page_foreign(process.pml4_physical_address, page, mapping.is_owned);
            page += crate::config::PAGE_SIZE;
        }
    }

    free_pml4_chain(process.pml4_physical_address);

    PROCESSES.remove(handle);
    Ok(())
}

/// Walks and frees every intermediate table below the process's own PML4
/// (PDPTs/PDs/PTs it created for the user-region portion of the address
/// space) and finally the PML4 frame itself. Kernel-region entries are
/// shared with the kernel's own tables and are never freed here.
fn free_pml4_chain(pml4_phys: PhysAddr) {
    let window = VirtAddr::new(0xffff_ff7f_fe00_0000);
    unsafe {
        let _ = paging::map_page(
            window,
            PhysFrame::containing_address(pml4_phys),
            x86_64::structures::paging::PageTableFlags::PRESENT
                | x86_64::structures::paging::PageTableFlags::WRITABLE,
        );
    }
    // User-region PML4 entries below KERNEL_REGION_START are the only ones
    // this process owns; everything at or above it is a shared mirror.
    let user_end_index = (KERNEL_REGION_START >> 39) & 0x1ff;
    let table = unsafe { &*(window.as_u64() as *const x86_64::structures::paging::PageTable) };
    for i in 0..user_end_index as usize {
        if table[i]
            .flags()
            .contains(x86_64::structures::paging::PageTableFlags::PRESENT)
        {
            if let Ok(frame) = table[i].frame() {
                free_table_recursive(frame, 2);
            }
        }
    }
    paging::unmap_page(window);
    frame_allocator::deallocate_frame(PhysFrame::containing_address(pml4_phys));
}

fn free_table_recursive(frame: PhysFrame, levels_below: u8) {
    let window = VirtAddr::new(0xffff_ff7f_fe00_1000);
    unsafe {
        let _ = paging::map_page(
            window,
            frame,
            x86_64::structures::paging::PageTableFlags::PRESENT
                | x86_64::structures::paging::PageTableFlags::WRITABLE,
        );
        if levels_below > 0 {
            let table = &*(window.as_u64() as *const x86_64::structures::paging::PageTable);
            for entry in table.iter() {
                if entry
                    .flags()
                    .contains(x86_64::structures::paging::PageTableFlags::PRESENT)
                {
                    if let Ok(child) = entry.frame() {
                        free_table_recursive(child, levels_below - 1);
                    }
                }
            }
        }
        paging::unmap_page(window);
    }
    frame_allocator::deallocate_frame(frame);
}

pub fn process_count() -> usize {
    PROCESSES.iter().count()
}
