//! Handlers for the memory-management syscalls: `MapFreeMemory`,
//! `MapFreeConsecutiveMemory`, `CreateSharedMemory`, `MapSharedMemory`, and
//! `UnmapMemory`.
//!
//! Grounded in `original_source/kernel64/main.cpp`'s syscall switch: each
//! private-memory handler allocates frames, maps them into a scratch
//! kernel-region window to zero them, then moves the mapping into the
//! caller's user region and unmaps the kernel side — the same
//! allocate-into-kernel-then-migrate-to-user idiom the loader uses for
//! section data, just with zero-fill instead of a file copy.

use x86_64::structures::paging::{PageTableFlags, PhysFrame};
use x86_64::VirtAddr;

use crate::config::{KERNEL_REGION_END, KERNEL_REGION_START, PAGE_SIZE, USER_REGION_END, USER_REGION_START};
use crate::error::{InvalidMemoryRange, InvalidProcessId, KernelError, OutOfMemory, SyscallResultCode};
use crate::memory::frame_allocator;
use crate::memory::paging;
use crate::process::{manager, MappingDescriptor, Process, ProcessId};
use crate::syscall::userptr;

/// Finds a free kernel-region window, maps `page_count` fresh zeroed frames
/// into it, then migrates that same run of frames into a free run of the
/// caller's user region. Returns the user virtual base.
fn allocate_and_place_in_user(process: &Process, page_count: u64, is_shared: bool) -> Result<VirtAddr, KernelError> {
    let kernel_base = VirtAddr::new(
        paging::find_free_range(KERNEL_REGION_START, KERNEL_REGION_END, page_count).ok_or(OutOfMemory)?,
    );
    let mut frames = alloc::vec::Vec::with_capacity(page_count as usize);
    for i in 0..page_count {
        let frame = match frame_allocator::allocate_frame() {
            Ok(f) => f,
            Err(e) => {
                for (j, f) in frames.iter().enumerate() {
                    paging::unmap_page(kernel_base + j as u64 * PAGE_SIZE);
                    frame_allocator::deallocate_frame(*f);
                }
                return Err(e.into());
            }
        };
        paging::map_page(
            kernel_base + i * PAGE_SIZE,
            frame,
            PageTableFlags::PRESENT | PageTableFlags::WRITABLE,
        )
        .expect("freshly found kernel window");
        unsafe {
            core::ptr::write_bytes((kernel_base + i * PAGE_SIZE).as_mut_ptr::<u8>(), 0, PAGE_SIZE as usize);
        }
        frames.push(frame);
    }

    let user_base = match paging::find_free_range(USER_REGION_START, USER_REGION_END, page_count) {
        Some(base) => VirtAddr::new(base),
        None => {
            for (i, frame) in frames.iter().enumerate() {
                paging::unmap_page(kernel_base + i as u64 * PAGE_SIZE);
                frame_allocator::deallocate_frame(*frame);
            }
            return Err(OutOfMemory.into());
        }
    };

    let user_flags = PageTableFlags::PRESENT | PageTableFlags::WRITABLE | PageTableFlags::USER_ACCESSIBLE;
    for (i, frame) in frames.iter().enumerate() {
        paging::unmap_page(kernel_base + i as u64 * PAGE_SIZE);
        paging::map_page(user_base + i as u64 * PAGE_SIZE, *frame, user_flags).expect("freshly found user range");
    }

    process.register_mapping(MappingDescriptor {
        start_page: user_base,
        page_count,
        is_owned: true,
        is_shared,
    });
    Ok(user_base)
}

pub fn map_free_memory(process: &Process, size: u64) -> (u64, u64) {
    let page_count = size.div_ceil(PAGE_SIZE).max(1);
    match allocate_and_place_in_user(process, page_count, false) {
        Ok(base) => (SyscallResultCode::Success as u64, base.as_u64()),
        Err(e) => (SyscallResultCode::from(e) as u64, 0),
    }
}

pub fn create_shared_memory(process: &Process, size: u64) -> (u64, u64) {
    let page_count = size.div_ceil(PAGE_SIZE).max(1);
    match allocate_and_place_in_user(process, page_count, true) {
        Ok(base) => (SyscallResultCode::Success as u64, base.as_u64()),
        Err(e) => (SyscallResultCode::from(e) as u64, 0),
    }
}

/// Like [`allocate_and_place_in_user`] but the backing frames are a single
/// physically contiguous run, for callers (virtio ring buffers, DMA
/// targets) that need to hand the physical base to a device.
pub fn map_free_consecutive_memory(process: &Process, size: u64) -> (u64, u64, u64) {
    let page_count = size.div_ceil(PAGE_SIZE).max(1);
    let first_frame = match frame_allocator::allocate_consecutive_frames(page_count) {
        Ok(f) => f,
        Err(e) => return (SyscallResultCode::from(KernelError::from(e)) as u64, 0, 0),
    };
    let physical_base = first_frame.start_address();

    let user_base = match paging::find_free_range(USER_REGION_START, USER_REGION_END, page_count) {
        Some(base) => VirtAddr::new(base),
        None => {
            frame_allocator::deallocate_consecutive_frames(first_frame, page_count);
            return (SyscallResultCode::OutOfMemory as u64, 0, 0);
        }
    };
    let user_flags = PageTableFlags::PRESENT | PageTableFlags::WRITABLE | PageTableFlags::USER_ACCESSIBLE;
    for i in 0..page_count {
        let frame = PhysFrame::containing_address(physical_base + i * PAGE_SIZE);
        paging::map_page(user_base + i * PAGE_SIZE, frame, user_flags).expect("freshly found user range");
        unsafe {
            core::ptr::write_bytes((user_base + i * PAGE_SIZE).as_mut_ptr::<u8>(), 0, PAGE_SIZE as usize);
        }
    }
    process.register_mapping(MappingDescriptor {
        start_page: user_base,
        page_count,
        is_owned: true,
        is_shared: false,
    });
    (SyscallResultCode::Success as u64, user_base.as_u64(), physical_base.as_u64())
}

#[repr(C)]
struct MapSharedMemoryParameters {
    process_id: u64,
    address: u64,
    size: u64,
}

/// Imports a shared mapping owned by `target_pid` at `target_addr` into the
/// caller, provided the target has a shared mapping at exactly that
/// virtual range. Walks the target's (foreign, not currently loaded) page
/// tables one page at a time to find the backing frames, then maps the same
/// frames into the caller's currently-loaded address space.
pub fn map_shared_memory(process: &Process, params_addr: u64) -> (u64, u64) {
    let params: MapSharedMemoryParameters = match userptr::copy_from_user(params_addr) {
        Ok(p) => p,
        Err(_) => return (SyscallResultCode::InvalidMemoryRange as u64, 0),
    };

    let page_count = params.size.div_ceil(PAGE_SIZE).max(1);
    let target_start = VirtAddr::new(params.address & !(PAGE_SIZE - 1));

    let (_, target) = match manager::find_by_id(ProcessId(params.process_id)) {
        Some(t) => t,
        None => return (SyscallResultCode::from(KernelError::from(InvalidProcessId)) as u64, 0),
    };

    let shared = target
        .mappings
        .iter()
        .any(|(_, m)| m.is_shared && m.start_page == target_start && m.page_count == page_count);
    if !shared {
        return (SyscallResultCode::from(KernelError::from(InvalidMemoryRange)) as u64, 0);
    }

    let user_base = match paging::find_free_range(USER_REGION_START, USER_REGION_END, page_count) {
        Some(base) => VirtAddr::new(base),
        None => return (SyscallResultCode::OutOfMemory as u64, 0),
    };

    let user_flags = PageTableFlags::PRESENT | PageTableFlags::WRITABLE | PageTableFlags::USER_ACCESSIBLE;
    for i in 0..page_count {
        let page = target_start + i * PAGE_SIZE;
        let frame = match paging::walk_foreign(target.pml4_physical_address, page.as_u64(), false, false, |pt, idx| {
            pt[idx].frame().ok()
        }) {
            Ok(Some(f)) => f,
            _ => return (SyscallResultCode::from(KernelError::from(InvalidMemoryRange)) as u64, 0),
        };
        paging::map_page(user_base + i * PAGE_SIZE, frame, user_flags).expect("freshly found user range");
    }

    process.register_mapping(MappingDescriptor {
        start_page: user_base,
        page_count,
        is_owned: false,
        is_shared: false,
    });
    (SyscallResultCode::Success as u64, user_base.as_u64())
}

/// Finds the caller's mapping whose virtual start equals `address`, removes
/// it from the process's mapping list, and unmaps it (freeing frames iff
/// `is_owned`).
pub fn unmap_memory(process: &Process, address: u64) {
    let target = VirtAddr::new(address & !(PAGE_SIZE - 1));
    if let Some((handle, mapping)) = process.mappings.iter().find(|(_, m)| m.start_page == target) {
        let page_count = mapping.page_count;
        let is_owned = mapping.is_owned;
        process.remove_mapping(handle);
        for i in 0..page_count {
            let page = target + i * PAGE_SIZE;
            if is_owned {
                paging::unmap_and_deallocate(page);
            } else {
                paging::unmap_page(page);
            }
        }
    }
}
