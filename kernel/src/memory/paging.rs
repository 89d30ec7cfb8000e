//! Four-level paging engine built on a recursive self-mapping.
//!
//! PML4 slot [`crate::config::RECURSIVE_PML4_INDEX`] points back at the
//! PML4 itself. That one fact lets every level of the currently-active
//! address space be reached as ordinary memory accesses through a fixed
//! set of virtual windows, the same trick `original_source/kernel64/paging.h`
//! uses (`get_pml4_table_pointer` / `get_pdp_table_pointer` /
//! `get_pd_table_pointer` / `get_page_table_pointer`). Operating on a
//! foreign address space (one that isn't loaded in CR3) instead goes
//! through [`walk_foreign`], which temporarily maps the foreign tables
//! into a scratch window.

use x86_64::registers::control::Cr3;
use x86_64::structures::paging::{PageTable, PageTableFlags, PhysFrame};
use x86_64::{PhysAddr, VirtAddr};

use crate::config::{PAGE_SIZE, RECURSIVE_PML4_INDEX};
use crate::error::OutOfMemory;
use crate::memory::{frame_allocator, layout, tlb};

const ENTRY_COUNT: u64 = 512;

/// Sign-extends a 48-bit virtual address into canonical form, mirroring
/// `make_address_canonical` in the original paging engine.
pub fn make_canonical(addr: u64) -> VirtAddr {
    let shifted = (addr << 16) as i64;
    VirtAddr::new((shifted >> 16) as u64)
}

fn pml4_index(addr: u64) -> u64 {
    (addr >> 39) & 0x1ff
}
fn pdpt_index(addr: u64) -> u64 {
    (addr >> 30) & 0x1ff
}
fn pd_index(addr: u64) -> u64 {
    (addr >> 21) & 0x1ff
}
fn pt_index(addr: u64) -> u64 {
    (addr >> 12) & 0x1ff
}

/// Virtual address of the currently-loaded PML4, reached through the
/// recursive slot pointing at itself four times.
pub fn pml4_table_pointer() -> *mut PageTable {
    let r = RECURSIVE_PML4_INDEX;
    let addr = (r << 39) | (r << 30) | (r << 21) | (r << 12);
    make_canonical(addr).as_mut_ptr()
}

/// Virtual address of the PDPT covering `addr` in the currently-loaded
/// address space.
pub fn pdpt_table_pointer(addr: u64) -> *mut PageTable {
    let r = RECURSIVE_PML4_INDEX;
    let a = (r << 39) | (r << 30) | (r << 21) | (pml4_index(addr) << 12);
    make_canonical(a).as_mut_ptr()
}

/// Virtual address of the PD covering `addr` in the currently-loaded
/// address space.
pub fn pd_table_pointer(addr: u64) -> *mut PageTable {
    let r = RECURSIVE_PML4_INDEX;
    let a = (r << 39) | (pml4_index(addr) << 30) | (pdpt_index(addr) << 21) | (pml4_index(addr) << 12);
    make_canonical(a).as_mut_ptr()
}

/// Virtual address of the PT covering `addr` in the currently-loaded
/// address space.
pub fn page_table_pointer(addr: u64) -> *mut PageTable {
    let r = RECURSIVE_PML4_INDEX;
    let a = (pml4_index(addr) << 30) | (pdpt_index(addr) << 21) | (pd_index(addr) << 12);
    make_canonical((r << 39) | a).as_mut_ptr()
}

fn current_pml4_phys() -> PhysAddr {
    Cr3::read().0.start_address()
}

/// Allocates and zeroes a frame to back an intermediate page-table level,
/// returning its physical address.
fn alloc_table_frame() -> Result<PhysFrame, OutOfMemory> {
    let frame = frame_allocator::allocate_frame()?;
    // Table frames are always reached once mapped; zero it through the
    // recursive window after installing it into its parent, since the
    // caller maps it immediately after this call returns.
    Ok(frame)
}

/// Flags for a page table used only to reach the next level down: present,
/// writable, and (when `user` is set) user-accessible.
fn intermediate_flags(user: bool) -> PageTableFlags {
    let mut f = PageTableFlags::PRESENT | PageTableFlags::WRITABLE;
    if user {
        f |= PageTableFlags::USER_ACCESSIBLE;
    }
    f
}

unsafe fn zero_table(table: *mut PageTable) {
    core::ptr::write_bytes(table, 0, 1);
}

unsafe fn invalidate(addr: VirtAddr) {
    x86_64::instructions::tlb::flush(addr);
}

/// Ensures the PML4/PDPT/PD chain down to (but not including) the leaf PT
/// exists for `addr` in the currently-loaded address space, allocating
/// intermediate tables on demand. `user` marks newly created intermediate
/// entries user-accessible, required for any leaf mapping a user process
/// will touch.
fn ensure_page_table(addr: u64, user: bool) -> Result<(), OutOfMemory> {
    let mut installed_new_table = false;
    unsafe {
        let pml4 = &mut *pml4_table_pointer();
        let i4 = pml4_index(addr) as usize;
        if !pml4[i4].flags().contains(PageTableFlags::PRESENT) {
            let frame = alloc_table_frame()?;
            pml4[i4].set_addr(frame.start_address(), intermediate_flags(user));
            invalidate(VirtAddr::from_ptr(pdpt_table_pointer(addr)));
            zero_table(pdpt_table_pointer(addr));
            installed_new_table = true;
        } else if user {
            pml4[i4].set_flags(pml4[i4].flags() | PageTableFlags::USER_ACCESSIBLE);
        }

        let pdpt = &mut *pdpt_table_pointer(addr);
        let i3 = pdpt_index(addr) as usize;
        if !pdpt[i3].flags().contains(PageTableFlags::PRESENT) {
            let frame = alloc_table_frame()?;
            pdpt[i3].set_addr(frame.start_address(), intermediate_flags(user));
            invalidate(VirtAddr::from_ptr(pd_table_pointer(addr)));
            zero_table(pd_table_pointer(addr));
            installed_new_table = true;
        } else if user {
            pdpt[i3].set_flags(pdpt[i3].flags() | PageTableFlags::USER_ACCESSIBLE);
        }

        let pd = &mut *pd_table_pointer(addr);
        let i2 = pd_index(addr) as usize;
        if !pd[i2].flags().contains(PageTableFlags::PRESENT) {
            let frame = alloc_table_frame()?;
            pd[i2].set_addr(frame.start_address(), intermediate_flags(user));
            invalidate(VirtAddr::from_ptr(page_table_pointer(addr)));
            zero_table(page_table_pointer(addr));
            installed_new_table = true;
        } else if user {
            pd[i2].set_flags(pd[i2].flags() | PageTableFlags::USER_ACCESSIBLE);
        }
    }

    // A newly installed intermediate table in the kernel region becomes
    // visible through every process's mirrored PML4 entries; other CPUs may
    // have cached the old (absent) paging-structure entry and need to be
    // told to drop it.
    if installed_new_table && layout::is_kernel_address(VirtAddr::new(addr)) {
        let others = crate::per_cpu::online_cpu_count().saturating_sub(1);
        tlb::shootdown_all(others);
    }
    Ok(())
}

/// Maps a single page in the currently-loaded address space to `frame`.
pub fn map_page(page: VirtAddr, frame: PhysFrame, flags: PageTableFlags) -> Result<(), OutOfMemory> {
    let user = flags.contains(PageTableFlags::USER_ACCESSIBLE);
    ensure_page_table(page.as_u64(), user)?;
    unsafe {
        let pt = &mut *page_table_pointer(page.as_u64());
        let i1 = pt_index(page.as_u64()) as usize;
        pt[i1].set_addr(frame.start_address(), flags);
        invalidate(page);
    }
    if layout::is_kernel_address(page) {
        let others = crate::per_cpu::online_cpu_count().saturating_sub(1);
        tlb::shootdown(page, others);
    }
    Ok(())
}

/// Allocates a fresh frame and maps `page` to it, returning the frame.
pub fn map_and_allocate(page: VirtAddr, flags: PageTableFlags) -> Result<PhysFrame, OutOfMemory> {
    let frame = frame_allocator::allocate_frame()?;
    map_page(page, frame, flags)?;
    Ok(frame)
}

/// Unmaps `page` in the currently-loaded address space without freeing its
/// backing frame, returning that frame if it was present.
pub fn unmap_page(page: VirtAddr) -> Option<PhysFrame> {
    unsafe {
        let pml4 = &*pml4_table_pointer();
        if !pml4[pml4_index(page.as_u64()) as usize]
            .flags()
            .contains(PageTableFlags::PRESENT)
        {
            return None;
        }
        let pdpt = &*pdpt_table_pointer(page.as_u64());
        if !pdpt[pdpt_index(page.as_u64()) as usize]
            .flags()
            .contains(PageTableFlags::PRESENT)
        {
            return None;
        }
        let pd = &*pd_table_pointer(page.as_u64());
        if !pd[pd_index(page.as_u64()) as usize]
            .flags()
            .contains(PageTableFlags::PRESENT)
        {
            return None;
        }
        let pt = &mut *page_table_pointer(page.as_u64());
        let i1 = pt_index(page.as_u64()) as usize;
        if !pt[i1].flags().contains(PageTableFlags::PRESENT) {
            return None;
        }
        let frame = pt[i1].frame().ok();
        pt[i1].set_unused();
        invalidate(page);
        if layout::is_kernel_address(page) {
            let others = crate::per_cpu::online_cpu_count().saturating_sub(1);
            tlb::shootdown(page, others);
        }
        frame
    }
}

/// Unmaps `page` and returns its frame to the frame allocator.
pub fn unmap_and_deallocate(page: VirtAddr) {
    if let Some(frame) = unmap_page(page) {
        frame_allocator::deallocate_frame(frame);
    }
}

/// Translates `addr` in the currently-loaded address space to a physical
/// address, or `None` if any level of the walk is not present.
pub fn translate(addr: VirtAddr) -> Option<PhysAddr> {
    let frame = unsafe {
        let pml4 = &*pml4_table_pointer();
        if !pml4[pml4_index(addr.as_u64()) as usize]
            .flags()
            .contains(PageTableFlags::PRESENT)
        {
            return None;
        }
        let pdpt = &*pdpt_table_pointer(addr.as_u64());
        if !pdpt[pdpt_index(addr.as_u64()) as usize]
            .flags()
            .contains(PageTableFlags::PRESENT)
        {
            return None;
        }
        let pd = &*pd_table_pointer(addr.as_u64());
        if !pd[pd_index(addr.as_u64()) as usize]
            .flags()
            .contains(PageTableFlags::PRESENT)
        {
            return None;
        }
        let pt = &*page_table_pointer(addr.as_u64());
        let entry = &pt[pt_index(addr.as_u64()) as usize];
        if !entry.flags().contains(PageTableFlags::PRESENT) {
            return None;
        }
        entry.frame().ok()?
    };
    Some(frame.start_address() + (addr.as_u64() & 0xfff))
}

/// Scratch window used by [`walk_foreign`] to reach a page table belonging
/// to an address space that isn't currently loaded in CR3. One window per
/// CPU would be needed for a fully concurrent implementation; this uses a
/// single kernel-region slot protected by the caller holding the process
/// manager's allocation lock for the duration of the walk.
const FOREIGN_WINDOW: u64 = 0xffff_ff7f_feff_f000;

unsafe fn map_scratch(window: u64, frame: PhysFrame) {
    unsafe {
        map_page(
            VirtAddr::new(window),
            frame,
            PageTableFlags::PRESENT | PageTableFlags::WRITABLE,
        )
        .expect("scratch window page table already established");
    }
}

/// Reads (and optionally installs, via `mutate`) a PML4 entry belonging to
/// a foreign address space identified by `pml4_phys`, without switching
/// CR3. Used by the process manager to mirror the kernel region into a new
/// process's PML4 and by the loader to populate a fresh process's address
/// space before it ever runs.
///
/// `addr` identifies which PML4/PDPT/PD/PT chain to walk; `alloc` controls
/// whether missing intermediate levels are created.
pub fn walk_foreign<R>(
    pml4_phys: PhysAddr,
    addr: u64,
    alloc: bool,
    user: bool,
    mutate: impl FnOnce(&mut PageTable, usize) -> R,
) -> Result<R, OutOfMemory> {
    unsafe {
        map_scratch(FOREIGN_WINDOW, PhysFrame::containing_address(pml4_phys));
        let pml4 = &mut *(FOREIGN_WINDOW as *mut PageTable);

        let i4 = pml4_index(addr) as usize;
        if !pml4[i4].flags().contains(PageTableFlags::PRESENT) {
            if !alloc {
                return Err(OutOfMemory);
            }
            let frame = alloc_table_frame()?;
            pml4[i4].set_addr(frame.start_address(), intermediate_flags(user));
            map_scratch(FOREIGN_WINDOW, frame);
            zero_table(FOREIGN_WINDOW as *mut PageTable);
            map_scratch(FOREIGN_WINDOW, PhysFrame::containing_address(pml4_phys));
        } else if user {
            pml4[i4].set_flags(pml4[i4].flags() | PageTableFlags::USER_ACCESSIBLE);
        }
        let pdpt_frame = pml4[i4].frame().map_err(|_| OutOfMemory)?;

        map_scratch(FOREIGN_WINDOW, pdpt_frame);
        let pdpt = &mut *(FOREIGN_WINDOW as *mut PageTable);
        let i3 = pdpt_index(addr) as usize;
        if !pdpt[i3].flags().contains(PageTableFlags::PRESENT) {
            if !alloc {
                return Err(OutOfMemory);
            }
            let frame = alloc_table_frame()?;
            pdpt[i3].set_addr(frame.start_address(), intermediate_flags(user));
            map_scratch(FOREIGN_WINDOW, frame);
            zero_table(FOREIGN_WINDOW as *mut PageTable);
            map_scratch(FOREIGN_WINDOW, pdpt_frame);
        } else if user {
            pdpt[i3].set_flags(pdpt[i3].flags() | PageTableFlags::USER_ACCESSIBLE);
        }
        let pd_frame = pdpt[i3].frame().map_err(|_| OutOfMemory)?;

        map_scratch(FOREIGN_WINDOW, pd_frame);
        let pd = &mut *(FOREIGN_WINDOW as *mut PageTable);
        let i2 = pd_index(addr) as usize;
        if !pd[i2].flags().contains(PageTableFlags::PRESENT) {
            if !alloc {
                return Err(OutOfMemory);
            }
            let frame = alloc_table_frame()?;
            pd[i2].set_addr(frame.start_address(), intermediate_flags(user));
            map_scratch(FOREIGN_WINDOW, frame);
            zero_table(FOREIGN_WINDOW as *mut PageTable);
            map_scratch(FOREIGN_WINDOW, pd_frame);
        } else if user {
            pd[i2].set_flags(pd[i2].flags() | PageTableFlags::USER_ACCESSIBLE);
        }
        let pt_frame = pd[i2].frame().map_err(|_| OutOfMemory)?;

        map_scratch(FOREIGN_WINDOW, pt_frame);
        let pt = &mut *(FOREIGN_WINDOW as *mut PageTable);
        let result = mutate(pt, pt_index(addr) as usize);

        unmap_page(VirtAddr::new(FOREIGN_WINDOW));
        Ok(result)
    }
}

/// Maps `page` to `frame` inside a foreign (not currently loaded) address
/// space.
pub fn map_page_foreign(
    pml4_phys: PhysAddr,
    page: VirtAddr,
    frame: PhysFrame,
    flags: PageTableFlags,
) -> Result<(), OutOfMemory> {
    let user = flags.contains(PageTableFlags::USER_ACCESSIBLE);
    walk_foreign(pml4_phys, page.as_u64(), true, user, |pt, i| {
        pt[i].set_addr(frame.start_address(), flags);
    })
}

/// Unmaps `page` inside a foreign address space, optionally freeing its
/// frame back to the allocator.
pub fn unmap_page_foreign(pml4_phys: PhysAddr, page: VirtAddr, free_frame: bool) {
    let result = walk_foreign(pml4_phys, page.as_u64(), false, false, |pt, i| {
        if pt[i].flags().contains(PageTableFlags::PRESENT) {
            let frame = pt[i].frame().ok();
            pt[i].set_unused();
            frame
        } else {
            None
        }
    });
    if let Ok(Some(frame)) = result {
        if free_frame {
            frame_allocator::deallocate_frame(frame);
        }
    }
}

/// Mirrors the given range from the currently-loaded (kernel) address
/// space into `pml4_phys` by copying top-level PML4 entries, never
/// allocating new tables for the mirrored range — the kernel's own tables
/// are shared and referenced, not duplicated.
pub fn mirror_pml4_range(pml4_phys: PhysAddr, start: u64, end: u64) {
    unsafe {
        let src = &*pml4_table_pointer();
        let start_idx = pml4_index(start) as usize;
        let end_idx = pml4_index(end - 1) as usize;

        map_scratch(FOREIGN_WINDOW, PhysFrame::containing_address(pml4_phys));
        let dst = &mut *(FOREIGN_WINDOW as *mut PageTable);
        for i in start_idx..=end_idx {
            dst[i] = src[i].clone();
        }
        unmap_page(VirtAddr::new(FOREIGN_WINDOW));
    }
}

/// Finds the lowest free virtual page run of `page_count` pages at or
/// above `floor` in the currently-loaded address space, by walking the
/// PML4/PDPT/PD/PT chain and treating any absent intermediate table as a
/// maximally-sized hole (breadth-greedy, as in the original allocator's
/// free range search).
pub fn find_free_range(floor: u64, ceiling: u64, page_count: u64) -> Option<u64> {
    let mut addr = floor & !(PAGE_SIZE - 1);
    let mut run_start = addr;
    let mut run_len = 0u64;

    while addr < ceiling {
        let present = unsafe {
            let pml4 = &*pml4_table_pointer();
            if !pml4[pml4_index(addr) as usize]
                .flags()
                .contains(PageTableFlags::PRESENT)
            {
                let skip = ENTRY_COUNT * ENTRY_COUNT * ENTRY_COUNT - pdpt_index(addr) * ENTRY_COUNT * ENTRY_COUNT
                    - pd_index(addr) * ENTRY_COUNT
                    - pt_index(addr);
                addr += skip * PAGE_SIZE;
                false
            } else {
                let pdpt = &*pdpt_table_pointer(addr);
                if !pdpt[pdpt_index(addr) as usize]
                    .flags()
                    .contains(PageTableFlags::PRESENT)
                {
                    let skip = ENTRY_COUNT * ENTRY_COUNT - pd_index(addr) * ENTRY_COUNT - pt_index(addr);
                    addr += skip * PAGE_SIZE;
                    false
                } else {
                    let pd = &*pd_table_pointer(addr);
                    if !pd[pd_index(addr) as usize]
                        .flags()
                        .contains(PageTableFlags::PRESENT)
                    {
                        let skip = ENTRY_COUNT - pt_index(addr);
                        addr += skip * PAGE_SIZE;
                        false
                    } else {
                        let pt = &*page_table_pointer(addr);
                        let occupied = pt[pt_index(addr) as usize]
                            .flags()
                            .contains(PageTableFlags::PRESENT);
                        addr += PAGE_SIZE;
                        occupied
                    }
                }
            }
        };

        if present {
            run_start = addr;
            run_len = 0;
        } else {
            run_len = (addr - run_start) / PAGE_SIZE;
            if run_len >= page_count {
                return Some(run_start);
            }
        }
    }
    None
}
