//! Relocatable-object loader: turns a section-table ELF-like file plus an
//! argument blob into a fully populated [`crate::process::Process`] with
//! one runnable thread.
//!
//! Grounded in `original_source/kernel64/process.cpp`'s
//! `create_process_from_elf`: allocate a process, walk the object's
//! section table copying "allocate" sections into freshly mapped pages,
//! process relocations through a kernel-side mirror of each page, then
//! drop the kernel mirrors and hand the process a stack and an entry
//! frame. This loader generalizes that shape from program headers to the
//! richer section/symbol/relocation model the object format actually
//! carries, per the expanded specification's step-by-step algorithm.

use x86_64::structures::paging::PageTableFlags;
use x86_64::{PhysAddr, VirtAddr};

use crate::config::{GOT_SIZE, PAGE_SIZE};
use crate::error::{InvalidElf, KernelError};
use crate::memory::{frame_allocator, kernel_stack, paging};
use crate::process::{manager, DebugSection, MappingDescriptor, Process, ProcessId, ThreadFrame};

pub const MAGIC: [u8; 4] = [0x7f, b'E', b'L', b'F'];

const SECTION_FLAG_ALLOC: u32 = 1 << 0;
const SECTION_FLAG_WRITE: u32 = 1 << 1;
const SECTION_FLAG_EXEC: u32 = 1 << 2;

const RELOC_ABS64: u32 = 1;
const RELOC_PC32: u32 = 2;
const RELOC_PC64: u32 = 3;
const RELOC_GOT32: u32 = 4;
const RELOC_GOT64: u32 = 5;
const RELOC_GOTPCREL32: u32 = 6;
const RELOC_GOTPCREL64: u32 = 7;
const RELOC_GOTOFF64: u32 = 8;
const RELOC_GOTPC32: u32 = 9;
const RELOC_GOTPC64: u32 = 10;

#[repr(C)]
#[derive(Clone, Copy)]
struct Header {
    magic: [u8; 4],
    section_count: u32,
    section_header_offset: u64,
    symtab_index: u32,
    strtab_index: u32,
}

#[repr(C)]
#[derive(Clone, Copy)]
struct SectionHeader {
    name_offset: u32,
    kind: u32,
    flags: u32,
    file_offset: u64,
    size: u64,
    link: u32,
    entry_size: u64,
}

#[repr(C)]
#[derive(Clone, Copy)]
struct Symbol {
    name_offset: u32,
    section_index: u32,
    value: u64,
}

#[repr(C)]
#[derive(Clone, Copy)]
struct Relocation {
    offset: u64,
    kind: u32,
    symbol_index: u32,
    addend: i64,
}

struct SectionAllocation {
    user_base: VirtAddr,
    kernel_base: VirtAddr,
    page_count: u64,
}

/// Parameters for [`load`], mirroring the `CreateProcess` syscall's input.
pub struct LoadRequest<'a> {
    pub object: &'a [u8],
    pub argument_data: &'a [u8],
}

unsafe fn read<T: Copy>(object: &[u8], offset: usize) -> Result<T, KernelError> {
    if offset + core::mem::size_of::<T>() > object.len() {
        return Err(InvalidElf::SectionOutOfBounds.into());
    }
    Ok(unsafe { core::ptr::read_unaligned(object.as_ptr().add(offset) as *const T) })
}

/// Builds a process from `request.object`, following the nine-step
/// algorithm: allocate, map and copy sections, allocate a GOT, process
/// relocations through kernel mirrors, drop the mirrors, allocate a
/// stack and argument blob, then seed the entry thread. Any failure
/// past step 1 rolls the partially built process back via
/// [`manager::destroy_process`].
pub fn load(request: LoadRequest) -> Result<ProcessId, KernelError> {
    let header: Header = unsafe { read(request.object, 0)? };
    if header.magic != MAGIC {
        return Err(InvalidElf::BadMagic.into());
    }

    let (pid, handle) = manager::allocate_process()?;
    let process = manager::lookup(handle).expect("just allocated");

    match load_inner(process, request, &header) {
        Ok(()) => Ok(pid),
        Err(e) => {
            let _ = manager::destroy_process(handle);
            Err(e)
        }
    }
}

fn section_header(object: &[u8], header: &Header, index: u32) -> Result<SectionHeader, KernelError> {
    let offset = header.section_header_offset as usize
        + index as usize * core::mem::size_of::<SectionHeader>();
    unsafe { read(object, offset) }
}

fn load_inner(process: &Process, request: LoadRequest, header: &Header) -> Result<(), KernelError> {
    let object = request.object;
    let symtab = section_header(object, header, header.symtab_index)?;
    if symtab.kind == 0 {
        return Err(InvalidElf::MissingSymtab.into());
    }
    let strtab = section_header(object, header, header.strtab_index)?;
    if strtab.kind == 0 {
        return Err(InvalidElf::MissingStrtab.into());
    }

    // A fresh process's user region is entirely empty: the loader is the
    // only thing that will ever establish mappings in it before the
    // process runs, so a simple bump allocator over USER_REGION suffices
    // in place of walking the (not-yet-loaded) foreign page tables.
    let mut next_user_page = crate::config::USER_REGION_START;
    let mut bump_user = |page_count: u64| -> VirtAddr {
        let base = next_user_page;
        next_user_page += page_count * PAGE_SIZE;
        VirtAddr::new(base)
    };

    // Step 2+3: map and copy every "allocate" section, recording where
    // each landed in both address spaces.
    let mut sections = alloc::vec::Vec::with_capacity(header.section_count as usize);
    for i in 0..header.section_count {
        let sh = section_header(object, header, i)?;
        if sh.flags & SECTION_FLAG_ALLOC == 0 {
            sections.push(None);
            continue;
        }
        let page_count = sh.size.div_ceil(PAGE_SIZE).max(1);
        let user_base = bump_user(page_count);
        let kernel_base = find_kernel_window(page_count)?;

        let writable = sh.flags & SECTION_FLAG_WRITE != 0;
        let executable = sh.flags & SECTION_FLAG_EXEC != 0;
        map_section_pages(process.pml4_physical_address, user_base, kernel_base, page_count, writable, executable)?;

        process.register_mapping(MappingDescriptor {
            start_page: user_base,
            page_count,
            is_owned: true,
            is_shared: false,
        });

        if executable {
            let name = read_cstr(object, strtab.file_offset as usize + sh.name_offset as usize);
            process.register_debug_section(DebugSection::new(user_base, sh.size, name));
        }

        if sh.kind != 0 && sh.file_offset != 0 {
            let src = &object[sh.file_offset as usize..(sh.file_offset + sh.size) as usize];
            unsafe {
                core::ptr::copy_nonoverlapping(src.as_ptr(), kernel_base.as_mut_ptr::<u8>(), src.len());
            }
        }

        sections.push(Some(SectionAllocation {
            user_base,
            kernel_base,
            page_count,
        }));
    }

    // Step 4: the GOT, one page, user+kernel mirrored.
    let got_pages = (GOT_SIZE as u64).div_ceil(PAGE_SIZE);
    let got_user = bump_user(got_pages);
    let got_kernel = find_kernel_window(got_pages)?;
    map_section_pages(process.pml4_physical_address, got_user, got_kernel, got_pages, true, false)?;
    process.register_mapping(MappingDescriptor {
        start_page: got_user,
        page_count: got_pages,
        is_owned: true,
        is_shared: false,
    });
    let mut got_cursor: u64 = 0;

    // Step 5: relocations.
    for i in 0..header.section_count {
        let sh = section_header(object, header, i)?;
        if sh.kind != 9 {
            // not a .rela section
            continue;
        }
        let target = sections
            .get(sh.link as usize)
            .and_then(|s| s.as_ref())
            .ok_or(InvalidElf::SectionOutOfBounds)?;

        let count = sh.size as usize / core::mem::size_of::<Relocation>();
        for r in 0..count {
            let reloc: Relocation =
                unsafe { read(object, (sh.file_offset as usize) + r * core::mem::size_of::<Relocation>())? };
            let symbol: Symbol = unsafe {
                read(
                    object,
                    symtab.file_offset as usize + reloc.symbol_index as usize * core::mem::size_of::<Symbol>(),
                )?
            };
            let sym_section = sections
                .get(symbol.section_index as usize)
                .and_then(|s| s.as_ref())
                .ok_or(InvalidElf::SectionOutOfBounds)?;
            let sym_addr = sym_section.user_base.as_u64() + symbol.value;

            let slot_user_addr = target.user_base.as_u64() + reloc.offset;
            let slot_kernel_ptr = (target.kernel_base.as_u64() + reloc.offset) as *mut u64;
            let slot_kernel_ptr32 = slot_kernel_ptr as *mut u32;

            unsafe {
                match reloc.kind {
                    RELOC_ABS64 => {
                        core::ptr::write_unaligned(slot_kernel_ptr, sym_addr.wrapping_add(reloc.addend as u64));
                    }
                    RELOC_PC32 => {
                        let value = (sym_addr as i64 + reloc.addend - slot_user_addr as i64) as u32;
                        core::ptr::write_unaligned(slot_kernel_ptr32, value);
                    }
                    RELOC_PC64 => {
                        let value = (sym_addr as i64 + reloc.addend - slot_user_addr as i64) as u64;
                        core::ptr::write_unaligned(slot_kernel_ptr, value);
                    }
                    RELOC_GOT32 | RELOC_GOT64 | RELOC_GOTPCREL32 | RELOC_GOTPCREL64 => {
                        if got_cursor + 8 > GOT_SIZE as u64 {
                            return Err(InvalidElf::GotOverflow.into());
                        }
                        let got_index_addr = got_kernel.as_u64() + got_cursor;
                        core::ptr::write_unaligned(got_index_addr as *mut u64, sym_addr);
                        let got_index = got_cursor;
                        got_cursor += 8;
                        match reloc.kind {
                            RELOC_GOT32 => {
                                let value = (got_index as i64 + reloc.addend) as u32;
                                core::ptr::write_unaligned(slot_kernel_ptr32, value);
                            }
                            RELOC_GOT64 => {
                                let value = (got_index as i64 + reloc.addend) as u64;
                                core::ptr::write_unaligned(slot_kernel_ptr, value);
                            }
                            RELOC_GOTPCREL32 => {
                                let got_user_addr = got_user.as_u64() + got_index;
                                let value = (got_user_addr as i64 + reloc.addend - slot_user_addr as i64) as u32;
                                core::ptr::write_unaligned(slot_kernel_ptr32, value);
                            }
                            _ => {
                                let got_user_addr = got_user.as_u64() + got_index;
                                let value = (got_user_addr as i64 + reloc.addend - slot_user_addr as i64) as u64;
                                core::ptr::write_unaligned(slot_kernel_ptr, value);
                            }
                        }
                    }
                    RELOC_GOTOFF64 => {
                        let value = (sym_addr as i64 + reloc.addend - got_user.as_u64() as i64) as u64;
                        core::ptr::write_unaligned(slot_kernel_ptr, value);
                    }
                    RELOC_GOTPC32 => {
                        let value = (got_user.as_u64() as i64 + reloc.addend - slot_user_addr as i64) as u32;
                        core::ptr::write_unaligned(slot_kernel_ptr32, value);
                    }
                    RELOC_GOTPC64 => {
                        let value = (got_user.as_u64() as i64 + reloc.addend - slot_user_addr as i64) as u64;
                        core::ptr::write_unaligned(slot_kernel_ptr, value);
                    }
                    _ => return Err(InvalidElf::UnknownRelocationType.into()),
                }
            }
        }
    }

    // Step 6: drop kernel mirrors of sections and GOT.
    for section in sections.iter().flatten() {
        unmap_kernel_window(section.kernel_base, section.page_count);
    }
    unmap_kernel_window(got_kernel, got_pages);

    // Step 7: user stack, and an optional argument-data region.
    const STACK_PAGES: u64 = crate::config::INITIAL_STACK_SIZE as u64 / PAGE_SIZE;
    let stack_user = bump_user(STACK_PAGES);
    let stack_kernel = find_kernel_window(STACK_PAGES)?;
    map_section_pages(process.pml4_physical_address, stack_user, stack_kernel, STACK_PAGES, true, false)?;
    process.register_mapping(MappingDescriptor {
        start_page: stack_user,
        page_count: STACK_PAGES,
        is_owned: true,
        is_shared: false,
    });
    unmap_kernel_window(stack_kernel, STACK_PAGES);

    let (data_user, data_len) = if !request.argument_data.is_empty() {
        let pages = (request.argument_data.len() as u64).div_ceil(PAGE_SIZE);
        let data_user = bump_user(pages);
        let data_kernel = find_kernel_window(pages)?;
        map_section_pages(process.pml4_physical_address, data_user, data_kernel, pages, true, false)?;
        process.register_mapping(MappingDescriptor {
            start_page: data_user,
            page_count: pages,
            is_owned: true,
            is_shared: false,
        });
        unsafe {
            core::ptr::copy_nonoverlapping(
                request.argument_data.as_ptr(),
                data_kernel.as_mut_ptr::<u8>(),
                request.argument_data.len(),
            );
        }
        unmap_kernel_window(data_kernel, pages);
        (data_user.as_u64(), request.argument_data.len() as u64)
    } else {
        (0, 0)
    };

    // Step 8: locate `entry`, seed the thread frame.
    let symbol_count = symtab.size as usize / core::mem::size_of::<Symbol>();
    let mut entry_addr = None;
    for i in 0..symbol_count {
        let symbol: Symbol =
            unsafe { read(object, symtab.file_offset as usize + i * core::mem::size_of::<Symbol>())? };
        let name = read_cstr(object, strtab.file_offset as usize + symbol.name_offset as usize);
        if name == b"entry" {
            if let Some(Some(section)) = sections.get(symbol.section_index as usize) {
                entry_addr = Some(section.user_base.as_u64() + symbol.value);
            } else {
                return Err(InvalidElf::EntryNotAllocated.into());
            }
            break;
        }
    }
    let entry = entry_addr.ok_or(InvalidElf::MissingEntrySymbol)?;

    let mut frame = ThreadFrame::zeroed();
    frame.rip = entry;
    frame.rsp = stack_user.as_u64() + crate::config::INITIAL_STACK_SIZE as u64 - 8;
    frame.rflags = 0x202; // interrupts enabled
    frame.rdi = process.id.0;
    frame.rsi = data_user;
    frame.rdx = data_len;

    let kernel_stack = kernel_stack::allocate_kernel_stack()?;
    let kernel_stack_top = kernel_stack.top();
    core::mem::forget(kernel_stack); // ownership moves to the thread; Process has no Drop today.
    process.spawn_thread(frame, kernel_stack_top);
    process.mark_ready();

    Ok(())
}

fn read_cstr(object: &[u8], offset: usize) -> &[u8] {
    let end = object[offset..].iter().position(|&b| b == 0).unwrap_or(0);
    &object[offset..offset + end]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reads_a_nul_terminated_name_out_of_the_string_table() {
        let strtab = b"\0entry\0main\0";
        assert_eq!(read_cstr(strtab, 1), b"entry");
        assert_eq!(read_cstr(strtab, 7), b"main");
    }

    #[test]
    fn empty_name_at_the_zero_offset() {
        let strtab = b"\0entry\0";
        assert_eq!(read_cstr(strtab, 0), b"");
    }

    #[test]
    fn header_is_rejected_without_the_magic_bytes() {
        let mut bytes = [0u8; core::mem::size_of::<Header>()];
        bytes[..4].copy_from_slice(&[0x7f, b'E', b'L', b'X']);
        let header: Header = unsafe { read(&bytes, 0).unwrap() };
        assert_ne!(header.magic, MAGIC);
    }

    #[test]
    fn read_rejects_a_truncated_buffer() {
        let bytes = [0u8; 4];
        let result: Result<Header, KernelError> = unsafe { read(&bytes, 0) };
        assert!(result.is_err());
    }
}

fn find_kernel_window(page_count: u64) -> Result<VirtAddr, crate::error::OutOfMemory> {
    let base = paging::find_free_range(
        crate::config::KERNEL_REGION_START,
        crate::config::KERNEL_REGION_END,
        page_count,
    )
    .ok_or(crate::error::OutOfMemory)?;
    Ok(VirtAddr::new(base))
}

fn map_section_pages(
    pml4_phys: PhysAddr,
    user_base: VirtAddr,
    kernel_base: VirtAddr,
    page_count: u64,
    writable: bool,
    executable: bool,
) -> Result<(), crate::error::OutOfMemory> {
    let mut user_flags = PageTableFlags::PRESENT | PageTableFlags::USER_ACCESSIBLE;
    if writable {
        user_flags |= PageTableFlags::WRITABLE;
    }
    if !executable {
        user_flags |= PageTableFlags::NO_EXECUTE;
    }
    let kernel_flags = PageTableFlags::PRESENT | PageTableFlags::WRITABLE;

    for i in 0..page_count {
        let frame = frame_allocator::allocate_frame()?;
        let user_page = user_base + i * PAGE_SIZE;
        let kernel_page = kernel_base + i * PAGE_SIZE;
        paging::map_page_foreign(pml4_phys, user_page, frame, user_flags)?;
        paging::map_page(kernel_page, frame, kernel_flags)?;
    }
    Ok(())
}

fn unmap_kernel_window(base: VirtAddr, page_count: u64) {
    for i in 0..page_count {
        paging::unmap_page(base + i * PAGE_SIZE);
    }
}
