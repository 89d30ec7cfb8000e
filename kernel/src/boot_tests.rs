//! In-kernel integration harness: a handful of end-to-end scenarios that
//! need real hardware (frame allocator, page tables, the scheduler's
//! per-CPU state) and so cannot run under the host `std` test harness.
//! Built only with `--features boot_tests`; `main.rs` runs these instead
//! of entering the interactive scheduler when the feature is enabled.

use alloc::vec::Vec;

use crate::elf::{self, LoadRequest};
use crate::process::{manager, ThreadState};
use crate::{serial_print, serial_println};

type Scenario = (&'static str, fn());

const SCENARIOS: &[Scenario] = &[
    ("frame_allocator_frames_are_disjoint", frame_allocator_frames_are_disjoint),
    ("process_create_and_destroy_round_trips", process_create_and_destroy_round_trips),
    ("load_spawns_one_runnable_thread", load_spawns_one_runnable_thread),
    ("load_rejects_bad_magic", load_rejects_bad_magic),
];

/// Runs every scenario, reporting pass/fail over serial, then exits QEMU
/// (under `qemu_exit`) or halts.
pub fn run() -> ! {
    serial_println!("running {} boot tests", SCENARIOS.len());
    for (name, scenario) in SCENARIOS {
        serial_print!("{}...\t", name);
        scenario();
        serial_println!("[ok]");
    }

    #[cfg(feature = "qemu_exit")]
    crate::exit_qemu(crate::QemuExitCode::Success);

    crate::hlt_loop()
}

fn frame_allocator_frames_are_disjoint() {
    use crate::memory::frame_allocator;

    let frames: Vec<_> = (0..16)
        .map(|_| frame_allocator::allocate_frame().expect("frame available"))
        .collect();
    for (i, a) in frames.iter().enumerate() {
        for b in &frames[i + 1..] {
            assert_ne!(a.start_address(), b.start_address());
        }
    }
    for frame in frames {
        frame_allocator::deallocate_frame(frame);
    }
}

fn process_create_and_destroy_round_trips() {
    let before = manager::process_count();
    let (_, handle) = manager::allocate_process().expect("process allocation");
    assert_eq!(manager::process_count(), before + 1);
    manager::destroy_process(handle).expect("destroy succeeds");
    assert_eq!(manager::process_count(), before);
}

/// A minimal synthetic object: one allocate+write section holding a single
/// `hlt; jmp $` loop, a symbol table naming its start `entry`, and no
/// relocations. Shaped by hand to match the section/symbol/string table
/// layout `crate::elf` expects; never assembled from real source.
fn synthetic_object() -> Vec<u8> {
    const ENTRY_CODE: [u8; 3] = [0xf4, 0xeb, 0xfd]; // hlt; jmp $-1

    #[repr(C)]
    struct Header {
        magic: [u8; 4],
        section_count: u32,
        section_header_offset: u64,
        symtab_index: u32,
        strtab_index: u32,
    }
    #[repr(C)]
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
    struct Symbol {
        name_offset: u32,
        section_index: u32,
        value: u64,
    }

    const SECTION_FLAG_ALLOC: u32 = 1 << 0;
    const SECTION_FLAG_EXEC: u32 = 1 << 2;

    let header_size = core::mem::size_of::<Header>();
    let section_header_size = core::mem::size_of::<SectionHeader>();
    let symbol_size = core::mem::size_of::<Symbol>();

    let section_header_offset = header_size as u64;
    // Sections: [0] = code, [1] = symtab, [2] = strtab.
    let code_file_offset = section_header_offset + 3 * section_header_size as u64;
    let symtab_file_offset = code_file_offset + ENTRY_CODE.len() as u64;
    let strtab_bytes = b"\0entry\0";
    let strtab_file_offset = symtab_file_offset + symbol_size as u64;

    let mut bytes = Vec::new();
    bytes.extend_from_slice(unsafe {
        core::slice::from_raw_parts(
            &Header {
                magic: elf::MAGIC,
                section_count: 3,
                section_header_offset,
                symtab_index: 1,
                strtab_index: 2,
            } as *const Header as *const u8,
            header_size,
        )
    });

    let section_headers = [
        SectionHeader {
            name_offset: 0,
            kind: 1,
            flags: SECTION_FLAG_ALLOC | SECTION_FLAG_EXEC,
            file_offset: code_file_offset,
            size: ENTRY_CODE.len() as u64,
            link: 0,
            entry_size: 0,
        },
        SectionHeader {
            name_offset: 0,
            kind: 2,
            flags: 0,
            file_offset: symtab_file_offset,
            size: symbol_size as u64,
            link: 0,
            entry_size: symbol_size as u64,
        },
        SectionHeader {
            name_offset: 0,
            kind: 3,
            flags: 0,
            file_offset: strtab_file_offset,
            size: strtab_bytes.len() as u64,
            link: 0,
            entry_size: 0,
        },
    ];
    for sh in &section_headers {
        bytes.extend_from_slice(unsafe {
            core::slice::from_raw_parts(sh as *const SectionHeader as *const u8, section_header_size)
        });
    }

    bytes.extend_from_slice(&ENTRY_CODE);

    let symbol = Symbol {
        name_offset: 1, // "entry" in the string table
        section_index: 0,
        value: 0,
    };
    bytes.extend_from_slice(unsafe {
        core::slice::from_raw_parts(&symbol as *const Symbol as *const u8, symbol_size)
    });

    bytes.extend_from_slice(strtab_bytes);
    bytes
}

fn load_spawns_one_runnable_thread() {
    let object = synthetic_object();
    let pid = elf::load(LoadRequest {
        object: &object,
        argument_data: &[],
    })
    .expect("synthetic object loads");

    let (handle, process) = manager::find_by_id(pid).expect("process registered");
    let threads: Vec<_> = process.threads.iter().collect();
    assert_eq!(threads.len(), 1);
    assert_eq!(threads[0].1.state, ThreadState::Runnable);

    manager::destroy_process(handle).expect("teardown succeeds");
}

fn load_rejects_bad_magic() {
    let mut object = synthetic_object();
    object[0] = 0x00;
    let result = elf::load(LoadRequest {
        object: &object,
        argument_data: &[],
    });
    assert!(result.is_err());
}
