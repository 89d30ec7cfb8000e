//! Process and thread object model.
//!
//! Grounded in `original_source/kernel64/process.h`: a process is little
//! more than its PML4 physical address and the set of mappings it owns;
//! all register state lives on the thread, in a frame shaped like the
//! original's `ProcessStackFrame`.

use x86_64::{PhysAddr, VirtAddr};

use crate::config::{DEBUG_SECTION_BUCKET_SIZE, MAPPING_BUCKET_SIZE};
use crate::process::bucket::{BucketArray, Handle};

/// Truncated name length for a [`DebugSection`] record; long section names
/// are cut to fit rather than heap-allocated, since these exist purely for
/// diagnostics.
const DEBUG_SECTION_NAME_LEN: usize = 16;

/// One executable or data section the loader placed in a process's address
/// space, kept around for crash dumps and debugger symbol lookup.
#[derive(Debug, Clone, Copy)]
pub struct DebugSection {
    pub start: VirtAddr,
    pub size: u64,
    pub name: [u8; DEBUG_SECTION_NAME_LEN],
    pub name_len: u8,
}

impl DebugSection {
    pub fn new(start: VirtAddr, size: u64, name: &[u8]) -> Self {
        let mut buf = [0u8; DEBUG_SECTION_NAME_LEN];
        let len = name.len().min(DEBUG_SECTION_NAME_LEN);
        buf[..len].copy_from_slice(&name[..len]);
        DebugSection {
            start,
            size,
            name: buf,
            name_len: len as u8,
        }
    }

    pub fn name(&self) -> &[u8] {
        &self.name[..self.name_len as usize]
    }
}

pub type DebugSections = BucketArray<DebugSection, DEBUG_SECTION_BUCKET_SIZE>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ProcessId(pub u64);

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ThreadId(pub u64);

/// Describes one region of virtual memory a process has mapped, whether
/// privately owned or shared with other processes. Mirrors
/// `ProcessPageMapping` in the original: enough to unmap and optionally
/// free the backing frames when the process is destroyed.
#[derive(Debug, Clone, Copy)]
pub struct MappingDescriptor {
    pub start_page: VirtAddr,
    pub page_count: u64,
    pub is_owned: bool,
    /// Whether another process may import this mapping via the
    /// shared-memory syscalls. Independent of `is_owned`: a shared mapping
    /// is still owned by whichever process created it, for teardown
    /// purposes.
    pub is_shared: bool,
}

pub type Mappings = BucketArray<MappingDescriptor, MAPPING_BUCKET_SIZE>;

/// Full general-purpose and segment register snapshot captured on kernel
/// entry and restored on return to user mode. Field order matches the
/// offset arithmetic in `crate::interrupts::context_switch`'s naked
/// assembly exactly; reordering this struct requires updating it too.
#[derive(Debug, Clone, Copy)]
#[repr(C)]
pub struct ThreadFrame {
    pub r15: u64,
    pub r14: u64,
    pub r13: u64,
    pub r12: u64,
    pub r11: u64,
    pub r10: u64,
    pub r9: u64,
    pub r8: u64,
    pub rbp: u64,
    pub rdi: u64,
    pub rsi: u64,
    pub rdx: u64,
    pub rcx: u64,
    pub rbx: u64,
    pub rax: u64,
    pub rip: u64,
    pub cs: u64,
    pub rflags: u64,
    pub rsp: u64,
    pub ss: u64,
}

impl ThreadFrame {
    pub const fn zeroed() -> Self {
        ThreadFrame {
            r15: 0,
            r14: 0,
            r13: 0,
            r12: 0,
            r11: 0,
            r10: 0,
            r9: 0,
            r8: 0,
            rbp: 0,
            rdi: 0,
            rsi: 0,
            rdx: 0,
            rcx: 0,
            rbx: 0,
            rax: 0,
            rip: 0,
            cs: 0,
            rflags: 0,
            rsp: 0,
            ss: 0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ThreadState {
    Runnable,
    Running,
    Exited(i64),
}

pub struct Thread {
    pub id: ThreadId,
    pub owner: ProcessId,
    pub frame: ThreadFrame,
    pub state: ThreadState,
    /// Physical address of the kernel stack this thread's register state
    /// is saved on/restored from while it is not running.
    pub kernel_stack_top: VirtAddr,
    /// Set by whichever CPU currently runs this thread; the only
    /// cross-CPU coordination the scheduler needs, toggled with
    /// `compare_exchange`.
    pub resident: core::sync::atomic::AtomicBool,
    /// CPU id that last ran this thread; diagnostic only, no affinity.
    pub last_cpu: core::sync::atomic::AtomicU32,
    pub fpu_state: crate::task::context::FpuState,
}

impl Thread {
    pub fn new(id: ThreadId, owner: ProcessId, frame: ThreadFrame, kernel_stack_top: VirtAddr) -> Self {
        Thread {
            id,
            owner,
            frame,
            state: ThreadState::Runnable,
            kernel_stack_top,
            resident: core::sync::atomic::AtomicBool::new(false),
            last_cpu: core::sync::atomic::AtomicU32::new(u32::MAX),
            fpu_state: crate::task::context::FpuState::initial(),
        }
    }
}

pub type Threads = BucketArray<Thread, crate::config::THREAD_BUCKET_SIZE>;

pub struct Process {
    pub id: ProcessId,
    pub pml4_physical_address: PhysAddr,
    pub mappings: Mappings,
    pub threads: Threads,
    pub debug_sections: DebugSections,
    /// Set once the loader has finished populating sections, the GOT, the
    /// stack, and the initial thread. Before that, the process is under
    /// construction and must stay invisible to `DoesProcessExist` and the
    /// scheduler (see `crate::process::manager`).
    pub ready: core::sync::atomic::AtomicBool,
}

impl Process {
    pub fn new(id: ProcessId, pml4_physical_address: PhysAddr) -> Self {
        Process {
            id,
            pml4_physical_address,
            mappings: BucketArray::new(),
            threads: BucketArray::new(),
            debug_sections: BucketArray::new(),
            ready: core::sync::atomic::AtomicBool::new(false),
        }
    }

    pub fn is_ready(&self) -> bool {
        self.ready.load(core::sync::atomic::Ordering::Acquire)
    }

    pub fn mark_ready(&self) {
        self.ready.store(true, core::sync::atomic::Ordering::Release);
    }

    pub fn register_debug_section(&self, section: DebugSection) -> Handle {
        self.debug_sections.insert(section)
    }

    pub fn register_mapping(&self, descriptor: MappingDescriptor) -> Handle {
        self.mappings.insert(descriptor)
    }

    pub fn remove_mapping(&self, handle: Handle) {
        self.mappings.remove(handle);
    }

    pub fn spawn_thread(&self, frame: ThreadFrame, kernel_stack_top: VirtAddr) -> Handle {
        let id = ThreadId(self.threads.iter().count() as u64);
        self.threads.insert(Thread::new(id, self.id, frame, kernel_stack_top))
    }
}
