//! Per-CPU area: one instance per CPU, heap-allocated and reached through
//! `GS_BASE`/`KERNEL_GS_BASE`, never a fixed virtual address. It is still
//! reachable identically whether the currently-loaded PML4 is the kernel's
//! or a user process's, since its backing frames fall inside the kernel
//! region every process's PML4 mirrors (see
//! [`crate::process::manager::mirror_kernel_region`]) and the MSRs that
//! locate it are unaffected by a CR3 switch.
//!
//! Grounded in `original_source/kernel64/multiprocessing.h`'s
//! `ProcessorArea`: an embedded interrupt stack, an embedded per-CPU GDT
//! and TSS (so the GDT's busy-bit bookkeeping never has to be shared
//! across CPUs), and the scheduler's residency/deferred-preempt flags.
//! Reached via the `GS` segment base, one region per CPU, indexed by
//! `cpu_id`.

use core::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use x86_64::registers::model_specific::{GsBase, KernelGsBase};
use x86_64::structures::gdt::{Descriptor, GlobalDescriptorTable, SegmentSelector};
use x86_64::structures::tss::TaskStateSegment;
use x86_64::VirtAddr;

use crate::config::MAX_CPUS;

pub const INTERRUPT_STACK_SIZE: usize = 16 * 1024;

/// Per-CPU state reached through `GS:0`. `repr(C)` keeps field order fixed
/// since the syscall entry trampoline reaches `kernel_stack_top` and
/// `user_rsp_scratch` directly by offset.
#[repr(C, align(64))]
pub struct PerCpuArea {
    /// Self-pointer: the first thing any code holding a `%gs`-relative
    /// pointer reads, to recover the `&'static PerCpuArea` as a normal
    /// reference.
    pub self_ptr: *mut PerCpuArea,
    pub cpu_id: u32,
    /// RSP0 handed to the TSS; refreshed whenever the running thread
    /// changes.
    pub kernel_stack_top: u64,
    /// Scratch slot the SYSCALL trampoline stashes the user RSP in before
    /// switching onto `kernel_stack_top`.
    pub user_rsp_scratch: u64,
    pub gdt: GlobalDescriptorTable,
    pub tss: TaskStateSegment,
    pub kernel_code_selector: SegmentSelector,
    pub kernel_data_selector: SegmentSelector,
    pub user_code_selector: SegmentSelector,
    pub user_data_selector: SegmentSelector,
    pub tss_selector: SegmentSelector,
    /// Set while this CPU is executing a syscall or handling a user-mode
    /// exception; a preemption IPI that lands during this window is
    /// deferred rather than acted on immediately, and replayed by the
    /// syscall/exception return path.
    pub in_syscall_or_user_exception: AtomicBool,
    pub preempt_deferred: AtomicBool,
    /// Handle of the thread currently resident on this CPU, or `None` if
    /// idle. `None` is encoded as `u64::MAX`.
    pub current_thread: AtomicU64,
    /// Scheduler cursor: the process/thread id pair the last selection
    /// scan left off at, so the next scan resumes forward instead of
    /// always restarting at the head of the process list.
    pub cursor_process_id: AtomicU64,
    pub cursor_thread_id: AtomicU64,
    interrupt_stack: [u8; INTERRUPT_STACK_SIZE],
}

pub const NONE_THREAD: u64 = u64::MAX;

static mut AREAS: [Option<&'static mut PerCpuArea>; MAX_CPUS] = [const { None }; MAX_CPUS];
static ONLINE_CPUS: AtomicU64 = AtomicU64::new(0);

/// Builds and installs the per-CPU area for `cpu_id`, loads its GDT, TSS,
/// and `GS_BASE`/`KERNEL_GS_BASE`. Must run once per CPU during that CPU's
/// bring-up, before interrupts are enabled.
pub fn init(cpu_id: u32) {
    let area = alloc::boxed::Box::leak(alloc::boxed::Box::new(PerCpuArea {
        self_ptr: core::ptr::null_mut(),
        cpu_id,
        kernel_stack_top: 0,
        user_rsp_scratch: 0,
        gdt: GlobalDescriptorTable::new(),
        tss: TaskStateSegment::new(),
        kernel_code_selector: SegmentSelector(0),
        kernel_data_selector: SegmentSelector(0),
        user_code_selector: SegmentSelector(0),
        user_data_selector: SegmentSelector(0),
        tss_selector: SegmentSelector(0),
        in_syscall_or_user_exception: AtomicBool::new(false),
        preempt_deferred: AtomicBool::new(false),
        current_thread: AtomicU64::new(NONE_THREAD),
        cursor_process_id: AtomicU64::new(NONE_THREAD),
        cursor_thread_id: AtomicU64::new(NONE_THREAD),
        interrupt_stack: [0; INTERRUPT_STACK_SIZE],
    }));

    area.self_ptr = area as *mut PerCpuArea;

    let stack_top = VirtAddr::from_ptr(area.interrupt_stack.as_ptr()) + INTERRUPT_STACK_SIZE as u64;
    area.tss.privilege_stack_table[0] = stack_top;
    area.tss.interrupt_stack_table[crate::gdt::DOUBLE_FAULT_IST_INDEX as usize] = stack_top;
    area.kernel_stack_top = stack_top.as_u64();

    area.kernel_code_selector = area.gdt.append(Descriptor::kernel_code_segment());
    area.kernel_data_selector = area.gdt.append(Descriptor::kernel_data_segment());
    area.user_data_selector = area.gdt.append(Descriptor::user_data_segment());
    area.user_code_selector = area.gdt.append(Descriptor::user_code_segment());
    let tss_ptr: *const TaskStateSegment = &area.tss;
    area.tss_selector = area.gdt.append(Descriptor::tss_segment(unsafe { &*tss_ptr }));

    area.gdt.load();
    unsafe {
        x86_64::instructions::segmentation::CS::set_reg(area.kernel_code_selector);
        x86_64::instructions::segmentation::SS::set_reg(area.kernel_data_selector);
        x86_64::instructions::tables::load_tss(area.tss_selector);
    }

    let addr = VirtAddr::from_ptr(area as *const PerCpuArea);
    GsBase::write(addr);
    // `swapgs` swaps GS_BASE with KERNEL_GS_BASE; both must be set before the
    // first SYSCALL, or syscall_entry's first swapgs on this CPU picks up a
    // stale/zero base for its gs-relative stack switch.
    KernelGsBase::write(addr);

    unsafe {
        #[allow(static_mut_refs)]
        {
            AREAS[cpu_id as usize] = Some(area);
        }
    }
    ONLINE_CPUS.fetch_add(1, Ordering::SeqCst);
}

/// Returns the calling CPU's per-CPU area via `GS_BASE`.
pub fn current() -> &'static PerCpuArea {
    let addr = GsBase::read();
    unsafe { &*(addr.as_u64() as *const PerCpuArea) }
}

pub fn online_cpu_count() -> usize {
    ONLINE_CPUS.load(Ordering::SeqCst) as usize
}

/// Sets the RSP0 the TSS hands the CPU the next time it takes a ring0
/// entry, i.e. the top of the newly-scheduled thread's kernel stack.
pub fn set_kernel_stack_top(area: &PerCpuArea, top: VirtAddr) {
    unsafe {
        let area_mut = &mut *(area as *const PerCpuArea as *mut PerCpuArea);
        area_mut.tss.privilege_stack_table[0] = top;
        area_mut.kernel_stack_top = top.as_u64();
    }
}

/// ICR register offsets, in 32-bit words from the local APIC's MMIO base.
const ICR_LOW_WORD: usize = 0x300 / 4;
const ICR_HIGH_WORD: usize = 0x310 / 4;

/// Sends an inter-processor interrupt on `vector` to every online CPU
/// other than the caller. Used for TLB shootdown and deferred preemption.
///
/// Uses the ICR's "all excluding self" destination shorthand rather than
/// addressing each CPU's local APIC ID individually, since this kernel
/// does not track a per-CPU APIC ID table.
pub fn send_ipi_to_others(vector: u8) {
    if cfg!(not(feature = "smp")) {
        return;
    }
    let Some(base) = crate::acpi::local_apic_base() else {
        return;
    };
    const DELIVERY_MODE_FIXED: u32 = 0;
    const LEVEL_ASSERT: u32 = 1 << 14;
    const DEST_SHORTHAND_ALL_EXCLUDING_SELF: u32 = 0b11 << 18;
    let low = vector as u32 | DELIVERY_MODE_FIXED | LEVEL_ASSERT | DEST_SHORTHAND_ALL_EXCLUDING_SELF;
    unsafe {
        core::ptr::write_volatile(base.add(ICR_HIGH_WORD), 0);
        core::ptr::write_volatile(base.add(ICR_LOW_WORD), low);
    }
}
