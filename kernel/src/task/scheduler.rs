//! Per-CPU scheduler: a cursor over (process, thread) pairs, advanced on
//! every preemption and voluntary yield.
//!
//! Grounded directly in the state machine spelled out for this kernel's
//! scheduler: strict forward iteration, no priority, no quantum
//! accounting, a thread's `resident` flag as the only cross-CPU
//! coordination. A CPU that finds nothing ready resets its stack to the
//! top of its per-CPU interrupt stack and halts until the next tick.

use core::sync::atomic::Ordering;

use crate::per_cpu::{self, NONE_THREAD};
use crate::process::{manager, ProcessId, ThreadId, ThreadState};

/// Re-arms the timer and runs `return_to_user` for the thread the cursor
/// just selected. Never returns.
fn dispatch_thread(process_pml4: x86_64::PhysAddr, thread: &'static crate::process::Thread) -> ! {
    unsafe {
        core::arch::asm!(
            "mov cr3, {pml4}",
            pml4 = in(reg) process_pml4.as_u64(),
            options(nostack, preserves_flags),
        );
    }
    thread.fpu_state.restore();
    if let Some(apic_base) = crate::acpi::local_apic_base() {
        crate::interrupts::timer::arm(apic_base);
    }
    unsafe { crate::interrupts::context_switch::return_to_user(&thread.frame) }
}

/// Scans forward from this CPU's cursor for the next runnable thread
/// not already resident elsewhere, claims it, and jumps to it. If none
/// exists anywhere, halts until the next timer tick and tries again.
pub fn schedule() -> ! {
    let area = per_cpu::current();
    loop {
        if let Some((owner_pml4, thread)) = select_next(area) {
            return dispatch_thread(owner_pml4, thread);
        }
        area.current_thread.store(NONE_THREAD, Ordering::Release);
        if let Some(apic_base) = crate::acpi::local_apic_base() {
            crate::interrupts::timer::arm(apic_base);
        }
        x86_64::instructions::interrupts::enable_and_hlt();
    }
}

fn select_next(
    area: &'static per_cpu::PerCpuArea,
) -> Option<(x86_64::PhysAddr, &'static crate::process::Thread)> {
    let processes: alloc::vec::Vec<_> = manager::all_processes().collect();
    if processes.is_empty() {
        return None;
    }

    let cursor_pid = area.cursor_process_id.load(Ordering::Acquire);
    let cursor_tid = area.cursor_thread_id.load(Ordering::Acquire);
    let start = processes
        .iter()
        .position(|(_, p)| p.id.0 == cursor_pid)
        .unwrap_or(0);

    for step in 0..processes.len() {
        let (_, process) = processes[(start + step) % processes.len()];
        let skip_to = if step == 0 { cursor_tid } else { NONE_THREAD };
        if let Some(handle) = select_thread_in(process, skip_to) {
            let thread = process.threads.get(handle).expect("selected handle is live");
            area.cursor_process_id.store(process.id.0, Ordering::Release);
            area.cursor_thread_id.store(thread.id.0, Ordering::Release);
            area.current_thread.store(thread.id.0, Ordering::Release);
            thread.last_cpu.store(area.cpu_id, Ordering::Relaxed);
            per_cpu::set_kernel_stack_top(area, thread.kernel_stack_top);
            return Some((process.pml4_physical_address, thread));
        }
    }
    None
}

/// Finds the next runnable, not-already-resident thread in `process`
/// strictly after `after_id` (or from the head, if `after_id` is
/// [`NONE_THREAD`]), and claims its residency.
fn select_thread_in(process: &crate::process::Process, after_id: u64) -> Option<crate::process::bucket::Handle> {
    let mut candidates: alloc::vec::Vec<_> = process.threads.iter().collect();
    candidates.sort_by_key(|(_, t)| t.id.0);
    let start = if after_id == NONE_THREAD {
        0
    } else {
        candidates
            .iter()
            .position(|(_, t)| t.id.0 == after_id)
            .map(|i| i + 1)
            .unwrap_or(0)
    };

    for i in 0..candidates.len() {
        let (handle, thread) = candidates[(start + i) % candidates.len()];
        if thread.state != ThreadState::Runnable {
            continue;
        }
        if thread
            .resident
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
        {
            return Some(handle);
        }
    }
    None
}

/// The process currently resident on this CPU, if any. Used by syscall
/// handlers, which always act on the calling process's own address space
/// and mapping list.
pub fn current_process() -> Option<&'static crate::process::Process> {
    let area = per_cpu::current();
    if area.current_thread.load(Ordering::Acquire) == NONE_THREAD {
        return None;
    }
    let pid = area.cursor_process_id.load(Ordering::Acquire);
    manager::find_by_id(ProcessId(pid)).map(|(_, p)| p)
}

/// Called from the timer handler when this CPU was running a thread in
/// user mode (not mid-syscall/mid-exception): saves nothing extra (the
/// frame on the kernel stack at interrupt entry already *is* the saved
/// frame location callers are expected to have written back before
/// calling this), clears residency, and re-enters the scheduler.
pub fn on_timer_tick() -> ! {
    vacate_current();
    schedule()
}

/// Clears the residency flag of the thread currently running on this
/// CPU, if any, so it becomes selectable by another CPU (or this one,
/// on its next pass).
pub fn vacate_current() {
    let area = per_cpu::current();
    let tid = area.current_thread.swap(NONE_THREAD, Ordering::AcqRel);
    if tid == NONE_THREAD {
        return;
    }
    let pid = area.cursor_process_id.load(Ordering::Acquire);
    if let Some((_, process)) = manager::find_by_id(ProcessId(pid)) {
        if let Some((handle, _)) = process.threads.iter().find(|(_, t)| t.id == ThreadId(tid)) {
            if let Some(thread) = process.threads.get_mut(handle) {
                thread.fpu_state.save();
                thread.resident.store(false, Ordering::Release);
            }
        }
    }
}

/// Terminates the thread currently running on this CPU with `exit_code`
/// and re-enters the scheduler. Used by the user-mode-exception path and
/// by the `Exit` syscall.
pub fn terminate_current_thread(exit_code: i64) -> ! {
    let area = per_cpu::current();
    let tid = area.current_thread.load(Ordering::Acquire);
    let pid = area.cursor_process_id.load(Ordering::Acquire);
    if tid != NONE_THREAD {
        if let Some((process_handle, process)) = manager::find_by_id(ProcessId(pid)) {
            if let Some((thread_handle, _)) = process.threads.iter().find(|(_, t)| t.id == ThreadId(tid)) {
                mark_exited(process, thread_handle, exit_code);
            }
            if remaining_runnable(process) == 0 {
                let _ = manager::destroy_process(process_handle);
            }
        }
    }
    area.current_thread.store(NONE_THREAD, Ordering::Release);
    schedule()
}

fn mark_exited(process: &crate::process::Process, handle: crate::process::bucket::Handle, exit_code: i64) {
    if let Some(thread) = process.threads.get_mut(handle) {
        thread.state = ThreadState::Exited(exit_code);
        thread.resident.store(false, Ordering::Release);
    }
}

fn remaining_runnable(process: &crate::process::Process) -> usize {
    process
        .threads
        .iter()
        .filter(|(_, t)| t.state == ThreadState::Runnable)
        .count()
}

/// Removes every thread belonging to `pid` from scheduling consideration.
/// Called by [`manager::destroy_process`] before any page table or
/// mapping is torn down, so no CPU can be mid-dispatch on a thread whose
/// address space is about to disappear.
pub fn remove_all_threads_of(pid: ProcessId) {
    if let Some((_, process)) = manager::find_by_id(pid) {
        let handles: alloc::vec::Vec<_> = process.threads.iter().map(|(h, _)| h).collect();
        for handle in handles {
            mark_exited(process, handle, -1);
        }
    }
}
