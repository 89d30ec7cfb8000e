//! Local APIC timer: the preemption clock.
//!
//! Armed in one-shot mode for `APIC_TIMER_INITIAL_COUNT` ticks at
//! `APIC_TIMER_DIVIDER`; the handler re-arms itself for the next quantum
//! and asks the scheduler to pick a thread, mirroring the
//! `ProcessorArea`-per-CPU residency model in
//! `original_source/kernel64/multiprocessing.h`. If the interrupted CPU
//! was mid-syscall or mid-user-exception, the preemption is deferred
//! rather than acted on (see `crate::per_cpu::PerCpuArea::preempt_deferred`)
//! and replayed by that handler's return path.

use x86_64::structures::idt::InterruptStackFrame;

use crate::config::{APIC_TIMER_DIVIDER, APIC_TIMER_INITIAL_COUNT};

pub const TIMER_VECTOR: u8 = 0x20;

const APIC_LVT_TIMER: usize = 0x320;
const APIC_TIMER_ICR: usize = 0x380;
const APIC_TIMER_DIVIDE: usize = 0x3e0;
const APIC_EOI: usize = 0xb0;

/// Programs the local APIC timer in one-shot mode on the calling CPU.
/// `apic_base` is the MMIO virtual address of this CPU's local APIC,
/// discovered via `crate::acpi` and mapped during `crate::memory::init`.
pub fn arm(apic_base: *mut u32) {
    unsafe {
        write(apic_base, APIC_TIMER_DIVIDE, APIC_TIMER_DIVIDER as u32);
        write(apic_base, APIC_LVT_TIMER, TIMER_VECTOR as u32);
        write(apic_base, APIC_TIMER_ICR, APIC_TIMER_INITIAL_COUNT);
    }
}

unsafe fn write(base: *mut u32, offset: usize, value: u32) {
    unsafe { core::ptr::write_volatile((base as usize + offset) as *mut u32, value) };
}

fn send_eoi(apic_base: *mut u32) {
    unsafe { write(apic_base, APIC_EOI, 0) };
}

pub extern "x86-interrupt" fn handler(_frame: InterruptStackFrame) {
    let area = crate::per_cpu::current();
    if area
        .in_syscall_or_user_exception
        .load(core::sync::atomic::Ordering::Acquire)
    {
        area.preempt_deferred
            .store(true, core::sync::atomic::Ordering::Release);
    } else {
        crate::task::scheduler::on_timer_tick();
    }
    if let Some(apic_base) = crate::acpi::local_apic_base() {
        send_eoi(apic_base);
        arm(apic_base);
    }
}
