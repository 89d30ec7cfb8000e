//! Interrupt descriptor table: CPU exceptions, the two inter-processor
//! vectors (TLB shootdown, deferred preemption), and the APIC timer.
//!
//! Exception policy: a fault taken while `CS` had RPL 0 (kernel mode) is
//! unrecoverable and halts with a diagnostic (`kernel_panic!`); a fault
//! taken at RPL 3 (user mode) destroys the faulting process and falls
//! back into the scheduler.

use x86_64::structures::idt::{InterruptDescriptorTable, InterruptStackFrame, PageFaultErrorCode};
use x86_64::PrivilegeLevel;

pub(crate) mod context_switch;
pub(crate) mod timer;

pub use context_switch::SYSCALL_VECTOR;

static mut IDT: Option<InterruptDescriptorTable> = None;

fn faulted_in_user_mode(frame: &InterruptStackFrame) -> bool {
    frame.code_segment.rpl() == PrivilegeLevel::Ring3
}

/// Shared policy for a CPU exception with no recovery path other than
/// "kill the process that caused it" in user mode.
fn handle_fault(name: &str, frame: InterruptStackFrame) {
    if faulted_in_user_mode(&frame) {
        log::warn!("{} in user mode at {:#x}, terminating process", name, frame.instruction_pointer);
        crate::task::scheduler::terminate_current_thread(-1);
    } else {
        crate::kernel_panic!("{} in kernel mode at {:#x}", name, frame.instruction_pointer);
    }
}

extern "x86-interrupt" fn divide_by_zero(frame: InterruptStackFrame) {
    handle_fault("divide-by-zero", frame);
}

extern "x86-interrupt" fn invalid_opcode(frame: InterruptStackFrame) {
    handle_fault("invalid opcode", frame);
}

extern "x86-interrupt" fn general_protection_fault(frame: InterruptStackFrame, code: u64) {
    log::warn!("general protection fault, error code {:#x}", code);
    handle_fault("general protection fault", frame);
}

extern "x86-interrupt" fn page_fault(
    frame: InterruptStackFrame,
    error_code: PageFaultErrorCode,
) {
    let addr = x86_64::registers::control::Cr2::read();
    log::warn!("page fault at {:?}, error {:?}", addr, error_code);
    handle_fault("page fault", frame);
}

extern "x86-interrupt" fn double_fault(frame: InterruptStackFrame, _code: u64) -> ! {
    crate::kernel_panic!("double fault at {:#x}", frame.instruction_pointer);
}

extern "x86-interrupt" fn breakpoint(frame: InterruptStackFrame) {
    log::info!("breakpoint at {:#x}", frame.instruction_pointer);
}

extern "x86-interrupt" fn tlb_shootdown(_frame: InterruptStackFrame) {
    crate::memory::tlb::handle_shootdown_ipi();
}

extern "x86-interrupt" fn preempt_ipi(_frame: InterruptStackFrame) {
    crate::per_cpu::current()
        .preempt_deferred
        .store(true, core::sync::atomic::Ordering::Release);
}

/// Arms the local APIC's one-shot timer for the first quantum. Thin
/// wrapper so callers outside this module don't need `timer` to be public.
pub fn arm_timer(apic_base: *mut u32) {
    timer::arm(apic_base);
}

/// Builds and loads this CPU's IDT. Safe to call once per CPU; the IDT
/// itself is shared (exception vectors don't vary per CPU), but `lidt`
/// must be issued on every CPU.
pub fn init() {
    unsafe {
        #[allow(static_mut_refs)]
        let idt = IDT.get_or_insert_with(|| {
            let mut idt = InterruptDescriptorTable::new();
            idt.divide_error.set_handler_fn(divide_by_zero);
            idt.invalid_opcode.set_handler_fn(invalid_opcode);
            idt.general_protection_fault.set_handler_fn(general_protection_fault);
            idt.page_fault.set_handler_fn(page_fault);
            idt.breakpoint.set_handler_fn(breakpoint);
            unsafe {
                idt.double_fault
                    .set_handler_fn(double_fault)
                    .set_stack_index(crate::gdt::DOUBLE_FAULT_IST_INDEX);
            }
            idt[timer::TIMER_VECTOR as usize].set_handler_fn(timer::handler);
            idt[crate::config::TLB_SHOOTDOWN_VECTOR as usize].set_handler_fn(tlb_shootdown);
            idt[crate::config::PREEMPT_IPI_VECTOR as usize].set_handler_fn(preempt_ipi);
            idt
        });
        idt.load_unsafe();
    }
    context_switch::install_syscall_entry();
}
