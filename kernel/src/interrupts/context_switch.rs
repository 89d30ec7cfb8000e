//! SYSCALL/SYSRET fast entry and exit.
//!
//! The fast path avoids the IDT entirely: `SYSCALL` reads `STAR`/`LSTAR`/
//! `SFMASK` directly, leaving `RIP` in `RCX` and `RFLAGS` in `R11` instead
//! of pushing them, and does not switch `RSP` or swap `GS` on its own. All
//! of that is this module's job: `swapgs` to reach this CPU's per-CPU area,
//! a gs-relative stack switch onto the kernel stack, and the matching
//! `swapgs` back in [`return_to_user`] before `sysretq`. CPU exceptions take
//! a separate path through the IDT's own IST-backed gates
//! (`crate::interrupts`), not through this module.

use core::mem::offset_of;
use core::sync::atomic::Ordering;

use x86_64::registers::control::{Efer, EferFlags};
use x86_64::registers::model_specific::{LStar, SFMask, Star};
use x86_64::PrivilegeLevel;

use crate::per_cpu::PerCpuArea;
use crate::process::ThreadFrame;

/// Not used for dispatch (SYSCALL bypasses the IDT); kept as the
/// documented vector a debugger or `INT` fallback would use if the fast
/// path is unavailable on a given core.
pub const SYSCALL_VECTOR: u8 = 0x80;

const OFF_KERNEL_STACK_TOP: usize = offset_of!(PerCpuArea, kernel_stack_top);
const OFF_USER_RSP_SCRATCH: usize = offset_of!(PerCpuArea, user_rsp_scratch);

/// Programs `EFER.SCE`, `STAR`, `LSTAR`, and `SFMASK` so `SYSCALL` lands on
/// [`syscall_entry`]. Must run once per CPU, after [`crate::per_cpu::init`]
/// has installed that CPU's GDT (the segment selectors `STAR` encodes come
/// from it).
pub fn install_syscall_entry() {
    unsafe {
        Efer::update(|flags| *flags |= EferFlags::SYSTEM_CALL_EXTENSIONS);
        Star::write(
            crate::gdt::user_code_selector(),
            crate::gdt::user_data_selector(),
            crate::gdt::kernel_code_selector(),
            crate::gdt::kernel_data_selector(),
        )
        .expect("STAR selector layout");
        LStar::write(x86_64::VirtAddr::new(syscall_entry as u64));
        // Mask IF on entry; the dispatcher re-enables interrupts once it's
        // safely on the kernel stack.
        SFMask::write(x86_64::registers::rflags::RFlags::INTERRUPT_FLAG);
    }
}

/// Raw `SYSCALL` landing pad. Stashes the user `RSP`, switches onto this
/// CPU's kernel stack, reassembles a [`ThreadFrame`] from the registers
/// `SYSCALL` left live (plus the ones it didn't touch), and calls
/// [`dispatch_from_asm`]. Never returns by the normal path: control comes
/// back to user mode via `sysretq` inside [`dispatch_from_asm`]'s callee.
#[unsafe(naked)]
unsafe extern "C" fn syscall_entry() -> ! {
    core::arch::naked_asm!(
        "swapgs",
        "mov gs:[{user_rsp_off}], rsp",
        "mov rsp, gs:[{kstack_off}]",
        // Build a ThreadFrame on the kernel stack in field order
        // (r15..ss); rsp/cs/ss are fixed up in Rust once the dispatcher
        // knows this CPU's user selectors.
        "push rcx",          // placeholder ss slot
        "push gs:[{user_rsp_off}]", // rsp
        "push r11",          // rflags
        "push rcx",          // placeholder cs slot
        "push rcx",          // rip (SYSCALL leaves return RIP in rcx)
        "push rax",
        "push rbx",
        "push rcx",
        "push rdx",
        "push rsi",
        "push rdi",
        "push rbp",
        "push r8",
        "push r9",
        "push r10",
        "push r11",
        "push r12",
        "push r13",
        "push r14",
        "push r15",
        "mov rdi, rsp",
        "call {dispatch}",
        "ud2",
        user_rsp_off = const OFF_USER_RSP_SCRATCH,
        kstack_off = const OFF_KERNEL_STACK_TOP,
        dispatch = sym dispatch_from_asm,
    );
}

/// Called with `rdi` pointing at the [`ThreadFrame`] just assembled on the
/// kernel stack. Marks the CPU as mid-syscall (deferring any preemption
/// IPI that lands while the dispatcher runs), re-enables interrupts,
/// dispatches, then replays a deferred preemption or returns straight to
/// user mode.
extern "C" fn dispatch_from_asm(frame: *mut ThreadFrame) {
    let area = crate::per_cpu::current();
    area.in_syscall_or_user_exception.store(true, Ordering::Release);

    let frame = unsafe { &mut *frame };
    frame.cs = crate::gdt::user_code_selector().0 as u64 | PrivilegeLevel::Ring3 as u64;
    frame.ss = crate::gdt::user_data_selector().0 as u64 | PrivilegeLevel::Ring3 as u64;

    x86_64::instructions::interrupts::enable();
    let result = crate::syscall::dispatcher::dispatch(frame);
    frame.rax = result;
    x86_64::instructions::interrupts::disable();

    area.in_syscall_or_user_exception.store(false, Ordering::Release);
    if area.preempt_deferred.swap(false, Ordering::AcqRel) {
        crate::task::scheduler::on_timer_tick();
    }

    unsafe { return_to_user(frame) }
}

/// Restores a [`ThreadFrame`] and executes `sysretq`. Used both by the
/// syscall return path above and by the scheduler when resuming a thread
/// that was last preempted mid-syscall.
///
/// # Safety
/// `frame` must describe a valid, runnable user-mode register state.
pub unsafe fn return_to_user(frame: &ThreadFrame) -> ! {
    unsafe {
        core::arch::asm!(
            "mov r15, [{f} + 0]",
            "mov r14, [{f} + 8]",
            "mov r13, [{f} + 16]",
            "mov r12, [{f} + 24]",
            "mov r11, [{f} + 32]",
            "mov r10, [{f} + 40]",
            "mov r9,  [{f} + 48]",
            "mov r8,  [{f} + 56]",
            "mov rbp, [{f} + 64]",
            "mov rdi, [{f} + 72]",
            "mov rsi, [{f} + 80]",
            "mov rdx, [{f} + 88]",
            "mov rcx, [{f} + 96]",
            "mov rbx, [{f} + 104]",
            "mov rax, [{f} + 112]",
            "mov rsp, [{f} + 144]",
            "swapgs",
            "sysretq",
            f = in(reg) frame as *const ThreadFrame,
            options(noreturn),
        );
    }
}
