//! TLB shootdown: forces every other CPU to drop cached translations for a
//! kernel-table change before the caller that made the change proceeds.
//!
//! Protocol: take the shootdown lock, publish the address (or "flush all")
//! and a target mask, `mfence`, send an IPI on
//! [`crate::config::TLB_SHOOTDOWN_VECTOR`] to every targeted CPU, then spin
//! on a progress counter until every targeted CPU has acknowledged. Each
//! CPU's interrupt handler flushes locally and bumps the counter before
//! returning from the interrupt.

use core::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

use x86_64::VirtAddr;

use crate::spinlock::SpinLock;

struct ShootdownRequest {
    addr: Option<VirtAddr>,
    target_count: usize,
}

static SHOOTDOWN_LOCK: SpinLock<()> = SpinLock::new(());
static PENDING_ADDR: AtomicU64 = AtomicU64::new(0);
static PENDING_IS_SET: core::sync::atomic::AtomicBool = core::sync::atomic::AtomicBool::new(false);
static PENDING_FLUSH_ALL: core::sync::atomic::AtomicBool = core::sync::atomic::AtomicBool::new(false);
static ACKS: AtomicUsize = AtomicUsize::new(0);

/// Flushes `addr` on every other online CPU and waits for all of them to
/// acknowledge. Must be called with interrupts enabled on the issuing CPU
/// (it does not itself need the flush, since the change was already made
/// in its own address space before this call).
pub fn shootdown(addr: VirtAddr, other_cpu_count: usize) {
    if other_cpu_count == 0 {
        unsafe { x86_64::instructions::tlb::flush(addr) };
        return;
    }
    let _guard = SHOOTDOWN_LOCK.lock();
    PENDING_ADDR.store(addr.as_u64(), Ordering::Relaxed);
    PENDING_IS_SET.store(true, Ordering::Relaxed);
    PENDING_FLUSH_ALL.store(false, Ordering::Relaxed);
    ACKS.store(0, Ordering::SeqCst);
    core::sync::atomic::fence(Ordering::SeqCst);

    crate::per_cpu::send_ipi_to_others(crate::config::TLB_SHOOTDOWN_VECTOR);

    while ACKS.load(Ordering::Acquire) < other_cpu_count {
        core::hint::spin_loop();
    }
    unsafe { x86_64::instructions::tlb::flush(addr) };
}

/// Same as [`shootdown`] but for an entire address-space swap (CR3 reload
/// on the issuing CPU already happened; other CPUs just need to know a
/// widespread change occurred if they share the same tables, e.g. after
/// mirroring a new kernel mapping into every process).
pub fn shootdown_all(other_cpu_count: usize) {
    if other_cpu_count == 0 {
        return;
    }
    let _guard = SHOOTDOWN_LOCK.lock();
    PENDING_IS_SET.store(false, Ordering::Relaxed);
    PENDING_FLUSH_ALL.store(true, Ordering::Relaxed);
    ACKS.store(0, Ordering::SeqCst);
    core::sync::atomic::fence(Ordering::SeqCst);

    crate::per_cpu::send_ipi_to_others(crate::config::TLB_SHOOTDOWN_VECTOR);

    while ACKS.load(Ordering::Acquire) < other_cpu_count {
        core::hint::spin_loop();
    }
}

/// Called from the TLB-shootdown interrupt handler on a receiving CPU.
pub fn handle_shootdown_ipi() {
    if PENDING_FLUSH_ALL.load(Ordering::Relaxed) {
        x86_64::instructions::tlb::flush_all();
    } else if PENDING_IS_SET.load(Ordering::Relaxed) {
        let addr = VirtAddr::new(PENDING_ADDR.load(Ordering::Relaxed));
        unsafe { x86_64::instructions::tlb::flush(addr) };
    }
    ACKS.fetch_add(1, Ordering::AcqRel);
}
