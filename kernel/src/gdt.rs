//! GDT/TSS bring-up is per-CPU (see [`crate::per_cpu::init`]); this module
//! just holds the IST slot conventions and the selector accessors the
//! interrupt descriptor table and syscall entry code need.

/// IST slot the double-fault handler runs on, so a stack overflow that
/// trips a page fault while handling another fault still has a stack.
pub const DOUBLE_FAULT_IST_INDEX: u16 = 0;

pub fn kernel_code_selector() -> x86_64::structures::gdt::SegmentSelector {
    crate::per_cpu::current().kernel_code_selector
}

pub fn kernel_data_selector() -> x86_64::structures::gdt::SegmentSelector {
    crate::per_cpu::current().kernel_data_selector
}

pub fn user_code_selector() -> x86_64::structures::gdt::SegmentSelector {
    crate::per_cpu::current().user_code_selector
}

pub fn user_data_selector() -> x86_64::structures::gdt::SegmentSelector {
    crate::per_cpu::current().user_data_selector
}
