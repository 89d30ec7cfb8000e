//! Handlers for the syscalls that don't fit the memory or PCIe modules:
//! `Exit`, `RelinquishTime`, `DebugPrint`, `CreateProcess`, and
//! `DoesProcessExist`.
//!
//! Grounded in `original_source/kernel64/main.cpp`'s syscall switch: process
//! creation copies the caller-supplied object and argument bytes into a
//! kernel buffer before handing them to the loader, since the loader reads
//! from a plain slice and the caller's buffer may not outlive the syscall.

use crate::error::SyscallResultCode;
use crate::process::{manager, Process, ProcessId};
use crate::syscall::userptr;

#[repr(C)]
struct CreateProcessParameters {
    elf_binary: u64,
    elf_size: u64,
    data: u64,
    data_size: u64,
}

/// Writes one byte to the serial console. Used by userspace for debug
/// output ahead of a real console driver.
pub fn debug_print(byte: u64) {
    crate::serial::write_byte(byte as u8);
}

/// Terminates the calling thread with `exit_code` and never returns: control
/// passes straight back into the scheduler, which picks the next runnable
/// thread on this CPU.
pub fn exit(exit_code: u64) -> ! {
    crate::task::scheduler::terminate_current_thread(exit_code as i64)
}

/// Voluntarily gives up the remainder of the calling thread's quantum. The
/// caller is still runnable; the scheduler will return to it in its next
/// pass over this CPU's processes.
pub fn relinquish_time() -> ! {
    crate::task::scheduler::schedule()
}

pub fn does_process_exist(pid: u64) -> u64 {
    manager::exists(ProcessId(pid)) as u64
}

/// Copies the caller's ELF object and argument bytes into kernel buffers,
/// builds a new process from them, and returns its process id.
pub fn create_process(_process: &Process, params_addr: u64) -> (u64, u64) {
    let params: CreateProcessParameters = match userptr::copy_from_user(params_addr) {
        Ok(p) => p,
        Err(_) => return (SyscallResultCode::InvalidMemoryRange as u64, 0),
    };

    if userptr::validate_range(params.elf_binary, params.elf_size).is_err() {
        return (SyscallResultCode::InvalidMemoryRange as u64, 0);
    }
    if params.data_size > 0 && userptr::validate_range(params.data, params.data_size).is_err() {
        return (SyscallResultCode::InvalidMemoryRange as u64, 0);
    }

    let object: alloc::vec::Vec<u8> = unsafe {
        core::slice::from_raw_parts(params.elf_binary as *const u8, params.elf_size as usize).to_vec()
    };
    let argument_data: alloc::vec::Vec<u8> = if params.data_size > 0 {
        unsafe { core::slice::from_raw_parts(params.data as *const u8, params.data_size as usize).to_vec() }
    } else {
        alloc::vec::Vec::new()
    };

    match crate::elf::load(crate::elf::LoadRequest {
        object: &object,
        argument_data: &argument_data,
    }) {
        Ok(pid) => (SyscallResultCode::Success as u64, pid.0),
        Err(e) => (SyscallResultCode::from(e) as u64, 0),
    }
}
