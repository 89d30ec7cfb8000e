//! Decodes a trapped syscall and dispatches it to the handler module that
//! owns it.
//!
//! Grounded in the user ABI: the syscall number arrives in `rax` (read here
//! before it is overwritten with the result), up to two input parameters
//! arrive in `rdi`/`rsi`, and the handler's result lands back in `rax`
//! (primary, returned from [`dispatch`]) and `rdx` (secondary, written
//! directly into the frame). `MapFreeConsecutiveMemory` has a third output
//! (the physical base callers need for DMA) written into `rcx`.

use crate::process::ThreadFrame;
use crate::syscall::{memory, pcie, process_ctl, table::Syscall};

/// Runs the syscall named by `frame.rax` against `frame.rdi`/`frame.rsi`,
/// writes any secondary output into `frame.rdx`, and returns the primary
/// result code the caller writes back into `frame.rax`.
pub fn dispatch(frame: &mut ThreadFrame) -> u64 {
    let Some(syscall) = Syscall::from_u64(frame.rax) else {
        return crate::error::SyscallResultCode::NotFound as u64;
    };

    let Some(process) = crate::task::scheduler::current_process() else {
        return crate::error::SyscallResultCode::InvalidProcessId as u64;
    };

    match syscall {
        Syscall::Exit => process_ctl::exit(frame.rdi),
        Syscall::RelinquishTime => process_ctl::relinquish_time(),
        Syscall::DebugPrint => {
            process_ctl::debug_print(frame.rdi);
            crate::error::SyscallResultCode::Success as u64
        }
        Syscall::MapFreeMemory => {
            let (result, addr) = memory::map_free_memory(process, frame.rdi);
            frame.rdx = addr;
            result
        }
        Syscall::MapFreeConsecutiveMemory => {
            let (result, addr, phys) = memory::map_free_consecutive_memory(process, frame.rdi);
            frame.rdx = addr;
            frame.rcx = phys;
            result
        }
        Syscall::CreateSharedMemory => {
            let (result, addr) = memory::create_shared_memory(process, frame.rdi);
            frame.rdx = addr;
            result
        }
        Syscall::MapSharedMemory => {
            let (result, addr) = memory::map_shared_memory(process, frame.rdi);
            frame.rdx = addr;
            result
        }
        Syscall::UnmapMemory => {
            memory::unmap_memory(process, frame.rdi);
            crate::error::SyscallResultCode::Success as u64
        }
        Syscall::CreateProcess => {
            let (result, pid) = process_ctl::create_process(process, frame.rdi);
            frame.rdx = pid;
            result
        }
        Syscall::DoesProcessExist => {
            frame.rdx = process_ctl::does_process_exist(frame.rdi);
            crate::error::SyscallResultCode::Success as u64
        }
        Syscall::FindPCIEDevice => {
            let (result, bdf) = pcie::find_pcie_device(frame.rdi);
            frame.rdx = bdf;
            result
        }
        Syscall::MapPCIEConfiguration => {
            let (result, addr) = pcie::map_pcie_configuration(process, frame.rdi);
            frame.rdx = addr;
            result
        }
        Syscall::MapPCIEBar => {
            let (result, addr) = pcie::map_pcie_bar(process, frame.rdi);
            frame.rdx = addr;
            result
        }
    }
}
