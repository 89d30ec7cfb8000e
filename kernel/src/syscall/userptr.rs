//! Safe access to user memory from inside a syscall handler.
//!
//! A syscall handler runs with the calling process's own PML4 still loaded
//! in `CR3` (there is no address-space switch on syscall entry, only a
//! privilege-level one), so a user pointer can be read or written directly
//! once it has been range-checked and shown to be mapped. No foreign-PML4
//! walk is needed here; that machinery exists in `crate::memory::paging`
//! for the loader and the process destructor, which do operate on
//! not-currently-loaded address spaces.

use x86_64::VirtAddr;

use crate::config::{USER_REGION_END, USER_REGION_START};
use crate::error::InvalidMemoryRange;
use crate::memory::paging;

/// Checks that `[addr, addr + len)` lies entirely within the user region,
/// doesn't overflow, and is backed by present mappings for its first and
/// last page (a sufficient check for the small, frequently-contiguous
/// structures syscalls pass; it does not probe every intervening page).
fn check_range(addr: u64, len: u64) -> Result<(), InvalidMemoryRange> {
    if len == 0 {
        return Ok(());
    }
    let end = addr.checked_add(len).ok_or(InvalidMemoryRange)?;
    if addr < USER_REGION_START || end > USER_REGION_END {
        return Err(InvalidMemoryRange);
    }
    if paging::translate(VirtAddr::new(addr)).is_none() {
        return Err(InvalidMemoryRange);
    }
    if paging::translate(VirtAddr::new(end - 1)).is_none() {
        return Err(InvalidMemoryRange);
    }
    Ok(())
}

/// Copies a `T` out of user memory at `addr`.
pub fn copy_from_user<T: Copy>(addr: u64) -> Result<T, InvalidMemoryRange> {
    check_range(addr, core::mem::size_of::<T>() as u64)?;
    Ok(unsafe { core::ptr::read_unaligned(addr as *const T) })
}

/// Copies `value` into user memory at `addr`.
pub fn copy_to_user<T: Copy>(addr: u64, value: &T) -> Result<(), InvalidMemoryRange> {
    check_range(addr, core::mem::size_of::<T>() as u64)?;
    unsafe { core::ptr::write_unaligned(addr as *mut T, *value) };
    Ok(())
}

/// Validates that `[addr, addr + len)` is readable/writable user memory
/// without copying anything, for handlers that need the raw range (e.g. the
/// `DebugPrint` byte or a buffer length check ahead of a loop).
pub fn validate_range(addr: u64, len: u64) -> Result<(), InvalidMemoryRange> {
    check_range(addr, len)
}
