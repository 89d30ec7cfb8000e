//! Syscall numbering.
//!
//! Grounded in `original_source/shared/syscalls.h`'s `SyscallType`: a small,
//! densely packed enum rather than the sparse Linux-style numbering space.
//! Numeric values are part of the user ABI once assigned and must never be
//! renumbered.

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u64)]
pub enum Syscall {
    Exit = 0,
    RelinquishTime = 1,
    DebugPrint = 2,
    MapFreeMemory = 3,
    MapFreeConsecutiveMemory = 4,
    CreateSharedMemory = 5,
    MapSharedMemory = 6,
    UnmapMemory = 7,
    CreateProcess = 8,
    DoesProcessExist = 9,
    FindPCIEDevice = 10,
    MapPCIEConfiguration = 11,
    MapPCIEBar = 12,
}

impl Syscall {
    pub fn from_u64(value: u64) -> Option<Self> {
        Some(match value {
            0 => Self::Exit,
            1 => Self::RelinquishTime,
            2 => Self::DebugPrint,
            3 => Self::MapFreeMemory,
            4 => Self::MapFreeConsecutiveMemory,
            5 => Self::CreateSharedMemory,
            6 => Self::MapSharedMemory,
            7 => Self::UnmapMemory,
            8 => Self::CreateProcess,
            9 => Self::DoesProcessExist,
            10 => Self::FindPCIEDevice,
            11 => Self::MapPCIEConfiguration,
            12 => Self::MapPCIEBar,
            _ => return None,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_every_variant() {
        for n in 0..=12u64 {
            assert_eq!(Syscall::from_u64(n).unwrap() as u64, n);
        }
    }

    #[test]
    fn rejects_unknown_numbers() {
        assert!(Syscall::from_u64(13).is_none());
        assert!(Syscall::from_u64(u64::MAX).is_none());
    }
}
