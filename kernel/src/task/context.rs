//! FPU/SSE state: saved alongside the GPR snapshot on exception entry,
//! restored before returning to user mode. Threads never touch the FPU
//! inside the kernel itself, so kernel entry/exit never needs to save it
//! for kernel-mode code, only for the user thread being suspended.

/// A 512-byte, 16-byte-aligned `FXSAVE` area.
#[repr(C, align(16))]
#[derive(Clone, Copy)]
pub struct FpuState([u8; 512]);

impl FpuState {
    /// The control-word bits the loader seeds a fresh thread with:
    /// all exceptions masked, round-to-nearest, 64-bit precision.
    pub const fn initial() -> Self {
        let mut bytes = [0u8; 512];
        bytes[0] = 0x7f;
        bytes[1] = 0x03;
        FpuState(bytes)
    }

    pub fn save(&mut self) {
        unsafe {
            core::arch::asm!("fxsave [{0}]", in(reg) self.0.as_mut_ptr(), options(nostack));
        }
    }

    pub fn restore(&self) {
        unsafe {
            core::arch::asm!("fxrstor [{0}]", in(reg) self.0.as_ptr(), options(nostack));
        }
    }
}
