//! Single source of truth for the kernel's fixed addresses, bucket-array
//! sizes, and scheduling quantum.
//!
//! Nothing else in the kernel re-derives these numbers; every module that
//! needs the kernel region, the recursive-mapping slot, or the per-CPU base
//! imports them from here.

/// Bytes per physical frame / virtual page.
pub const PAGE_SIZE: u64 = 4096;

/// PML4 slot reserved for the recursive self-mapping. Slot 511 is the last
/// entry, chosen so `make_canonical` sign-extends it into the top of the
/// higher half.
pub const RECURSIVE_PML4_INDEX: u64 = 511;

/// `[KERNEL_REGION_START, KERNEL_REGION_END)` is mirrored with
/// `user_accessible = false` into every process's PML4 by
/// [`crate::process::manager::mirror_kernel_region`].
pub const KERNEL_REGION_START: u64 = 0xffff_8000_0000_0000;
pub const KERNEL_REGION_END: u64 = 0xffff_8080_0000_0000;

/// Lower bound of user-mappable address space (page 0 stays unmapped so
/// null derefs fault).
pub const USER_REGION_START: u64 = 0x0000_0000_0040_0000;

/// Upper bound (exclusive) of the canonical lower half.
pub const USER_REGION_END: u64 = 0x0000_7fff_ffff_f000;

/// Size of a process's initial stack, per the loader contract.
pub const INITIAL_STACK_SIZE: u64 = 16 * 1024;

/// Size reserved for a process's global offset table. Exhausting this
/// returns `InvalidElf` rather than growing the table.
pub const GOT_SIZE: u64 = PAGE_SIZE;

/// Number of slots per bucket in each `BucketArray` instantiation.
pub const PROCESS_BUCKET_SIZE: usize = 4;
pub const THREAD_BUCKET_SIZE: usize = 4;
pub const MAPPING_BUCKET_SIZE: usize = 16;
pub const DEBUG_SECTION_BUCKET_SIZE: usize = 8;

/// Maximum number of CPUs this build supports. Per-CPU area storage is
/// statically sized to this bound.
pub const MAX_CPUS: usize = 16;

/// APIC timer divider (divide-by-16) and initial count. At a divider of 16
/// this is roughly a 10ms quantum on typical QEMU TSC-deadline-less APICs;
/// real hardware recalibrates this against the measured APIC frequency in
/// `crate::interrupts::timer::calibrate`.
pub const APIC_TIMER_DIVIDER: u8 = 0b0011; // divide by 16
pub const APIC_TIMER_INITIAL_COUNT: u32 = 1_000_000;

/// Dedicated IPI vector used for TLB shootdown of kernel-table changes.
pub const TLB_SHOOTDOWN_VECTOR: u8 = 0xf0;

/// Dedicated IPI vector used to deliver a deferred preemption to a CPU that
/// is currently in a syscall or user exception handler.
pub const PREEMPT_IPI_VECTOR: u8 = 0xf1;

