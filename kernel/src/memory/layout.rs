//! Named views onto the address ranges defined in [`crate::config`].
//!
//! This module used to carry per-architecture `cfg` branches for x86_64 and
//! aarch64; the aarch64 half was dropped along with `arch_impl` when this
//! kernel narrowed to a single architecture. What remains are helpers that
//! turn the raw constants into the `VirtAddr`/`PhysAddr` types the paging
//! engine and loader actually pass around.

use x86_64::VirtAddr;

use crate::config;

/// `true` if `addr` falls in the region every process's PML4 mirrors from
/// the kernel's own PML4 (see [`crate::process::manager::mirror_kernel_region`]).
pub fn is_kernel_address(addr: VirtAddr) -> bool {
    let a = addr.as_u64();
    a >= config::KERNEL_REGION_START && a < config::KERNEL_REGION_END
}

/// `true` if `addr` falls in the range a process may ask to have mapped on
/// its own behalf via `MapFreeMemory`/`MapSharedMemory`.
pub fn is_user_address(addr: VirtAddr) -> bool {
    let a = addr.as_u64();
    a >= config::USER_REGION_START && a < config::USER_REGION_END
}

/// Base of the recursive self-mapping window: the virtual address at which
/// PML4 slot [`config::RECURSIVE_PML4_INDEX`] points back at the PML4
/// itself, canonicalized per [`crate::memory::paging::make_canonical`].
pub fn recursive_window_base() -> VirtAddr {
    crate::memory::paging::make_canonical(config::RECURSIVE_PML4_INDEX << 39)
}

/// Lower/upper bounds of the kernel region as `VirtAddr`.
pub fn kernel_region() -> core::ops::Range<VirtAddr> {
    VirtAddr::new(config::KERNEL_REGION_START)..VirtAddr::new(config::KERNEL_REGION_END)
}

/// Lower/upper bounds of the user-mappable region as `VirtAddr`.
pub fn user_region() -> core::ops::Range<VirtAddr> {
    VirtAddr::new(config::USER_REGION_START)..VirtAddr::new(config::USER_REGION_END)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kernel_and_user_regions_do_not_overlap() {
        let kernel = kernel_region();
        let user = user_region();
        assert!(kernel.end <= user.start || user.end <= kernel.start);
    }

    #[test]
    fn region_bounds_agree_with_the_predicates() {
        let kernel = kernel_region();
        assert!(is_kernel_address(kernel.start));
        assert!(!is_kernel_address(kernel.end));

        let user = user_region();
        assert!(is_user_address(user.start));
        assert!(!is_user_address(user.end));
    }

    #[test]
    fn an_address_is_never_both_kernel_and_user() {
        assert!(!(is_kernel_address(user_region().start) && is_user_address(user_region().start)));
        assert!(!(is_kernel_address(kernel_region().start) && is_user_address(kernel_region().start)));
    }
}
