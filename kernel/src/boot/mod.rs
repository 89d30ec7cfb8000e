//! The handful of facts the bootloader hands off that the rest of the
//! kernel needs before it can stand on its own page tables: where physical
//! RAM is described, where ACPI's root table lives, and a boot-time
//! physical-to-virtual mapping for reading firmware tables before the
//! recursive self-map is the only way in.
//!
//! This struct just narrows `bootloader_api::BootInfo` down to the fields
//! this kernel's init sequence actually consumes.

use bootloader_api::info::MemoryRegions;
use bootloader_api::BootInfo;
use x86_64::{PhysAddr, VirtAddr};

pub struct BootstrapSpace {
    pub memory_regions: &'static MemoryRegions,
    pub rsdp_phys: Option<PhysAddr>,
    physical_memory_offset: Option<VirtAddr>,
}

impl BootstrapSpace {
    pub fn from_boot_info(info: &'static mut BootInfo) -> Self {
        BootstrapSpace {
            memory_regions: &info.memory_regions,
            rsdp_phys: info.rsdp_addr.into_option().map(PhysAddr::new),
            physical_memory_offset: info.physical_memory_offset.into_option().map(VirtAddr::new),
        }
    }

    /// Maps a physical address the bootloader's direct map already covers
    /// (used only while reading ACPI tables during early init, before the
    /// kernel's own recursive mapping is relied on for everything else).
    pub fn phys_to_virt(&self, phys: PhysAddr) -> VirtAddr {
        let offset = self.physical_memory_offset.expect("bootloader did not map physical memory");
        VirtAddr::new(offset.as_u64() + phys.as_u64())
    }
}
