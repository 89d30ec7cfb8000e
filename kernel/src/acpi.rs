//! ACPI table lookup: just enough to find the local APIC's MMIO base and
//! the PCI Express MCFG table the `FindPCIEDevice`/`MapPCIEConfiguration`
//! syscalls need. Full ACPI table interpretation is out of scope; this
//! module reads the RSDP handed to the kernel by the bootloader and
//! walks only the two tables the in-scope syscalls depend on.

use core::sync::atomic::{AtomicU64, Ordering};

use x86_64::{PhysAddr, VirtAddr};

static LOCAL_APIC_BASE: AtomicU64 = AtomicU64::new(0);
static MCFG_BASE: AtomicU64 = AtomicU64::new(0);
static MCFG_LEN: AtomicU64 = AtomicU64::new(0);

#[repr(C, packed)]
struct SdtHeader {
    signature: [u8; 4],
    length: u32,
    revision: u8,
    checksum: u8,
    oem_id: [u8; 6],
    oem_table_id: [u8; 8],
    oem_revision: u32,
    creator_id: u32,
    creator_revision: u32,
}

#[repr(C, packed)]
struct McfgEntry {
    base_address: u64,
    segment_group: u16,
    start_bus: u8,
    end_bus: u8,
    _reserved: u32,
}

/// Parses the RSDP/XSDT chain rooted at `rsdp_phys` (handed to the kernel
/// in `BootstrapSpace`), locating the MADT's local APIC address and the
/// MCFG table if present. Both may be absent on non-PCIe hardware; the
/// syscall layer treats that as `NotFound`, not an error.
pub fn init(rsdp_phys: PhysAddr, phys_to_virt: impl Fn(PhysAddr) -> VirtAddr) {
    unsafe {
        let rsdp = phys_to_virt(rsdp_phys).as_ptr::<u8>();
        // XSDT address lives at offset 24 in the RSDP (ACPI 2.0+).
        let xsdt_phys = core::ptr::read_unaligned(rsdp.add(24) as *const u64);
        let xsdt_virt = phys_to_virt(PhysAddr::new(xsdt_phys));
        let header = &*(xsdt_virt.as_u64() as *const SdtHeader);
        let entry_count = (header.length as usize - core::mem::size_of::<SdtHeader>()) / 8;
        let entries = (xsdt_virt.as_u64() as usize + core::mem::size_of::<SdtHeader>()) as *const u64;

        for i in 0..entry_count {
            let table_phys = core::ptr::read_unaligned(entries.add(i));
            let table_virt = phys_to_virt(PhysAddr::new(table_phys));
            let table_header = &*(table_virt.as_u64() as *const SdtHeader);
            match &table_header.signature {
                b"APIC" => parse_madt(table_virt),
                b"MCFG" => parse_mcfg(table_virt, table_header.length),
                _ => {}
            }
        }
    }
}

unsafe fn parse_madt(virt: VirtAddr) {
    // Local APIC address sits right after the SDT header plus an 8-byte
    // (local APIC addr, flags) pair at a fixed offset in the MADT. It is a
    // physical MMIO address; this kernel has no direct physical map
    // outside this boot-time ACPI pass, so map it into the kernel region
    // once here and remember the virtual address instead.
    unsafe {
        let phys = core::ptr::read_unaligned(
            (virt.as_u64() as usize + core::mem::size_of::<SdtHeader>()) as *const u32,
        ) as u64;
        if let Some(mapped) = map_mmio_page(PhysAddr::new(phys)) {
            LOCAL_APIC_BASE.store(mapped.as_u64(), Ordering::Release);
        }
    }
}

/// Maps one page of MMIO at `phys` into a free kernel-region window.
/// Called only during boot-time ACPI parsing, before any process exists to
/// contend for the kernel region.
fn map_mmio_page(phys: PhysAddr) -> Option<VirtAddr> {
    use x86_64::structures::paging::{PageTableFlags, PhysFrame};

    let window = VirtAddr::new(crate::memory::paging::find_free_range(
        crate::config::KERNEL_REGION_START,
        crate::config::KERNEL_REGION_END,
        1,
    )?);
    crate::memory::paging::map_page(
        window,
        PhysFrame::containing_address(phys),
        PageTableFlags::PRESENT | PageTableFlags::WRITABLE | PageTableFlags::NO_CACHE,
    )
    .ok()?;
    Some(window)
}

unsafe fn parse_mcfg(virt: VirtAddr, length: u32) {
    let header_len = core::mem::size_of::<SdtHeader>() + 8; // + reserved field
    let entries_start = virt.as_u64() as usize + header_len;
    MCFG_BASE.store(entries_start as u64, Ordering::Release);
    MCFG_LEN.store((length as usize - header_len) as u64, Ordering::Release);
}

pub fn local_apic_base() -> Option<*mut u32> {
    let base = LOCAL_APIC_BASE.load(Ordering::Acquire);
    if base == 0 {
        None
    } else {
        Some(base as *mut u32)
    }
}

/// Finds the ECAM configuration-space base address for `(segment, bus)`,
/// the lookup backing `FindPCIEDevice`/`MapPCIEConfiguration`.
pub fn mcfg_base_for(segment: u16, bus: u8) -> Option<PhysAddr> {
    let base = MCFG_BASE.load(Ordering::Acquire);
    let len = MCFG_LEN.load(Ordering::Acquire);
    if base == 0 {
        return None;
    }
    let entry_size = core::mem::size_of::<McfgEntry>();
    let count = len as usize / entry_size;
    unsafe {
        for i in 0..count {
            let entry = &*((base as usize + i * entry_size) as *const McfgEntry);
            if entry.segment_group == segment && bus >= entry.start_bus && bus <= entry.end_bus {
                let offset = (bus - entry.start_bus) as u64 * (1 << 20);
                return Some(PhysAddr::new(entry.base_address + offset));
            }
        }
    }
    None
}
