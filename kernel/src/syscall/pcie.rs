//! PCI Express enumeration and BAR mapping: `FindPCIEDevice`,
//! `MapPCIEConfiguration`, `MapPCIEBar`.
//!
//! Grounded in `original_source/shared/pcie.h`'s bit-field layout and
//! `original_source/kernel64/main.cpp`'s three PCIe syscall handlers: a
//! `bus/device/function` triple (plus an ECAM segment) is packed into one
//! GPR, `configuration_area_size` (4 KiB) separates each function's header
//! in the memory-mapped configuration space found via the ACPI MCFG table,
//! and a BAR's size is discovered by writing all-ones, reading back the
//! size mask, and restoring the original value.

use x86_64::structures::paging::{PageTableFlags, PhysFrame};
use x86_64::{PhysAddr, VirtAddr};

use crate::config::{KERNEL_REGION_END, KERNEL_REGION_START, PAGE_SIZE, USER_REGION_END, USER_REGION_START};
use crate::error::SyscallResultCode;
use crate::memory::paging;
use crate::process::{MappingDescriptor, Process};
use crate::syscall::userptr;

const FUNCTION_BITS: u32 = 3;
const DEVICE_BITS: u32 = 5;
const BUS_BITS: u32 = 8;
const BAR_INDEX_BITS: u32 = 3;
const DEVICE_COUNT: u64 = 32;
const FUNCTION_COUNT: u64 = 8;
const CONFIGURATION_AREA_SIZE: u64 = 4096;

#[repr(C)]
struct FindPcieDeviceParameters {
    vendor_id: u16,
    device_id: u16,
    class_code: u8,
    subclass: u8,
    interface: u8,
    require_vendor_id: u8,
    require_device_id: u8,
    require_class_code: u8,
    require_subclass: u8,
    require_interface: u8,
    index: u64,
}

#[repr(C)]
struct PciHeader {
    vendor_id: u16,
    device_id: u16,
    command: u16,
    status: u16,
    revision: u8,
    interface: u8,
    subclass: u8,
    class_code: u8,
    cache_line_size: u8,
    latency_timer: u8,
    header_type: u8,
    bist: u8,
    bars: [u32; 6],
}

fn bdf(segment: u16, bus: u8, device: u8, function: u8) -> u64 {
    function as u64
        | (device as u64) << FUNCTION_BITS
        | (bus as u64) << (FUNCTION_BITS + DEVICE_BITS)
        | (segment as u64) << (FUNCTION_BITS + DEVICE_BITS + BUS_BITS)
}

fn unpack_bdf(value: u64) -> (u16, u8, u8, u8) {
    let function = (value & ((1 << FUNCTION_BITS) - 1)) as u8;
    let device = ((value >> FUNCTION_BITS) & ((1 << DEVICE_BITS) - 1)) as u8;
    let bus = ((value >> (FUNCTION_BITS + DEVICE_BITS)) & ((1 << BUS_BITS) - 1)) as u8;
    let segment = (value >> (FUNCTION_BITS + DEVICE_BITS + BUS_BITS)) as u16;
    (segment, bus, device, function)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bdf_round_trips() {
        for (segment, bus, device, function) in [
            (0u16, 0u8, 0u8, 0u8),
            (0, 1, 2, 3),
            (0, 255, 31, 7),
            (3, 128, 17, 5),
        ] {
            let packed = bdf(segment, bus, device, function);
            assert_eq!(unpack_bdf(packed), (segment, bus, device, function));
        }
    }

    #[test]
    fn bar_index_shares_the_low_bits_of_a_bar_value() {
        let target = bdf(0, 12, 4, 1);
        let value = (target << BAR_INDEX_BITS) | 2;
        let bar_index = (value & ((1 << BAR_INDEX_BITS) - 1)) as usize;
        assert_eq!(bar_index, 2);
        assert_eq!(unpack_bdf(value >> BAR_INDEX_BITS), (0, 12, 4, 1));
    }

    #[test]
    fn fields_pack_into_disjoint_bit_ranges() {
        assert!(FUNCTION_BITS + DEVICE_BITS + BUS_BITS < 64);
        let max_bdf = bdf(u16::MAX, u8::MAX, 31, 7);
        assert_eq!(unpack_bdf(max_bdf), (u16::MAX, u8::MAX, 31, 7));
    }
}

/// Maps one page of configuration space for `(segment, bus, device,
/// function)` into a scratch kernel-region window. Caller unmaps it when
/// done.
fn map_config_window(segment: u16, bus: u8, device: u8, function: u8) -> Option<VirtAddr> {
    let ecam_base = crate::acpi::mcfg_base_for(segment, bus)?;
    let local_bus = 0u64; // mcfg_base_for already offsets by (bus - start_bus).
    let offset = (local_bus * DEVICE_COUNT * FUNCTION_COUNT + device as u64 * FUNCTION_COUNT + function as u64)
        * CONFIGURATION_AREA_SIZE;
    let phys = PhysAddr::new(ecam_base.as_u64() + offset);

    let window = VirtAddr::new(paging::find_free_range(KERNEL_REGION_START, KERNEL_REGION_END, 1)?);
    paging::map_page(
        window,
        PhysFrame::containing_address(phys),
        PageTableFlags::PRESENT | PageTableFlags::WRITABLE,
    )
    .ok()?;
    Some(window)
}

/// Walks every ECAM segment/bus/device/function the MCFG table describes,
/// filters by the caller's vendor/device/class/subclass/interface criteria,
/// and returns the `index`'th match packed as a BDF.
pub fn find_pcie_device(params_addr: u64) -> (u64, u64) {
    let params: FindPcieDeviceParameters = match userptr::copy_from_user(params_addr) {
        Ok(p) => p,
        Err(_) => return (SyscallResultCode::InvalidMemoryRange as u64, 0),
    };

    let mut matches_seen = 0u64;
    for segment in 0u16..1 {
        for bus in 0u8..=255 {
            if crate::acpi::mcfg_base_for(segment, bus).is_none() {
                continue;
            }
            for device in 0u8..DEVICE_COUNT as u8 {
                for function in 0u8..FUNCTION_COUNT as u8 {
                    let Some(window) = map_config_window(segment, bus, device, function) else {
                        continue;
                    };
                    let header = unsafe { &*(window.as_ptr::<PciHeader>()) };
                    let vendor_id = header.vendor_id;
                    if vendor_id == 0xffff {
                        paging::unmap_page(window);
                        continue;
                    }
                    let device_id = header.device_id;
                    let class_code = header.class_code;
                    let subclass = header.subclass;
                    let interface = header.interface;
                    paging::unmap_page(window);

                    let hit = (params.require_vendor_id == 0 || vendor_id == params.vendor_id)
                        && (params.require_device_id == 0 || device_id == params.device_id)
                        && (params.require_class_code == 0 || class_code == params.class_code)
                        && (params.require_subclass == 0 || subclass == params.subclass)
                        && (params.require_interface == 0 || interface == params.interface);

                    if hit {
                        if matches_seen == params.index {
                            return (SyscallResultCode::Success as u64, bdf(segment, bus, device, function));
                        }
                        matches_seen += 1;
                    }
                }
                if bus == 255 {
                    break;
                }
            }
        }
    }
    (SyscallResultCode::NotFound as u64, 0)
}

/// Maps one page of configuration space for the device named by `bdf_segment`
/// writable into the caller.
pub fn map_pcie_configuration(process: &Process, bdf_segment: u64) -> (u64, u64) {
    let (segment, bus, device, function) = unpack_bdf(bdf_segment);
    let Some(phys_window) = map_config_window(segment, bus, device, function) else {
        return (SyscallResultCode::NotFound as u64, 0);
    };
    let frame = paging::translate(phys_window).map(PhysFrame::containing_address);
    paging::unmap_page(phys_window);
    let Some(frame) = frame else {
        return (SyscallResultCode::NotFound as u64, 0);
    };

    let Some(user_base) = paging::find_free_range(USER_REGION_START, USER_REGION_END, 1) else {
        return (SyscallResultCode::OutOfMemory as u64, 0);
    };
    let user_base = VirtAddr::new(user_base);
    let flags = PageTableFlags::PRESENT | PageTableFlags::WRITABLE | PageTableFlags::USER_ACCESSIBLE;
    if paging::map_page(user_base, frame, flags).is_err() {
        return (SyscallResultCode::OutOfMemory as u64, 0);
    }
    process.register_mapping(MappingDescriptor {
        start_page: user_base,
        page_count: 1,
        is_owned: false,
        is_shared: false,
    });
    (SyscallResultCode::Success as u64, user_base.as_u64())
}

/// Reads BAR `bar_index` of the device named by the remaining bits of
/// `value`, discovers its size with the standard write-all-ones probe, and
/// maps the resulting MMIO range writable into the caller.
pub fn map_pcie_bar(process: &Process, value: u64) -> (u64, u64) {
    let bar_index = (value & ((1 << BAR_INDEX_BITS) - 1)) as usize;
    let (segment, bus, device, function) = unpack_bdf(value >> BAR_INDEX_BITS);

    let Some(window) = map_config_window(segment, bus, device, function) else {
        return (SyscallResultCode::NotFound as u64, 0);
    };
    let header = unsafe { &mut *(window.as_mut_ptr::<PciHeader>()) };

    if bar_index >= 6 {
        paging::unmap_page(window);
        return (SyscallResultCode::InvalidMemoryRange as u64, 0);
    }

    let bar_value = header.bars[bar_index];
    if bar_value & 0x1 != 0 {
        // I/O-space BAR: not representable as an MMIO mapping.
        paging::unmap_page(window);
        return (SyscallResultCode::InvalidMemoryRange as u64, 0);
    }
    let bar_type = (bar_value >> 1) & 0x3;

    let (address, size) = match bar_type {
        0b00 => {
            let info_mask = 0xfu32;
            let address = (bar_value & !info_mask) as u64;
            header.bars[bar_index] = u32::MAX;
            let probed = header.bars[bar_index] & !info_mask;
            let size = (!probed).wrapping_add(1) as u64;
            header.bars[bar_index] = bar_value;
            (address, size)
        }
        0b10 => {
            if bar_index >= 5 {
                paging::unmap_page(window);
                return (SyscallResultCode::InvalidMemoryRange as u64, 0);
            }
            let info_mask = 0xfu32;
            let high = header.bars[bar_index + 1];
            let address = (bar_value & !info_mask) as u64 | (high as u64) << 32;

            header.bars[bar_index] = u32::MAX;
            header.bars[bar_index + 1] = u32::MAX;
            let probed_low = header.bars[bar_index] & !info_mask;
            let probed_high = header.bars[bar_index + 1];
            let probed = probed_low as u64 | (probed_high as u64) << 32;
            let size = (!probed).wrapping_add(1);
            header.bars[bar_index] = bar_value;
            header.bars[bar_index + 1] = high;
            (address, size)
        }
        _ => {
            paging::unmap_page(window);
            return (SyscallResultCode::InvalidMemoryRange as u64, 0);
        }
    };
    paging::unmap_page(window);

    let page_count = (size.div_ceil(PAGE_SIZE)).max(1);
    let physical_pages_start = PhysAddr::new(address & !(PAGE_SIZE - 1));

    let Some(user_base) = paging::find_free_range(USER_REGION_START, USER_REGION_END, page_count) else {
        return (SyscallResultCode::OutOfMemory as u64, 0);
    };
    let user_base = VirtAddr::new(user_base);
    let flags = PageTableFlags::PRESENT | PageTableFlags::WRITABLE | PageTableFlags::USER_ACCESSIBLE;
    for i in 0..page_count {
        let frame = PhysFrame::containing_address(physical_pages_start + i * PAGE_SIZE);
        if paging::map_page(user_base + i * PAGE_SIZE, frame, flags).is_err() {
            for j in 0..i {
                paging::unmap_page(user_base + j * PAGE_SIZE);
            }
            return (SyscallResultCode::OutOfMemory as u64, 0);
        }
    }
    process.register_mapping(MappingDescriptor {
        start_page: user_base,
        page_count,
        is_owned: false,
        is_shared: false,
    });
    (SyscallResultCode::Success as u64, user_base.as_u64())
}
