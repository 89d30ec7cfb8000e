#![no_std]
#![no_main]

extern crate alloc;

use bootloader_api::BootInfo;
use kernel::boot::BootstrapSpace;
#[cfg(not(feature = "boot_tests"))]
use kernel::task;
use kernel::{acpi, hlt_loop, interrupts, logger, memory, per_cpu, process, serial};

bootloader_api::entry_point!(kernel_main);

fn kernel_main(boot_info: &'static mut BootInfo) -> ! {
    serial::init();
    logger::init();

    let bootstrap = BootstrapSpace::from_boot_info(boot_info);
    memory::init(&bootstrap);

    per_cpu::init(0);
    interrupts::init();
    process::init();

    if let Some(rsdp_phys) = bootstrap.rsdp_phys {
        acpi::init(rsdp_phys, |phys| bootstrap.phys_to_virt(phys));
        if let Some(apic_base) = acpi::local_apic_base() {
            interrupts::arm_timer(apic_base);
        } else {
            log::warn!("no local APIC found, running without preemption");
        }
    } else {
        log::warn!("no RSDP handed off, skipping ACPI bring-up");
    }

    x86_64::instructions::interrupts::enable();

    #[cfg(feature = "boot_tests")]
    {
        log::info!("boot complete, running boot tests");
        kernel::boot_tests::run();
    }

    #[cfg(not(feature = "boot_tests"))]
    {
        log::info!("boot complete, entering scheduler");
        task::scheduler::schedule();
    }
}

use core::panic::PanicInfo;

#[panic_handler]
fn panic(info: &PanicInfo) -> ! {
    log::error!("kernel panic: {}", info);
    hlt_loop()
}
