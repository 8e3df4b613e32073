//! Kernel entry point
//!
//! The boot layer (assembly + early loader, outside this crate) hands over
//! a protocol-specific blob in the first argument register. Boot order:
//! serial and logging, CPU features, boot-info normalization, PMM, MMU and
//! kernel linear map, heap, vectors and interrupt controller, timer, then
//! the init task.

#![cfg_attr(target_os = "none", no_std)]
#![cfg_attr(target_os = "none", no_main)]

#[cfg(target_os = "none")]
mod boot {
    use nova_kernel::mm::{vmm, PageFlags, PhysAddr, VirtAddr, PAGE_SIZE};
    use nova_kernel::{bootinfo, hal, kprintln, mm, sched, trap};

    /// Ticks per second for the system timer.
    const TIMER_HZ: u32 = 100;

    /// Base of the init task's user stack (one page below, mapped on
    /// demand growth is the task layer's concern).
    const INIT_STACK_TOP: u64 = 0x8000_0000;

    #[no_mangle]
    pub extern "C" fn kernel_main(boot_blob: u64) -> ! {
        nova_kernel::arch::serial::init();
        nova_kernel::serial::init_logging();
        kprintln!("nova kernel starting");

        hal::cpu_init();

        let boot_info = match read_boot_info(boot_blob) {
            Ok(info) => info,
            Err(e) => {
                kprintln!("boot info unusable: {}", e);
                halt_forever();
            }
        };
        if let Some(cmdline) = boot_info.cmdline() {
            log::info!("boot: cmdline '{}'", cmdline);
        }

        if let Err(e) = mm::pmm::init(&boot_info) {
            kprintln!("pmm init failed: {}", e);
            halt_forever();
        }
        if let Err(e) = hal::mmu_init() {
            kprintln!("mmu init failed: {}", e);
            halt_forever();
        }
        if let Err(e) = mm::heap::init() {
            kprintln!("heap init failed: {}", e);
            halt_forever();
        }

        trap::init();
        if let Err(e) = hal::timer_init(TIMER_HZ, None) {
            kprintln!("timer init failed: {}", e);
            halt_forever();
        }
        hal::interrupt_enable();

        #[cfg(feature = "self-test")]
        nova_kernel::selftest::run();

        spawn_init(&boot_info);
    }

    /// Normalize the boot blob into the single record feeding the PMM.
    #[cfg(target_arch = "aarch64")]
    fn read_boot_info(blob: u64) -> nova_kernel::KernelResult<bootinfo::BootInfo> {
        bootinfo::from_dtb(blob)
    }

    /// The x86-family boot layer hands over a counted E820-style table:
    /// a u64 entry count followed by packed (base, length, type) records.
    #[cfg(any(target_arch = "x86", target_arch = "x86_64"))]
    fn read_boot_info(blob: u64) -> nova_kernel::KernelResult<bootinfo::BootInfo> {
        #[repr(C)]
        struct RawRegion {
            base: u64,
            length: u64,
            kind: u32,
            _reserved: u32,
        }

        if blob == 0 {
            return Err(nova_kernel::KernelError::InvalidAddress { addr: 0 });
        }
        // SAFETY: The boot contract places the counted table at `blob`,
        // identity-covered by the boot mapping.
        let raw = unsafe {
            let count = (*(blob as *const u64)).min(bootinfo::MAX_REGIONS as u64) as usize;
            core::slice::from_raw_parts((blob + 8) as *const RawRegion, count)
        };
        let mut table = [(0u64, 0u64, 0u32); bootinfo::MAX_REGIONS];
        for (slot, region) in table.iter_mut().zip(raw) {
            *slot = (region.base, region.length, region.kind);
        }
        bootinfo::from_e820(bootinfo::BootProtocol::Bios, &table[..raw.len()])
    }

    /// Launch the init task: its image arrives as the first boot module;
    /// without one there is nothing to run and the CPU idles servicing
    /// interrupts.
    fn spawn_init(boot_info: &bootinfo::BootInfo) -> ! {
        let Some(module) = boot_info.modules().first().copied() else {
            log::warn!("boot: no init module, idling");
            halt_forever();
        };

        let space = match vmm::create_space() {
            Ok(s) => s,
            Err(e) => {
                kprintln!("init space creation failed: {}", e);
                halt_forever();
            }
        };

        // Map the module image executable at a fixed user base and give it
        // one page of stack; the in-image loader does the rest.
        const USER_BASE: u64 = 0x40_0000;
        let image_pages = (module.end - module.start).div_ceil(PAGE_SIZE as u64);
        for page in 0..image_pages {
            let flags =
                PageFlags::PRESENT | PageFlags::USER | PageFlags::WRITE | PageFlags::EXEC;
            let vaddr = VirtAddr::new(USER_BASE + page * PAGE_SIZE as u64);
            let paddr = PhysAddr::new(module.start).align_down()
                .offset(page * PAGE_SIZE as u64);
            if let Err(e) = vmm::map_page_in(space, vaddr, paddr, flags) {
                kprintln!("init image mapping failed: {}", e);
                halt_forever();
            }
        }
        let stack_frame = mm::pmm::FRAME_ALLOCATOR.alloc_frame();
        let stack_page = VirtAddr::new(INIT_STACK_TOP - PAGE_SIZE as u64);
        let stack_flags = PageFlags::PRESENT | PageFlags::WRITE | PageFlags::USER;
        if !stack_frame.is_valid()
            || vmm::map_page_in(space, stack_page, stack_frame, stack_flags).is_err()
        {
            kprintln!("init stack mapping failed");
            halt_forever();
        }

        if let Err(e) = vmm::switch_space(space) {
            kprintln!("switch to init space failed: {}", e);
            halt_forever();
        }
        sched::set_current(1, space);
        log::info!("boot: entering init at {:#x}", USER_BASE);
        hal::enter_usermode(VirtAddr::new(USER_BASE), VirtAddr::new(INIT_STACK_TOP));
    }

    fn halt_forever() -> ! {
        loop {
            hal::cpu_halt();
        }
    }

    #[panic_handler]
    fn panic(info: &core::panic::PanicInfo) -> ! {
        use nova_kernel::serial::{serial_put_hex64, serial_puts};
        serial_puts("\nKERNEL PANIC\n");
        kprintln!("{}", info);
        serial_puts("ticks ");
        serial_put_hex64(hal::timer_get_ticks());
        serial_puts("\n");
        hal::interrupt_disable();
        loop {
            hal::cpu_halt();
        }
    }
}

#[cfg(not(target_os = "none"))]
fn main() {
    // The kernel only runs on bare metal; hosted builds exist for tests.
}
