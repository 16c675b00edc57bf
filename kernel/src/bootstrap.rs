//! Boot glue
//!
//! Stands the core subsystems up in dependency order: frame pool from
//! the boot memory map, the kernel page directory (PSE linear map of
//! managed memory plus the self-map), the system automaton with its
//! control-plane actions, and finally the first user automaton from the
//! boot module. The memory stage is separate from the system stage
//! because bare metal must switch onto the new directory in between.

extern crate alloc;

use crate::{
    error::Result,
    mm::{
        page_table::{Entry, KERNEL_DIR_INDEX, SELF_MAP_INDEX},
        PageDirectory, PageFlags, VirtAddr, VmArea, LINEAR_MAP_LIMIT, PAGE_SIZE,
    },
    registry::{Aid, Automaton, Privilege, SYSTEM_AID},
    spawn::{self, image, message::CreateOutcome},
    state::Kernel,
};

/// Stage one: frame pool and the kernel page directory.
///
/// `regions` are the available ranges from the boot memory map;
/// `reserved` are ranges whose frames back the kernel image and boot
/// data and must never be handed out.
pub fn init_memory(
    kernel: &mut Kernel,
    regions: &[(usize, usize)],
    reserved: &[(usize, usize)],
) -> Result<PageDirectory> {
    for (begin, end) in regions {
        kernel
            .mm
            .pool
            .add_region(crate::mm::PhysAddr::new(*begin), crate::mm::PhysAddr::new(*end));
    }
    for (begin, end) in reserved {
        let mut addr = crate::mm::page_align_down(*begin);
        while addr < *end {
            kernel.mm.pool.mark_used(crate::mm::PhysAddr::new(addr).frame());
            addr += PAGE_SIZE;
        }
    }

    // The directory frame must be reachable through the 16 MiB boot
    // window, hence the DMA-zone preference.
    let frame = kernel.mm.pool.alloc_dma().or_else(|_| kernel.mm.pool.alloc())?;
    kernel.mm.phys.zero_frame(frame);
    let dir = PageDirectory::from_frame(frame);
    // SAFETY: the frame was just allocated and zeroed for this directory.
    let entries = unsafe { kernel.mm.phys.table(frame) };
    let huge = PageFlags::PRESENT | PageFlags::WRITABLE | PageFlags::HUGE | PageFlags::GLOBAL;
    for index in 0..(LINEAR_MAP_LIMIT >> 22) {
        entries[KERNEL_DIR_INDEX + index] = ((index << 22) as u32) | huge.bits();
    }
    entries[SELF_MAP_INDEX] = Entry::new(frame, PageFlags::PRESENT | PageFlags::WRITABLE).raw();

    kernel.mm.set_kernel_dir(frame);
    Ok(dir)
}

/// Stage two: the system automaton. Bootstrapped, not created — it owns
/// itself, runs at ring 0 and its actions are the control plane.
pub fn init_system(
    kernel: &mut Kernel,
    dir: PageDirectory,
    stack_top: usize,
    kernel_areas: &[VmArea],
) -> Result<()> {
    kernel.mm.init_spare()?;

    // The ceiling keeps the system automaton out of the recursive
    // page-table window.
    let ceiling = VirtAddr::new(0xFFC0_0000);
    let mut space = crate::mm::AddressSpace::adopt(dir, ceiling);
    for area in kernel_areas {
        space
            .insert_area(*area)
            .map_err(crate::error::KernelError::from)?;
    }

    let aid = kernel
        .registry
        .insert(|aid| Automaton::new(aid, Privilege::Ring0, space, VirtAddr::new(stack_top), aid));
    debug_assert_eq!(aid, SYSTEM_AID);

    spawn::register_system_actions(kernel)?;
    kernel.sched.schedule(SYSTEM_AID, spawn::actions::INIT, 0);
    Ok(())
}

/// Launch the first user automaton from the boot module (a CPIO archive
/// of automaton images; the first regular member boots).
pub fn launch_boot_archive(kernel: &mut Kernel, archive: &[u8]) -> Result<Aid> {
    image::create_automaton(kernel, SYSTEM_AID, archive, &[], false).map_err(|outcome| {
        crate::error::KernelError::InvalidImage {
            reason: match outcome {
                CreateOutcome::OutOfMemory => "out of memory loading boot automaton",
                _ => "unusable boot automaton image",
            },
        }
    })
}

#[cfg(all(target_arch = "x86", target_os = "none"))]
mod multiboot_glue {
    //! Bare-metal entry: parse the multiboot info record and drive the
    //! two boot stages.

    use alloc::vec::Vec;

    use multiboot::information::{MemoryManagement, MemoryType, Multiboot, PAddr};

    use super::*;
    use crate::mm::{PhysMap, KERNEL_BASE};

    const MULTIBOOT_BOOTLOADER_MAGIC: u32 = 0x2BAD_B002;

    /// Physical memory is visible at the kernel window offset, both
    /// through the 16 MiB boot window and the full linear map later.
    struct WindowMapper;

    impl MemoryManagement for WindowMapper {
        unsafe fn paddr_to_slice(&self, addr: PAddr, size: usize) -> Option<&'static [u8]> {
            let virt = (addr as usize).checked_add(KERNEL_BASE)?;
            // SAFETY: the boot window maps low physical memory at the
            // kernel window offset; the loader's structures live there.
            unsafe { Some(core::slice::from_raw_parts(virt as *const u8, size)) }
        }

        unsafe fn allocate(&mut self, _length: usize) -> Option<(PAddr, &mut [u8])> {
            None
        }

        unsafe fn deallocate(&mut self, _addr: PAddr) {}
    }

    extern "C" {
        static __kernel_phys_start: u8;
        static __kernel_phys_end: u8;
        static __text_start: u8;
        static __text_end: u8;
        static __rodata_start: u8;
        static __rodata_end: u8;
        static __data_start: u8;
        static __bss_end: u8;
    }

    fn symbol(addr: &'static u8) -> usize {
        core::ptr::from_ref(addr) as usize
    }

    #[no_mangle]
    pub extern "C" fn boot_main(magic: u32, mbi: u32) -> ! {
        crate::serial::init();
        crate::logger::init(log::LevelFilter::Info);
        crate::println!("automa kernel starting");

        if magic != MULTIBOOT_BOOTLOADER_MAGIC {
            panic!("not booted by a multiboot loader (magic {magic:#x})");
        }

        crate::mm::heap::init();
        crate::arch::x86::init(crate::state::kernel_stack_top() as u32);

        let mut mapper = WindowMapper;
        // SAFETY: the loader's info record is identity-visible through
        // the boot window and the mapper performs the offset translation.
        let info = unsafe { Multiboot::from_ptr(PAddr::from(mbi), &mut mapper) }
            .expect("unreadable multiboot info record");

        let mut regions: Vec<(usize, usize)> = Vec::new();
        for region in info.memory_regions().expect("loader supplied no memory map") {
            if region.memory_type() == MemoryType::Available {
                regions.push((
                    region.base_address() as usize,
                    (region.base_address() + region.length()) as usize,
                ));
            }
        }
        if let Some(cmdline) = info.command_line() {
            log::info!("cmdline: {cmdline}");
        }

        // SAFETY: linker-provided symbols; only addresses are taken.
        let kernel_span = unsafe {
            (
                core::ptr::addr_of!(__kernel_phys_start) as usize,
                core::ptr::addr_of!(__kernel_phys_end) as usize,
            )
        };
        let mut reserved: Vec<(usize, usize)> = alloc::vec![kernel_span];
        reserved.push((mbi as usize, mbi as usize + 4096));
        let mut modules: Vec<(usize, usize)> = Vec::new();
        if let Some(iter) = info.modules() {
            for module in iter {
                let span = (module.start as usize, module.end as usize);
                reserved.push(span);
                modules.push(span);
            }
        }

        let mut kernel = Kernel::new(PhysMap::kernel());
        let dir = init_memory(&mut kernel, &regions, &reserved)
            .expect("cannot initialize the frame pool");

        // From here the full linear map is live; the boot window mapping
        // of low memory is replaced.
        crate::arch::switch_address_space(dir.physical_address());

        // SAFETY: linker symbols; only addresses are taken.
        let (text, rodata, data) = unsafe {
            use crate::mm::{page_align_down, page_align_up, AreaKind};
            (
                VmArea::new(
                    AreaKind::Text,
                    VirtAddr::new(page_align_down(symbol(&__text_start))),
                    VirtAddr::new(page_align_up(symbol(&__text_end))),
                    false,
                    false,
                ),
                VmArea::new(
                    AreaKind::Rodata,
                    VirtAddr::new(page_align_down(symbol(&__rodata_start))),
                    VirtAddr::new(page_align_up(symbol(&__rodata_end))),
                    false,
                    false,
                ),
                VmArea::new(
                    AreaKind::Data,
                    VirtAddr::new(page_align_down(symbol(&__data_start))),
                    VirtAddr::new(page_align_up(symbol(&__bss_end))),
                    false,
                    true,
                ),
            )
        };
        init_system(&mut kernel, dir, crate::state::kernel_stack_top(), &[text, rodata, data])
            .expect("cannot bootstrap the system automaton");

        if let Some((start, end)) = modules.first().copied() {
            // SAFETY: the module's frames are reserved and linearly
            // mapped; the slice lives until the automaton is built.
            let archive = unsafe {
                core::slice::from_raw_parts((KERNEL_BASE + start) as *const u8, end - start)
            };
            match launch_boot_archive(&mut kernel, archive) {
                Ok(aid) => log::info!("boot automaton is {aid}"),
                Err(err) => log::error!("boot automaton failed: {err}"),
            }
        } else {
            log::warn!("no boot module; only the system automaton will run");
        }

        crate::state::init_kernel(kernel);
        crate::sched::dispatch::run()
    }
}
