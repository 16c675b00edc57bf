//! x86 protected-mode support
//!
//! Segmentation, trap entry, the 8259 PIC and the 8253 timer. These are
//! collaborators of the core subsystems: the interesting decisions live in
//! `mm`, `sched` and `syscall`; this module only moves the machine.

pub mod boot;
pub mod gdt;
pub mod idt;
pub mod pic;
pub mod pit;
pub mod port;
pub mod trap;

use core::arch::asm;

/// Initialize segmentation, trap vectors and the interrupt controller.
pub fn init(kernel_stack_top: u32) {
    gdt::init(kernel_stack_top);
    idt::init();
    pic::init();
    pit::init(pit::DEFAULT_HZ);
}

#[inline]
pub fn invlpg(addr: usize) {
    // SAFETY: invlpg only drops a TLB entry; the mapping change it
    // publishes was already made by the caller.
    unsafe {
        asm!("invlpg [{}]", in(reg) addr, options(nostack, preserves_flags));
    }
}

#[inline]
pub fn load_cr3(page_dir: u32) {
    // SAFETY: the caller passes the physical address of a valid page
    // directory whose kernel window matches the running kernel's.
    unsafe {
        asm!("mov cr3, {}", in(reg) page_dir, options(nostack));
    }
}

#[inline]
pub fn read_cr2() -> u32 {
    let addr: u32;
    // SAFETY: reading CR2 has no side effects.
    unsafe {
        asm!("mov {}, cr2", out(reg) addr, options(nostack, preserves_flags));
    }
    addr
}

#[inline]
pub fn read_cr3() -> u32 {
    let addr: u32;
    // SAFETY: reading CR3 has no side effects.
    unsafe {
        asm!("mov {}, cr3", out(reg) addr, options(nostack, preserves_flags));
    }
    addr
}

#[inline]
pub fn cli() {
    // SAFETY: masking interrupts is always permissible at ring 0.
    unsafe {
        asm!("cli", options(nostack, preserves_flags));
    }
}

#[inline]
pub fn hlt() {
    // SAFETY: halting waits for the next interrupt; no memory is touched.
    unsafe {
        asm!("hlt", options(nostack, preserves_flags));
    }
}

/// `sti` immediately followed by `hlt`: the interrupt window opens after
/// the halt so a wakeup cannot slip between the two.
#[inline]
pub fn sti_hlt() {
    // SAFETY: see above; the sti;hlt pair is the architectural idle idiom.
    unsafe {
        asm!("sti", "hlt", options(nostack, preserves_flags));
    }
}
