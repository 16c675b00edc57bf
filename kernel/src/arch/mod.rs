//! Architecture support
//!
//! The kernel targets x86 protected mode. The core subsystems are
//! architecture-neutral data-structure code; everything that touches rings,
//! control registers or the TLB funnels through the small facade below so
//! the rest of the kernel compiles (and is unit-tested) on hosted targets.

#[cfg(all(target_arch = "x86", target_os = "none"))]
pub mod x86;

use crate::mm::PhysAddr;

/// Invalidate the TLB entry covering `addr` in the active address space.
#[inline]
pub fn flush_tlb(addr: usize) {
    #[cfg(all(target_arch = "x86", target_os = "none"))]
    x86::invlpg(addr);
    #[cfg(not(all(target_arch = "x86", target_os = "none")))]
    let _ = addr;
}

/// Load a new root page table.
#[inline]
pub fn switch_address_space(page_dir: PhysAddr) {
    #[cfg(all(target_arch = "x86", target_os = "none"))]
    x86::load_cr3(page_dir.raw() as u32);
    #[cfg(not(all(target_arch = "x86", target_os = "none")))]
    let _ = page_dir;
}

/// Enable interrupts and halt until the next one arrives.
#[inline]
pub fn wait_for_interrupt() {
    #[cfg(all(target_arch = "x86", target_os = "none"))]
    x86::sti_hlt();
    #[cfg(not(all(target_arch = "x86", target_os = "none")))]
    unreachable!("wait_for_interrupt is only reachable on bare metal");
}

/// Disable interrupts.
#[inline]
pub fn disable_interrupts() {
    #[cfg(all(target_arch = "x86", target_os = "none"))]
    x86::cli();
}

/// Halt the machine after a fatal error.
pub fn halt() -> ! {
    #[cfg(all(target_arch = "x86", target_os = "none"))]
    {
        x86::cli();
        loop {
            x86::hlt();
        }
    }
    #[cfg(not(all(target_arch = "x86", target_os = "none")))]
    panic!("kernel halt");
}
