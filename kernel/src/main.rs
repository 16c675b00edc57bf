//! Bare-metal kernel binary
//!
//! The multiboot stub in `arch::x86::boot` jumps into
//! `bootstrap::boot_main`; this file only contributes the panic handler.
//! Hosted builds get a stub `main` so the workspace builds (and tests)
//! on the development machine.

#![cfg_attr(target_os = "none", no_std)]
#![cfg_attr(target_os = "none", no_main)]

#[cfg(target_os = "none")]
use automa_kernel as _;

#[cfg(target_os = "none")]
#[panic_handler]
fn panic(info: &core::panic::PanicInfo) -> ! {
    automa_kernel::println!("[KERNEL PANIC] {}", info);
    automa_kernel::arch::halt()
}

#[cfg(not(target_os = "none"))]
fn main() {
    // The kernel only runs on bare metal; hosted builds exist for the
    // test suite.
    std::eprintln!("automa-kernel targets x86 bare metal; run `cargo test` instead");
}
