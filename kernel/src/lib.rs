//! Automa Kernel Library
//!
//! A research microkernel organized around the I/O-automata model:
//! isolated automata with typed actions, wired together by bindings,
//! exchanging values as small copies or reference-counted buffers at
//! action boundaries.
//!
//! The crate is `no_std` and targets x86 protected mode; on a hosted
//! target it links `std` so the core subsystems run under the standard
//! test harness against a synthetic physical memory region.

#![no_std]

#[cfg(not(target_os = "none"))]
extern crate std;

extern crate alloc;

#[cfg(target_os = "none")]
use linked_list_allocator::LockedHeap;

/// Kernel heap allocator; fed by `mm::heap::init` during boot.
#[cfg(target_os = "none")]
#[global_allocator]
pub static ALLOCATOR: LockedHeap = LockedHeap::empty();

#[macro_use]
pub mod print;

pub mod arch;
pub mod bootstrap;
pub mod buffer;
pub mod cpio;
pub mod elf;
pub mod error;
pub mod logger;
pub mod mm;
pub mod registry;
pub mod sched;
pub mod serial;
pub mod spawn;
pub mod state;
pub mod syscall;

#[cfg(test)]
pub mod test_util;

// The names the rest of the kernel (and the tests) reach for most.
pub use error::{KernelError, SyscallError};
pub use mm::{AddressSpace, AreaKind, Frame, PhysAddr, VirtAddr, VmArea, PAGE_SIZE};
pub use registry::{ActionKind, ActionRef, Aid, ParameterMode, Privilege, SYSTEM_AID};
pub use state::{init_kernel, kernel, Kernel};
