//! The kernel singleton
//!
//! Process-wide state is genuinely process-wide: one structure holds the
//! frame pool, buffer store, registry, scheduler and control plane. It is
//! built once during boot and never torn down. Only the trap layer goes
//! through the global; everything below takes `&mut Kernel`, which is
//! what lets the test suite run against private instances.

use spin::{Mutex, Once};

use crate::{
    buffer::BufferStore,
    mm::{MemoryManager, PhysMap},
    registry::Registry,
    sched::Scheduler,
    spawn::ControlPlane,
};

pub struct Kernel {
    pub mm: MemoryManager,
    pub buffers: BufferStore,
    pub registry: Registry,
    pub sched: Scheduler,
    pub plane: ControlPlane,
}

impl Kernel {
    pub fn new(phys: PhysMap) -> Self {
        Self {
            mm: MemoryManager::new(phys),
            buffers: BufferStore::new(),
            registry: Registry::new(),
            sched: Scheduler::new(),
            plane: ControlPlane::new(),
        }
    }
}

static KERNEL: Once<Mutex<Kernel>> = Once::new();

/// Install the kernel singleton. Called once by the boot glue.
pub fn init_kernel(kernel: Kernel) -> &'static Mutex<Kernel> {
    KERNEL.call_once(|| Mutex::new(kernel))
}

/// The kernel singleton. Panics before `init_kernel`.
pub fn kernel() -> &'static Mutex<Kernel> {
    KERNEL.get().expect("kernel accessed before boot initialization")
}

/// Top of the fixed kernel stack every trap starts on.
#[cfg(target_os = "none")]
pub fn kernel_stack_top() -> usize {
    extern "C" {
        static boot_stack_top: u8;
    }
    // SAFETY: the symbol is provided by the boot stub; only its address
    // is taken.
    unsafe { core::ptr::addr_of!(boot_stack_top) as usize }
}
