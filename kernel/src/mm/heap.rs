//! Kernel heap
//!
//! A fixed region in `.bss` feeds the linked-list allocator. Two
//! megabytes holds the frame-pool entry arrays, the registry and every
//! queue this kernel builds; there is no allocation fast path to tune.
//! Hosted builds use the system allocator instead (see `lib.rs`).

/// Kernel heap size in bytes.
pub const KERNEL_HEAP_SIZE: usize = 2 * 1024 * 1024;

#[cfg(target_os = "none")]
static mut KERNEL_HEAP: [u8; KERNEL_HEAP_SIZE] = [0; KERNEL_HEAP_SIZE];

/// Hand the heap region to the global allocator. Must run before the
/// first allocation and must never run twice.
#[cfg(target_os = "none")]
pub fn init() {
    // SAFETY: KERNEL_HEAP is reserved for the allocator and this is the
    // only place that takes a pointer to it; init is called once from the
    // boot glue before allocation begins.
    unsafe {
        let start = core::ptr::addr_of_mut!(KERNEL_HEAP).cast::<u8>();
        crate::ALLOCATOR.lock().init(start, KERNEL_HEAP_SIZE);
    }
}

#[cfg(not(target_os = "none"))]
pub fn init() {}
