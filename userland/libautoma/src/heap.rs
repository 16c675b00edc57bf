//! Automaton heap
//!
//! `alloc` support for automata: a linked-list allocator fed by `sbrk`.
//! The kernel demand-pages the data area behind the break, so claiming
//! address space here costs nothing until it is touched.

/// Default heap span claimed by [`init`].
pub const DEFAULT_HEAP_SIZE: usize = 256 * 1024;

#[cfg(target_os = "none")]
#[global_allocator]
static ALLOCATOR: linked_list_allocator::LockedHeap = linked_list_allocator::LockedHeap::empty();

/// Claim `size` bytes of heap. Call once, before the first allocation
/// (typically at the top of the init action).
#[cfg(target_os = "none")]
pub fn init(size: usize) {
    let base = crate::sys::sbrk(size as isize);
    // SAFETY: sbrk returned a fresh, exclusively owned span of the data
    // area; init runs once before any allocation.
    unsafe {
        ALLOCATOR.lock().init(base, size);
    }
}

/// Hosted builds use the system allocator; nothing to claim.
#[cfg(not(target_os = "none"))]
pub fn init(_size: usize) {}
