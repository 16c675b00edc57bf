//! Per-automaton support library
//!
//! Everything an automaton needs beside its action bodies: raw syscall
//! stubs, a FIFO scheduler stub mirroring the kernel's uniqueness
//! semantics, a random-access buffer file, argv marshalling, the action
//! description reader and a callback queue for request/response flows.
//!
//! On hosted targets the syscall layer is replaced by an in-memory shim
//! so the library's logic runs under the standard test harness.

#![no_std]

#[cfg(not(target_os = "none"))]
extern crate std;

extern crate alloc;

pub mod argv;
pub mod buffer_file;
pub mod callback_queue;
pub mod description;
pub mod heap;
pub mod sched;
pub mod sys;

/// Automaton identifier.
pub type Aid = i32;

/// Buffer descriptor.
pub type Bid = i32;

/// No buffer attached.
pub const NO_BUFFER: Bid = -1;

/// Arguments every action body receives.
#[derive(Debug, Clone, Copy)]
pub struct ActionArgs<'a> {
    pub parameter: i32,
    /// The delivered copy value (empty for non-input actions).
    pub value: &'a [u8],
    /// The delivered buffer, if the action carries one.
    pub bid: Option<Bid>,
}

impl ActionArgs<'_> {
    /// Reassemble the arguments the executor marshalled onto the stack.
    ///
    /// # Safety
    ///
    /// `value`/`value_size` must be the pointer pair received from the
    /// kernel (or a null pointer with size zero).
    pub unsafe fn from_raw(
        parameter: i32,
        value: *const u8,
        value_size: usize,
        bid: Bid,
    ) -> ActionArgs<'static> {
        let value = if value.is_null() || value_size == 0 {
            &[]
        } else {
            // SAFETY: the executor spilled value_size bytes at `value`
            // on this action's fresh stack; they outlive the action.
            unsafe { core::slice::from_raw_parts(value, value_size) }
        };
        ActionArgs { parameter, value, bid: (bid >= 0).then_some(bid) }
    }
}

/// Define the `extern "C"` entry for an action. The body runs to
/// completion and the wrapper issues the finish the kernel requires, so
/// bodies are ordinary functions returning a [`sched::Finish`] record.
#[macro_export]
macro_rules! action_entry {
    ($name:ident, $body:path) => {
        #[no_mangle]
        pub extern "C" fn $name(
            parameter: i32,
            value: *const u8,
            value_size: usize,
            bid: $crate::Bid,
        ) -> ! {
            // SAFETY: the kernel marshalled these exact arguments.
            let args = unsafe { $crate::ActionArgs::from_raw(parameter, value, value_size, bid) };
            let finish: $crate::sched::Finish = $body(args);
            $crate::sys::finish(finish.next, finish.value_bytes(), finish.buffer)
        }
    };
}
