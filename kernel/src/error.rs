//! Error types for the Automa kernel
//!
//! Every fallible kernel operation reports a typed error. Errors never
//! unwind across an action boundary: syscall implementations convert them
//! into the stable negative codes of [`SyscallError`] before returning to
//! the automaton.

use core::fmt;

/// Main kernel error type
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[must_use = "kernel errors must be handled, not silently discarded"]
pub enum KernelError {
    /// No frame or address-space capacity left for the request
    OutOfMemory {
        requested: usize,
    },
    /// A size or address that must be page-aligned was not
    NotAligned {
        value: usize,
    },
    /// aid does not name a live automaton
    UnknownAutomaton {
        aid: i32,
    },
    /// Entry address is not a registered action of the automaton
    UnknownAction {
        aid: i32,
        entry: usize,
    },
    /// An action was registered twice at one entry address
    ActionExists {
        aid: i32,
        entry: usize,
    },
    /// Declared copy-value size exceeds the transfer limit
    CopyValueTooLarge {
        size: usize,
        max: usize,
    },
    /// The automaton image could not be parsed
    InvalidImage {
        reason: &'static str,
    },
    /// A registered action descriptor is internally inconsistent
    InvalidAction {
        reason: &'static str,
    },
    /// The requesting automaton does not own the target
    NotOwner {
        aid: i32,
        target: i32,
    },

    /// Buffer-store errors
    Buffer(BufferError),
    /// Binding errors
    Bind(BindError),
    /// Scheduler errors
    Sched(SchedError),
    /// Address-space errors
    Memory(MemError),
}

/// Buffer-store errors
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BufferError {
    /// bid does not name a live buffer of the calling automaton
    UnknownBuffer { bid: i32 },
    /// The operation requires the buffer to be unmapped
    Mapped { bid: i32 },
    /// The operation requires the caller to hold a mapping
    NotMapped { bid: i32 },
    /// The buffer is in transit to a receiver and may not be mutated
    Closed { bid: i32 },
    /// Size-0 buffers cannot be mapped
    ZeroSized { bid: i32 },
    /// Offset/length fall outside the buffer
    OutOfRange { offset: usize, length: usize },
    /// Same-buffer assign with overlapping ranges
    Overlap,
    /// No frames left to back the buffer
    OutOfMemory,
}

/// Binding errors
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BindError {
    /// An endpoint aid does not name a live automaton
    UnknownAutomaton { aid: i32 },
    /// An endpoint entry is not a registered action
    UnknownAction { aid: i32, entry: usize },
    /// The output endpoint is not an output action (or input not an input)
    KindMismatch { aid: i32, entry: usize },
    /// The identical 6-tuple is already bound
    AlreadyBound,
    /// No binding matches the 6-tuple
    UnknownBinding,
    /// The authorization automaton refused the request
    NotAuthorized,
}

/// Scheduler errors
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchedError {
    /// The caller tried to schedule an action it does not own
    NotOwned { aid: i32, entry: usize },
    /// Input actions fire on delivery and cannot be scheduled
    NotSchedulable { entry: usize },
}

/// Address-space errors
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemError {
    /// The new area overlaps an existing one
    AreaOverlap,
    /// The area would extend past the automaton's memory ceiling
    CeilingExceeded,
    /// No gap large enough below the ceiling
    OutOfMemory { requested: usize },
    /// Requested size is not a page multiple
    NotAligned { size: usize },
    /// No area starts at the given address
    NoSuchArea { addr: usize },
}

impl From<BufferError> for KernelError {
    fn from(err: BufferError) -> Self {
        KernelError::Buffer(err)
    }
}

impl From<BindError> for KernelError {
    fn from(err: BindError) -> Self {
        KernelError::Bind(err)
    }
}

impl From<SchedError> for KernelError {
    fn from(err: SchedError) -> Self {
        KernelError::Sched(err)
    }
}

impl From<MemError> for KernelError {
    fn from(err: MemError) -> Self {
        KernelError::Memory(err)
    }
}

impl fmt::Display for KernelError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            KernelError::OutOfMemory { requested } => {
                write!(f, "out of memory (requested {requested} bytes)")
            }
            KernelError::NotAligned { value } => {
                write!(f, "value {value:#x} is not page-aligned")
            }
            KernelError::UnknownAutomaton { aid } => write!(f, "unknown automaton {aid}"),
            KernelError::UnknownAction { aid, entry } => {
                write!(f, "automaton {aid} has no action at {entry:#x}")
            }
            KernelError::ActionExists { aid, entry } => {
                write!(f, "automaton {aid} already has an action at {entry:#x}")
            }
            KernelError::CopyValueTooLarge { size, max } => {
                write!(f, "copy value of {size} bytes exceeds limit of {max}")
            }
            KernelError::InvalidImage { reason } => write!(f, "invalid image: {reason}"),
            KernelError::InvalidAction { reason } => write!(f, "invalid action: {reason}"),
            KernelError::NotOwner { aid, target } => {
                write!(f, "automaton {aid} does not own {target}")
            }
            KernelError::Buffer(e) => write!(f, "buffer: {e:?}"),
            KernelError::Bind(e) => write!(f, "bind: {e:?}"),
            KernelError::Sched(e) => write!(f, "sched: {e:?}"),
            KernelError::Memory(e) => write!(f, "memory: {e:?}"),
        }
    }
}

/// Result alias used throughout the kernel
pub type Result<T> = core::result::Result<T, KernelError>;

/// Stable error codes surfaced to automata through the syscall boundary
#[repr(i32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyscallError {
    InvalidSyscall = -1,
    InvalidArgument = -2,
    OutOfMemory = -3,
    NotAligned = -4,
    NotFound = -5,
    Mapped = -6,
    NotMapped = -7,
    Closed = -8,
    NotOwned = -9,
    Overlap = -10,
    AlreadyBound = -11,
    NotAuthorized = -12,
    ZeroSized = -13,
}

impl From<KernelError> for SyscallError {
    fn from(err: KernelError) -> Self {
        match err {
            KernelError::OutOfMemory { .. } => SyscallError::OutOfMemory,
            KernelError::NotAligned { .. } => SyscallError::NotAligned,
            KernelError::UnknownAutomaton { .. }
            | KernelError::UnknownAction { .. }
            | KernelError::InvalidImage { .. } => SyscallError::NotFound,
            KernelError::ActionExists { .. }
            | KernelError::CopyValueTooLarge { .. }
            | KernelError::InvalidAction { .. } => SyscallError::InvalidArgument,
            KernelError::NotOwner { .. } => SyscallError::NotOwned,
            KernelError::Buffer(e) => e.into(),
            KernelError::Bind(e) => e.into(),
            KernelError::Sched(e) => e.into(),
            KernelError::Memory(e) => e.into(),
        }
    }
}

impl From<BufferError> for SyscallError {
    fn from(err: BufferError) -> Self {
        match err {
            BufferError::UnknownBuffer { .. } => SyscallError::NotFound,
            BufferError::Mapped { .. } => SyscallError::Mapped,
            BufferError::NotMapped { .. } => SyscallError::NotMapped,
            BufferError::Closed { .. } => SyscallError::Closed,
            BufferError::ZeroSized { .. } => SyscallError::ZeroSized,
            BufferError::OutOfRange { .. } => SyscallError::InvalidArgument,
            BufferError::Overlap => SyscallError::Overlap,
            BufferError::OutOfMemory => SyscallError::OutOfMemory,
        }
    }
}

impl From<BindError> for SyscallError {
    fn from(err: BindError) -> Self {
        match err {
            BindError::UnknownAutomaton { .. }
            | BindError::UnknownAction { .. }
            | BindError::UnknownBinding => SyscallError::NotFound,
            BindError::KindMismatch { .. } => SyscallError::InvalidArgument,
            BindError::AlreadyBound => SyscallError::AlreadyBound,
            BindError::NotAuthorized => SyscallError::NotAuthorized,
        }
    }
}

impl From<SchedError> for SyscallError {
    fn from(err: SchedError) -> Self {
        match err {
            SchedError::NotOwned { .. } => SyscallError::NotOwned,
            SchedError::NotSchedulable { .. } => SyscallError::InvalidArgument,
        }
    }
}

impl From<MemError> for SyscallError {
    fn from(err: MemError) -> Self {
        match err {
            MemError::AreaOverlap | MemError::NoSuchArea { .. } => SyscallError::InvalidArgument,
            MemError::CeilingExceeded | MemError::OutOfMemory { .. } => SyscallError::OutOfMemory,
            MemError::NotAligned { .. } => SyscallError::NotAligned,
        }
    }
}
