//! Action descriptors
//!
//! An action is a typed entry point of an automaton, identified by its
//! entry address. The descriptor carries the categories that drove the
//! original template dispatch — kind, parameter mode and value shape —
//! as plain data checked at registration time.

extern crate alloc;

use alloc::string::String;

use crate::error::{KernelError, Result};

/// Largest by-value payload an output may produce per firing.
pub const MAX_COPY_VALUE: usize = 512;

/// What role the action plays in the automaton's interface.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActionKind {
    /// Fires when a bound output produces a value.
    Input,
    /// Fires when scheduled; may produce a value.
    Output,
    /// Fires when scheduled; never produces a value.
    Internal,
}

/// How the invocation parameter is supplied.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParameterMode {
    /// The parameter is always zero.
    None,
    /// The scheduling caller picks the parameter.
    Parameter,
    /// The kernel supplies the aid of the counterparty.
    Auto,
}

/// Kernel-resident action body for ring-0 automata. The body returns its
/// finish record instead of issuing the finish trap.
pub type KernelHandler =
    fn(&mut crate::state::Kernel, i32, Option<&crate::sched::Delivery>) -> crate::sched::Finish;

/// Immutable description of one action.
#[derive(Clone)]
pub struct ActionDescriptor {
    pub kind: ActionKind,
    pub parameter_mode: ParameterMode,
    /// Bytes of by-value payload (0 = none), bounded by [`MAX_COPY_VALUE`].
    pub copy_size: usize,
    /// Whether a buffer travels with each firing.
    pub has_buffer: bool,
    /// Export name, surfaced through `describe`.
    pub name: String,
    /// Dense per-automaton action number, assigned at registration.
    pub number: u32,
    /// Present only for actions of ring-0 automata.
    pub handler: Option<KernelHandler>,
}

impl ActionDescriptor {
    pub fn new(kind: ActionKind, parameter_mode: ParameterMode, name: &str) -> Self {
        Self {
            kind,
            parameter_mode,
            copy_size: 0,
            has_buffer: false,
            name: String::from(name),
            number: 0,
            handler: None,
        }
    }

    pub fn with_copy_value(mut self, size: usize) -> Self {
        self.copy_size = size;
        self
    }

    pub fn with_buffer(mut self) -> Self {
        self.has_buffer = true;
        self
    }

    pub fn with_handler(mut self, handler: KernelHandler) -> Self {
        self.handler = Some(handler);
        self
    }

    /// Registration-time checks: value sizes and kind/value consistency.
    pub fn validate(&self) -> Result<()> {
        if self.copy_size > MAX_COPY_VALUE {
            return Err(KernelError::CopyValueTooLarge {
                size: self.copy_size,
                max: MAX_COPY_VALUE,
            });
        }
        if self.kind == ActionKind::Internal && (self.copy_size != 0 || self.has_buffer) {
            return Err(KernelError::InvalidAction {
                reason: "internal actions carry no value",
            });
        }
        Ok(())
    }

    /// Whether a firing of this action carries anything at all.
    pub fn carries_value(&self) -> bool {
        self.copy_size != 0 || self.has_buffer
    }
}

impl core::fmt::Debug for ActionDescriptor {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("ActionDescriptor")
            .field("kind", &self.kind)
            .field("parameter_mode", &self.parameter_mode)
            .field("copy_size", &self.copy_size)
            .field("has_buffer", &self.has_buffer)
            .field("name", &self.name)
            .field("number", &self.number)
            .field("handler", &self.handler.map(|h| h as usize))
            .finish()
    }
}
