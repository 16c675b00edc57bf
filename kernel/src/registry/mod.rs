//! Automaton & action registry
//!
//! The process-wide table of automata, their typed actions and the
//! bindings between them. Every live automaton appears here exactly once
//! and is reachable from the system automaton through the owner relation.

extern crate alloc;

pub mod action;
pub mod automaton;
pub mod binding;

#[cfg(test)]
mod tests;

pub use action::{ActionDescriptor, ActionKind, KernelHandler, ParameterMode, MAX_COPY_VALUE};
pub use automaton::Automaton;
pub use binding::{ActionRef, Binding, BindingTable};

use hashbrown::HashMap;

use crate::{
    error::{BindError, KernelError, Result},
    state::Kernel,
};

/// Automaton identifier: dense, non-negative.
pub type Aid = i32;

/// The bootstrapped automaton that owns everything else.
pub const SYSTEM_AID: Aid = 0;

/// Ring an automaton's actions execute at.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Privilege {
    Ring0,
    Ring3,
}

/// The registry singleton's state.
pub struct Registry {
    automata: HashMap<Aid, Automaton>,
    pub bindings: BindingTable,
    next_aid: Aid,
}

impl Registry {
    pub fn new() -> Self {
        Self { automata: HashMap::new(), bindings: BindingTable::new(), next_aid: SYSTEM_AID }
    }

    /// Allocate an aid and insert the record. The cursor walks forward,
    /// skipping live entries, and wraps at the top of the range.
    pub fn insert(&mut self, build: impl FnOnce(Aid) -> Automaton) -> Aid {
        let aid = loop {
            let candidate = self.next_aid;
            self.next_aid = if self.next_aid == Aid::MAX { 0 } else { self.next_aid + 1 };
            if !self.automata.contains_key(&candidate) {
                break candidate;
            }
        };
        self.automata.insert(aid, build(aid));
        aid
    }

    pub fn get(&self, aid: Aid) -> Option<&Automaton> {
        self.automata.get(&aid)
    }

    pub fn get_mut(&mut self, aid: Aid) -> Option<&mut Automaton> {
        self.automata.get_mut(&aid)
    }

    pub fn require(&self, aid: Aid) -> Result<&Automaton> {
        self.get(aid).ok_or(KernelError::UnknownAutomaton { aid })
    }

    pub fn require_mut(&mut self, aid: Aid) -> Result<&mut Automaton> {
        self.get_mut(aid).ok_or(KernelError::UnknownAutomaton { aid })
    }

    pub fn contains(&self, aid: Aid) -> bool {
        self.automata.contains_key(&aid)
    }

    pub fn len(&self) -> usize {
        self.automata.len()
    }

    pub fn is_empty(&self) -> bool {
        self.automata.is_empty()
    }

    pub fn aids(&self) -> impl Iterator<Item = Aid> + '_ {
        self.automata.keys().copied()
    }

    pub(crate) fn remove(&mut self, aid: Aid) -> Option<Automaton> {
        self.automata.remove(&aid)
    }

    /// The descriptor for an action, if registered.
    pub fn action_of(&self, aid: Aid, entry: usize) -> Option<&ActionDescriptor> {
        self.get(aid).and_then(|automaton| automaton.action(entry))
    }

    /// Validate and install a binding.
    ///
    /// Auto-parameter endpoints get the counterparty's aid as their
    /// effective parameter; the returned refs carry the resolved values.
    /// Nothing is installed unless every check passes.
    pub fn bind(
        &mut self,
        output: ActionRef,
        input: ActionRef,
        owner: Aid,
    ) -> core::result::Result<(ActionRef, ActionRef), BindError> {
        if !self.contains(owner) {
            return Err(BindError::UnknownAutomaton { aid: owner });
        }
        let output_desc = self
            .get(output.aid)
            .ok_or(BindError::UnknownAutomaton { aid: output.aid })?
            .action(output.entry)
            .ok_or(BindError::UnknownAction { aid: output.aid, entry: output.entry })?;
        if output_desc.kind != ActionKind::Output {
            return Err(BindError::KindMismatch { aid: output.aid, entry: output.entry });
        }
        let output_mode = output_desc.parameter_mode;
        let output_shape = (output_desc.copy_size, output_desc.has_buffer);

        let input_desc = self
            .get(input.aid)
            .ok_or(BindError::UnknownAutomaton { aid: input.aid })?
            .action(input.entry)
            .ok_or(BindError::UnknownAction { aid: input.aid, entry: input.entry })?;
        if input_desc.kind != ActionKind::Input {
            return Err(BindError::KindMismatch { aid: input.aid, entry: input.entry });
        }
        // The input must accept exactly what the output produces.
        if output_shape != (input_desc.copy_size, input_desc.has_buffer) {
            return Err(BindError::KindMismatch { aid: input.aid, entry: input.entry });
        }
        let input_mode = input_desc.parameter_mode;

        let output = resolve_parameter(output, output_mode, input.aid);
        let input = resolve_parameter(input, input_mode, output.aid);

        self.bindings.insert(output, input, owner)?;
        Ok((output, input))
    }

    /// Remove a binding by its (resolved) 6-tuple.
    pub fn unbind(
        &mut self,
        output: ActionRef,
        input: ActionRef,
    ) -> core::result::Result<Binding, BindError> {
        self.bindings.remove(output, input)
    }
}

impl Default for Registry {
    fn default() -> Self {
        Self::new()
    }
}

fn resolve_parameter(reference: ActionRef, mode: ParameterMode, counterparty: Aid) -> ActionRef {
    match mode {
        ParameterMode::None => ActionRef::new(reference.aid, reference.entry, 0),
        ParameterMode::Parameter => reference,
        ParameterMode::Auto => ActionRef::new(reference.aid, reference.entry, counterparty),
    }
}

/// Destroy an automaton and everything that depends on it: owned
/// automata (recursively), bindings at either endpoint or owned by it,
/// pending scheduler entries, buffer references and the address space.
pub fn destroy_automaton(kernel: &mut Kernel, aid: Aid) {
    let Some(mut automaton) = kernel.registry.remove(aid) else {
        return;
    };

    // Owned automata go first; the set was snapshotted by the remove.
    let owned: alloc::vec::Vec<Aid> = automaton.owned.iter().copied().collect();
    for child in owned {
        destroy_automaton(kernel, child);
    }

    kernel.sched.purge_automaton(aid);
    kernel.registry.bindings.purge_automaton(aid);

    // Release buffer handles. Frames backing mapped buffer pages are
    // reclaimed by the address-space teardown below; here only the
    // store's bookkeeping is unwound.
    for (bid, id) in automaton.buffers().collect::<alloc::vec::Vec<_>>() {
        if automaton.mapping(bid).is_some() {
            kernel.buffers.note_unmapped(id);
        }
        kernel.buffers.acknowledge_receiver(id, aid, bid);
        kernel.buffers.release(&mut kernel.mm, id);
    }

    automaton.space.teardown(&mut kernel.mm);

    if let Some(owner) = kernel.registry.get_mut(automaton.owner) {
        owner.owned.remove(&aid);
    }

    log::info!("automaton {aid} destroyed");
}
