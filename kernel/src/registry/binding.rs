//! Bindings: the directed multimap from output actions to input actions
//!
//! Keyed by the output triple so delivery traversal is one lookup. Each
//! installed binding remembers its owner, the automaton accountable for
//! its existence.

extern crate alloc;

use alloc::vec::Vec;

use hashbrown::HashMap;

use super::Aid;
use crate::error::BindError;

/// One endpoint of a binding: (automaton, action entry, parameter).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ActionRef {
    pub aid: Aid,
    pub entry: usize,
    pub parameter: i32,
}

impl ActionRef {
    pub const fn new(aid: Aid, entry: usize, parameter: i32) -> Self {
        Self { aid, entry, parameter }
    }
}

/// An installed binding, stored under its output triple.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Binding {
    pub input: ActionRef,
    pub owner: Aid,
}

/// All bindings in the system.
pub struct BindingTable {
    by_output: HashMap<ActionRef, Vec<Binding>>,
}

impl BindingTable {
    pub fn new() -> Self {
        Self { by_output: HashMap::new() }
    }

    /// Install a binding. Two bindings are equal iff their 6-tuples are
    /// equal; installing an existing 6-tuple fails regardless of owner.
    pub fn insert(
        &mut self,
        output: ActionRef,
        input: ActionRef,
        owner: Aid,
    ) -> core::result::Result<(), BindError> {
        let list = self.by_output.entry(output).or_default();
        if list.iter().any(|binding| binding.input == input) {
            return Err(BindError::AlreadyBound);
        }
        list.push(Binding { input, owner });
        Ok(())
    }

    /// Remove the binding with the given 6-tuple.
    pub fn remove(
        &mut self,
        output: ActionRef,
        input: ActionRef,
    ) -> core::result::Result<Binding, BindError> {
        let list = self.by_output.get_mut(&output).ok_or(BindError::UnknownBinding)?;
        let index = list
            .iter()
            .position(|binding| binding.input == input)
            .ok_or(BindError::UnknownBinding)?;
        let binding = list.remove(index);
        if list.is_empty() {
            self.by_output.remove(&output);
        }
        Ok(binding)
    }

    /// The inputs currently bound to an output triple, in bind order.
    pub fn inputs_for(&self, output: ActionRef) -> &[Binding] {
        self.by_output.get(&output).map_or(&[], Vec::as_slice)
    }

    pub fn count_for_output(&self, output: ActionRef) -> usize {
        self.inputs_for(output).len()
    }

    /// How many outputs feed an input triple. Inputs are not indexed;
    /// this walks the table.
    pub fn count_for_input(&self, input: ActionRef) -> usize {
        self.by_output
            .values()
            .map(|list| list.iter().filter(|binding| binding.input == input).count())
            .sum()
    }

    /// Drop every binding that touches `aid` as an endpoint or owner.
    pub fn purge_automaton(&mut self, aid: Aid) {
        self.by_output.retain(|output, list| {
            if output.aid == aid {
                return false;
            }
            list.retain(|binding| binding.input.aid != aid && binding.owner != aid);
            !list.is_empty()
        });
    }

    pub fn len(&self) -> usize {
        self.by_output.values().map(Vec::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.by_output.is_empty()
    }
}

impl Default for BindingTable {
    fn default() -> Self {
        Self::new()
    }
}
