//! The automaton record

extern crate alloc;

use alloc::collections::BTreeSet;

use hashbrown::HashMap;

use super::{action::ActionDescriptor, Aid, Privilege};
use crate::{
    buffer::{Bid, BufferId},
    error::{KernelError, Result},
    mm::{AddressSpace, VirtAddr},
};

/// An isolated unit of execution: address space, typed actions, buffer
/// handles and the fixed stack every action starts on.
pub struct Automaton {
    pub aid: Aid,
    pub privilege: Privilege,
    pub space: AddressSpace,
    /// Constant across all invocations; every action starts on a fresh
    /// stack at this address.
    pub stack_pointer: VirtAddr,
    /// Action table keyed by entry address.
    actions: HashMap<usize, ActionDescriptor>,
    /// Buffer handles held by this automaton.
    bids: HashMap<Bid, BufferId>,
    /// Where each currently mapped buffer lives in the address space.
    pub mapped: HashMap<Bid, VirtAddr>,
    next_bid: Bid,
    /// The automaton responsible for this one's existence.
    pub owner: Aid,
    /// Automata this one owns.
    pub owned: BTreeSet<Aid>,
}

impl Automaton {
    pub fn new(
        aid: Aid,
        privilege: Privilege,
        space: AddressSpace,
        stack_pointer: VirtAddr,
        owner: Aid,
    ) -> Self {
        Self {
            aid,
            privilege,
            space,
            stack_pointer,
            actions: HashMap::new(),
            bids: HashMap::new(),
            mapped: HashMap::new(),
            next_bid: 0,
            owner,
            owned: BTreeSet::new(),
        }
    }

    /// Register an action at its entry address. Actions are immutable
    /// once registered; a second registration at the same entry fails.
    pub fn register_action(&mut self, entry: usize, descriptor: ActionDescriptor) -> Result<()> {
        descriptor.validate()?;
        if self.actions.contains_key(&entry) {
            return Err(KernelError::ActionExists { aid: self.aid, entry });
        }
        let mut descriptor = descriptor;
        descriptor.number = self.actions.len() as u32;
        self.actions.insert(entry, descriptor);
        Ok(())
    }

    pub fn action(&self, entry: usize) -> Option<&ActionDescriptor> {
        self.actions.get(&entry)
    }

    pub fn actions(&self) -> impl Iterator<Item = (usize, &ActionDescriptor)> {
        self.actions.iter().map(|(entry, descriptor)| (*entry, descriptor))
    }

    pub fn action_count(&self) -> usize {
        self.actions.len()
    }

    /// Record a reference to a buffer under a fresh local descriptor.
    /// The cursor walks forward and skips live handles, so descriptors
    /// stay dense and are reused only after release.
    pub fn publish_buffer(&mut self, id: BufferId) -> Bid {
        loop {
            let bid = self.next_bid;
            self.next_bid = if self.next_bid == i32::MAX { 0 } else { self.next_bid + 1 };
            if !self.bids.contains_key(&bid) {
                self.bids.insert(bid, id);
                return bid;
            }
        }
    }

    pub fn buffer(&self, bid: Bid) -> Option<BufferId> {
        self.bids.get(&bid).copied()
    }

    pub fn forget_buffer(&mut self, bid: Bid) -> Option<BufferId> {
        self.mapped.remove(&bid);
        self.bids.remove(&bid)
    }

    pub fn buffers(&self) -> impl Iterator<Item = (Bid, BufferId)> + '_ {
        self.bids.iter().map(|(bid, id)| (*bid, *id))
    }

    pub fn mapping(&self, bid: Bid) -> Option<VirtAddr> {
        self.mapped.get(&bid).copied()
    }
}
