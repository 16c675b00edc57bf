//! Shared test fixtures
//!
//! A `TestRig` is a private kernel instance over a heap-backed physical
//! region: the rig's `PhysMap` offset points the linear map into the
//! allocation, so frame content, page tables and buffer bytes all work
//! exactly as on the metal. The region spans the DMA boundary so both
//! zones exist.

extern crate alloc;

use alloc::vec;
use alloc::vec::Vec;

use crate::{
    bootstrap,
    elf::{testing::ImageBuilder, ActionNote, PF_R, PF_W, PF_X},
    mm::{PageDirectory, PhysMap, PAGE_SIZE},
    registry::{Aid, SYSTEM_AID},
    spawn::image,
    state::Kernel,
};

/// Base of the synthetic physical region (15 MiB, inside the DMA zone).
pub const PHYS_BASE: usize = 0xF0_0000;

/// Length of the synthetic region (4 MiB: 1 MiB DMA + 3 MiB normal).
pub const PHYS_LEN: usize = 0x40_0000;

/// Entry addresses of the canonical test automaton's actions.
pub const T_INIT: usize = 0x10_0000;
pub const T_POKE: usize = 0x10_0004;
pub const T_EMIT: usize = 0x10_0008;
pub const T_SINK: usize = 0x10_000C;
pub const T_REQ: usize = 0x10_0014;
pub const T_RES: usize = 0x10_0018;
pub const T_RES4: usize = 0x10_001C;
pub const T_BUFIN: usize = 0x10_0020;
pub const T_BUFOUT: usize = 0x10_0024;

pub struct TestRig {
    _mem: Vec<u8>,
    pub kernel: Kernel,
    pub dir: PageDirectory,
}

impl TestRig {
    pub fn new() -> Self {
        let mut mem = vec![0u8; PHYS_LEN + PAGE_SIZE];
        let aligned = (mem.as_mut_ptr() as usize + PAGE_SIZE - 1) & !(PAGE_SIZE - 1);
        let offset = aligned - PHYS_BASE;

        let mut kernel = Kernel::new(PhysMap::with_offset(offset));
        let dir = bootstrap::init_memory(&mut kernel, &[(PHYS_BASE, PHYS_BASE + PHYS_LEN)], &[])
            .expect("rig frame pool");
        bootstrap::init_system(&mut kernel, dir, 0xFFB0_0000, &[]).expect("rig system automaton");
        Self { _mem: mem, kernel, dir }
    }

    /// Build the canonical user automaton: an init and a poke internal
    /// action, an `emit` output and a `sink` input (both parameterized,
    /// 8-byte copy value plus buffer).
    pub fn user_automaton(&mut self) -> Aid {
        let image = Self::standard_image();
        image::create_automaton(&mut self.kernel, SYSTEM_AID, &image, &[], false)
            .expect("test automaton image")
    }

    pub fn standard_image() -> Vec<u8> {
        ImageBuilder::new(T_INIT)
            .segment(0x10_0000, PAGE_SIZE, PF_R | PF_X, &[0x90; 64])
            .segment(0x10_1000, PAGE_SIZE, PF_R | PF_W, b"data segment")
            .action(note(2, 0, T_INIT, 0, false, "init"))
            .action(note(2, 1, T_POKE, 0, false, "poke"))
            .action(note(1, 1, T_EMIT, 8, true, "emit"))
            .action(note(0, 1, T_SINK, 8, true, "sink"))
            .action(note(1, 1, T_REQ, 0, true, "request"))
            .action(note(0, 1, T_RES, 8, false, "response"))
            .action(note(0, 1, T_RES4, 4, false, "verdict"))
            .action(note(0, 1, T_BUFIN, 0, true, "accept"))
            .action(note(1, 1, T_BUFOUT, 0, true, "supply"))
            .build()
    }

    /// Throw away everything pending and make `(aid, entry)` current, as
    /// if the dispatcher had just entered that action.
    pub fn run_action(&mut self, aid: Aid, entry: usize) {
        self.drain();
        self.kernel.sched.schedule(aid, entry, 0);
        self.kernel.sched.take_next();
    }

    /// Make some action of `aid` current.
    pub fn run_as(&mut self, aid: Aid) {
        self.run_action(aid, T_INIT);
    }

    /// Drain the ready queue without executing anything.
    pub fn drain(&mut self) {
        while self.kernel.sched.take_next().is_some() {
            self.kernel.sched.clear_current();
        }
    }

    /// Run ring-0 entries until the queue is empty or a user entry is
    /// reached (which is handed back).
    pub fn pump(&mut self) -> Option<crate::sched::Entry> {
        loop {
            match crate::sched::dispatch::step(&mut self.kernel) {
                crate::sched::dispatch::Step::Idle => return None,
                crate::sched::dispatch::Step::Completed => continue,
                crate::sched::dispatch::Step::EnterUser(entry) => return Some(entry),
            }
        }
    }
}

pub fn note(
    kind: u32,
    parameter_mode: u32,
    entry: usize,
    copy_size: usize,
    has_buffer: bool,
    name: &str,
) -> ActionNote {
    ActionNote {
        kind,
        parameter_mode,
        entry,
        copy_size,
        has_buffer,
        name: alloc::string::String::from(name),
    }
}
