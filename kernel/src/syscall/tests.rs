//! Syscall-surface tests
//!
//! Each test makes an action current (as the trap layer would have) and
//! drives `dispatch_syscall` with raw register-style arguments.

extern crate alloc;

use super::{dispatch_syscall, Syscall, SyscallArgs, SyscallOutcome};
use crate::{
    buffer,
    error::SyscallError,
    mm::{VirtAddr, PAGE_SIZE},
    registry::ActionRef,
    test_util::{TestRig, T_EMIT, T_INIT, T_POKE, T_SINK},
};

fn call(rig: &mut TestRig, number: Syscall, args: [usize; 5]) -> SyscallOutcome {
    dispatch_syscall(
        &mut rig.kernel,
        SyscallArgs {
            number: number as usize,
            arg1: args[0],
            arg2: args[1],
            arg3: args[2],
            arg4: args[3],
            arg5: args[4],
        },
    )
}

fn ret(outcome: SyscallOutcome) -> isize {
    match outcome {
        SyscallOutcome::Return(value) => value,
        SyscallOutcome::Finished => panic!("unexpected finish"),
    }
}

#[test]
fn getpagesize_reports_the_page_size() {
    let mut rig = TestRig::new();
    let aid = rig.user_automaton();
    rig.run_as(aid);
    assert_eq!(ret(call(&mut rig, Syscall::GetPageSize, [0; 5])), PAGE_SIZE as isize);
}

#[test]
fn unknown_numbers_are_rejected() {
    let mut rig = TestRig::new();
    let aid = rig.user_automaton();
    rig.run_as(aid);
    let outcome = dispatch_syscall(
        &mut rig.kernel,
        SyscallArgs { number: 999, arg1: 0, arg2: 0, arg3: 0, arg4: 0, arg5: 0 },
    );
    assert_eq!(outcome, SyscallOutcome::Return(SyscallError::InvalidSyscall as isize));
}

#[test]
fn schedule_requires_an_owned_schedulable_action() {
    let mut rig = TestRig::new();
    let aid = rig.user_automaton();
    rig.run_as(aid);

    assert_eq!(ret(call(&mut rig, Syscall::Schedule, [T_POKE, 5, 0, 0, 0])), 0);
    assert_eq!(rig.kernel.sched.len(), 1);

    // Not owned.
    assert_eq!(
        ret(call(&mut rig, Syscall::Schedule, [0xBAD, 0, 0, 0, 0])),
        SyscallError::NotOwned as isize
    );
    // Inputs fire on delivery only.
    assert_eq!(
        ret(call(&mut rig, Syscall::Schedule, [T_SINK, 0, 0, 0, 0])),
        SyscallError::InvalidArgument as isize
    );
}

#[test]
fn remove_is_a_no_op_when_absent() {
    let mut rig = TestRig::new();
    let aid = rig.user_automaton();
    rig.run_as(aid);
    call(&mut rig, Syscall::Schedule, [T_POKE, 5, 0, 0, 0]);
    assert_eq!(ret(call(&mut rig, Syscall::Remove, [T_POKE, 5, 0, 0, 0])), 0);
    assert!(rig.kernel.sched.is_empty());
    assert_eq!(ret(call(&mut rig, Syscall::Remove, [T_POKE, 5, 0, 0, 0])), 0);
}

#[test]
fn buffer_calls_round_trip() {
    let mut rig = TestRig::new();
    let aid = rig.user_automaton();
    rig.run_as(aid);

    let bid = ret(call(&mut rig, Syscall::BufferCreate, [3 * PAGE_SIZE, 0, 0, 0, 0]));
    assert!(bid >= 0);
    assert_eq!(
        ret(call(&mut rig, Syscall::BufferSize, [bid as usize, 0, 0, 0, 0])),
        3 * PAGE_SIZE as isize
    );
    let addr = ret(call(&mut rig, Syscall::BufferMap, [bid as usize, 0, 0, 0, 0]));
    assert!(addr > 0);
    assert_eq!(ret(call(&mut rig, Syscall::BufferUnmap, [bid as usize, 0, 0, 0, 0])), 0);
    assert_eq!(ret(call(&mut rig, Syscall::BufferDestroy, [bid as usize, 0, 0, 0, 0])), 0);
    // Unknown bids: size answers -1, everything else a typed error.
    assert_eq!(ret(call(&mut rig, Syscall::BufferSize, [bid as usize, 0, 0, 0, 0])), -1);
    assert_eq!(
        ret(call(&mut rig, Syscall::BufferDestroy, [bid as usize, 0, 0, 0, 0])),
        SyscallError::NotFound as isize
    );
}

#[test]
fn sbrk_grows_the_break_and_reports_the_old_one() {
    let mut rig = TestRig::new();
    let aid = rig.user_automaton();
    rig.run_as(aid);

    let base = ret(call(&mut rig, Syscall::Sbrk, [0x100, 0, 0, 0, 0]));
    assert!(base > 0);
    let old = ret(call(&mut rig, Syscall::Sbrk, [0x2000, 0, 0, 0, 0]));
    assert_eq!(old, base + 0x100);
    // Shrinking moves the break down without failing.
    let old = ret(call(&mut rig, Syscall::Sbrk, [(-0x80isize) as usize, 0, 0, 0, 0]));
    assert_eq!(old, base + 0x2100);
}

#[test]
fn binding_count_counts_peers_per_role() {
    let mut rig = TestRig::new();
    let producer = rig.user_automaton();
    let consumer = rig.user_automaton();
    let output = ActionRef::new(producer, T_EMIT, 0);
    rig.kernel.registry.bind(output, ActionRef::new(consumer, T_SINK, 1), producer).unwrap();
    rig.kernel.registry.bind(output, ActionRef::new(consumer, T_SINK, 2), producer).unwrap();

    rig.run_as(producer);
    assert_eq!(ret(call(&mut rig, Syscall::BindingCount, [T_EMIT, 0, 0, 0, 0])), 2);
    assert_eq!(ret(call(&mut rig, Syscall::BindingCount, [T_EMIT, 9, 0, 0, 0])), 0);

    rig.run_as(consumer);
    assert_eq!(ret(call(&mut rig, Syscall::BindingCount, [T_SINK, 1, 0, 0, 0])), 1);
    // Unknown actions count zero rather than failing.
    assert_eq!(ret(call(&mut rig, Syscall::BindingCount, [0xBAD, 0, 0, 0, 0])), 0);
}

#[test]
fn finish_trap_delivers_and_dispatches() {
    let mut rig = TestRig::new();
    let producer = rig.user_automaton();
    let consumer = rig.user_automaton();
    let output = ActionRef::new(producer, T_EMIT, 0);
    rig.kernel.registry.bind(output, ActionRef::new(consumer, T_SINK, 4), producer).unwrap();

    // The producer stages its copy value on its own stack, as the user
    // library does, then raises finish.
    rig.run_action(producer, T_EMIT);
    let bid = buffer::create_for(&mut rig.kernel, producer, PAGE_SIZE).unwrap();
    let staging = VirtAddr::new(crate::spawn::image::USER_CEILING - 64);
    {
        let automaton = rig.kernel.registry.get(producer).unwrap();
        assert!(automaton.space.write_bytes(
            rig.kernel.mm.phys,
            staging,
            &77u64.to_le_bytes()
        ));
    }

    let outcome = call(
        &mut rig,
        Syscall::Finish,
        [T_POKE, 0, staging.raw(), 8, bid as usize],
    );
    assert_eq!(outcome, SyscallOutcome::Finished);
    assert!(rig.kernel.sched.current().is_none());

    let entries: alloc::vec::Vec<crate::sched::Entry> =
        rig.kernel.sched.entries().copied().collect();
    assert_eq!(entries.len(), 2);
    // The delivery first, then the successor on self.
    assert_eq!((entries[0].aid, entries[0].entry, entries[0].parameter), (consumer, T_SINK, 4));
    assert_eq!((entries[1].aid, entries[1].entry), (producer, T_POKE));
    let delivery = entries[0].delivery.unwrap();
    assert_eq!(delivery.value.unwrap().as_slice(), 77u64.to_le_bytes());
    assert!(delivery.bid.is_some());
}

#[test]
fn describe_serializes_the_action_table() {
    let mut rig = TestRig::new();
    let aid = rig.user_automaton();
    let peer = rig.user_automaton();
    rig.run_as(aid);

    let bid = ret(call(&mut rig, Syscall::Describe, [peer as usize, 0, 0, 0, 0]));
    assert!(bid >= 0);
    let size = ret(call(&mut rig, Syscall::BufferSize, [bid as usize, 0, 0, 0, 0]));
    assert!(size > 4);

    let id = rig.kernel.registry.get(aid).unwrap().buffer(bid as i32).unwrap();
    let mut bytes = alloc::vec![0u8; size as usize];
    rig.kernel.buffers.read(rig.kernel.mm.phys, id, 0, &mut bytes, bid as i32).unwrap();

    let count = u32::from_le_bytes(bytes[0..4].try_into().unwrap());
    assert_eq!(count, 9);
    // First record is action number 0: init, internal, no parameter.
    let kind = u32::from_le_bytes(bytes[4..8].try_into().unwrap());
    let mode = u32::from_le_bytes(bytes[8..12].try_into().unwrap());
    let number = u32::from_le_bytes(bytes[12..16].try_into().unwrap());
    let entry = u32::from_le_bytes(bytes[16..20].try_into().unwrap());
    let name_len = u32::from_le_bytes(bytes[28..32].try_into().unwrap());
    let name = &bytes[32..32 + name_len as usize];
    assert_eq!(kind, 2);
    assert_eq!(mode, 0);
    assert_eq!(number, 0);
    assert_eq!(entry as usize, T_INIT);
    assert_eq!(name, b"init");
}

#[test]
fn syscall_without_a_current_action_is_rejected() {
    let mut rig = TestRig::new();
    rig.drain();
    let outcome = call(&mut rig, Syscall::GetPageSize, [0; 5]);
    assert_eq!(outcome, SyscallOutcome::Return(SyscallError::InvalidSyscall as isize));
}
