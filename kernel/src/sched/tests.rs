//! Scheduler and executor tests

extern crate alloc;

use super::{dispatch, CopyValue, Finish, Scheduler};
use crate::{
    buffer,
    mm::PAGE_SIZE,
    registry::ActionRef,
    test_util::{TestRig, T_EMIT, T_INIT, T_POKE, T_SINK},
};

#[test]
fn scheduled_entries_are_unique() {
    let mut sched = Scheduler::new();
    assert!(sched.schedule(1, 0x100, 0));
    assert!(!sched.schedule(1, 0x100, 0));
    assert_eq!(sched.len(), 1);
    // A different parameter is a different entry.
    assert!(sched.schedule(1, 0x100, 1));
    assert_eq!(sched.len(), 2);
}

#[test]
fn fifo_order_is_preserved() {
    let mut sched = Scheduler::new();
    sched.schedule(1, 0x100, 0);
    sched.schedule(2, 0x200, 0);
    sched.schedule(1, 0x300, 0);
    let order: alloc::vec::Vec<usize> = core::iter::from_fn(|| {
        let entry = sched.take_next()?;
        sched.clear_current();
        Some(entry.entry)
    })
    .collect();
    assert_eq!(order, [0x100, 0x200, 0x300]);
}

#[test]
fn remove_cancels_a_pending_entry() {
    let mut sched = Scheduler::new();
    sched.schedule(1, 0x100, 7);
    assert!(sched.remove(1, 0x100, 7));
    assert!(sched.is_empty());
    // Removing an absent entry is a no-op.
    assert!(!sched.remove(1, 0x100, 7));
    // The entry can be scheduled again afterwards.
    assert!(sched.schedule(1, 0x100, 7));
}

#[test]
fn purge_drops_entries_and_current() {
    let mut sched = Scheduler::new();
    sched.schedule(1, 0x100, 0);
    sched.schedule(2, 0x200, 0);
    sched.take_next();
    sched.purge_automaton(1);
    assert!(sched.current().is_none());
    assert_eq!(sched.len(), 1);
    // The uniqueness key went with the entry.
    assert!(sched.schedule(1, 0x100, 0));
}

#[test]
fn delivery_entries_are_not_coalesced() {
    let mut sched = Scheduler::new();
    let delivery = super::Delivery { value: CopyValue::from_slice(b"x"), bid: None };
    sched.deliver(super::Entry { aid: 1, entry: 0x100, parameter: 0, delivery: Some(delivery) });
    sched.deliver(super::Entry { aid: 1, entry: 0x100, parameter: 0, delivery: Some(delivery) });
    assert_eq!(sched.len(), 2);
}

#[test]
fn output_with_two_bound_inputs_fans_out_in_bind_order() {
    let mut rig = TestRig::new();
    let producer = rig.user_automaton();
    let consumer = rig.user_automaton();

    let output = ActionRef::new(producer, T_EMIT, 0);
    rig.kernel.registry.bind(output, ActionRef::new(consumer, T_SINK, 1), producer).unwrap();
    rig.kernel.registry.bind(output, ActionRef::new(consumer, T_SINK, 2), producer).unwrap();

    let bid = buffer::create_for(&mut rig.kernel, producer, PAGE_SIZE).unwrap();
    rig.run_action(producer, T_EMIT);
    let value = CopyValue::from_slice(&42u64.to_le_bytes()).unwrap();
    dispatch::complete(&mut rig.kernel, Finish::nothing().with_value(value).with_buffer(bid))
        .unwrap();

    let entries: alloc::vec::Vec<super::Entry> =
        rig.kernel.sched.entries().copied().collect();
    assert_eq!(entries.len(), 2);
    assert_eq!(entries[0].parameter, 1);
    assert_eq!(entries[1].parameter, 2);
    for entry in &entries {
        assert_eq!(entry.aid, consumer);
        assert_eq!(entry.entry, T_SINK);
        let delivery = entry.delivery.as_ref().unwrap();
        assert_eq!(delivery.value.unwrap().as_slice(), 42u64.to_le_bytes());
        assert!(delivery.bid.is_some());
    }
    // Two receivers of one firing get distinct descriptors to the same
    // buffer; the producer keeps its own.
    assert_ne!(entries[0].delivery.unwrap().bid, entries[1].delivery.unwrap().bid);
    let id = rig.kernel.registry.get(producer).unwrap().buffer(bid).unwrap();
    assert_eq!(rig.kernel.buffers.get(id).unwrap().refcount(), 3);
    assert!(buffer::refcounts_consistent(&rig.kernel));
}

#[test]
fn deliveries_enqueue_before_later_work_of_the_producer() {
    let mut rig = TestRig::new();
    let producer = rig.user_automaton();
    let consumer = rig.user_automaton();
    let output = ActionRef::new(producer, T_EMIT, 0);
    rig.kernel.registry.bind(output, ActionRef::new(consumer, T_SINK, 0), producer).unwrap();

    rig.run_action(producer, T_EMIT);
    let value = CopyValue::from_slice(&7u64.to_le_bytes()).unwrap();
    let finish = Finish::then(T_POKE, 0).with_value(value);
    dispatch::complete(&mut rig.kernel, finish).unwrap();

    // The delivery fed by this firing runs before anything the producer
    // lined up for itself.
    let positions: alloc::vec::Vec<(i32, usize)> =
        rig.kernel.sched.entries().map(|entry| (entry.aid, entry.entry)).collect();
    assert_eq!(positions, [(consumer, T_SINK), (producer, T_POKE)]);
}

#[test]
fn unbound_output_delivers_nothing() {
    let mut rig = TestRig::new();
    let producer = rig.user_automaton();
    let bid = buffer::create_for(&mut rig.kernel, producer, PAGE_SIZE).unwrap();
    let id = rig.kernel.registry.get(producer).unwrap().buffer(bid).unwrap();
    let free = rig.kernel.mm.pool.free_frames();

    rig.run_action(producer, T_EMIT);
    dispatch::complete(&mut rig.kernel, Finish::nothing().with_buffer(bid)).unwrap();

    assert!(rig.kernel.sched.is_empty());
    assert_eq!(rig.kernel.mm.pool.free_frames(), free);
    assert_eq!(rig.kernel.buffers.get(id).unwrap().refcount(), 1);
    // The buffer never closed; the producer can still grow it.
    assert!(buffer::grow_for(&mut rig.kernel, producer, bid, 1).is_ok());
}

#[test]
fn internal_actions_deliver_nothing_even_with_a_value() {
    let mut rig = TestRig::new();
    let producer = rig.user_automaton();
    let consumer = rig.user_automaton();
    let output = ActionRef::new(producer, T_EMIT, 0);
    rig.kernel.registry.bind(output, ActionRef::new(consumer, T_SINK, 0), producer).unwrap();

    rig.run_action(producer, T_POKE);
    let value = CopyValue::from_slice(b"ignored!").unwrap();
    dispatch::complete(&mut rig.kernel, Finish::nothing().with_value(value)).unwrap();
    assert!(rig.kernel.sched.is_empty());
}

#[test]
fn finish_schedules_the_successor_on_self() {
    let mut rig = TestRig::new();
    let aid = rig.user_automaton();
    rig.run_action(aid, T_INIT);
    dispatch::complete(&mut rig.kernel, Finish::then(T_POKE, 3)).unwrap();
    let entry = rig.kernel.sched.take_next().unwrap();
    assert_eq!((entry.aid, entry.entry, entry.parameter), (aid, T_POKE, 3));
}

#[test]
fn finish_with_a_foreign_successor_is_dropped() {
    let mut rig = TestRig::new();
    let aid = rig.user_automaton();
    rig.run_action(aid, T_INIT);
    dispatch::complete(&mut rig.kernel, Finish::then(0xBAD, 0)).unwrap();
    assert!(rig.kernel.sched.is_empty());
    // An input is not schedulable either.
    rig.run_action(aid, T_INIT);
    dispatch::complete(&mut rig.kernel, Finish::then(T_SINK, 0)).unwrap();
    assert!(rig.kernel.sched.is_empty());
}

#[test]
fn step_runs_system_actions_inline() {
    let mut rig = TestRig::new();
    // The rig leaves the system automaton's init pending.
    assert!(matches!(dispatch::step(&mut rig.kernel), dispatch::Step::Completed));
}

#[test]
fn step_hands_user_entries_back() {
    let mut rig = TestRig::new();
    rig.drain();
    let aid = rig.user_automaton();
    match dispatch::step(&mut rig.kernel) {
        dispatch::Step::EnterUser(entry) => {
            assert_eq!(entry.aid, aid);
            assert_eq!(entry.entry, T_INIT);
        }
        _ => panic!("expected a user entry"),
    }
    assert_eq!(rig.kernel.sched.current_aid(), Some(aid));
}

#[test]
fn user_frame_carries_the_delivered_value() {
    let mut rig = TestRig::new();
    let producer = rig.user_automaton();
    let consumer = rig.user_automaton();
    let output = ActionRef::new(producer, T_EMIT, 0);
    rig.kernel.registry.bind(output, ActionRef::new(consumer, T_SINK, 9), producer).unwrap();

    rig.run_action(producer, T_EMIT);
    let value = CopyValue::from_slice(&0xDEAD_BEEFu64.to_le_bytes()).unwrap();
    dispatch::complete(&mut rig.kernel, Finish::nothing().with_value(value)).unwrap();

    let entry = rig.kernel.sched.take_next().unwrap();
    let frame = dispatch::prepare_user_frame(&rig.kernel, &entry).unwrap();
    assert_eq!(frame.entry, T_SINK);

    // Read back the argument frame: ret, parameter, value ptr, value
    // size, bid.
    let automaton = rig.kernel.registry.get(consumer).unwrap();
    let mut words = [0u8; 20];
    assert!(automaton.space.read_bytes(rig.kernel.mm.phys, frame.esp, &mut words));
    let parameter = i32::from_le_bytes(words[4..8].try_into().unwrap());
    let value_ptr = u32::from_le_bytes(words[8..12].try_into().unwrap());
    let value_size = u32::from_le_bytes(words[12..16].try_into().unwrap());
    let bid = i32::from_le_bytes(words[16..20].try_into().unwrap());
    assert_eq!(parameter, 9);
    assert_eq!(value_size, 8);
    assert_eq!(bid, -1);

    let mut payload = [0u8; 8];
    assert!(automaton.space.read_bytes(
        rig.kernel.mm.phys,
        crate::mm::VirtAddr::new(value_ptr as usize),
        &mut payload
    ));
    assert_eq!(payload, 0xDEAD_BEEFu64.to_le_bytes());
}
