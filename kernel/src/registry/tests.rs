//! Registry tests

use super::*;
use crate::{
    error::BindError,
    test_util::{TestRig, T_EMIT, T_INIT, T_POKE, T_SINK},
};

#[test]
fn aid_allocation_is_dense_and_skips_live_entries() {
    let mut rig = TestRig::new();
    let first = rig.user_automaton();
    let second = rig.user_automaton();
    assert_eq!(first, 1);
    assert_eq!(second, 2);

    destroy_automaton(&mut rig.kernel, first);
    let third = rig.user_automaton();
    // The cursor has moved past 2; it does not reuse 1 yet.
    assert_eq!(third, 3);
}

#[test]
fn registering_two_actions_at_one_entry_fails() {
    let mut rig = TestRig::new();
    let aid = rig.user_automaton();
    let automaton = rig.kernel.registry.get_mut(aid).unwrap();
    let descriptor =
        ActionDescriptor::new(ActionKind::Internal, ParameterMode::None, "duplicate");
    assert!(matches!(
        automaton.register_action(T_INIT, descriptor),
        Err(crate::error::KernelError::ActionExists { .. })
    ));
}

#[test]
fn oversized_copy_values_are_rejected_at_registration() {
    let mut rig = TestRig::new();
    let aid = rig.user_automaton();
    let automaton = rig.kernel.registry.get_mut(aid).unwrap();
    let descriptor = ActionDescriptor::new(ActionKind::Output, ParameterMode::None, "fat")
        .with_copy_value(MAX_COPY_VALUE + 1);
    assert!(matches!(
        automaton.register_action(0x9000, descriptor),
        Err(crate::error::KernelError::CopyValueTooLarge { .. })
    ));
}

#[test]
fn bind_checks_endpoint_kinds() {
    let mut rig = TestRig::new();
    let producer = rig.user_automaton();
    let consumer = rig.user_automaton();

    // Output side must be an output.
    assert_eq!(
        rig.kernel
            .registry
            .bind(
                ActionRef::new(producer, T_SINK, 0),
                ActionRef::new(consumer, T_SINK, 0),
                producer,
            )
            .unwrap_err(),
        BindError::KindMismatch { aid: producer, entry: T_SINK }
    );
    // Input side must be an input.
    assert_eq!(
        rig.kernel
            .registry
            .bind(
                ActionRef::new(producer, T_EMIT, 0),
                ActionRef::new(consumer, T_EMIT, 0),
                producer,
            )
            .unwrap_err(),
        BindError::KindMismatch { aid: consumer, entry: T_EMIT }
    );
}

#[test]
fn bind_rejects_value_shape_mismatch() {
    let mut rig = TestRig::new();
    let producer = rig.user_automaton();
    let consumer = rig.user_automaton();
    // emit carries copy+buffer; accept is buffer-only.
    assert!(matches!(
        rig.kernel.registry.bind(
            ActionRef::new(producer, T_EMIT, 0),
            ActionRef::new(consumer, crate::test_util::T_BUFIN, 0),
            producer,
        ),
        Err(BindError::KindMismatch { .. })
    ));
}

#[test]
fn duplicate_binding_fails() {
    let mut rig = TestRig::new();
    let producer = rig.user_automaton();
    let consumer = rig.user_automaton();
    let output = ActionRef::new(producer, T_EMIT, 3);
    let input = ActionRef::new(consumer, T_SINK, 5);
    rig.kernel.registry.bind(output, input, producer).unwrap();
    assert_eq!(
        rig.kernel.registry.bind(output, input, consumer).unwrap_err(),
        BindError::AlreadyBound
    );
    // A different parameter is a different binding.
    rig.kernel
        .registry
        .bind(output, ActionRef::new(consumer, T_SINK, 6), producer)
        .unwrap();
    assert_eq!(rig.kernel.registry.bindings.count_for_output(output), 2);
}

#[test]
fn unbind_removes_only_the_named_tuple() {
    let mut rig = TestRig::new();
    let producer = rig.user_automaton();
    let consumer = rig.user_automaton();
    let output = ActionRef::new(producer, T_EMIT, 0);
    let first = ActionRef::new(consumer, T_SINK, 1);
    let second = ActionRef::new(consumer, T_SINK, 2);
    rig.kernel.registry.bind(output, first, producer).unwrap();
    rig.kernel.registry.bind(output, second, producer).unwrap();

    rig.kernel.registry.unbind(output, first).unwrap();
    assert_eq!(rig.kernel.registry.bindings.count_for_output(output), 1);
    assert_eq!(
        rig.kernel.registry.unbind(output, first).unwrap_err(),
        BindError::UnknownBinding
    );
}

#[test]
fn destroy_cascades_to_owned_automata_and_bindings() {
    let mut rig = TestRig::new();
    let parent = rig.user_automaton();
    let child = {
        let image = TestRig::standard_image();
        crate::spawn::image::create_automaton(&mut rig.kernel, parent, &image, &[], false)
            .unwrap()
    };
    rig.kernel
        .registry
        .bind(
            ActionRef::new(child, T_EMIT, 0),
            ActionRef::new(parent, T_SINK, 0),
            parent,
        )
        .unwrap();
    rig.kernel.sched.schedule(child, T_POKE, 0);

    destroy_automaton(&mut rig.kernel, parent);

    assert!(rig.kernel.registry.get(parent).is_none());
    assert!(rig.kernel.registry.get(child).is_none());
    assert!(rig.kernel.registry.bindings.is_empty());
    // No ready-queue entry may survive its automaton.
    assert!(rig.kernel.sched.entries().all(|entry| {
        rig.kernel
            .registry
            .action_of(entry.aid, entry.entry)
            .is_some()
    }));
}

#[test]
fn destroy_returns_every_frame() {
    let mut rig = TestRig::new();
    let baseline = rig.kernel.mm.pool.free_frames();
    let aid = rig.user_automaton();
    assert!(rig.kernel.mm.pool.free_frames() < baseline);
    destroy_automaton(&mut rig.kernel, aid);
    assert_eq!(rig.kernel.mm.pool.free_frames(), baseline);
}

#[test]
fn auto_parameter_endpoints_resolve_to_the_counterparty() {
    let mut rig = TestRig::new();
    let consumer = rig.user_automaton();
    // The system automaton's create_response output is auto-parameter.
    let (output, input) = rig
        .kernel
        .registry
        .bind(
            ActionRef::new(SYSTEM_AID, crate::spawn::actions::CREATE_RESPONSE, 99),
            ActionRef::new(consumer, crate::test_util::T_RES, 7),
            consumer,
        )
        .unwrap();
    // The requested output parameter is overridden with the input's aid.
    assert_eq!(output.parameter, consumer);
    // The input is plain-parameterized and keeps its parameter.
    assert_eq!(input.parameter, 7);
}
