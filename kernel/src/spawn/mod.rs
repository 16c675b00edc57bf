//! Create/bind control plane
//!
//! The system automaton's ring-0 actions. User automata submit requests
//! (create, bind, destroy, unbind) through bound inputs; authorization
//! is delegated to user-level policy automata over the `ca_*`/`ba_*`
//! channels; results travel back over auto-parameter response outputs.
//!
//! When no policy automaton is bound to a request output, the plane
//! authorizes the request itself — the permissive default the reference
//! policy automata implement.

extern crate alloc;

pub mod image;
pub mod message;


use alloc::vec::Vec;

use alloc::collections::VecDeque;

use message::{
    BindOutcome, BindRequest, BindResponse, BindRole, BindingSpec, CaRequest, CaResponse,
    ControlOutcome, ControlResponse, CreateOutcome, CreateRequest, CreateResponse, DestroyRequest,
    UnbindRequest,
};

use crate::{
    buffer::{self, Bid},
    registry::{ActionDescriptor, ActionRef, Aid, SYSTEM_AID},
    sched::{CopyValue, Delivery, Finish},
    state::Kernel,
};

/// Entry addresses of the system automaton's actions. They are dispatch
/// keys, not jump targets: ring-0 actions run through their registered
/// handlers.
pub mod actions {
    pub const INIT: usize = 0x10;
    pub const CREATE_REQUEST: usize = 0x11;
    pub const CREATE_RESPONSE: usize = 0x12;
    pub const BIND_REQUEST: usize = 0x13;
    pub const BIND_RESPONSE: usize = 0x14;
    pub const DESTROY_REQUEST: usize = 0x15;
    pub const DESTROY_RESPONSE: usize = 0x16;
    pub const UNBIND_REQUEST: usize = 0x17;
    pub const UNBIND_RESPONSE: usize = 0x18;
    pub const CA_REQUEST: usize = 0x19;
    pub const CA_RESPONSE: usize = 0x1A;
    pub const BA_REQUEST: usize = 0x1B;
    pub const BA_RESPONSE: usize = 0x1C;
    pub const PROCESS_CREATE: usize = 0x1D;
    pub const PROCESS_BIND: usize = 0x1E;
    pub const PIT_OUT: usize = 0x1F;
}

struct CreateJob {
    serial: u64,
    requester: Aid,
    request: CreateRequest,
    decision: Option<bool>,
}

struct BindJob {
    serial: u64,
    requester: Aid,
    binding: BindingSpec,
    approvals: [Option<bool>; 3],
}

impl BindJob {
    fn decided(&self) -> bool {
        self.approvals.iter().all(Option::is_some)
    }

    fn approved(&self) -> bool {
        self.approvals.iter().all(|approval| *approval == Some(true))
    }
}

/// Control-plane state, part of the kernel singleton.
pub struct ControlPlane {
    create_jobs: VecDeque<CreateJob>,
    bind_jobs: VecDeque<BindJob>,
    /// Authorization queries not yet emitted / emitted and awaiting an
    /// answer. Answers pair with the oldest outstanding query.
    ca_unsent: VecDeque<u64>,
    ca_sent: VecDeque<u64>,
    ba_unsent: VecDeque<(u64, BindRole)>,
    ba_sent: VecDeque<(u64, BindRole)>,
    create_responses: VecDeque<(Aid, CreateResponse)>,
    bind_responses: VecDeque<(Aid, BindResponse)>,
    destroy_responses: VecDeque<(Aid, ControlResponse)>,
    unbind_responses: VecDeque<(Aid, ControlResponse)>,
    /// Producer-side buffers from previous firings, reclaimed lazily at
    /// the next control-plane action.
    spent: Vec<Bid>,
    next_serial: u64,
    /// Timer ticks surfaced through `pit_out`.
    pub ticks: u64,
}

impl ControlPlane {
    pub fn new() -> Self {
        Self {
            create_jobs: VecDeque::new(),
            bind_jobs: VecDeque::new(),
            ca_unsent: VecDeque::new(),
            ca_sent: VecDeque::new(),
            ba_unsent: VecDeque::new(),
            ba_sent: VecDeque::new(),
            create_responses: VecDeque::new(),
            bind_responses: VecDeque::new(),
            destroy_responses: VecDeque::new(),
            unbind_responses: VecDeque::new(),
            spent: Vec::new(),
            next_serial: 0,
            ticks: 0,
        }
    }

    fn serial(&mut self) -> u64 {
        let serial = self.next_serial;
        self.next_serial += 1;
        serial
    }
}

impl Default for ControlPlane {
    fn default() -> Self {
        Self::new()
    }
}

/// Register the system automaton's actions. Called once by the boot glue
/// after the record exists.
pub fn register_system_actions(kernel: &mut Kernel) -> crate::error::Result<()> {
    use self::actions::*;
    use crate::registry::ActionKind::{Input, Internal, Output};
    use crate::registry::ParameterMode::{Auto, None as NoParam};

    let table: [(usize, ActionDescriptor); 16] = [
        (INIT, ActionDescriptor::new(Internal, NoParam, "init").with_handler(sa_init)),
        (
            CREATE_REQUEST,
            ActionDescriptor::new(Input, Auto, "create_request")
                .with_buffer()
                .with_handler(sa_create_request),
        ),
        (
            CREATE_RESPONSE,
            ActionDescriptor::new(Output, Auto, "create_response")
                .with_copy_value(8)
                .with_handler(sa_create_response),
        ),
        (
            BIND_REQUEST,
            ActionDescriptor::new(Input, Auto, "bind_request")
                .with_buffer()
                .with_handler(sa_bind_request),
        ),
        (
            BIND_RESPONSE,
            ActionDescriptor::new(Output, Auto, "bind_response")
                .with_copy_value(4)
                .with_handler(sa_bind_response),
        ),
        (
            DESTROY_REQUEST,
            ActionDescriptor::new(Input, Auto, "destroy_request")
                .with_buffer()
                .with_handler(sa_destroy_request),
        ),
        (
            DESTROY_RESPONSE,
            ActionDescriptor::new(Output, Auto, "destroy_response")
                .with_copy_value(4)
                .with_handler(sa_destroy_response),
        ),
        (
            UNBIND_REQUEST,
            ActionDescriptor::new(Input, Auto, "unbind_request")
                .with_buffer()
                .with_handler(sa_unbind_request),
        ),
        (
            UNBIND_RESPONSE,
            ActionDescriptor::new(Output, Auto, "unbind_response")
                .with_copy_value(4)
                .with_handler(sa_unbind_response),
        ),
        (
            CA_REQUEST,
            ActionDescriptor::new(Output, NoParam, "ca_request")
                .with_buffer()
                .with_handler(sa_ca_request),
        ),
        (
            CA_RESPONSE,
            ActionDescriptor::new(Input, NoParam, "ca_response")
                .with_buffer()
                .with_handler(sa_ca_response),
        ),
        (
            BA_REQUEST,
            ActionDescriptor::new(Output, NoParam, "ba_request")
                .with_buffer()
                .with_handler(sa_ba_request),
        ),
        (
            BA_RESPONSE,
            ActionDescriptor::new(Input, NoParam, "ba_response")
                .with_buffer()
                .with_handler(sa_ba_response),
        ),
        (
            PROCESS_CREATE,
            ActionDescriptor::new(Internal, NoParam, "process_create")
                .with_handler(sa_process_create),
        ),
        (
            PROCESS_BIND,
            ActionDescriptor::new(Internal, NoParam, "process_bind")
                .with_handler(sa_process_bind),
        ),
        (
            PIT_OUT,
            ActionDescriptor::new(Output, NoParam, "pit_out")
                .with_copy_value(8)
                .with_handler(sa_pit_out),
        ),
    ];

    let automaton = kernel.registry.require_mut(SYSTEM_AID)?;
    for (entry, descriptor) in table {
        automaton.register_action(entry, descriptor)?;
    }
    Ok(())
}

/// Reclaim buffers produced by earlier control-plane firings.
fn reap_spent(kernel: &mut Kernel) {
    let spent = core::mem::take(&mut kernel.plane.spent);
    for bid in spent {
        let _ = buffer::destroy_for(kernel, SYSTEM_AID, bid);
    }
}

/// Read and release a delivered request buffer.
fn take_request_bytes(kernel: &mut Kernel, delivery: Option<&Delivery>) -> Option<Vec<u8>> {
    let bid = delivery?.bid?;
    let id = kernel.registry.get(SYSTEM_AID)?.buffer(bid)?;
    let bytes = image::read_buffer_bytes(kernel, id);
    let _ = buffer::destroy_for(kernel, SYSTEM_AID, bid);
    bytes
}

/// Build an outbound buffer for an authorization query.
fn make_request_buffer(kernel: &mut Kernel, bytes: &[u8]) -> Option<Bid> {
    let bid = buffer::create_for(kernel, SYSTEM_AID, bytes.len()).ok()?;
    let id = kernel.registry.get(SYSTEM_AID)?.buffer(bid)?;
    kernel.buffers.write(kernel.mm.phys, id, 0, bytes, bid).ok()?;
    Some(bid)
}

fn authorizer_bound(kernel: &Kernel, entry: usize) -> bool {
    kernel
        .registry
        .bindings
        .count_for_output(ActionRef::new(SYSTEM_AID, entry, 0))
        > 0
}

fn encode_value(encode: impl FnOnce(&mut Vec<u8>)) -> Option<CopyValue> {
    let mut bytes = Vec::new();
    encode(&mut bytes);
    CopyValue::from_slice(&bytes)
}

fn sa_init(_kernel: &mut Kernel, _parameter: i32, _delivery: Option<&Delivery>) -> Finish {
    log::info!("control plane ready");
    Finish::nothing()
}

fn sa_create_request(kernel: &mut Kernel, parameter: i32, delivery: Option<&Delivery>) -> Finish {
    reap_spent(kernel);
    let requester = parameter;
    let Some(bytes) = take_request_bytes(kernel, delivery) else {
        return Finish::nothing();
    };
    let Some(request) = CreateRequest::decode(&bytes) else {
        kernel
            .plane
            .create_responses
            .push_back((requester, CreateResponse { outcome: CreateOutcome::InvalidImage, aid: -1 }));
        kernel.sched.schedule(SYSTEM_AID, actions::CREATE_RESPONSE, requester);
        return Finish::nothing();
    };

    let serial = kernel.plane.serial();
    let decision = if authorizer_bound(kernel, actions::CA_REQUEST) {
        kernel.plane.ca_unsent.push_back(serial);
        kernel.sched.schedule(SYSTEM_AID, actions::CA_REQUEST, 0);
        None
    } else {
        kernel.sched.schedule(SYSTEM_AID, actions::PROCESS_CREATE, 0);
        Some(true)
    };
    kernel.plane.create_jobs.push_back(CreateJob { serial, requester, request, decision });
    Finish::nothing()
}

fn sa_ca_request(kernel: &mut Kernel, _parameter: i32, _delivery: Option<&Delivery>) -> Finish {
    reap_spent(kernel);
    let Some(serial) = kernel.plane.ca_unsent.pop_front() else {
        return Finish::nothing();
    };
    let owner = kernel
        .plane
        .create_jobs
        .iter()
        .find(|job| job.serial == serial)
        .map(|job| job.requester)
        .unwrap_or(-1);
    let mut bytes = Vec::new();
    CaRequest { owner }.encode(&mut bytes);
    let Some(bid) = make_request_buffer(kernel, &bytes) else {
        // Query cannot be built; fall back to the local decision.
        decide_create(kernel, serial, true);
        return Finish::nothing();
    };
    kernel.plane.ca_sent.push_back(serial);
    kernel.plane.spent.push(bid);
    let mut finish = Finish::nothing().with_buffer(bid);
    if !kernel.plane.ca_unsent.is_empty() {
        finish.next = Some((actions::CA_REQUEST, 0));
    }
    finish
}

fn sa_ca_response(kernel: &mut Kernel, _parameter: i32, delivery: Option<&Delivery>) -> Finish {
    reap_spent(kernel);
    let Some(bytes) = take_request_bytes(kernel, delivery) else {
        return Finish::nothing();
    };
    let Some(response) = CaResponse::decode(&bytes) else {
        return Finish::nothing();
    };
    let Some(serial) = kernel.plane.ca_sent.pop_front() else {
        return Finish::nothing();
    };
    decide_create(kernel, serial, response.authorized);
    Finish::nothing()
}

fn decide_create(kernel: &mut Kernel, serial: u64, authorized: bool) {
    if let Some(job) =
        kernel.plane.create_jobs.iter_mut().find(|job| job.serial == serial)
    {
        job.decision = Some(authorized);
    }
    kernel.sched.schedule(SYSTEM_AID, actions::PROCESS_CREATE, 0);
}

fn sa_process_create(kernel: &mut Kernel, _parameter: i32, _delivery: Option<&Delivery>) -> Finish {
    reap_spent(kernel);
    while kernel
        .plane
        .create_jobs
        .front()
        .is_some_and(|job| job.decision.is_some())
    {
        let Some(job) = kernel.plane.create_jobs.pop_front() else {
            break;
        };
        let response = run_create_job(kernel, &job);
        kernel.plane.create_responses.push_back((job.requester, response));
        kernel.sched.schedule(SYSTEM_AID, actions::CREATE_RESPONSE, job.requester);
    }
    Finish::nothing()
}

fn run_create_job(kernel: &mut Kernel, job: &CreateJob) -> CreateResponse {
    let failure = |outcome| CreateResponse { outcome, aid: -1 };
    if job.decision != Some(true) {
        return failure(CreateOutcome::NotAuthorized);
    }

    let Some(requester) = kernel.registry.get(job.requester) else {
        // Requester died while the request was in flight; nothing to
        // answer, nothing to build.
        return failure(CreateOutcome::UnknownBuffer);
    };
    let Some(image_id) = requester.buffer(job.request.image) else {
        return failure(CreateOutcome::UnknownBuffer);
    };
    let mut init_ids = Vec::new();
    for bid in [job.request.init_a, job.request.init_b] {
        if bid < 0 {
            continue;
        }
        match requester.buffer(bid) {
            Some(id) => init_ids.push(id),
            None => return failure(CreateOutcome::UnknownBuffer),
        }
    }

    let Some(payload) = image::read_buffer_bytes(kernel, image_id) else {
        return failure(CreateOutcome::UnknownBuffer);
    };
    match image::create_automaton(
        kernel,
        job.requester,
        &payload,
        &init_ids,
        job.request.retain_privilege,
    ) {
        Ok(aid) => CreateResponse { outcome: CreateOutcome::Success, aid },
        Err(outcome) => failure(outcome),
    }
}

fn sa_create_response(kernel: &mut Kernel, parameter: i32, _delivery: Option<&Delivery>) -> Finish {
    respond_from_queue(kernel, parameter, actions::CREATE_RESPONSE, |plane| {
        &mut plane.create_responses
    })
}

fn sa_bind_request(kernel: &mut Kernel, parameter: i32, delivery: Option<&Delivery>) -> Finish {
    reap_spent(kernel);
    let requester = parameter;
    let Some(bytes) = take_request_bytes(kernel, delivery) else {
        return Finish::nothing();
    };
    let Some(request) = BindRequest::decode(&bytes) else {
        kernel
            .plane
            .bind_responses
            .push_back((requester, BindResponse { outcome: BindOutcome::UnknownAction }));
        kernel.sched.schedule(SYSTEM_AID, actions::BIND_RESPONSE, requester);
        return Finish::nothing();
    };

    let serial = kernel.plane.serial();
    let approvals = if authorizer_bound(kernel, actions::BA_REQUEST) {
        for role in BindRole::ALL {
            kernel.plane.ba_unsent.push_back((serial, role));
        }
        kernel.sched.schedule(SYSTEM_AID, actions::BA_REQUEST, 0);
        [None; 3]
    } else {
        kernel.sched.schedule(SYSTEM_AID, actions::PROCESS_BIND, 0);
        [Some(true); 3]
    };
    kernel
        .plane
        .bind_jobs
        .push_back(BindJob { serial, requester, binding: request.binding, approvals });
    Finish::nothing()
}

fn sa_ba_request(kernel: &mut Kernel, _parameter: i32, _delivery: Option<&Delivery>) -> Finish {
    reap_spent(kernel);
    let Some((serial, role)) = kernel.plane.ba_unsent.pop_front() else {
        return Finish::nothing();
    };
    let query = kernel
        .plane
        .bind_jobs
        .iter()
        .find(|job| job.serial == serial)
        .map(|job| (job.binding, job.requester));
    let Some((binding, owner)) = query else {
        return Finish::nothing();
    };
    let mut bytes = Vec::new();
    message::BaRequest { binding, owner, role }.encode(&mut bytes);
    let Some(bid) = make_request_buffer(kernel, &bytes) else {
        decide_bind(kernel, serial, role, true);
        return Finish::nothing();
    };
    kernel.plane.ba_sent.push_back((serial, role));
    kernel.plane.spent.push(bid);
    let mut finish = Finish::nothing().with_buffer(bid);
    if !kernel.plane.ba_unsent.is_empty() {
        finish.next = Some((actions::BA_REQUEST, 0));
    }
    finish
}

fn sa_ba_response(kernel: &mut Kernel, _parameter: i32, delivery: Option<&Delivery>) -> Finish {
    reap_spent(kernel);
    let Some(bytes) = take_request_bytes(kernel, delivery) else {
        return Finish::nothing();
    };
    let Some(response) = message::BaResponse::decode(&bytes) else {
        return Finish::nothing();
    };
    let Some((serial, role)) = kernel.plane.ba_sent.pop_front() else {
        return Finish::nothing();
    };
    decide_bind(kernel, serial, role, response.authorized);
    Finish::nothing()
}

fn decide_bind(kernel: &mut Kernel, serial: u64, role: BindRole, authorized: bool) {
    if let Some(job) = kernel.plane.bind_jobs.iter_mut().find(|job| job.serial == serial) {
        job.approvals[role.index()] = Some(authorized);
        if job.decided() {
            kernel.sched.schedule(SYSTEM_AID, actions::PROCESS_BIND, 0);
        }
    }
}

fn sa_process_bind(kernel: &mut Kernel, _parameter: i32, _delivery: Option<&Delivery>) -> Finish {
    reap_spent(kernel);
    while kernel.plane.bind_jobs.front().is_some_and(BindJob::decided) {
        let Some(job) = kernel.plane.bind_jobs.pop_front() else {
            break;
        };
        let outcome = run_bind_job(kernel, &job);
        // Success or failure, all three parties hear the verdict.
        let response = BindResponse { outcome };
        for party in [job.requester, job.binding.output_aid, job.binding.input_aid] {
            kernel.plane.bind_responses.push_back((party, response));
            kernel.sched.schedule(SYSTEM_AID, actions::BIND_RESPONSE, party);
        }
    }
    Finish::nothing()
}

fn run_bind_job(kernel: &mut Kernel, job: &BindJob) -> BindOutcome {
    if !job.approved() {
        return BindOutcome::NotAuthorized;
    }
    let output = ActionRef::new(
        job.binding.output_aid,
        job.binding.output_entry as usize,
        job.binding.output_parameter,
    );
    let input = ActionRef::new(
        job.binding.input_aid,
        job.binding.input_entry as usize,
        job.binding.input_parameter,
    );
    match kernel.registry.bind(output, input, job.requester) {
        Ok(_) => BindOutcome::Success,
        Err(crate::error::BindError::UnknownAutomaton { .. }) => BindOutcome::UnknownAutomaton,
        Err(crate::error::BindError::UnknownAction { .. }) => BindOutcome::UnknownAction,
        Err(crate::error::BindError::KindMismatch { .. }) => BindOutcome::KindMismatch,
        Err(crate::error::BindError::AlreadyBound) => BindOutcome::AlreadyBound,
        Err(_) => BindOutcome::NotAuthorized,
    }
}

fn sa_bind_response(kernel: &mut Kernel, parameter: i32, _delivery: Option<&Delivery>) -> Finish {
    respond_from_queue(kernel, parameter, actions::BIND_RESPONSE, |plane| {
        &mut plane.bind_responses
    })
}

fn sa_destroy_request(kernel: &mut Kernel, parameter: i32, delivery: Option<&Delivery>) -> Finish {
    reap_spent(kernel);
    let requester = parameter;
    let Some(bytes) = take_request_bytes(kernel, delivery) else {
        return Finish::nothing();
    };
    let outcome = match DestroyRequest::decode(&bytes) {
        Some(request) => {
            let owner = kernel.registry.get(request.aid).map(|target| target.owner);
            match owner {
                Some(owner) if owner == requester => {
                    crate::registry::destroy_automaton(kernel, request.aid);
                    ControlOutcome::Success
                }
                Some(_) => ControlOutcome::NotOwner,
                None => ControlOutcome::NotFound,
            }
        }
        None => ControlOutcome::NotFound,
    };
    // The requester may have destroyed itself; only answer survivors.
    if kernel.registry.contains(requester) {
        kernel.plane.destroy_responses.push_back((requester, ControlResponse { outcome }));
        kernel.sched.schedule(SYSTEM_AID, actions::DESTROY_RESPONSE, requester);
    }
    Finish::nothing()
}

fn sa_destroy_response(kernel: &mut Kernel, parameter: i32, _delivery: Option<&Delivery>) -> Finish {
    respond_from_queue(kernel, parameter, actions::DESTROY_RESPONSE, |plane| {
        &mut plane.destroy_responses
    })
}

fn sa_unbind_request(kernel: &mut Kernel, parameter: i32, delivery: Option<&Delivery>) -> Finish {
    reap_spent(kernel);
    let requester = parameter;
    let Some(bytes) = take_request_bytes(kernel, delivery) else {
        return Finish::nothing();
    };
    let outcome = match UnbindRequest::decode(&bytes) {
        Some(request) => {
            let output = ActionRef::new(
                request.binding.output_aid,
                request.binding.output_entry as usize,
                request.binding.output_parameter,
            );
            let input = ActionRef::new(
                request.binding.input_aid,
                request.binding.input_entry as usize,
                request.binding.input_parameter,
            );
            let owner = kernel
                .registry
                .bindings
                .inputs_for(output)
                .iter()
                .find(|binding| binding.input == input)
                .map(|binding| binding.owner);
            match owner {
                Some(owner) if owner == requester => match kernel.registry.unbind(output, input) {
                    Ok(_) => ControlOutcome::Success,
                    Err(_) => ControlOutcome::NotFound,
                },
                Some(_) => ControlOutcome::NotOwner,
                None => ControlOutcome::NotFound,
            }
        }
        None => ControlOutcome::NotFound,
    };
    kernel.plane.unbind_responses.push_back((requester, ControlResponse { outcome }));
    kernel.sched.schedule(SYSTEM_AID, actions::UNBIND_RESPONSE, requester);
    Finish::nothing()
}

fn sa_unbind_response(kernel: &mut Kernel, parameter: i32, _delivery: Option<&Delivery>) -> Finish {
    respond_from_queue(kernel, parameter, actions::UNBIND_RESPONSE, |plane| {
        &mut plane.unbind_responses
    })
}

fn sa_pit_out(kernel: &mut Kernel, _parameter: i32, _delivery: Option<&Delivery>) -> Finish {
    let ticks = kernel.plane.ticks;
    match encode_value(|bytes| bytes.extend_from_slice(&ticks.to_le_bytes())) {
        Some(value) => Finish::nothing().with_value(value),
        None => Finish::nothing(),
    }
}

/// Shared body of the four response outputs: emit the oldest response
/// queued for the firing's destination, and reschedule if more wait.
fn respond_from_queue<R, F>(kernel: &mut Kernel, destination: i32, entry: usize, queue: F) -> Finish
where
    R: Encode + Copy,
    F: Fn(&mut ControlPlane) -> &mut VecDeque<(Aid, R)>,
{
    reap_spent(kernel);
    let response = {
        let pending = queue(&mut kernel.plane);
        match pending.iter().position(|(aid, _)| *aid == destination) {
            Some(index) => pending.remove(index).map(|(_, response)| response),
            None => None,
        }
    };
    let Some(response) = response else {
        return Finish::nothing();
    };
    let more = queue(&mut kernel.plane).iter().any(|(aid, _)| *aid == destination);
    let mut finish = match encode_value(|bytes| response.encode_to(bytes)) {
        Some(value) => Finish::nothing().with_value(value),
        None => Finish::nothing(),
    };
    if more {
        finish.next = Some((entry, destination));
    }
    finish
}

/// Encoding hook for response payloads.
trait Encode {
    fn encode_to(&self, out: &mut Vec<u8>);
}

impl Encode for CreateResponse {
    fn encode_to(&self, out: &mut Vec<u8>) {
        self.encode(out);
    }
}

impl Encode for BindResponse {
    fn encode_to(&self, out: &mut Vec<u8>) {
        self.encode(out);
    }
}

impl Encode for ControlResponse {
    fn encode_to(&self, out: &mut Vec<u8>) {
        self.encode(out);
    }
}
