//! Action executor
//!
//! Drives the invocation protocol: pop an entry, execute the action at
//! its ring, and on finish deliver any produced value to the inputs
//! bound to the output triple. Ring-0 actions are direct calls to their
//! kernel handlers; ring-3 actions are entered through a crafted
//! interrupt-return frame and come back through the finish trap.

extern crate alloc;

use alloc::vec::Vec;

use super::{Delivery, Entry, Finish};
use crate::{
    buffer,
    error::Result,
    mm::VirtAddr,
    registry::{ActionKind, ActionRef, Privilege, MAX_COPY_VALUE},
    state::Kernel,
};

/// Outcome of processing one ready-queue entry.
pub enum Step {
    /// Queue was empty.
    Idle,
    /// A ring-0 action ran to completion (handler + finish).
    Completed,
    /// A ring-3 entry is current; the caller must enter user mode with
    /// the prepared frame (bare metal) or emulate the body (tests).
    EnterUser(Entry),
}

/// Pop the next entry. Ring-0 actions execute on the spot; ring-3
/// entries are handed back for the cross-ring jump.
pub fn step(kernel: &mut Kernel) -> Step {
    loop {
        let Some(entry) = kernel.sched.take_next() else {
            return Step::Idle;
        };
        let Some(automaton) = kernel.registry.get(entry.aid) else {
            // The automaton died between enqueue and dispatch.
            kernel.sched.clear_current();
            continue;
        };
        let Some(descriptor) = automaton.action(entry.entry) else {
            kernel.sched.clear_current();
            continue;
        };
        match (automaton.privilege, descriptor.handler) {
            (Privilege::Ring0, Some(handler)) => {
                let finish = handler(kernel, entry.parameter, entry.delivery.as_ref());
                // A handler may have destroyed its own automaton; then
                // the current entry is already gone and finish is moot.
                if kernel.sched.current().is_some() {
                    let _ = complete(kernel, finish);
                }
                return Step::Completed;
            }
            _ => return Step::EnterUser(entry),
        }
    }
}

/// Finish processing for the current entry.
///
/// Schedules the action's successor on its own automaton, and for an
/// output that produced a value walks the bound inputs: the copy value
/// travels by value, the buffer by re-publication into each receiver's
/// descriptor table with a reference-count increment. Each input is
/// enqueued at the tail.
pub fn complete(kernel: &mut Kernel, finish: Finish) -> Result<()> {
    let Some(current) = kernel.sched.clear_current() else {
        return Ok(());
    };

    deliver_produced_value(kernel, &current, &finish);

    // The successor enqueues after the deliveries: inputs fed by this
    // firing run before any later action of the producer.
    if let Some((entry, parameter)) = finish.next {
        // The successor must be a schedulable action the automaton owns;
        // finish itself never fails, so a bad successor is dropped.
        let schedulable = kernel
            .registry
            .action_of(current.aid, entry)
            .is_some_and(|descriptor| descriptor.kind != ActionKind::Input);
        if schedulable {
            kernel.sched.schedule(current.aid, entry, parameter);
        } else {
            log::warn!(
                "automaton {} finished with unschedulable successor {:#x}",
                current.aid,
                entry
            );
        }
    }
    Ok(())
}

fn deliver_produced_value(kernel: &mut Kernel, current: &Entry, finish: &Finish) {
    let Some(descriptor) = kernel.registry.action_of(current.aid, current.entry) else {
        return;
    };
    if descriptor.kind != ActionKind::Output {
        return;
    }

    // Clamp the produced value to the declared shape.
    let value = if descriptor.copy_size > 0 { finish.value } else { None };
    let buffer_id = if descriptor.has_buffer {
        finish.buffer.and_then(|bid| {
            kernel.registry.get(current.aid).and_then(|automaton| automaton.buffer(bid))
        })
    } else {
        None
    };
    if value.is_none() && buffer_id.is_none() {
        // An output that fired without producing delivers nothing.
        return;
    }

    let output = ActionRef::new(current.aid, current.entry, current.parameter);
    let inputs: Vec<_> = kernel.registry.bindings.inputs_for(output).to_vec();
    for binding in inputs {
        let bid = buffer_id.and_then(|id| buffer::transfer_to(kernel, id, binding.input.aid));
        kernel.sched.deliver(Entry {
            aid: binding.input.aid,
            entry: binding.input.entry,
            parameter: binding.input.parameter,
            delivery: Some(Delivery { value, bid }),
        });
    }
}

/// The argument frame a user action starts with, cdecl order:
/// `action(parameter, value_ptr, value_size, bid)`. The copy value is
/// spilled onto the fresh stack just above the frame.
pub struct UserFrame {
    pub esp: VirtAddr,
    pub entry: usize,
}

/// Lay out the stack for a user-mode invocation of `entry`. The stack
/// is the automaton's fixed stack; nothing from earlier invocations
/// survives there.
pub fn prepare_user_frame(kernel: &Kernel, entry: &Entry) -> Option<UserFrame> {
    let automaton = kernel.registry.get(entry.aid)?;
    let top = automaton.stack_pointer;
    let phys = kernel.mm.phys;

    let (value_ptr, value_size, after_value) = match entry.delivery.as_ref().and_then(|d| d.value)
    {
        Some(value) => {
            let spill = VirtAddr::new((top.raw() - MAX_COPY_VALUE) & !0xF);
            if !automaton.space.write_bytes(phys, spill, value.as_slice()) {
                return None;
            }
            (spill.raw(), value.len(), spill)
        }
        None => (0, 0, top),
    };
    let bid = entry.delivery.as_ref().and_then(|d| d.bid).unwrap_or(-1);

    // Fake return address, then the four arguments right to left.
    let words: [u32; 5] = [
        0,
        entry.parameter as u32,
        value_ptr as u32,
        value_size as u32,
        bid as u32,
    ];
    let esp = VirtAddr::new(after_value.raw() - core::mem::size_of_val(&words));
    let mut bytes = [0u8; 20];
    for (chunk, word) in bytes.chunks_exact_mut(4).zip(words) {
        chunk.copy_from_slice(&word.to_le_bytes());
    }
    if !automaton.space.write_bytes(phys, esp, &bytes) {
        return None;
    }
    Some(UserFrame { esp, entry: entry.entry })
}

/// Record one timer tick: bump the count the `pit_out` output publishes
/// and schedule its firing. Consecutive ticks before the output runs
/// coalesce into one firing carrying the latest count.
pub fn record_timer_tick(kernel: &mut Kernel) {
    kernel.plane.ticks += 1;
    kernel.sched.schedule(
        crate::registry::SYSTEM_AID,
        crate::spawn::actions::PIT_OUT,
        0,
    );
}

/// Timer trap entry.
#[cfg(target_os = "none")]
pub fn timer_tick() {
    record_timer_tick(&mut crate::kernel().lock());
}

/// A user action faulted beyond repair; tear its automaton down.
#[cfg(target_os = "none")]
pub fn destroy_current() {
    let mut kernel = crate::kernel().lock();
    if let Some(aid) = kernel.sched.current_aid() {
        crate::registry::destroy_automaton(&mut kernel, aid);
    }
}

/// The dispatcher loop. Runs ring-0 entries inline; for ring-3 entries
/// switches address spaces, resets the kernel stack and drops to user
/// mode. Never returns: a running action comes back through the finish
/// trap, which calls here again.
#[cfg(target_os = "none")]
pub fn run() -> ! {
    use crate::arch;

    loop {
        arch::disable_interrupts();
        let prepared = {
            let mut kernel = crate::kernel().lock();
            match step(&mut kernel) {
                Step::Idle => None,
                Step::Completed => continue,
                Step::EnterUser(entry) => {
                    let frame = prepare_user_frame(&kernel, &entry);
                    let target = kernel.registry.get(entry.aid).map(|automaton| {
                        (
                            automaton.space.page_dir().physical_address(),
                            automaton.privilege == Privilege::Ring0,
                        )
                    });
                    match frame.zip(target) {
                        Some((frame, (dir, ring0))) => Some((frame, dir, ring0)),
                        None => {
                            // Unusable stack: fatal to the automaton.
                            log::error!(
                                "cannot build invocation frame for automaton {}",
                                entry.aid
                            );
                            crate::registry::destroy_automaton(&mut kernel, entry.aid);
                            continue;
                        }
                    }
                }
            }
        };

        match prepared {
            None => arch::wait_for_interrupt(),
            Some((frame, dir, ring0)) => {
                arch::switch_address_space(dir);
                arch::x86::gdt::set_kernel_stack(crate::state::kernel_stack_top() as u32);
                // SAFETY: frame.esp/entry are valid in the address space
                // just activated; the kernel stack was reset above.
                unsafe {
                    if ring0 {
                        arch::x86::trap::enter_ring0(frame.entry as u32, frame.esp.raw() as u32)
                    } else {
                        arch::x86::trap::enter_ring3(frame.entry as u32, frame.esp.raw() as u32)
                    }
                }
            }
        }
    }
}
