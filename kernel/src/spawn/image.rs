//! Automaton materialization
//!
//! Turns an image archive into a live automaton: address space laid out
//! from the ELF program headers, declared actions registered, init
//! buffers published, init action enqueued. Nothing is left behind on
//! failure; either the whole automaton exists or none of it does.

extern crate alloc;

use alloc::vec::Vec;

use super::message::CreateOutcome;
use crate::{
    buffer::BufferId,
    cpio::CpioArchive,
    elf::{ActionNote, Image},
    mm::{page_align_down, page_align_up, AddressSpace, AreaKind, VirtAddr, VmArea, KERNEL_BASE, PAGE_SIZE},
    registry::{ActionDescriptor, ActionKind, Aid, Automaton, ParameterMode, Privilege},
    state::Kernel,
};

/// User automata may not map at or above the kernel window.
pub const USER_CEILING: usize = KERNEL_BASE;

/// Pages eagerly mapped under the fixed stack pointer.
pub const USER_STACK_PAGES: usize = 4;

/// Materialize an automaton from a create payload.
///
/// The payload is a CPIO archive whose first regular member is the ELF32
/// image; a bare ELF image is accepted for the boot path. Init buffers
/// are published into the fresh descriptor table in order, so an init
/// action finds them as descriptors 0 and 1.
pub fn create_automaton(
    kernel: &mut Kernel,
    owner: Aid,
    payload: &[u8],
    init_buffers: &[BufferId],
    retain_privilege: bool,
) -> Result<Aid, CreateOutcome> {
    let elf_bytes = extract_image(payload).ok_or(CreateOutcome::InvalidImage)?;
    let image = Image::parse(elf_bytes).map_err(|_| CreateOutcome::InvalidImage)?;
    let segments = image.segments().map_err(|_| CreateOutcome::InvalidImage)?;
    let notes = image.action_notes().map_err(|_| CreateOutcome::InvalidImage)?;
    if notes.is_empty() {
        return Err(CreateOutcome::InvalidImage);
    }

    let owner_privilege = match kernel.registry.get(owner) {
        Some(automaton) => automaton.privilege,
        None => return Err(CreateOutcome::InvalidImage),
    };
    let privilege = if retain_privilege && owner_privilege == Privilege::Ring0 {
        Privilege::Ring0
    } else {
        Privilege::Ring3
    };
    let user = privilege == Privilege::Ring3;

    let mut space =
        match AddressSpace::create(&mut kernel.mm, VirtAddr::new(USER_CEILING), user) {
            Ok(space) => space,
            Err(_) => return Err(CreateOutcome::OutOfMemory),
        };

    match load_segments(kernel, &mut space, &segments, user) {
        Ok(()) => {}
        Err(outcome) => {
            space.teardown(&mut kernel.mm);
            return Err(outcome);
        }
    }

    let stack_top = VirtAddr::new(USER_CEILING);
    let stack_begin = VirtAddr::new(USER_CEILING - USER_STACK_PAGES * PAGE_SIZE);
    let stack = VmArea::new(AreaKind::Stack, stack_begin, stack_top, user, true);
    if space.insert_area(stack).is_err() {
        space.teardown(&mut kernel.mm);
        return Err(CreateOutcome::InvalidImage);
    }
    for page in 0..USER_STACK_PAGES {
        let addr = stack_begin.add(page * PAGE_SIZE);
        let frame = match kernel.mm.pool.alloc() {
            Ok(frame) => frame,
            Err(_) => {
                space.teardown(&mut kernel.mm);
                return Err(CreateOutcome::OutOfMemory);
            }
        };
        kernel.mm.phys.zero_frame(frame);
        if space.map(&mut kernel.mm, addr, frame, user, true).is_err() {
            kernel.mm.pool.decref(frame);
            space.teardown(&mut kernel.mm);
            return Err(CreateOutcome::OutOfMemory);
        }
    }

    let aid =
        kernel.registry.insert(|aid| Automaton::new(aid, privilege, space, stack_top, owner));

    if let Err(outcome) = register_actions(kernel, aid, &notes) {
        crate::registry::destroy_automaton(kernel, aid);
        return Err(outcome);
    }

    // The init entry must be a declared, schedulable action.
    let init_ok = kernel
        .registry
        .action_of(aid, image.entry())
        .is_some_and(|descriptor| descriptor.kind != ActionKind::Input);
    if !init_ok {
        crate::registry::destroy_automaton(kernel, aid);
        return Err(CreateOutcome::InvalidImage);
    }

    for id in init_buffers {
        kernel.buffers.add_ref(*id);
        if let Some(automaton) = kernel.registry.get_mut(aid) {
            automaton.publish_buffer(*id);
        }
    }

    if let Some(automaton) = kernel.registry.get_mut(owner) {
        automaton.owned.insert(aid);
    }

    kernel.sched.schedule(aid, image.entry(), 0);
    log::info!("automaton {aid} created (owner {owner}, {privilege:?})");
    Ok(aid)
}

/// The ELF bytes inside a create payload.
fn extract_image(payload: &[u8]) -> Option<&[u8]> {
    if CpioArchive::is_cpio(payload) {
        return CpioArchive::new(payload)
            .find(|file| file.is_regular() && !file.data.is_empty())
            .map(|file| file.data);
    }
    payload.starts_with(&[0x7F, b'E', b'L', b'F']).then_some(payload)
}

fn load_segments(
    kernel: &mut Kernel,
    space: &mut AddressSpace,
    segments: &[crate::elf::Segment<'_>],
    user: bool,
) -> Result<(), CreateOutcome> {
    for segment in segments {
        let begin = page_align_down(segment.vaddr);
        let end = page_align_up(segment.vaddr + segment.memsz);
        let kind = if segment.is_executable() {
            AreaKind::Text
        } else if segment.is_writable() {
            AreaKind::Data
        } else {
            AreaKind::Rodata
        };
        let area = VmArea::new(
            kind,
            VirtAddr::new(begin),
            VirtAddr::new(end),
            user,
            segment.is_writable(),
        );
        if space.insert_area(area).is_err() {
            return Err(CreateOutcome::InvalidImage);
        }

        for page_base in (begin..end).step_by(PAGE_SIZE) {
            let frame = kernel.mm.pool.alloc().map_err(|_| CreateOutcome::OutOfMemory)?;
            kernel.mm.phys.zero_frame(frame);
            // Copy the file bytes that land in this page.
            let file_begin = segment.vaddr.max(page_base);
            let file_end = (segment.vaddr + segment.data.len()).min(page_base + PAGE_SIZE);
            if file_begin < file_end {
                let bytes = &segment.data[file_begin - segment.vaddr..file_end - segment.vaddr];
                kernel.mm.phys.write_frame(frame, file_begin - page_base, bytes);
            }
            if space
                .map(&mut kernel.mm, VirtAddr::new(page_base), frame, user, segment.is_writable())
                .is_err()
            {
                kernel.mm.pool.decref(frame);
                return Err(CreateOutcome::OutOfMemory);
            }
        }
    }
    Ok(())
}

fn register_actions(
    kernel: &mut Kernel,
    aid: Aid,
    notes: &[ActionNote],
) -> Result<(), CreateOutcome> {
    for note in notes {
        let kind = match note.kind {
            0 => ActionKind::Input,
            1 => ActionKind::Output,
            2 => ActionKind::Internal,
            _ => return Err(CreateOutcome::InvalidImage),
        };
        let mode = match note.parameter_mode {
            0 => ParameterMode::None,
            1 => ParameterMode::Parameter,
            2 => ParameterMode::Auto,
            _ => return Err(CreateOutcome::InvalidImage),
        };
        let mut descriptor =
            ActionDescriptor::new(kind, mode, &note.name).with_copy_value(note.copy_size);
        if note.has_buffer {
            descriptor = descriptor.with_buffer();
        }
        let Some(automaton) = kernel.registry.get_mut(aid) else {
            return Err(CreateOutcome::InvalidImage);
        };
        if automaton.register_action(note.entry, descriptor).is_err() {
            return Err(CreateOutcome::InvalidImage);
        }
    }
    Ok(())
}

/// Collect the whole content of a buffer into kernel memory.
pub fn read_buffer_bytes(kernel: &Kernel, id: BufferId) -> Option<Vec<u8>> {
    let size = kernel.buffers.get(id)?.size();
    let mut bytes = alloc::vec![0u8; size];
    kernel.buffers.read(kernel.mm.phys, id, 0, &mut bytes, -1).ok()?;
    Some(bytes)
}
