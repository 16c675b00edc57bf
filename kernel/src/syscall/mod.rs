//! System-call surface
//!
//! Numbered calls raised through `int 0x80` with the number in `eax` and
//! up to five register arguments. `finish` consumes the remaining five
//! registers as (next entry, next parameter, value pointer, value size,
//! bid); the buffer size the original interface also carried is derivable
//! and dropped. Errors come back as the stable negative codes of
//! [`SyscallError`]; `buffer_size` alone returns `-1` for an unknown
//! descriptor, as specified.

extern crate alloc;

#[cfg(test)]
mod tests;

use alloc::vec::Vec;

use crate::{
    buffer,
    error::{SchedError, SyscallError},
    mm::{page_align_up, VirtAddr, PAGE_SIZE},
    registry::{ActionKind, ActionRef, Aid},
    sched::{dispatch, CopyValue, Finish},
    state::Kernel,
};

/// System call numbers.
#[repr(usize)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Syscall {
    Finish = 0,
    Schedule = 1,
    GetPageSize = 2,
    Sbrk = 3,
    BindingCount = 4,
    BufferCreate = 5,
    BufferCopy = 6,
    BufferGrow = 7,
    BufferAppend = 8,
    BufferAssign = 9,
    BufferMap = 10,
    BufferUnmap = 11,
    BufferDestroy = 12,
    BufferSize = 13,
    Remove = 14,
    Describe = 15,
}

impl TryFrom<usize> for Syscall {
    type Error = ();

    fn try_from(value: usize) -> core::result::Result<Self, ()> {
        Ok(match value {
            0 => Syscall::Finish,
            1 => Syscall::Schedule,
            2 => Syscall::GetPageSize,
            3 => Syscall::Sbrk,
            4 => Syscall::BindingCount,
            5 => Syscall::BufferCreate,
            6 => Syscall::BufferCopy,
            7 => Syscall::BufferGrow,
            8 => Syscall::BufferAppend,
            9 => Syscall::BufferAssign,
            10 => Syscall::BufferMap,
            11 => Syscall::BufferUnmap,
            12 => Syscall::BufferDestroy,
            13 => Syscall::BufferSize,
            14 => Syscall::Remove,
            15 => Syscall::Describe,
            _ => return Err(()),
        })
    }
}

/// Raw trap-register view of a syscall.
#[derive(Debug, Clone, Copy)]
pub struct SyscallArgs {
    pub number: usize,
    pub arg1: usize,
    pub arg2: usize,
    pub arg3: usize,
    pub arg4: usize,
    pub arg5: usize,
}

/// What the trap layer does after the call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyscallOutcome {
    /// Write the value into the caller's eax and resume the action.
    Return(isize),
    /// The action finished; dispatch the next entry instead.
    Finished,
}

/// Locking wrapper used by the trap stub.
pub fn handle(kernel: &spin::Mutex<Kernel>, args: SyscallArgs) -> SyscallOutcome {
    dispatch_syscall(&mut kernel.lock(), args)
}

/// Decode and run one syscall on behalf of the current action.
pub fn dispatch_syscall(kernel: &mut Kernel, args: SyscallArgs) -> SyscallOutcome {
    let Some(aid) = kernel.sched.current_aid() else {
        return SyscallOutcome::Return(SyscallError::InvalidSyscall as isize);
    };
    let Ok(number) = Syscall::try_from(args.number) else {
        return SyscallOutcome::Return(SyscallError::InvalidSyscall as isize);
    };

    match number {
        Syscall::Finish => {
            let finish = decode_finish(kernel, aid, &args);
            // Finish never fails; a malformed record degrades to "no
            // successor, no value".
            let _ = dispatch::complete(kernel, finish);
            SyscallOutcome::Finished
        }
        Syscall::Schedule => SyscallOutcome::Return(sys_schedule(
            kernel,
            aid,
            args.arg1,
            args.arg2 as i32,
        )),
        Syscall::GetPageSize => SyscallOutcome::Return(PAGE_SIZE as isize),
        Syscall::Sbrk => SyscallOutcome::Return(sys_sbrk(kernel, aid, args.arg1 as isize)),
        Syscall::BindingCount => SyscallOutcome::Return(sys_binding_count(
            kernel,
            aid,
            args.arg1,
            args.arg2 as i32,
        )),
        Syscall::BufferCreate => SyscallOutcome::Return(
            buffer::create_for(kernel, aid, args.arg1)
                .map_or_else(errno, |bid| bid as isize),
        ),
        Syscall::BufferCopy => SyscallOutcome::Return(
            buffer::copy_for(kernel, aid, args.arg1 as i32, args.arg2, args.arg3)
                .map_or_else(errno, |bid| bid as isize),
        ),
        Syscall::BufferGrow => SyscallOutcome::Return(
            buffer::grow_for(kernel, aid, args.arg1 as i32, args.arg2)
                .map_or_else(errno, |previous| previous as isize),
        ),
        Syscall::BufferAppend => SyscallOutcome::Return(
            buffer::append_for(
                kernel,
                aid,
                args.arg1 as i32,
                args.arg2 as i32,
                args.arg3,
                args.arg4,
            )
            .map_or_else(errno, |size| size as isize),
        ),
        Syscall::BufferAssign => SyscallOutcome::Return(
            buffer::assign_for(
                kernel,
                aid,
                args.arg1 as i32,
                args.arg2,
                args.arg3 as i32,
                args.arg4,
                args.arg5,
            )
            .map_or_else(errno, |()| 0),
        ),
        Syscall::BufferMap => SyscallOutcome::Return(
            buffer::map_for(kernel, aid, args.arg1 as i32)
                .map_or_else(errno, |addr| addr.raw() as isize),
        ),
        Syscall::BufferUnmap => SyscallOutcome::Return(
            buffer::unmap_for(kernel, aid, args.arg1 as i32).map_or_else(errno, |()| 0),
        ),
        Syscall::BufferDestroy => SyscallOutcome::Return(
            buffer::destroy_for(kernel, aid, args.arg1 as i32).map_or_else(errno, |()| 0),
        ),
        Syscall::BufferSize => SyscallOutcome::Return(
            buffer::size_for(kernel, aid, args.arg1 as i32).map_or(-1, |size| size as isize),
        ),
        Syscall::Remove => {
            kernel.sched.remove(aid, args.arg1, args.arg2 as i32);
            SyscallOutcome::Return(0)
        }
        Syscall::Describe => SyscallOutcome::Return(sys_describe(kernel, aid, args.arg1 as Aid)),
    }
}

fn errno<E: Into<SyscallError>>(err: E) -> isize {
    err.into() as isize
}

fn decode_finish(kernel: &mut Kernel, aid: Aid, args: &SyscallArgs) -> Finish {
    let next = if args.arg1 != 0 { Some((args.arg1, args.arg2 as i32)) } else { None };
    let value = if args.arg3 != 0 && args.arg4 > 0 && args.arg4 <= crate::registry::MAX_COPY_VALUE
    {
        read_user_value(kernel, aid, VirtAddr::new(args.arg3), args.arg4)
    } else {
        None
    };
    let bid = args.arg5 as i32;
    Finish { next, value, buffer: (bid >= 0).then_some(bid) }
}

fn read_user_value(kernel: &Kernel, aid: Aid, addr: VirtAddr, len: usize) -> Option<CopyValue> {
    let automaton = kernel.registry.get(aid)?;
    let mut bytes = [0u8; crate::registry::MAX_COPY_VALUE];
    if !automaton.space.read_bytes(kernel.mm.phys, addr, &mut bytes[..len]) {
        return None;
    }
    CopyValue::from_slice(&bytes[..len])
}

fn sys_schedule(kernel: &mut Kernel, aid: Aid, entry: usize, parameter: i32) -> isize {
    let Some(descriptor) = kernel.registry.action_of(aid, entry) else {
        return errno(SchedError::NotOwned { aid, entry });
    };
    if descriptor.kind == ActionKind::Input {
        return errno(SchedError::NotSchedulable { entry });
    }
    kernel.sched.schedule(aid, entry, parameter);
    0
}

/// Move the program break. Growth extends the trailing data area (new
/// pages are demand-backed); shrinking only moves the break.
fn sys_sbrk(kernel: &mut Kernel, aid: Aid, delta: isize) -> isize {
    let Some(automaton) = kernel.registry.get_mut(aid) else {
        return errno(SyscallError::NotFound);
    };
    let old = match automaton.space.brk() {
        Some(brk) => brk,
        None => {
            // First call establishes the break at a fresh data page.
            let size = page_align_up(delta.unsigned_abs().max(1));
            match automaton.space.alloc(size) {
                Ok(base) => {
                    automaton.space.set_brk(if delta > 0 {
                        base.add(delta as usize)
                    } else {
                        base
                    });
                    return base.raw() as isize;
                }
                Err(err) => return errno(err),
            }
        }
    };
    if delta > 0 {
        let new_brk = VirtAddr::new(old.raw() + delta as usize);
        if let Err(err) = automaton.space.extend_data_area(old, new_brk.align_up()) {
            return errno(err);
        }
        automaton.space.set_brk(new_brk);
    } else if delta < 0 {
        let back = delta.unsigned_abs().min(old.raw());
        automaton.space.set_brk(VirtAddr::new(old.raw() - back));
    }
    old.raw() as isize
}

fn sys_binding_count(kernel: &Kernel, aid: Aid, entry: usize, parameter: i32) -> isize {
    let Some(descriptor) = kernel.registry.action_of(aid, entry) else {
        return 0;
    };
    let reference = ActionRef::new(aid, entry, parameter);
    match descriptor.kind {
        ActionKind::Output => kernel.registry.bindings.count_for_output(reference) as isize,
        ActionKind::Input => kernel.registry.bindings.count_for_input(reference) as isize,
        ActionKind::Internal => 0,
    }
}

/// Build the caller a buffer holding the serialized action table of the
/// named automaton: u32 count, then per action (kind, parameter mode,
/// number, entry, copy size, buffer flag, name length, name bytes,
/// zero-padded to a 4-byte boundary).
fn sys_describe(kernel: &mut Kernel, caller: Aid, target: Aid) -> isize {
    let Some(automaton) = kernel.registry.get(target) else {
        return errno(SyscallError::NotFound);
    };

    let mut bytes: Vec<u8> = Vec::new();
    bytes.extend_from_slice(&(automaton.action_count() as u32).to_le_bytes());
    let mut actions: Vec<_> = automaton.actions().collect();
    actions.sort_by_key(|(_, descriptor)| descriptor.number);
    for (entry, descriptor) in actions {
        let kind = match descriptor.kind {
            ActionKind::Input => 0u32,
            ActionKind::Output => 1,
            ActionKind::Internal => 2,
        };
        let mode = match descriptor.parameter_mode {
            crate::registry::ParameterMode::None => 0u32,
            crate::registry::ParameterMode::Parameter => 1,
            crate::registry::ParameterMode::Auto => 2,
        };
        bytes.extend_from_slice(&kind.to_le_bytes());
        bytes.extend_from_slice(&mode.to_le_bytes());
        bytes.extend_from_slice(&descriptor.number.to_le_bytes());
        bytes.extend_from_slice(&(entry as u32).to_le_bytes());
        bytes.extend_from_slice(&(descriptor.copy_size as u32).to_le_bytes());
        bytes.extend_from_slice(&u32::from(descriptor.has_buffer).to_le_bytes());
        bytes.extend_from_slice(&(descriptor.name.len() as u32).to_le_bytes());
        bytes.extend_from_slice(descriptor.name.as_bytes());
        while bytes.len() % 4 != 0 {
            bytes.push(0);
        }
    }

    let id = match kernel.buffers.create(&mut kernel.mm, bytes.len()) {
        Ok(id) => id,
        Err(err) => return errno(err),
    };
    let bid_for_error = -1;
    if kernel.buffers.write(kernel.mm.phys, id, 0, &bytes, bid_for_error).is_err() {
        kernel.buffers.release(&mut kernel.mm, id);
        return errno(SyscallError::InvalidArgument);
    }
    match kernel.registry.get_mut(caller) {
        Some(automaton) => automaton.publish_buffer(id) as isize,
        None => errno(SyscallError::NotFound),
    }
}
