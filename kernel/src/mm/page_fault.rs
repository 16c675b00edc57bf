//! Page-fault policy
//!
//! A not-present data access inside a data area is demand-paged: allocate
//! a frame, map it with the area's attributes, zero it, resume. Anything
//! else is fatal to the offending automaton; the kernel halts only when
//! the system automaton itself faults.

use bitflags::bitflags;

use super::{page_align_down, VirtAddr};
use crate::{
    registry::{self, SYSTEM_AID},
    state::Kernel,
    AreaKind,
};

bitflags! {
    /// x86 page-fault error code bits.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct FaultError: u32 {
        const PROTECTION  = 1 << 0;
        const WRITE       = 1 << 1;
        const USER        = 1 << 2;
        const RESERVED    = 1 << 3;
        const INSTRUCTION = 1 << 4;
    }
}

/// What the trap layer should do after the fault was examined.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FaultOutcome {
    /// The faulting access was backed; resume the action.
    Resumed,
    /// The fault was fatal to the automaton, which is gone. Dispatch the
    /// next ready entry.
    AutomatonDestroyed,
    /// The system automaton (or boot code) faulted; halt.
    Fatal,
}

/// Locking wrapper used by the trap stub.
pub fn handle(
    kernel: &spin::Mutex<Kernel>,
    addr: usize,
    error: u32,
    from_user: bool,
) -> FaultOutcome {
    handle_fault(&mut kernel.lock(), addr, error, from_user)
}

/// Examine a fault at `addr` raised by the currently executing action.
pub fn handle_fault(
    kernel: &mut Kernel,
    addr: usize,
    error: u32,
    _from_user: bool,
) -> FaultOutcome {
    let error = FaultError::from_bits_truncate(error);
    let page = VirtAddr::new(page_align_down(addr));

    let Some(aid) = kernel.sched.current_aid() else {
        log::error!("page fault at {addr:#x} with no action executing");
        return FaultOutcome::Fatal;
    };

    let Some(automaton) = kernel.registry.get_mut(aid) else {
        log::error!("page fault in unregistered automaton {aid}");
        return FaultOutcome::Fatal;
    };

    let area = automaton.space.area_containing(page).copied();
    let backed = match area {
        Some(area)
            if area.kind == AreaKind::Data
                && !error.contains(FaultError::PROTECTION)
                && !error.contains(FaultError::INSTRUCTION) =>
        {
            match kernel.mm.pool.alloc() {
                Ok(frame) => {
                    if automaton
                        .space
                        .map(&mut kernel.mm, page, frame, area.user, area.writable)
                        .is_ok()
                    {
                        kernel.mm.phys.zero_frame(frame);
                        true
                    } else {
                        kernel.mm.pool.decref(frame);
                        false
                    }
                }
                Err(_) => {
                    log::error!("no frame for demand page at {page:?} in automaton {aid}");
                    false
                }
            }
        }
        _ => false,
    };

    if backed {
        return FaultOutcome::Resumed;
    }

    if aid == SYSTEM_AID {
        log::error!("system automaton faulted at {addr:#x} ({error:?})");
        return FaultOutcome::Fatal;
    }

    log::warn!("fault at {addr:#x} ({error:?}) is fatal to automaton {aid}");
    registry::destroy_automaton(kernel, aid);
    FaultOutcome::AutomatonDestroyed
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mm::PAGE_SIZE;
    use crate::test_util::TestRig;

    #[test]
    fn data_fault_is_demand_paged_and_zeroed() {
        let mut rig = TestRig::new();
        let aid = rig.user_automaton();
        let base = {
            let auto = rig.kernel.registry.get_mut(aid).unwrap();
            auto.space.alloc(16 * PAGE_SIZE).unwrap()
        };
        rig.run_as(aid);

        let outcome = handle_fault(&mut rig.kernel, base.raw() + 5, FaultError::WRITE.bits(), true);
        assert_eq!(outcome, FaultOutcome::Resumed);

        let auto = rig.kernel.registry.get(aid).unwrap();
        let frame = auto.space.translate(rig.kernel.mm.phys, base).unwrap();
        assert!(!rig.kernel.mm.pool.is_free(frame));
        let mut byte = [0xAAu8];
        rig.kernel.mm.phys.read_frame(frame, 5, &mut byte);
        assert_eq!(byte[0], 0);
    }

    #[test]
    fn second_page_gets_its_own_frame() {
        let mut rig = TestRig::new();
        let aid = rig.user_automaton();
        let base = {
            let auto = rig.kernel.registry.get_mut(aid).unwrap();
            auto.space.alloc(16 * PAGE_SIZE).unwrap()
        };
        rig.run_as(aid);

        handle_fault(&mut rig.kernel, base.raw(), FaultError::WRITE.bits(), true);
        handle_fault(&mut rig.kernel, base.raw() + 15 * PAGE_SIZE, FaultError::WRITE.bits(), true);

        let auto = rig.kernel.registry.get(aid).unwrap();
        let first = auto.space.translate(rig.kernel.mm.phys, base).unwrap();
        let second =
            auto.space.translate(rig.kernel.mm.phys, base.add(15 * PAGE_SIZE)).unwrap();
        assert_ne!(first, second);
    }

    #[test]
    fn fault_outside_any_area_destroys_the_automaton() {
        let mut rig = TestRig::new();
        let aid = rig.user_automaton();
        rig.run_as(aid);
        let outcome = handle_fault(&mut rig.kernel, 0xDEAD_0000, FaultError::USER.bits(), true);
        assert_eq!(outcome, FaultOutcome::AutomatonDestroyed);
        assert!(rig.kernel.registry.get(aid).is_none());
    }

    #[test]
    fn instruction_fetch_fault_is_not_demand_paged() {
        let mut rig = TestRig::new();
        let aid = rig.user_automaton();
        let base = {
            let auto = rig.kernel.registry.get_mut(aid).unwrap();
            auto.space.alloc(PAGE_SIZE).unwrap()
        };
        rig.run_as(aid);
        let outcome = handle_fault(
            &mut rig.kernel,
            base.raw(),
            (FaultError::INSTRUCTION | FaultError::USER).bits(),
            true,
        );
        assert_eq!(outcome, FaultOutcome::AutomatonDestroyed);
    }

    #[test]
    fn teardown_returns_demand_paged_frames() {
        let mut rig = TestRig::new();
        let aid = rig.user_automaton();
        let base = {
            let auto = rig.kernel.registry.get_mut(aid).unwrap();
            auto.space.alloc(16 * PAGE_SIZE).unwrap()
        };
        rig.run_as(aid);
        let free_before = rig.kernel.mm.pool.free_frames();
        handle_fault(&mut rig.kernel, base.raw(), FaultError::WRITE.bits(), true);
        handle_fault(&mut rig.kernel, base.raw() + 15 * PAGE_SIZE, FaultError::WRITE.bits(), true);
        assert_eq!(rig.kernel.mm.pool.free_frames(), free_before - 2);

        crate::registry::destroy_automaton(&mut rig.kernel, aid);
        // Both demand-paged frames (and the automaton's tables) are back.
        assert!(rig.kernel.mm.pool.free_frames() >= free_before);
    }
}
