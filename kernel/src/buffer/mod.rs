//! Buffer subsystem
//!
//! [`store`] holds the reference-counted containers; this module layers
//! the per-automaton view on top: bid resolution, mapping into address
//! spaces and the open/closed discipline around transfers. These are the
//! semantics behind the `buffer_*` syscalls.

extern crate alloc;

pub mod store;


pub use store::{Bid, Buffer, BufferId, BufferStore};

use alloc::vec::Vec;

use crate::{
    error::{BufferError, Result},
    mm::{Frame, VirtAddr, PAGE_SIZE},
    registry::{Aid, Privilege},
    state::Kernel,
};

/// Allocate a buffer for `aid` and hand back its descriptor.
pub fn create_for(kernel: &mut Kernel, aid: Aid, bytes: usize) -> Result<Bid> {
    let id = kernel.buffers.create(&mut kernel.mm, bytes)?;
    let automaton = kernel.registry.require_mut(aid)?;
    Ok(automaton.publish_buffer(id))
}

/// `copy`: new buffer over a substring of an existing one.
pub fn copy_for(kernel: &mut Kernel, aid: Aid, bid: Bid, offset: usize, length: usize) -> Result<Bid> {
    let automaton = kernel.registry.require_mut(aid)?;
    let src = automaton.buffer(bid).ok_or(BufferError::UnknownBuffer { bid })?;
    let id = kernel.buffers.copy(src, offset, length, bid)?;
    Ok(automaton.publish_buffer(id))
}

/// `grow`: extend by whole pages; returns the previous size.
pub fn grow_for(kernel: &mut Kernel, aid: Aid, bid: Bid, pages: usize) -> Result<usize> {
    let automaton = kernel.registry.require_mut(aid)?;
    let id = automaton.buffer(bid).ok_or(BufferError::UnknownBuffer { bid })?;
    Ok(kernel.buffers.grow(&mut kernel.mm, id, pages, bid)?)
}

/// `append`: splice a window of `src` onto the tail of `dst`.
pub fn append_for(
    kernel: &mut Kernel,
    aid: Aid,
    dst_bid: Bid,
    src_bid: Bid,
    offset: usize,
    length: usize,
) -> Result<usize> {
    let automaton = kernel.registry.require_mut(aid)?;
    let dst = automaton.buffer(dst_bid).ok_or(BufferError::UnknownBuffer { bid: dst_bid })?;
    let src = automaton.buffer(src_bid).ok_or(BufferError::UnknownBuffer { bid: src_bid })?;
    Ok(kernel.buffers.append(&mut kernel.mm, dst, src, offset, length, dst_bid, src_bid)?)
}

/// `assign`: in-place overwrite. The destination must be mapped by the
/// caller; that mapping is also what guarantees the pages are private.
pub fn assign_for(
    kernel: &mut Kernel,
    aid: Aid,
    dst_bid: Bid,
    dst_offset: usize,
    src_bid: Bid,
    src_offset: usize,
    length: usize,
) -> Result<()> {
    let automaton = kernel.registry.require_mut(aid)?;
    let dst = automaton.buffer(dst_bid).ok_or(BufferError::UnknownBuffer { bid: dst_bid })?;
    let src = automaton.buffer(src_bid).ok_or(BufferError::UnknownBuffer { bid: src_bid })?;
    if automaton.mapping(dst_bid).is_none() {
        return Err(BufferError::NotMapped { bid: dst_bid }.into());
    }
    let phys = kernel.mm.phys;
    Ok(kernel.buffers.assign(phys, dst, dst_offset, src, src_offset, length, dst_bid, src_bid)?)
}

/// `map`: place the buffer's pages into the caller's address space.
/// Mapping twice returns the same address. Mapping privatizes shared
/// chunks first, so a mapped buffer never aliases another's pages.
pub fn map_for(kernel: &mut Kernel, aid: Aid, bid: Bid) -> Result<VirtAddr> {
    let automaton = kernel.registry.require_mut(aid)?;
    let id = automaton.buffer(bid).ok_or(BufferError::UnknownBuffer { bid })?;
    if let Some(addr) = automaton.mapping(bid) {
        return Ok(addr);
    }
    let (size, closed) = match kernel.buffers.get(id) {
        Some(buffer) => (buffer.size(), buffer.is_closed()),
        None => return Err(BufferError::UnknownBuffer { bid }.into()),
    };
    if size == 0 {
        return Err(BufferError::ZeroSized { bid }.into());
    }
    if closed && !kernel.buffers.is_pending_receiver(id, aid, bid) {
        return Err(BufferError::Closed { bid }.into());
    }

    kernel.buffers.privatize(&mut kernel.mm, id, bid)?;

    let addr = automaton.space.reserve(size).map_err(crate::error::KernelError::from)?;
    let user = automaton.privilege == Privilege::Ring3;
    let frames: Vec<Frame> = match kernel.buffers.get(id) {
        Some(buffer) => buffer.frames().collect(),
        None => return Err(BufferError::UnknownBuffer { bid }.into()),
    };
    for (index, frame) in frames.iter().enumerate() {
        kernel.mm.pool.incref(*frame);
        if let Err(err) =
            automaton.space.map(&mut kernel.mm, addr.add(index * PAGE_SIZE), *frame, user, true)
        {
            // Unwind the partial mapping before surfacing the error.
            kernel.mm.pool.decref(*frame);
            for (done, frame) in frames.iter().enumerate().take(index) {
                let _ = automaton.space.unmap_page(&mut kernel.mm, addr.add(done * PAGE_SIZE));
                kernel.mm.pool.decref(*frame);
            }
            let _ = automaton.space.unreserve(addr);
            return Err(err);
        }
    }

    kernel.buffers.note_mapped(id);
    kernel.buffers.acknowledge_receiver(id, aid, bid);
    automaton.mapped.insert(bid, addr);
    Ok(addr)
}

/// `unmap`: drop the caller's mapping and the per-page references.
pub fn unmap_for(kernel: &mut Kernel, aid: Aid, bid: Bid) -> Result<()> {
    let automaton = kernel.registry.require_mut(aid)?;
    let id = automaton.buffer(bid).ok_or(BufferError::UnknownBuffer { bid })?;
    let addr = automaton.mapped.remove(&bid).ok_or(BufferError::NotMapped { bid })?;
    let pages = kernel.buffers.get(id).map_or(0, |buffer| buffer.size() / PAGE_SIZE);
    let _ = automaton.space.unreserve(addr);
    for index in 0..pages {
        if let Some(frame) = automaton.space.unmap_page(&mut kernel.mm, addr.add(index * PAGE_SIZE))
        {
            kernel.mm.pool.decref(frame);
        }
    }
    kernel.buffers.note_unmapped(id);
    Ok(())
}

/// `destroy`: drop the caller's reference, unmapping first if needed.
pub fn destroy_for(kernel: &mut Kernel, aid: Aid, bid: Bid) -> Result<()> {
    let needs_unmap = {
        let automaton = kernel.registry.require(aid)?;
        if automaton.buffer(bid).is_none() {
            return Err(BufferError::UnknownBuffer { bid }.into());
        }
        automaton.mapping(bid).is_some()
    };
    if needs_unmap {
        unmap_for(kernel, aid, bid)?;
    }
    let automaton = kernel.registry.require_mut(aid)?;
    if let Some(id) = automaton.forget_buffer(bid) {
        kernel.buffers.acknowledge_receiver(id, aid, bid);
        kernel.buffers.release(&mut kernel.mm, id);
    }
    Ok(())
}

/// `size`: bytes, or an error for unknown descriptors.
pub fn size_for(kernel: &Kernel, aid: Aid, bid: Bid) -> Result<usize> {
    let automaton = kernel.registry.require(aid)?;
    let id = automaton.buffer(bid).ok_or(BufferError::UnknownBuffer { bid })?;
    match kernel.buffers.get(id) {
        Some(buffer) => Ok(buffer.size()),
        None => Err(BufferError::UnknownBuffer { bid }.into()),
    }
}

/// Re-publish a buffer into `receiver`'s descriptor table as part of a
/// finish transfer. The producer keeps its own descriptor; the buffer
/// stays closed until the receiver maps or destroys the new one.
pub fn transfer_to(kernel: &mut Kernel, id: BufferId, receiver: Aid) -> Option<Bid> {
    let automaton = kernel.registry.get_mut(receiver)?;
    kernel.buffers.add_ref(id);
    let bid = automaton.publish_buffer(id);
    kernel.buffers.mark_in_transit(id, receiver, bid);
    Some(bid)
}

/// Test oracle for the refcount invariant: every live buffer's count
/// equals its bid-table references plus its implied-set memberships.
#[cfg(test)]
pub fn refcounts_consistent(kernel: &Kernel) -> bool {
    for id in kernel.buffers.ids() {
        let buffer = match kernel.buffers.get(id) {
            Some(buffer) => buffer,
            None => return false,
        };
        let bid_refs: usize = kernel
            .registry
            .aids()
            .filter_map(|aid| kernel.registry.get(aid))
            .map(|automaton| automaton.buffers().filter(|(_, b)| *b == id).count())
            .sum();
        let implied_refs: usize = kernel
            .buffers
            .ids()
            .filter_map(|other| kernel.buffers.get(other))
            .filter(|other| other.implied().contains(&id))
            .count();
        if buffer.refcount() as usize != bid_refs + implied_refs {
            return false;
        }
    }
    true
}
