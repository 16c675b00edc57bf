//! The buffer store
//!
//! Buffers are page-granular chunk lists over pool frames. Copy and
//! append share chunks structurally (O(chunks), never O(bytes)); mapping
//! privatizes shared chunks, which is what makes a mapped buffer's pages
//! exclusively its own. Each chunk records the buffer that allocated its
//! frame; referencing a foreign chunk puts its owner into the referencing
//! buffer's implied set, and implied membership holds a reference count.

extern crate alloc;

use alloc::collections::BTreeSet;
use alloc::vec::Vec;

use hashbrown::{HashMap, HashSet};

use crate::{
    error::BufferError,
    mm::{page_align_down, page_align_up, Frame, MemoryManager, PhysMap, PAGE_SIZE},
    registry::Aid,
};

/// Per-automaton buffer descriptor.
pub type Bid = i32;

/// Store-wide buffer identity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct BufferId(u32);

#[derive(Debug, Clone, Copy)]
struct Chunk {
    frame: Frame,
    /// The buffer whose allocation this frame belongs to. Foreign owners
    /// are kept alive through the implied set.
    owner: BufferId,
}

/// One reference-counted byte container.
pub struct Buffer {
    size: usize,
    rc: u32,
    chunks: Vec<Chunk>,
    /// Owners of foreign chunks in `chunks`, transitively live. Always
    /// acyclic: a chunk whose owner could reach this buffer is copied
    /// instead of shared (see `append`).
    implied: BTreeSet<BufferId>,
    /// Number of automata currently mapping this buffer.
    map_count: u32,
    /// Receivers of an in-flight transfer that have not yet mapped or
    /// destroyed their delivered descriptor. Non-empty = closed.
    pending: Vec<(Aid, Bid)>,
}

impl Buffer {
    pub fn size(&self) -> usize {
        self.size
    }

    pub fn refcount(&self) -> u32 {
        self.rc
    }

    pub fn is_mapped(&self) -> bool {
        self.map_count > 0
    }

    pub fn is_closed(&self) -> bool {
        !self.pending.is_empty()
    }

    pub fn implied(&self) -> &BTreeSet<BufferId> {
        &self.implied
    }

    pub fn frames(&self) -> impl Iterator<Item = Frame> + '_ {
        self.chunks.iter().map(|chunk| chunk.frame)
    }

    fn pages(&self) -> usize {
        self.chunks.len()
    }
}

/// The process-wide buffer store.
pub struct BufferStore {
    buffers: HashMap<BufferId, Buffer>,
    next: u32,
}

impl BufferStore {
    pub fn new() -> Self {
        Self { buffers: HashMap::new(), next: 0 }
    }

    pub fn get(&self, id: BufferId) -> Option<&Buffer> {
        self.buffers.get(&id)
    }

    pub fn len(&self) -> usize {
        self.buffers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buffers.is_empty()
    }

    pub fn ids(&self) -> impl Iterator<Item = BufferId> + '_ {
        self.buffers.keys().copied()
    }

    fn fresh_id(&mut self) -> BufferId {
        let id = BufferId(self.next);
        self.next = self.next.wrapping_add(1);
        id
    }

    /// Allocate a buffer of `bytes` rounded up to whole pages, zeroed.
    /// Size may be zero. The buffer starts with reference count 1.
    pub fn create(&mut self, mm: &mut MemoryManager, bytes: usize) -> Result<BufferId, BufferError> {
        let size = page_align_up(bytes);
        let id = self.fresh_id();
        let mut chunks: Vec<Chunk> = Vec::with_capacity(size / PAGE_SIZE);
        for _ in 0..size / PAGE_SIZE {
            let frame = match mm.pool.alloc() {
                Ok(frame) => frame,
                Err(_) => {
                    for chunk in &chunks {
                        mm.pool.decref(chunk.frame);
                    }
                    return Err(BufferError::OutOfMemory);
                }
            };
            mm.phys.zero_frame(frame);
            chunks.push(Chunk { frame, owner: id });
        }
        self.buffers.insert(
            id,
            Buffer { size, rc: 1, chunks, implied: BTreeSet::new(), map_count: 0, pending: Vec::new() },
        );
        Ok(id)
    }

    /// New buffer over the substring `[offset, offset + length)` of
    /// `src`, with the window aligned outward to page boundaries. Chunks
    /// are shared; no bytes move.
    pub fn copy(
        &mut self,
        src: BufferId,
        offset: usize,
        length: usize,
        bid: Bid,
    ) -> Result<BufferId, BufferError> {
        let (first, count) = {
            let buffer = self.require(src, bid)?;
            window(buffer.size, offset, length)?
        };
        let id = self.fresh_id();
        let mut chunks = Vec::with_capacity(count);
        let mut implied = BTreeSet::new();
        {
            let buffer = &self.buffers[&src];
            for chunk in &buffer.chunks[first..first + count] {
                chunks.push(*chunk);
                if chunk.owner != id {
                    implied.insert(chunk.owner);
                }
            }
        }
        for owner in &implied {
            if let Some(target) = self.buffers.get_mut(owner) {
                target.rc += 1;
            }
        }
        self.buffers.insert(
            id,
            Buffer {
                size: count * PAGE_SIZE,
                rc: 1,
                chunks,
                implied,
                map_count: 0,
                pending: Vec::new(),
            },
        );
        Ok(id)
    }

    /// Extend an open, unmapped buffer by `pages` fresh zeroed pages.
    /// Returns the size before growth.
    pub fn grow(
        &mut self,
        mm: &mut MemoryManager,
        id: BufferId,
        pages: usize,
        bid: Bid,
    ) -> Result<usize, BufferError> {
        let buffer = self.require(id, bid)?;
        if buffer.is_mapped() {
            return Err(BufferError::Mapped { bid });
        }
        if buffer.is_closed() {
            return Err(BufferError::Closed { bid });
        }
        let previous = buffer.size;
        let mut fresh = Vec::with_capacity(pages);
        for _ in 0..pages {
            let frame = match mm.pool.alloc() {
                Ok(frame) => frame,
                Err(_) => {
                    for frame in fresh {
                        mm.pool.decref(frame);
                    }
                    return Err(BufferError::OutOfMemory);
                }
            };
            mm.phys.zero_frame(frame);
            fresh.push(frame);
        }
        let buffer = self.buffers.get_mut(&id).ok_or(BufferError::UnknownBuffer { bid })?;
        buffer.chunks.extend(fresh.into_iter().map(|frame| Chunk { frame, owner: id }));
        buffer.size += pages * PAGE_SIZE;
        Ok(previous)
    }

    /// Append the aligned window of `src` onto the tail of `dst`. Chunks
    /// are shared except where sharing would make the implied relation
    /// cyclic; those are copied onto fresh frames. Returns the new size.
    pub fn append(
        &mut self,
        mm: &mut MemoryManager,
        dst: BufferId,
        src: BufferId,
        offset: usize,
        length: usize,
        dst_bid: Bid,
        src_bid: Bid,
    ) -> Result<usize, BufferError> {
        {
            let buffer = self.require(dst, dst_bid)?;
            if buffer.is_mapped() {
                return Err(BufferError::Mapped { bid: dst_bid });
            }
            if buffer.is_closed() {
                return Err(BufferError::Closed { bid: dst_bid });
            }
        }
        let (first, count) = {
            let buffer = self.require(src, src_bid)?;
            window(buffer.size, offset, length)?
        };

        let shared: Vec<Chunk> = self.buffers[&src].chunks[first..first + count].to_vec();
        let mut appended: Vec<Chunk> = Vec::with_capacity(count);
        let mut new_members = BTreeSet::new();
        for chunk in shared {
            if chunk.owner == dst || self.implies_transitively(chunk.owner, dst) {
                // Sharing would create a cycle; pay the copy now.
                let frame = match mm.pool.alloc() {
                    Ok(frame) => frame,
                    Err(_) => {
                        for copied in appended.iter().filter(|chunk| chunk.owner == dst) {
                            mm.pool.decref(copied.frame);
                        }
                        return Err(BufferError::OutOfMemory);
                    }
                };
                mm.phys.copy_frame(frame, chunk.frame);
                appended.push(Chunk { frame, owner: dst });
            } else {
                appended.push(chunk);
                new_members.insert(chunk.owner);
            }
        }

        for owner in &new_members {
            let newly = {
                let buffer = self.buffers.get_mut(&dst).ok_or(BufferError::UnknownBuffer {
                    bid: dst_bid,
                })?;
                buffer.implied.insert(*owner)
            };
            if newly {
                if let Some(target) = self.buffers.get_mut(owner) {
                    target.rc += 1;
                }
            }
        }

        let buffer = self.buffers.get_mut(&dst).ok_or(BufferError::UnknownBuffer { bid: dst_bid })?;
        buffer.chunks.extend(appended);
        buffer.size += count * PAGE_SIZE;
        Ok(buffer.size)
    }

    /// In-place byte overwrite. The caller has verified that it maps
    /// `dst`; same-buffer calls require the ranges to be identical (then
    /// this is a no-op) or disjoint.
    pub fn assign(
        &mut self,
        phys: PhysMap,
        dst: BufferId,
        dst_offset: usize,
        src: BufferId,
        src_offset: usize,
        length: usize,
        dst_bid: Bid,
        src_bid: Bid,
    ) -> Result<(), BufferError> {
        {
            let buffer = self.require(dst, dst_bid)?;
            if dst_offset + length > buffer.size {
                return Err(BufferError::OutOfRange { offset: dst_offset, length });
            }
        }
        {
            let buffer = self.require(src, src_bid)?;
            if src_offset + length > buffer.size {
                return Err(BufferError::OutOfRange { offset: src_offset, length });
            }
        }
        if dst == src {
            if dst_offset == src_offset {
                return Ok(());
            }
            let no_overlap =
                dst_offset + length <= src_offset || src_offset + length <= dst_offset;
            if !no_overlap {
                return Err(BufferError::Overlap);
            }
        }

        let mut copied = 0;
        while copied < length {
            let doff = dst_offset + copied;
            let soff = src_offset + copied;
            let dst_frame = self.buffers[&dst].chunks[doff / PAGE_SIZE].frame;
            let src_frame = self.buffers[&src].chunks[soff / PAGE_SIZE].frame;
            let run = (PAGE_SIZE - doff % PAGE_SIZE)
                .min(PAGE_SIZE - soff % PAGE_SIZE)
                .min(length - copied);
            // SAFETY: both frames are live managed frames and the ranges
            // are in-bounds; disjointness was established above.
            unsafe {
                core::ptr::copy_nonoverlapping(
                    phys.frame_ptr(src_frame).add(soff % PAGE_SIZE),
                    phys.frame_ptr(dst_frame).add(doff % PAGE_SIZE),
                    run,
                );
            }
            copied += run;
        }
        Ok(())
    }

    /// Give the buffer exclusive ownership of every page before it is
    /// mapped: foreign and aliased chunks are copied onto fresh frames
    /// and the implied references are dropped.
    pub fn privatize(&mut self, mm: &mut MemoryManager, id: BufferId, bid: Bid) -> Result<(), BufferError> {
        let count = self.require(id, bid)?.chunks.len();
        let mut seen: HashSet<Frame> = HashSet::new();
        for index in 0..count {
            let chunk = self.buffers[&id].chunks[index];
            let needs_copy = chunk.owner != id || !seen.insert(chunk.frame);
            if needs_copy {
                let frame = mm.pool.alloc().map_err(|_| BufferError::OutOfMemory)?;
                mm.phys.copy_frame(frame, chunk.frame);
                seen.insert(frame);
                if let Some(buffer) = self.buffers.get_mut(&id) {
                    buffer.chunks[index] = Chunk { frame, owner: id };
                }
            }
        }
        let implied = {
            let buffer = self.buffers.get_mut(&id).ok_or(BufferError::UnknownBuffer { bid })?;
            core::mem::take(&mut buffer.implied)
        };
        for member in implied {
            self.release(mm, member);
        }
        Ok(())
    }

    pub fn note_mapped(&mut self, id: BufferId) {
        if let Some(buffer) = self.buffers.get_mut(&id) {
            buffer.map_count += 1;
        }
    }

    pub fn note_unmapped(&mut self, id: BufferId) {
        if let Some(buffer) = self.buffers.get_mut(&id) {
            debug_assert!(buffer.map_count > 0);
            buffer.map_count = buffer.map_count.saturating_sub(1);
        }
    }

    /// Take one more reference (bid-table publication).
    pub fn add_ref(&mut self, id: BufferId) {
        if let Some(buffer) = self.buffers.get_mut(&id) {
            buffer.rc += 1;
        }
    }

    /// Record an in-flight transfer: the buffer closes until every
    /// receiver has mapped or destroyed its descriptor.
    pub fn mark_in_transit(&mut self, id: BufferId, receiver: Aid, bid: Bid) {
        if let Some(buffer) = self.buffers.get_mut(&id) {
            buffer.pending.push((receiver, bid));
        }
    }

    /// A receiver mapped or destroyed its delivered descriptor.
    pub fn acknowledge_receiver(&mut self, id: BufferId, receiver: Aid, bid: Bid) {
        if let Some(buffer) = self.buffers.get_mut(&id) {
            if let Some(index) =
                buffer.pending.iter().position(|entry| *entry == (receiver, bid))
            {
                buffer.pending.remove(index);
            }
        }
    }

    /// Whether `(receiver, bid)` is an outstanding delivery of `id`.
    pub fn is_pending_receiver(&self, id: BufferId, receiver: Aid, bid: Bid) -> bool {
        self.get(id).is_some_and(|buffer| buffer.pending.contains(&(receiver, bid)))
    }

    /// Drop one reference; at zero the chunks this buffer owns return to
    /// the pool and its implied references unwind (possibly cascading).
    pub fn release(&mut self, mm: &mut MemoryManager, id: BufferId) {
        let mut stack: Vec<BufferId> = alloc::vec![id];
        while let Some(id) = stack.pop() {
            let Some(buffer) = self.buffers.get_mut(&id) else {
                continue;
            };
            debug_assert!(buffer.rc > 0);
            buffer.rc -= 1;
            if buffer.rc > 0 {
                continue;
            }
            let Some(buffer) = self.buffers.remove(&id) else {
                continue;
            };
            let mut seen: HashSet<Frame> = HashSet::new();
            for chunk in &buffer.chunks {
                if chunk.owner == id && seen.insert(chunk.frame) {
                    mm.pool.decref(chunk.frame);
                }
            }
            stack.extend(buffer.implied.iter().copied());
        }
    }

    /// Copy bytes out of a buffer (kernel-side access, no mapping).
    pub fn read(
        &self,
        phys: PhysMap,
        id: BufferId,
        offset: usize,
        out: &mut [u8],
        bid: Bid,
    ) -> Result<(), BufferError> {
        let buffer = self.require(id, bid)?;
        if offset + out.len() > buffer.size {
            return Err(BufferError::OutOfRange { offset, length: out.len() });
        }
        let mut copied = 0;
        while copied < out.len() {
            let pos = offset + copied;
            let frame = buffer.chunks[pos / PAGE_SIZE].frame;
            let run = (PAGE_SIZE - pos % PAGE_SIZE).min(out.len() - copied);
            phys.read_frame(frame, pos % PAGE_SIZE, &mut out[copied..copied + run]);
            copied += run;
        }
        Ok(())
    }

    /// Copy bytes into a buffer the kernel just built (all chunks owned).
    pub fn write(
        &mut self,
        phys: PhysMap,
        id: BufferId,
        offset: usize,
        bytes: &[u8],
        bid: Bid,
    ) -> Result<(), BufferError> {
        let buffer = self.require(id, bid)?;
        if offset + bytes.len() > buffer.size {
            return Err(BufferError::OutOfRange { offset, length: bytes.len() });
        }
        debug_assert!(buffer.chunks.iter().all(|chunk| chunk.owner == id));
        let mut copied = 0;
        while copied < bytes.len() {
            let pos = offset + copied;
            let frame = buffer.chunks[pos / PAGE_SIZE].frame;
            let run = (PAGE_SIZE - pos % PAGE_SIZE).min(bytes.len() - copied);
            phys.write_frame(frame, pos % PAGE_SIZE, &bytes[copied..copied + run]);
            copied += run;
        }
        Ok(())
    }

    fn require(&self, id: BufferId, bid: Bid) -> Result<&Buffer, BufferError> {
        self.buffers.get(&id).ok_or(BufferError::UnknownBuffer { bid })
    }

    /// Whether `target` is reachable from `from` through implied sets.
    fn implies_transitively(&self, from: BufferId, target: BufferId) -> bool {
        let mut stack = alloc::vec![from];
        let mut seen: HashSet<BufferId> = HashSet::new();
        while let Some(id) = stack.pop() {
            if id == target {
                return true;
            }
            if !seen.insert(id) {
                continue;
            }
            if let Some(buffer) = self.buffers.get(&id) {
                stack.extend(buffer.implied.iter().copied());
            }
        }
        false
    }
}

impl Default for BufferStore {
    fn default() -> Self {
        Self::new()
    }
}

/// Page-align a byte window outward; `(first_page, page_count)`.
fn window(size: usize, offset: usize, length: usize) -> Result<(usize, usize), BufferError> {
    if length == 0 {
        if offset > size {
            return Err(BufferError::OutOfRange { offset, length });
        }
        return Ok((page_align_down(offset) / PAGE_SIZE, 0));
    }
    if offset + length > size {
        return Err(BufferError::OutOfRange { offset, length });
    }
    let first = page_align_down(offset);
    let end = page_align_up(offset + length);
    Ok((first / PAGE_SIZE, (end - first) / PAGE_SIZE))
}
