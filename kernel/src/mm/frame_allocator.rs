//! Physical frame pool
//!
//! Zoned stack-of-free-indices allocator. Each zone covers a run of
//! frames from the boot memory map; a free entry stores the index of the
//! next free frame and an allocated entry stores the additive inverse of
//! its reference count. Generic allocations search normal zones before
//! the DMA zone; DMA allocations bypass normal zones.

extern crate alloc;

use alloc::vec::Vec;

use super::{out_of_memory, Frame, PhysAddr, MEMORY_DMA_LIMIT, MEMORY_LOWER_LIMIT, PAGE_SIZE};
use crate::error::Result;

/// End-of-list sentinel in a free entry.
const EOL: i32 = i32::MAX;

/// Which policy a zone serves.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ZoneKind {
    /// [1 MiB, 16 MiB): kept for devices that need low memory.
    Dma,
    /// Everything above 16 MiB.
    Normal,
}

struct Zone {
    kind: ZoneKind,
    frame_begin: usize,
    frame_end: usize,
    free_head: i32,
    free_count: usize,
    /// `entry[i] >= 0`: i is free, value is the next free index (EOL ends
    /// the list). `entry[i] < 0`: allocated with refcount `-entry[i]`.
    entries: Vec<i32>,
}

impl Zone {
    fn new(kind: ZoneKind, begin: PhysAddr, end: PhysAddr) -> Self {
        let frame_begin = begin.raw() / PAGE_SIZE;
        let frame_end = end.raw() / PAGE_SIZE;
        let count = frame_end - frame_begin;
        let mut entries = Vec::with_capacity(count);
        for i in 0..count {
            entries.push(if i + 1 < count { (i + 1) as i32 } else { EOL });
        }
        Self { kind, frame_begin, frame_end, free_head: 0, free_count: count, entries }
    }

    fn contains(&self, frame: Frame) -> bool {
        (self.frame_begin..self.frame_end).contains(&frame.number())
    }

    fn alloc(&mut self) -> Option<Frame> {
        if self.free_head == EOL {
            return None;
        }
        let index = self.free_head as usize;
        self.free_head = self.entries[index];
        self.entries[index] = -1;
        self.free_count -= 1;
        Some(Frame::new(self.frame_begin + index))
    }

    /// Unlink a specific frame from the free list. Returns false if the
    /// frame is already allocated.
    fn mark_used(&mut self, frame: Frame) -> bool {
        let target = (frame.number() - self.frame_begin) as i32;
        if self.entries[target as usize] < 0 {
            return false;
        }
        if self.free_head == target {
            self.free_head = self.entries[target as usize];
        } else {
            let mut index = self.free_head;
            while index != EOL && self.entries[index as usize] != target {
                index = self.entries[index as usize];
            }
            if index == EOL {
                return false;
            }
            self.entries[index as usize] = self.entries[target as usize];
        }
        self.entries[target as usize] = -1;
        self.free_count -= 1;
        true
    }

    fn incref(&mut self, frame: Frame) {
        let index = frame.number() - self.frame_begin;
        debug_assert!(self.entries[index] < 0, "incref of a free frame");
        self.entries[index] -= 1;
    }

    /// Drop one reference; at zero the frame rejoins the free list.
    fn decref(&mut self, frame: Frame) {
        let index = frame.number() - self.frame_begin;
        debug_assert!(self.entries[index] < 0, "decref of a free frame");
        self.entries[index] += 1;
        if self.entries[index] == 0 {
            self.entries[index] = self.free_head;
            self.free_head = index as i32;
            self.free_count += 1;
        }
    }

    fn is_free(&self, frame: Frame) -> bool {
        self.entries[frame.number() - self.frame_begin] >= 0
    }

    fn refcount(&self, frame: Frame) -> u32 {
        let entry = self.entries[frame.number() - self.frame_begin];
        if entry < 0 {
            entry.unsigned_abs()
        } else {
            0
        }
    }
}

/// The process-wide frame pool.
pub struct FramePool {
    normal: Vec<Zone>,
    dma: Vec<Zone>,
    phys_begin: PhysAddr,
    phys_end: PhysAddr,
}

impl FramePool {
    pub const fn new() -> Self {
        Self {
            normal: Vec::new(),
            dma: Vec::new(),
            phys_begin: PhysAddr::new(usize::MAX),
            phys_end: PhysAddr::new(0),
        }
    }

    /// Add an available region from the boot memory map. The region is
    /// clipped below 1 MiB and above the linear-map cap, and split at the
    /// DMA boundary.
    pub fn add_region(&mut self, begin: PhysAddr, end: PhysAddr) {
        let mut begin = begin.raw().max(MEMORY_LOWER_LIMIT);
        let end = end.raw().min(super::LINEAR_MAP_LIMIT);
        begin = super::page_align_up(begin);
        let end = super::page_align_down(end);
        if begin >= end {
            return;
        }

        self.phys_begin = PhysAddr::new(self.phys_begin.raw().min(begin));
        self.phys_end = PhysAddr::new(self.phys_end.raw().max(end));

        if begin < MEMORY_DMA_LIMIT && end > MEMORY_DMA_LIMIT {
            self.dma.push(Zone::new(
                ZoneKind::Dma,
                PhysAddr::new(begin),
                PhysAddr::new(MEMORY_DMA_LIMIT),
            ));
            self.normal.push(Zone::new(
                ZoneKind::Normal,
                PhysAddr::new(MEMORY_DMA_LIMIT),
                PhysAddr::new(end),
            ));
        } else if end <= MEMORY_DMA_LIMIT {
            self.dma.push(Zone::new(ZoneKind::Dma, PhysAddr::new(begin), PhysAddr::new(end)));
        } else {
            self.normal.push(Zone::new(ZoneKind::Normal, PhysAddr::new(begin), PhysAddr::new(end)));
        }
    }

    /// Pop a frame from the first zone with capacity, normal zones first.
    /// The frame comes back with reference count 1.
    pub fn alloc(&mut self) -> Result<Frame> {
        for zone in self.normal.iter_mut().chain(self.dma.iter_mut()) {
            if let Some(frame) = zone.alloc() {
                return Ok(frame);
            }
        }
        Err(out_of_memory(PAGE_SIZE))
    }

    /// Allocate from the DMA zone only.
    pub fn alloc_dma(&mut self) -> Result<Frame> {
        for zone in &mut self.dma {
            if let Some(frame) = zone.alloc() {
                return Ok(frame);
            }
        }
        Err(out_of_memory(PAGE_SIZE))
    }

    /// Claim a frame that backs the kernel image or boot data. A frame
    /// outside every zone is silently ignored.
    pub fn mark_used(&mut self, frame: Frame) {
        for zone in self.normal.iter_mut().chain(self.dma.iter_mut()) {
            if zone.contains(frame) {
                zone.mark_used(frame);
                return;
            }
        }
    }

    pub fn incref(&mut self, frame: Frame) {
        if let Some(zone) = self.zone_of_mut(frame) {
            zone.incref(frame);
        }
    }

    pub fn decref(&mut self, frame: Frame) {
        if let Some(zone) = self.zone_of_mut(frame) {
            zone.decref(frame);
        }
    }

    pub fn is_free(&self, frame: Frame) -> bool {
        self.zone_of(frame).is_some_and(|zone| zone.is_free(frame))
    }

    pub fn refcount(&self, frame: Frame) -> u32 {
        self.zone_of(frame).map_or(0, |zone| zone.refcount(frame))
    }

    pub fn free_frames(&self) -> usize {
        self.normal.iter().chain(self.dma.iter()).map(|zone| zone.free_count).sum()
    }

    /// Which zone a frame belongs to, if any.
    pub fn zone_kind(&self, frame: Frame) -> Option<ZoneKind> {
        self.zone_of(frame).map(|zone| zone.kind)
    }

    /// Lowest managed physical address.
    pub fn physical_begin(&self) -> PhysAddr {
        self.phys_begin
    }

    /// One past the highest managed physical address. The boot glue maps
    /// the kernel window up to here.
    pub fn physical_end(&self) -> PhysAddr {
        self.phys_end
    }

    fn zone_of(&self, frame: Frame) -> Option<&Zone> {
        self.normal.iter().chain(self.dma.iter()).find(|zone| zone.contains(frame))
    }

    fn zone_of_mut(&mut self, frame: Frame) -> Option<&mut Zone> {
        self.normal.iter_mut().chain(self.dma.iter_mut()).find(|zone| zone.contains(frame))
    }
}

impl Default for FramePool {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pool_over(begin: usize, end: usize) -> FramePool {
        let mut pool = FramePool::new();
        pool.add_region(PhysAddr::new(begin), PhysAddr::new(end));
        pool
    }

    #[test]
    fn region_splits_at_dma_boundary() {
        let pool = pool_over(0xF0_0000, 0x120_0000);
        assert_eq!(pool.dma.len(), 1);
        assert_eq!(pool.normal.len(), 1);
        assert_eq!(pool.dma[0].frame_end * PAGE_SIZE, MEMORY_DMA_LIMIT);
        assert_eq!(pool.normal[0].frame_begin * PAGE_SIZE, MEMORY_DMA_LIMIT);
    }

    #[test]
    fn low_memory_is_never_managed() {
        let pool = pool_over(0, 0x20_0000);
        assert_eq!(pool.physical_begin().raw(), MEMORY_LOWER_LIMIT);
    }

    #[test]
    fn generic_allocation_prefers_normal_zone() {
        let mut pool = pool_over(0xF0_0000, 0x120_0000);
        let frame = pool.alloc().unwrap();
        assert_eq!(pool.zone_kind(frame), Some(ZoneKind::Normal));
        let dma = pool.alloc_dma().unwrap();
        assert_eq!(pool.zone_kind(dma), Some(ZoneKind::Dma));
    }

    #[test]
    fn alloc_and_release_round_trip() {
        let mut pool = pool_over(0x100_0000, 0x100_4000);
        let before = pool.free_frames();
        let frame = pool.alloc().unwrap();
        assert!(!pool.is_free(frame));
        assert_eq!(pool.refcount(frame), 1);
        pool.decref(frame);
        assert!(pool.is_free(frame));
        assert_eq!(pool.free_frames(), before);
    }

    #[test]
    fn refcount_tracks_shared_mappings() {
        let mut pool = pool_over(0x100_0000, 0x100_4000);
        let frame = pool.alloc().unwrap();
        pool.incref(frame);
        pool.incref(frame);
        assert_eq!(pool.refcount(frame), 3);
        pool.decref(frame);
        pool.decref(frame);
        assert!(!pool.is_free(frame));
        pool.decref(frame);
        assert!(pool.is_free(frame));
    }

    #[test]
    fn mark_used_unlinks_mid_list_frames() {
        let mut pool = pool_over(0x100_0000, 0x100_8000);
        let target = Frame::new(0x100_2000 / PAGE_SIZE);
        pool.mark_used(target);
        assert!(!pool.is_free(target));
        // Every remaining frame is still allocatable exactly once.
        let mut seen = alloc::vec::Vec::new();
        while let Ok(frame) = pool.alloc() {
            assert_ne!(frame, target);
            assert!(!seen.contains(&frame));
            seen.push(frame);
        }
        assert_eq!(seen.len(), 7);
    }

    #[test]
    fn mark_used_outside_all_zones_is_ignored() {
        let mut pool = pool_over(0x100_0000, 0x100_4000);
        pool.mark_used(Frame::new(2));
        assert_eq!(pool.free_frames(), 4);
    }

    #[test]
    fn exhaustion_is_reported() {
        let mut pool = pool_over(0x100_0000, 0x100_2000);
        assert!(pool.alloc().is_ok());
        assert!(pool.alloc().is_ok());
        assert!(pool.alloc().is_err());
    }
}
