//! Two-level x86 page tables
//!
//! A directory of 1024 entries over tables of 1024 entries, 4 KiB pages.
//! Every directory's last entry maps the directory itself, which pins the
//! classic recursive window (`0xFFC0_0000..`) for in-space walks; kernel
//! code reaches any table through the linear map instead, so the same
//! walk code runs on the hosted test target.

use bitflags::bitflags;

use super::{Frame, MemoryManager, PhysAddr, PhysMap, VirtAddr, KERNEL_BASE};
use crate::{arch, error::Result};

pub const PAGE_TABLE_ENTRIES: usize = 1024;

/// Directory slot that maps the directory itself.
pub const SELF_MAP_INDEX: usize = PAGE_TABLE_ENTRIES - 1;

/// First directory slot of the kernel window; entries from here up are
/// shared by every address space.
pub const KERNEL_DIR_INDEX: usize = KERNEL_BASE >> 22;

bitflags! {
    /// Page-table and page-directory entry bits.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct PageFlags: u32 {
        const PRESENT       = 1 << 0;
        const WRITABLE      = 1 << 1;
        const USER          = 1 << 2;
        const WRITE_THROUGH = 1 << 3;
        const NO_CACHE      = 1 << 4;
        const ACCESSED      = 1 << 5;
        const DIRTY         = 1 << 6;
        const HUGE          = 1 << 7;
        const GLOBAL        = 1 << 8;
    }
}

/// One entry of a directory or table.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct Entry(u32);

impl Entry {
    pub const fn empty() -> Self {
        Self(0)
    }

    pub fn new(frame: Frame, flags: PageFlags) -> Self {
        Self((frame.base().raw() as u32) | flags.bits())
    }

    pub fn is_present(self) -> bool {
        self.0 & PageFlags::PRESENT.bits() != 0
    }

    pub fn frame(self) -> Frame {
        PhysAddr::new((self.0 & 0xFFFF_F000) as usize).frame()
    }

    pub fn flags(self) -> PageFlags {
        PageFlags::from_bits_truncate(self.0)
    }

    pub const fn raw(self) -> u32 {
        self.0
    }
}

pub const fn dir_index(addr: VirtAddr) -> usize {
    addr.raw() >> 22
}

pub const fn table_index(addr: VirtAddr) -> usize {
    (addr.raw() >> 12) & 0x3FF
}

/// Handle to a root page directory. The frame holds the entries; all
/// access goes through the linear map.
#[derive(Clone, Copy, Debug)]
pub struct PageDirectory {
    frame: Frame,
}

impl PageDirectory {
    /// Allocate and initialize a fresh directory: empty user half, kernel
    /// window copied from the canonical directory, self-map installed.
    pub fn create(mm: &mut MemoryManager) -> Result<Self> {
        let frame = mm.pool.alloc()?;
        mm.phys.zero_frame(frame);
        let dir = Self { frame };

        // SAFETY: `frame` was just allocated and zeroed; no aliasing view
        // exists yet.
        let entries = unsafe { mm.phys.table(frame) };
        if let Some(kernel_dir) = mm.kernel_dir() {
            // SAFETY: the kernel directory is live and the two frames are
            // distinct allocations.
            let kernel_entries = unsafe { mm.phys.table(kernel_dir) };
            entries[KERNEL_DIR_INDEX..SELF_MAP_INDEX]
                .copy_from_slice(&kernel_entries[KERNEL_DIR_INDEX..SELF_MAP_INDEX]);
        }
        entries[SELF_MAP_INDEX] =
            Entry::new(frame, PageFlags::PRESENT | PageFlags::WRITABLE).raw();
        Ok(dir)
    }

    /// Adopt a directory frame set up by the boot glue.
    pub const fn from_frame(frame: Frame) -> Self {
        Self { frame }
    }

    pub const fn frame(self) -> Frame {
        self.frame
    }

    pub fn physical_address(self) -> PhysAddr {
        self.frame.base()
    }

    /// Install a mapping, allocating the intermediate table from the
    /// standing spare if the directory slot is empty.
    pub fn map(
        self,
        mm: &mut MemoryManager,
        virt: VirtAddr,
        frame: Frame,
        flags: PageFlags,
    ) -> Result<()> {
        debug_assert!(virt.is_aligned());
        let di = dir_index(virt);
        // SAFETY: the directory frame is owned by this handle; entries are
        // plain integers.
        let dir = unsafe { mm.phys.table(self.frame) };
        let table_frame = if Entry(dir[di]).is_present() {
            Entry(dir[di]).frame()
        } else {
            let table = mm.take_page_table()?;
            // Directory-level USER is required for any user page below it;
            // the page entry itself decides the final privilege.
            dir[di] = Entry::new(
                table,
                PageFlags::PRESENT | PageFlags::WRITABLE | PageFlags::USER,
            )
            .raw();
            table
        };
        // SAFETY: `table_frame` is a live page table of this directory.
        let table = unsafe { mm.phys.table(table_frame) };
        table[table_index(virt)] = Entry::new(frame, flags | PageFlags::PRESENT).raw();
        arch::flush_tlb(virt.raw());
        Ok(())
    }

    /// Clear a mapping; returns the frame that was mapped.
    pub fn unmap(self, mm: &mut MemoryManager, virt: VirtAddr) -> Option<Frame> {
        debug_assert!(virt.is_aligned());
        let di = dir_index(virt);
        // SAFETY: directory frame owned by this handle.
        let dir = unsafe { mm.phys.table(self.frame) };
        if !Entry(dir[di]).is_present() {
            return None;
        }
        let table_frame = Entry(dir[di]).frame();
        // SAFETY: live page table of this directory.
        let table = unsafe { mm.phys.table(table_frame) };
        let entry = Entry(table[table_index(virt)]);
        if !entry.is_present() {
            return None;
        }
        table[table_index(virt)] = Entry::empty().raw();
        arch::flush_tlb(virt.raw());
        Some(entry.frame())
    }

    /// Walk the tables for `virt`.
    pub fn translate(self, phys: PhysMap, virt: VirtAddr) -> Option<(Frame, PageFlags)> {
        let di = dir_index(virt);
        // SAFETY: directory frame owned by this handle; read-only walk.
        let dir = unsafe { phys.table(self.frame) };
        let dir_entry = Entry(dir[di]);
        if !dir_entry.is_present() {
            return None;
        }
        // SAFETY: live page table of this directory.
        let table = unsafe { phys.table(dir_entry.frame()) };
        let entry = Entry(table[table_index(virt)]);
        entry.is_present().then(|| (entry.frame(), entry.flags()))
    }

    /// Release every user-half frame and table, then the directory
    /// itself. Kernel-window entries are shared and left untouched.
    pub fn destroy(self, mm: &mut MemoryManager) {
        for di in 0..KERNEL_DIR_INDEX {
            // SAFETY: directory frame owned by this handle.
            let dir_entry = Entry(unsafe { mm.phys.table(self.frame) }[di]);
            if !dir_entry.is_present() {
                continue;
            }
            let table_frame = dir_entry.frame();
            for ti in 0..PAGE_TABLE_ENTRIES {
                // SAFETY: live page table of this directory.
                let entry = Entry(unsafe { mm.phys.table(table_frame) }[ti]);
                if entry.is_present() {
                    mm.pool.decref(entry.frame());
                }
            }
            mm.pool.decref(table_frame);
        }
        mm.pool.decref(self.frame);
    }
}
