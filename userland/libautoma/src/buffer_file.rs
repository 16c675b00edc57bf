//! Buffer file
//!
//! A random-access view over a mapped buffer with a read/write cursor.
//! Writes past the mapped capacity unmap, grow and remap, so the file
//! appears unbounded while staying one buffer underneath.

use crate::{sys, Bid};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Seek {
    Set,
    Current,
    End,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BufferFileError;

pub struct BufferFile {
    bid: Bid,
    ptr: *mut u8,
    capacity: usize,
    position: usize,
    writable: bool,
    /// Whether this file created (and thus should destroy) the buffer.
    owned: bool,
}

impl BufferFile {
    /// Open an existing buffer. Maps it; fails on size-0 buffers.
    pub fn open(bid: Bid, writable: bool) -> Result<Self, BufferFileError> {
        let size = sys::buffer_size(bid);
        if size < 0 {
            return Err(BufferFileError);
        }
        let ptr = sys::buffer_map(bid).ok_or(BufferFileError)?;
        Ok(Self { bid, ptr, capacity: size as usize, position: 0, writable, owned: false })
    }

    /// Create a fresh buffer of at least `initial_capacity` bytes.
    pub fn create(initial_capacity: usize) -> Result<Self, BufferFileError> {
        let bid = sys::buffer_create(initial_capacity.max(1));
        if bid < 0 {
            return Err(BufferFileError);
        }
        match Self::open(bid, true) {
            Ok(mut file) => {
                file.owned = true;
                Ok(file)
            }
            Err(err) => {
                sys::buffer_destroy(bid);
                Err(err)
            }
        }
    }

    pub fn bid(&self) -> Bid {
        self.bid
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn position(&self) -> usize {
        self.position
    }

    pub fn seek(&mut self, offset: isize, whence: Seek) -> Result<usize, BufferFileError> {
        let base = match whence {
            Seek::Set => 0,
            Seek::Current => self.position as isize,
            Seek::End => self.capacity as isize,
        };
        let target = base + offset;
        if target < 0 {
            return Err(BufferFileError);
        }
        self.position = target as usize;
        Ok(self.position)
    }

    /// Copy bytes at the cursor; fails on reads past the capacity.
    pub fn read(&mut self, out: &mut [u8]) -> Result<(), BufferFileError> {
        if self.position + out.len() > self.capacity {
            return Err(BufferFileError);
        }
        // SAFETY: the mapping covers `capacity` bytes and the range was
        // bounds-checked above.
        unsafe {
            core::ptr::copy_nonoverlapping(
                self.ptr.add(self.position),
                out.as_mut_ptr(),
                out.len(),
            );
        }
        self.position += out.len();
        Ok(())
    }

    /// Write bytes at the cursor, growing the buffer as needed.
    pub fn write(&mut self, bytes: &[u8]) -> Result<(), BufferFileError> {
        if !self.writable {
            return Err(BufferFileError);
        }
        self.ensure(self.position + bytes.len())?;
        // SAFETY: `ensure` made the mapping cover the range.
        unsafe {
            core::ptr::copy_nonoverlapping(bytes.as_ptr(), self.ptr.add(self.position), bytes.len());
        }
        self.position += bytes.len();
        Ok(())
    }

    /// Grow (unmap, extend, remap) until `needed` bytes are mapped.
    fn ensure(&mut self, needed: usize) -> Result<(), BufferFileError> {
        if needed <= self.capacity {
            return Ok(());
        }
        let page = sys::getpagesize();
        let missing = needed - self.capacity;
        let pages = missing.div_ceil(page);
        if sys::buffer_unmap(self.bid) < 0 {
            return Err(BufferFileError);
        }
        if sys::buffer_grow(self.bid, pages) < 0 {
            // Restore the old mapping before reporting.
            self.ptr = sys::buffer_map(self.bid).ok_or(BufferFileError)?;
            return Err(BufferFileError);
        }
        self.ptr = sys::buffer_map(self.bid).ok_or(BufferFileError)?;
        self.capacity += pages * page;
        Ok(())
    }

    /// Release the mapping; destroy the buffer if this file created it.
    pub fn close(self) {
        sys::buffer_unmap(self.bid);
        if self.owned {
            sys::buffer_destroy(self.bid);
        }
    }

    /// Hand the underlying buffer out (for a finish), leaving it
    /// unmapped and no longer owned by the file.
    pub fn into_bid(self) -> Bid {
        sys::buffer_unmap(self.bid);
        self.bid
    }
}

#[cfg(test)]
mod tests {
    extern crate alloc;

    use super::*;

    #[test]
    fn write_then_read_round_trips() {
        let mut file = BufferFile::create(16).unwrap();
        file.write(b"hello buffer file").unwrap();
        file.seek(0, Seek::Set).unwrap();
        let mut out = [0u8; 17];
        file.read(&mut out).unwrap();
        assert_eq!(&out, b"hello buffer file");
        file.close();
    }

    #[test]
    fn writes_grow_across_page_boundaries() {
        let mut file = BufferFile::create(16).unwrap();
        let page = sys::getpagesize();
        let blob = alloc::vec![0x5Au8; page + 100];
        file.write(&blob).unwrap();
        assert!(file.capacity() >= page + 100);
        file.seek(-1, Seek::Current).unwrap();
        let mut byte = [0u8];
        file.read(&mut byte).unwrap();
        assert_eq!(byte[0], 0x5A);
        file.close();
    }

    #[test]
    fn reads_past_the_end_fail() {
        let mut file = BufferFile::create(8).unwrap();
        file.seek(0, Seek::End).unwrap();
        let mut byte = [0u8];
        assert_eq!(file.read(&mut byte), Err(BufferFileError));
        file.close();
    }
}
