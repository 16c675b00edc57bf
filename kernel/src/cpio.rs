//! CPIO new-ASCII archive reader
//!
//! The boot module and create-request images arrive as `070701` archives
//! (the `070702` checksum variant is accepted and its checksum ignored).
//! Header fields are 8-digit ASCII hex; names and data align to 4 bytes;
//! `TRAILER!!!` ends the archive.

use core::str;

const HEADER_LEN: usize = 110;
const TRAILER: &str = "TRAILER!!!";

/// One archive member, borrowing the archive bytes.
#[derive(Debug, Clone, Copy)]
pub struct CpioFile<'a> {
    pub name: &'a str,
    pub mode: u32,
    pub data: &'a [u8],
}

impl CpioFile<'_> {
    /// Regular file check (S_IFREG in the mode field).
    pub fn is_regular(&self) -> bool {
        self.mode & 0o170_000 == 0o100_000
    }
}

/// Iterator over archive members. Malformed input ends the iteration.
pub struct CpioArchive<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> CpioArchive<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    /// Whether `data` starts with a new-ASCII magic.
    pub fn is_cpio(data: &[u8]) -> bool {
        data.starts_with(b"070701") || data.starts_with(b"070702")
    }

    fn field(&self, offset: usize) -> Option<u32> {
        let bytes = self.data.get(self.pos + offset..self.pos + offset + 8)?;
        let mut value = 0u32;
        for byte in bytes {
            let digit = match byte {
                b'0'..=b'9' => byte - b'0',
                b'A'..=b'F' => byte - b'A' + 10,
                b'a'..=b'f' => byte - b'a' + 10,
                _ => return None,
            };
            value = value << 4 | u32::from(digit);
        }
        Some(value)
    }
}

impl<'a> Iterator for CpioArchive<'a> {
    type Item = CpioFile<'a>;

    fn next(&mut self) -> Option<CpioFile<'a>> {
        self.pos = (self.pos + 3) & !3;
        let magic = self.data.get(self.pos..self.pos + 6)?;
        if magic != b"070701" && magic != b"070702" {
            return None;
        }

        let mode = self.field(14)?;
        let filesize = self.field(54)? as usize;
        let namesize = self.field(94)? as usize;

        let name_start = self.pos + HEADER_LEN;
        let name_bytes = self.data.get(name_start..name_start + namesize)?;
        if namesize == 0 || *name_bytes.last()? != 0 {
            return None;
        }
        let name = str::from_utf8(&name_bytes[..namesize - 1]).ok()?;

        let data_start = (name_start + namesize + 3) & !3;
        let data = self.data.get(data_start..data_start + filesize)?;
        self.pos = data_start + filesize;

        if name == TRAILER {
            return None;
        }
        Some(CpioFile { name, mode, data })
    }
}

/// In-memory archive builder for tests.
#[cfg(test)]
pub(crate) mod testing {
    extern crate alloc;

    use alloc::vec::Vec;

    use super::TRAILER;

    /// Build a minimal new-ASCII archive in memory.
    pub(crate) fn build_archive(members: &[(&str, &[u8])]) -> Vec<u8> {
        let mut out = Vec::new();
        for (name, data) in members {
            push_member(&mut out, name, data, 0o100_644);
        }
        push_member(&mut out, TRAILER, &[], 0);
        out
    }

    fn push_member(out: &mut Vec<u8>, name: &str, data: &[u8], mode: u32) {
        while out.len() % 4 != 0 {
            out.push(0);
        }
        let mut header = alloc::string::String::new();
        header.push_str("070701");
        let fields = [
            0,                      // inode
            mode,                   // mode
            0,                      // uid
            0,                      // gid
            1,                      // nlink
            0,                      // mtime
            data.len() as u32,      // filesize
            0,                      // dev major
            0,                      // dev minor
            0,                      // rdev major
            0,                      // rdev minor
            name.len() as u32 + 1,  // namesize (with NUL)
            0,                      // checksum
        ];
        for field in fields {
            header.push_str(&alloc::format!("{field:08X}"));
        }
        out.extend_from_slice(header.as_bytes());
        out.extend_from_slice(name.as_bytes());
        out.push(0);
        while out.len() % 4 != 0 {
            out.push(0);
        }
        out.extend_from_slice(data);
    }
}

#[cfg(test)]
mod tests {
    extern crate alloc;

    use super::testing::build_archive;
    use super::*;

    #[test]
    fn reads_members_in_order() {
        let archive = build_archive(&[("first", b"hello"), ("second", b"world!")]);
        let mut reader = CpioArchive::new(&archive);
        let first = reader.next().unwrap();
        assert_eq!(first.name, "first");
        assert_eq!(first.data, b"hello");
        assert!(first.is_regular());
        let second = reader.next().unwrap();
        assert_eq!(second.name, "second");
        assert_eq!(second.data, b"world!");
        assert!(reader.next().is_none());
    }

    #[test]
    fn trailer_ends_iteration() {
        let archive = build_archive(&[]);
        assert!(CpioArchive::new(&archive).next().is_none());
    }

    #[test]
    fn bad_magic_ends_iteration() {
        let data = b"junk archive";
        assert!(CpioArchive::new(data).next().is_none());
        assert!(!CpioArchive::is_cpio(data));
    }

    #[test]
    fn truncated_archive_is_rejected() {
        let mut archive = build_archive(&[("file", b"payload")]);
        archive.truncate(HEADER_LEN + 2);
        assert!(CpioArchive::new(&archive).next().is_none());
    }
}
