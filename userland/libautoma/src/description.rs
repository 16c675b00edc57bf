//! Action description reader
//!
//! Every automaton's action table is exposed by the kernel's `describe`
//! call: a count-prefixed sequence of records (kind, parameter mode,
//! action number, entry, copy size, buffer flag, name). The reader
//! builds the reverse lookup from export name to the numbers a caller
//! needs to schedule or bind.

extern crate alloc;

use alloc::string::String;
use alloc::vec::Vec;

use crate::{buffer_file::BufferFile, sys, Aid};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActionKind {
    Input,
    Output,
    Internal,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParameterMode {
    None,
    Parameter,
    Auto,
}

/// One described action.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ActionInfo {
    pub kind: ActionKind,
    pub parameter_mode: ParameterMode,
    pub number: u32,
    pub entry: usize,
    pub copy_size: usize,
    pub has_buffer: bool,
    pub name: String,
}

/// A parsed description.
pub struct Description {
    pub aid: Aid,
    actions: Vec<ActionInfo>,
}

impl Description {
    /// Fetch and parse the description of `aid`.
    pub fn fetch(aid: Aid) -> Option<Self> {
        let bid = sys::describe(aid);
        if bid < 0 {
            return None;
        }
        let mut file = BufferFile::open(bid, false).ok()?;
        let mut bytes = alloc::vec![0u8; file.capacity()];
        file.read(&mut bytes).ok()?;
        file.close();
        sys::buffer_destroy(bid);
        Self::from_bytes(aid, &bytes)
    }

    /// Parse a description blob.
    pub fn from_bytes(aid: Aid, bytes: &[u8]) -> Option<Self> {
        let mut cursor = Reader { bytes, pos: 0 };
        let count = cursor.u32()?;
        let mut actions = Vec::with_capacity(count as usize);
        for _ in 0..count {
            let kind = match cursor.u32()? {
                0 => ActionKind::Input,
                1 => ActionKind::Output,
                2 => ActionKind::Internal,
                _ => return None,
            };
            let parameter_mode = match cursor.u32()? {
                0 => ParameterMode::None,
                1 => ParameterMode::Parameter,
                2 => ParameterMode::Auto,
                _ => return None,
            };
            let number = cursor.u32()?;
            let entry = cursor.u32()? as usize;
            let copy_size = cursor.u32()? as usize;
            let has_buffer = cursor.u32()? != 0;
            let name_len = cursor.u32()? as usize;
            let name = core::str::from_utf8(cursor.bytes(name_len)?).ok()?;
            cursor.align(4);
            actions.push(ActionInfo {
                kind,
                parameter_mode,
                number,
                entry,
                copy_size,
                has_buffer,
                name: String::from(name),
            });
        }
        Some(Self { aid, actions })
    }

    pub fn actions(&self) -> &[ActionInfo] {
        &self.actions
    }

    /// Reverse lookup: export name to action.
    pub fn action_named(&self, name: &str) -> Option<&ActionInfo> {
        self.actions.iter().find(|action| action.name == name)
    }

    /// Lookup by dense action number.
    pub fn action_number(&self, number: u32) -> Option<&ActionInfo> {
        self.actions.iter().find(|action| action.number == number)
    }
}

struct Reader<'a> {
    bytes: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn u32(&mut self) -> Option<u32> {
        let bytes = self.bytes.get(self.pos..self.pos + 4)?;
        self.pos += 4;
        Some(u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
    }

    fn bytes(&mut self, len: usize) -> Option<&'a [u8]> {
        let bytes = self.bytes.get(self.pos..self.pos + len)?;
        self.pos += len;
        Some(bytes)
    }

    fn align(&mut self, to: usize) {
        self.pos = (self.pos + to - 1) / to * to;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(out: &mut Vec<u8>, kind: u32, mode: u32, number: u32, entry: u32, name: &str) {
        for value in [kind, mode, number, entry, 0, 0, name.len() as u32] {
            out.extend_from_slice(&value.to_le_bytes());
        }
        out.extend_from_slice(name.as_bytes());
        while out.len() % 4 != 0 {
            out.push(0);
        }
    }

    fn sample() -> Vec<u8> {
        let mut bytes = Vec::new();
        bytes.extend_from_slice(&3u32.to_le_bytes());
        record(&mut bytes, 2, 0, 0, 0x1000, "init");
        record(&mut bytes, 1, 1, 1, 0x1010, "stdout");
        record(&mut bytes, 0, 2, 2, 0x1020, "stdin");
        bytes
    }

    #[test]
    fn name_lookup_finds_numbers_and_entries() {
        let description = Description::from_bytes(7, &sample()).unwrap();
        assert_eq!(description.actions().len(), 3);
        let stdout = description.action_named("stdout").unwrap();
        assert_eq!(stdout.number, 1);
        assert_eq!(stdout.entry, 0x1010);
        assert_eq!(stdout.kind, ActionKind::Output);
        assert_eq!(stdout.parameter_mode, ParameterMode::Parameter);
        assert!(description.action_named("missing").is_none());
        assert_eq!(description.action_number(2).unwrap().name, "stdin");
    }

    #[test]
    fn fetch_reads_through_the_describe_call() {
        sys::install_description(41, &sample());
        let description = Description::fetch(41).unwrap();
        assert_eq!(description.action_named("init").unwrap().kind, ActionKind::Internal);
        assert!(Description::fetch(999_999).is_none());
    }

    #[test]
    fn truncated_blobs_are_rejected() {
        let bytes = sample();
        assert!(Description::from_bytes(1, &bytes[..bytes.len() - 3]).is_none());
    }
}
