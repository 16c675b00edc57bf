//! Control-plane wire messages
//!
//! Requests travel to the system automaton in buffers; results travel
//! back as copy values. Encoding is explicit little-endian so the layout
//! is a contract rather than an accident of struct layout. Buffer
//! references inside a request are descriptors local to the requesting
//! automaton; the control plane resolves them against the requester's
//! table.

extern crate alloc;

use alloc::vec::Vec;

use crate::{buffer::Bid, registry::Aid};

/// Byte reader with bounds checking.
pub struct Cursor<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> Cursor<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    pub fn u32(&mut self) -> Option<u32> {
        let bytes = self.data.get(self.pos..self.pos + 4)?;
        self.pos += 4;
        Some(u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
    }

    pub fn i32(&mut self) -> Option<i32> {
        self.u32().map(|value| value as i32)
    }

    pub fn u64(&mut self) -> Option<u64> {
        let low = self.u32()?;
        let high = self.u32()?;
        Some(u64::from(low) | u64::from(high) << 32)
    }

    pub fn bytes(&mut self, len: usize) -> Option<&'a [u8]> {
        let bytes = self.data.get(self.pos..self.pos + len)?;
        self.pos += len;
        Some(bytes)
    }

    pub fn position(&self) -> usize {
        self.pos
    }
}

fn put_u32(out: &mut Vec<u8>, value: u32) {
    out.extend_from_slice(&value.to_le_bytes());
}

fn put_i32(out: &mut Vec<u8>, value: i32) {
    put_u32(out, value as u32);
}

/// Ask the system automaton to materialize a new automaton.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CreateRequest {
    /// Requester-local descriptor of the image archive.
    pub image: Bid,
    /// Up to two buffers handed to the new automaton's init action.
    pub init_a: Bid,
    pub init_b: Bid,
    /// Keep the owner's ring instead of dropping to ring 3.
    pub retain_privilege: bool,
}

impl CreateRequest {
    pub fn encode(&self, out: &mut Vec<u8>) {
        put_i32(out, self.image);
        put_i32(out, self.init_a);
        put_i32(out, self.init_b);
        put_u32(out, u32::from(self.retain_privilege));
    }

    pub fn decode(data: &[u8]) -> Option<Self> {
        let mut cursor = Cursor::new(data);
        Some(Self {
            image: cursor.i32()?,
            init_a: cursor.i32()?,
            init_b: cursor.i32()?,
            retain_privilege: cursor.u32()? != 0,
        })
    }
}

/// Result of a create request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CreateOutcome {
    Success = 0,
    NotAuthorized = 1,
    InvalidImage = 2,
    UnknownBuffer = 3,
    OutOfMemory = 4,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CreateResponse {
    pub outcome: CreateOutcome,
    /// Valid on success.
    pub aid: Aid,
}

impl CreateResponse {
    pub fn encode(&self, out: &mut Vec<u8>) {
        put_u32(out, self.outcome as u32);
        put_i32(out, self.aid);
    }

    pub fn decode(data: &[u8]) -> Option<Self> {
        let mut cursor = Cursor::new(data);
        let outcome = match cursor.u32()? {
            0 => CreateOutcome::Success,
            1 => CreateOutcome::NotAuthorized,
            2 => CreateOutcome::InvalidImage,
            3 => CreateOutcome::UnknownBuffer,
            4 => CreateOutcome::OutOfMemory,
            _ => return None,
        };
        Some(Self { outcome, aid: cursor.i32()? })
    }
}

/// A binding 6-tuple as named in requests.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BindingSpec {
    pub output_aid: Aid,
    pub output_entry: u32,
    pub output_parameter: i32,
    pub input_aid: Aid,
    pub input_entry: u32,
    pub input_parameter: i32,
}

impl BindingSpec {
    pub fn encode(&self, out: &mut Vec<u8>) {
        put_i32(out, self.output_aid);
        put_u32(out, self.output_entry);
        put_i32(out, self.output_parameter);
        put_i32(out, self.input_aid);
        put_u32(out, self.input_entry);
        put_i32(out, self.input_parameter);
    }

    pub fn decode(cursor: &mut Cursor) -> Option<Self> {
        Some(Self {
            output_aid: cursor.i32()?,
            output_entry: cursor.u32()?,
            output_parameter: cursor.i32()?,
            input_aid: cursor.i32()?,
            input_entry: cursor.u32()?,
            input_parameter: cursor.i32()?,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BindRequest {
    pub binding: BindingSpec,
}

impl BindRequest {
    pub fn encode(&self, out: &mut Vec<u8>) {
        self.binding.encode(out);
    }

    pub fn decode(data: &[u8]) -> Option<Self> {
        let mut cursor = Cursor::new(data);
        Some(Self { binding: BindingSpec::decode(&mut cursor)? })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BindOutcome {
    Success = 0,
    NotAuthorized = 1,
    UnknownAutomaton = 2,
    UnknownAction = 3,
    KindMismatch = 4,
    AlreadyBound = 5,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BindResponse {
    pub outcome: BindOutcome,
}

impl BindResponse {
    pub fn encode(&self, out: &mut Vec<u8>) {
        put_u32(out, self.outcome as u32);
    }

    pub fn decode(data: &[u8]) -> Option<Self> {
        let mut cursor = Cursor::new(data);
        let outcome = match cursor.u32()? {
            0 => BindOutcome::Success,
            1 => BindOutcome::NotAuthorized,
            2 => BindOutcome::UnknownAutomaton,
            3 => BindOutcome::UnknownAction,
            4 => BindOutcome::KindMismatch,
            5 => BindOutcome::AlreadyBound,
            _ => return None,
        };
        Some(Self { outcome })
    }
}

/// Role under review in a bind-authorization query.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BindRole {
    Output = 0,
    Input = 1,
    Owner = 2,
}

impl BindRole {
    pub const ALL: [BindRole; 3] = [BindRole::Output, BindRole::Input, BindRole::Owner];

    pub fn index(self) -> usize {
        self as usize
    }
}

/// Query to the create-authorization automaton.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CaRequest {
    pub owner: Aid,
}

impl CaRequest {
    pub fn encode(&self, out: &mut Vec<u8>) {
        put_i32(out, self.owner);
    }

    pub fn decode(data: &[u8]) -> Option<Self> {
        let mut cursor = Cursor::new(data);
        Some(Self { owner: cursor.i32()? })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CaResponse {
    pub authorized: bool,
}

impl CaResponse {
    pub fn encode(&self, out: &mut Vec<u8>) {
        put_u32(out, u32::from(self.authorized));
    }

    pub fn decode(data: &[u8]) -> Option<Self> {
        let mut cursor = Cursor::new(data);
        Some(Self { authorized: cursor.u32()? != 0 })
    }
}

/// Query to the bind-authorization automaton: the full tuple plus the
/// role whose consent is being asked for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BaRequest {
    pub binding: BindingSpec,
    pub owner: Aid,
    pub role: BindRole,
}

impl BaRequest {
    pub fn encode(&self, out: &mut Vec<u8>) {
        self.binding.encode(out);
        put_i32(out, self.owner);
        put_u32(out, self.role as u32);
    }

    pub fn decode(data: &[u8]) -> Option<Self> {
        let mut cursor = Cursor::new(data);
        let binding = BindingSpec::decode(&mut cursor)?;
        let owner = cursor.i32()?;
        let role = match cursor.u32()? {
            0 => BindRole::Output,
            1 => BindRole::Input,
            2 => BindRole::Owner,
            _ => return None,
        };
        Some(Self { binding, owner, role })
    }
}

pub type BaResponse = CaResponse;

/// Tear down an automaton the requester owns.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DestroyRequest {
    pub aid: Aid,
}

impl DestroyRequest {
    pub fn encode(&self, out: &mut Vec<u8>) {
        put_i32(out, self.aid);
    }

    pub fn decode(data: &[u8]) -> Option<Self> {
        let mut cursor = Cursor::new(data);
        Some(Self { aid: cursor.i32()? })
    }
}

/// Remove a binding the requester owns.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UnbindRequest {
    pub binding: BindingSpec,
}

impl UnbindRequest {
    pub fn encode(&self, out: &mut Vec<u8>) {
        self.binding.encode(out);
    }

    pub fn decode(data: &[u8]) -> Option<Self> {
        let mut cursor = Cursor::new(data);
        Some(Self { binding: BindingSpec::decode(&mut cursor)? })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlOutcome {
    Success = 0,
    NotOwner = 1,
    NotFound = 2,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ControlResponse {
    pub outcome: ControlOutcome,
}

impl ControlResponse {
    pub fn encode(&self, out: &mut Vec<u8>) {
        put_u32(out, self.outcome as u32);
    }

    pub fn decode(data: &[u8]) -> Option<Self> {
        let mut cursor = Cursor::new(data);
        let outcome = match cursor.u32()? {
            0 => ControlOutcome::Success,
            1 => ControlOutcome::NotOwner,
            2 => ControlOutcome::NotFound,
            _ => return None,
        };
        Some(Self { outcome })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn create_request_round_trip() {
        let request = CreateRequest { image: 3, init_a: 4, init_b: -1, retain_privilege: true };
        let mut bytes = Vec::new();
        request.encode(&mut bytes);
        assert_eq!(CreateRequest::decode(&bytes), Some(request));
    }

    #[test]
    fn bind_request_round_trip() {
        let request = BindRequest {
            binding: BindingSpec {
                output_aid: 1,
                output_entry: 0x1000,
                output_parameter: 0,
                input_aid: 2,
                input_entry: 0x2000,
                input_parameter: 7,
            },
        };
        let mut bytes = Vec::new();
        request.encode(&mut bytes);
        assert_eq!(BindRequest::decode(&bytes), Some(request));
    }

    #[test]
    fn truncated_messages_are_rejected() {
        let request = CreateRequest { image: 1, init_a: -1, init_b: -1, retain_privilege: false };
        let mut bytes = Vec::new();
        request.encode(&mut bytes);
        assert_eq!(CreateRequest::decode(&bytes[..bytes.len() - 1]), None);
    }

    #[test]
    fn ba_request_round_trip() {
        let request = BaRequest {
            binding: BindingSpec {
                output_aid: 5,
                output_entry: 0x40,
                output_parameter: -1,
                input_aid: 6,
                input_entry: 0x80,
                input_parameter: 0,
            },
            owner: 9,
            role: BindRole::Owner,
        };
        let mut bytes = Vec::new();
        request.encode(&mut bytes);
        assert_eq!(BaRequest::decode(&bytes), Some(request));
    }
}
