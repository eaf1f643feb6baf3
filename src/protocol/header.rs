//! Fixed 16-byte wire message header
//!
//! Every protocol message starts with four little-endian int32 fields:
//! total message length, request id, response-to id, and operation code.
//! Header validation is also the resynchronization predicate used by the
//! stream reassembler when it has lost message framing.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Length of the fixed message header in bytes
pub const HEADER_LEN: usize = 16;

/// Smallest possible message: header plus one int32 body field
pub const MIN_MESSAGE_SIZE: i32 = 24;

/// Largest message the server will accept (48MB)
pub const MAX_MESSAGE_SIZE: i32 = 48 * 1000 * 1000;

/// Operation codes carried in the header's fourth field
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OpCode {
    Reply,
    Message,
    Update,
    Insert,
    Reserved,
    Query,
    GetMore,
    Delete,
    KillCursors,
    Command,
    CommandReply,
    Compressed,
    Unknown(i32),
}

impl OpCode {
    pub fn from_i32(code: i32) -> OpCode {
        match code {
            1 => OpCode::Reply,
            1000 => OpCode::Message,
            2001 => OpCode::Update,
            2002 => OpCode::Insert,
            2003 => OpCode::Reserved,
            2004 => OpCode::Query,
            2005 => OpCode::GetMore,
            2006 => OpCode::Delete,
            2007 => OpCode::KillCursors,
            2010 => OpCode::Command,
            2011 => OpCode::CommandReply,
            2012 => OpCode::Compressed,
            other => OpCode::Unknown(other),
        }
    }

    pub fn as_i32(&self) -> i32 {
        match self {
            OpCode::Reply => 1,
            OpCode::Message => 1000,
            OpCode::Update => 2001,
            OpCode::Insert => 2002,
            OpCode::Reserved => 2003,
            OpCode::Query => 2004,
            OpCode::GetMore => 2005,
            OpCode::Delete => 2006,
            OpCode::KillCursors => 2007,
            OpCode::Command => 2010,
            OpCode::CommandReply => 2011,
            OpCode::Compressed => 2012,
            OpCode::Unknown(other) => *other,
        }
    }

    /// True for the fixed set of opcodes this codec understands
    pub fn is_known(code: i32) -> bool {
        !matches!(OpCode::from_i32(code), OpCode::Unknown(_))
    }
}

impl fmt::Display for OpCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            OpCode::Reply => "reply",
            OpCode::Message => "message",
            OpCode::Update => "update",
            OpCode::Insert => "insert",
            OpCode::Reserved => "reserved",
            OpCode::Query => "query",
            OpCode::GetMore => "getmore",
            OpCode::Delete => "delete",
            OpCode::KillCursors => "killcursors",
            OpCode::Command => "command",
            OpCode::CommandReply => "command_reply",
            OpCode::Compressed => "compressed",
            OpCode::Unknown(code) => return write!(f, "unknown({})", code),
        };
        f.write_str(name)
    }
}

/// The fixed wire message header
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MsgHeader {
    pub message_length: i32,
    pub request_id: i32,
    pub response_to: i32,
    pub op_code: i32,
}

impl MsgHeader {
    pub fn new(message_length: i32, request_id: i32, response_to: i32, op_code: OpCode) -> Self {
        Self {
            message_length,
            request_id,
            response_to,
            op_code: op_code.as_i32(),
        }
    }

    /// Parse a header from the first [`HEADER_LEN`] bytes of `buf`
    ///
    /// Returns `None` if the buffer is too short. No validity check is
    /// applied; see [`MsgHeader::looks_valid`].
    pub fn parse(buf: &[u8]) -> Option<Self> {
        if buf.len() < HEADER_LEN {
            return None;
        }
        let read = |at: usize| i32::from_le_bytes([buf[at], buf[at + 1], buf[at + 2], buf[at + 3]]);
        Some(Self {
            message_length: read(0),
            request_id: read(4),
            response_to: read(8),
            op_code: read(12),
        })
    }

    /// Serialize to the 16-byte wire form
    pub fn to_bytes(&self) -> [u8; HEADER_LEN] {
        let mut out = [0u8; HEADER_LEN];
        out[0..4].copy_from_slice(&self.message_length.to_le_bytes());
        out[4..8].copy_from_slice(&self.request_id.to_le_bytes());
        out[8..12].copy_from_slice(&self.response_to.to_le_bytes());
        out[12..16].copy_from_slice(&self.op_code.to_le_bytes());
        out
    }

    /// Decoded operation code
    pub fn opcode(&self) -> OpCode {
        OpCode::from_i32(self.op_code)
    }

    /// Sanity check used both by the codec and by reassembly resync
    ///
    /// A header is plausible only when the declared length is within
    /// protocol bounds, both ids are non-negative, and the opcode is one
    /// the codec knows. Anything else is not a message boundary.
    pub fn looks_valid(&self) -> bool {
        self.message_length >= MIN_MESSAGE_SIZE
            && self.message_length <= MAX_MESSAGE_SIZE
            && self.request_id >= 0
            && self.response_to >= 0
            && OpCode::is_known(self.op_code)
    }

    /// Body length implied by the declared message length
    pub fn body_len(&self) -> usize {
        (self.message_length as usize).saturating_sub(HEADER_LEN)
    }
}
