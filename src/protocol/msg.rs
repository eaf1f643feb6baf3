//! Generic message (opcode 1000) and unrecognized operations
//!
//! Both carry opaque bodies: the codec records the bytes and replays them
//! untouched. They never participate in cursor remapping or reply pairing.

use crate::error::Result;
use crate::protocol::op::OpMetadata;
use crate::protocol::wire::WireWriter;
use std::fmt;

/// Generic wire message, body treated as opaque bytes
#[derive(Debug, Clone, PartialEq)]
pub struct MessageOp {
    pub message: Vec<u8>,
}

impl MessageOp {
    pub fn decode(body: &[u8]) -> Result<Self> {
        Ok(Self {
            message: body.to_vec(),
        })
    }

    pub fn encode(&self, w: &mut WireWriter) -> Result<()> {
        w.write_bytes(&self.message);
        Ok(())
    }

    pub fn meta(&self) -> OpMetadata {
        OpMetadata {
            op: "message",
            namespace: String::new(),
            command: String::new(),
        }
    }
}

impl fmt::Display for MessageOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "message len={}", self.message.len())
    }
}

/// Operation with an opcode outside the supported set
#[derive(Debug, Clone, PartialEq)]
pub struct UnknownOp {
    pub op_code: i32,
    pub body: Vec<u8>,
}

impl UnknownOp {
    pub fn decode(op_code: i32, body: &[u8]) -> Result<Self> {
        Ok(Self {
            op_code,
            body: body.to_vec(),
        })
    }

    pub fn encode(&self, w: &mut WireWriter) -> Result<()> {
        w.write_bytes(&self.body);
        Ok(())
    }

    pub fn meta(&self) -> OpMetadata {
        OpMetadata {
            op: "unknown",
            namespace: String::new(),
            command: String::new(),
        }
    }
}

impl fmt::Display for UnknownOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "unknown opcode={} len={}", self.op_code, self.body.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_message_passthrough() {
        let op = MessageOp::decode(b"payload").unwrap();
        let mut w = WireWriter::new();
        op.encode(&mut w).unwrap();
        assert_eq!(w.into_bytes(), b"payload");
    }

    #[test]
    fn test_unknown_passthrough() {
        let op = UnknownOp::decode(4242, &[1, 2, 3]).unwrap();
        assert_eq!(op.op_code, 4242);
        let mut w = WireWriter::new();
        op.encode(&mut w).unwrap();
        assert_eq!(w.into_bytes(), vec![1, 2, 3]);
    }
}
