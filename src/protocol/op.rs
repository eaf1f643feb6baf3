//! Typed operation model
//!
//! [`Op`] is a closed sum over every supported wire operation. The codec is
//! the only place that dispatches on opcodes; everywhere else callers ask an
//! op for the capabilities it supports ([`CursorBearing`], [`Replyable`])
//! instead of probing its variant.

use crate::error::{ProtocolError, Result};
use crate::protocol::command::{CommandGetMoreOp, CommandOp, CommandReplyOp};
use crate::protocol::compressed;
use crate::protocol::delete::DeleteOp;
use crate::protocol::get_more::GetMoreOp;
use crate::protocol::header::{MsgHeader, OpCode, HEADER_LEN};
use crate::protocol::insert::InsertOp;
use crate::protocol::kill_cursors::KillCursorsOp;
use crate::protocol::msg::{MessageOp, UnknownOp};
use crate::protocol::query::QueryOp;
use crate::protocol::reply::ReplyOp;
use crate::protocol::update::UpdateOp;
use crate::protocol::wire::WireWriter;
use std::fmt;

/// Ops that reference server-side cursors and can have those references
/// rewritten before dispatch
pub trait CursorBearing {
    fn cursor_ids(&self) -> Vec<i64>;
    fn set_cursor_ids(&mut self, ids: &[i64]) -> Result<()>;
}

/// Reply-shaped ops that can report the cursor they define, the documents
/// they carry, and any embedded error messages
pub trait Replyable {
    fn cursor_id(&self) -> Option<i64>;
    fn num_returned(&self) -> i32;
    fn error_messages(&self) -> Vec<String>;
}

/// Compact summary used by telemetry and log lines
#[derive(Debug, Clone, Default, PartialEq, Eq, serde::Serialize)]
pub struct OpMetadata {
    pub op: &'static str,
    pub namespace: String,
    pub command: String,
}

/// One decoded wire operation
#[derive(Debug, Clone, PartialEq)]
pub enum Op {
    Query(QueryOp),
    Reply(ReplyOp),
    Insert(InsertOp),
    Update(UpdateOp),
    Delete(DeleteOp),
    GetMore(GetMoreOp),
    KillCursors(KillCursorsOp),
    Command(CommandOp),
    CommandGetMore(CommandGetMoreOp),
    CommandReply(CommandReplyOp),
    Message(MessageOp),
    Unknown(UnknownOp),
}

impl Op {
    /// Decode a message body according to its header's opcode
    ///
    /// Compressed messages are unwrapped first and re-dispatched with the
    /// synthesized inner header; a compressed message inside a compressed
    /// message is rejected.
    pub fn decode(header: &MsgHeader, body: &[u8]) -> Result<Op> {
        if header.opcode() == OpCode::Compressed {
            let (inner_header, inner_body) = compressed::unwrap(header, body)?;
            if inner_header.opcode() == OpCode::Compressed {
                return Err(ProtocolError::operation(
                    "decode",
                    "nested compressed message".to_string(),
                )
                .into());
            }
            return Op::decode(&inner_header, &inner_body);
        }

        let op = match header.opcode() {
            OpCode::Query => Op::Query(QueryOp::decode(body)?),
            OpCode::Reply => Op::Reply(ReplyOp::decode(body)?),
            OpCode::Insert => Op::Insert(InsertOp::decode(body)?),
            OpCode::Update => Op::Update(UpdateOp::decode(body)?),
            OpCode::Delete => Op::Delete(DeleteOp::decode(body)?),
            OpCode::GetMore => Op::GetMore(GetMoreOp::decode(body)?),
            OpCode::KillCursors => Op::KillCursors(KillCursorsOp::decode(body)?),
            OpCode::Command => {
                let command = CommandOp::decode(body)?;
                if command.is_get_more() {
                    Op::CommandGetMore(CommandGetMoreOp::new(command))
                } else {
                    Op::Command(command)
                }
            }
            OpCode::CommandReply => Op::CommandReply(CommandReplyOp::decode(body)?),
            OpCode::Message => Op::Message(MessageOp::decode(body)?),
            OpCode::Reserved => Op::Unknown(UnknownOp::decode(header.op_code, body)?),
            OpCode::Compressed => unreachable!("handled above"),
            OpCode::Unknown(code) => Op::Unknown(UnknownOp::decode(code, body)?),
        };
        Ok(op)
    }

    /// Encode the body for this operation (inverse of [`Op::decode`])
    pub fn encode_body(&self) -> Result<Vec<u8>> {
        let mut w = WireWriter::new();
        match self {
            Op::Query(op) => op.encode(&mut w)?,
            Op::Reply(op) => op.encode(&mut w)?,
            Op::Insert(op) => op.encode(&mut w)?,
            Op::Update(op) => op.encode(&mut w)?,
            Op::Delete(op) => op.encode(&mut w)?,
            Op::GetMore(op) => op.encode(&mut w)?,
            Op::KillCursors(op) => op.encode(&mut w)?,
            Op::Command(op) => op.encode(&mut w)?,
            Op::CommandGetMore(op) => op.encode(&mut w)?,
            Op::CommandReply(op) => op.encode(&mut w)?,
            Op::Message(op) => op.encode(&mut w)?,
            Op::Unknown(op) => op.encode(&mut w)?,
        }
        Ok(w.into_bytes())
    }

    /// Encode a complete wire message with the given ids
    pub fn encode_message(&self, request_id: i32, response_to: i32) -> Result<Vec<u8>> {
        let body = self.encode_body()?;
        let header = MsgHeader {
            message_length: (HEADER_LEN + body.len()) as i32,
            request_id,
            response_to,
            op_code: self.opcode().as_i32(),
        };
        let mut out = Vec::with_capacity(HEADER_LEN + body.len());
        out.extend_from_slice(&header.to_bytes());
        out.extend_from_slice(&body);
        Ok(out)
    }

    pub fn opcode(&self) -> OpCode {
        match self {
            Op::Query(_) => OpCode::Query,
            Op::Reply(_) => OpCode::Reply,
            Op::Insert(_) => OpCode::Insert,
            Op::Update(_) => OpCode::Update,
            Op::Delete(_) => OpCode::Delete,
            Op::GetMore(_) => OpCode::GetMore,
            Op::KillCursors(_) => OpCode::KillCursors,
            Op::Command(_) | Op::CommandGetMore(_) => OpCode::Command,
            Op::CommandReply(_) => OpCode::CommandReply,
            Op::Message(_) => OpCode::Message,
            Op::Unknown(op) => OpCode::from_i32(op.op_code),
        }
    }

    pub fn meta(&self) -> OpMetadata {
        match self {
            Op::Query(op) => op.meta(),
            Op::Reply(op) => op.meta(),
            Op::Insert(op) => op.meta(),
            Op::Update(op) => op.meta(),
            Op::Delete(op) => op.meta(),
            Op::GetMore(op) => op.meta(),
            Op::KillCursors(op) => op.meta(),
            Op::Command(op) => op.meta(),
            Op::CommandGetMore(op) => op.meta(),
            Op::CommandReply(op) => op.meta(),
            Op::Message(op) => op.meta(),
            Op::Unknown(op) => op.meta(),
        }
    }

    /// Cursor capability, if this variant references cursors
    pub fn cursor_bearing(&self) -> Option<&dyn CursorBearing> {
        match self {
            Op::GetMore(op) => Some(op),
            Op::KillCursors(op) => Some(op),
            Op::CommandGetMore(op) => Some(op),
            _ => None,
        }
    }

    /// Mutable cursor capability for rewriting before dispatch
    pub fn cursor_bearing_mut(&mut self) -> Option<&mut dyn CursorBearing> {
        match self {
            Op::GetMore(op) => Some(op),
            Op::KillCursors(op) => Some(op),
            Op::CommandGetMore(op) => Some(op),
            _ => None,
        }
    }

    /// Reply capability, if this variant is reply-shaped
    pub fn replyable(&self) -> Option<&dyn Replyable> {
        match self {
            Op::Reply(op) => Some(op),
            Op::CommandReply(op) => Some(op),
            _ => None,
        }
    }

    /// True for operations a client originates (everything that is not a
    /// server reply)
    pub fn is_request(&self) -> bool {
        self.replyable().is_none()
    }

    /// True when dispatching this op should wait for a server reply
    pub fn expects_reply(&self) -> bool {
        matches!(
            self,
            Op::Query(_) | Op::GetMore(_) | Op::Command(_) | Op::CommandGetMore(_)
        )
    }

    /// Classify driver-internal housekeeping traffic
    ///
    /// Handshake, liveness, and authentication commands are issued by
    /// drivers on their own; replaying them alongside application traffic
    /// only adds noise, so `filter` can strip them.
    pub fn is_driver_op(&self) -> bool {
        const DRIVER_COMMANDS: &[&str] = &[
            "isMaster",
            "ismaster",
            "hello",
            "ping",
            "getnonce",
            "logout",
            "saslStart",
            "saslContinue",
        ];
        let command = match self {
            Op::Query(op) => match op.command_name() {
                Some(name) => name.to_string(),
                None => return false,
            },
            Op::Command(op) => op.command_name.clone(),
            _ => return false,
        };
        DRIVER_COMMANDS.iter().any(|c| *c == command)
    }
}

impl fmt::Display for Op {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Op::Query(op) => fmt::Display::fmt(op, f),
            Op::Reply(op) => fmt::Display::fmt(op, f),
            Op::Insert(op) => fmt::Display::fmt(op, f),
            Op::Update(op) => fmt::Display::fmt(op, f),
            Op::Delete(op) => fmt::Display::fmt(op, f),
            Op::GetMore(op) => fmt::Display::fmt(op, f),
            Op::KillCursors(op) => fmt::Display::fmt(op, f),
            Op::Command(op) => fmt::Display::fmt(op, f),
            Op::CommandGetMore(op) => fmt::Display::fmt(op, f),
            Op::CommandReply(op) => fmt::Display::fmt(op, f),
            Op::Message(op) => fmt::Display::fmt(op, f),
            Op::Unknown(op) => fmt::Display::fmt(op, f),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bson::doc;

    fn roundtrip(op: Op) {
        let body = op.encode_body().unwrap();
        let header = MsgHeader {
            message_length: (HEADER_LEN + body.len()) as i32,
            request_id: 1,
            response_to: 0,
            op_code: op.opcode().as_i32(),
        };
        let decoded = Op::decode(&header, &body).unwrap();
        assert_eq!(decoded, op);
    }

    #[test]
    fn test_decode_encode_roundtrip_every_variant() {
        roundtrip(Op::Query(QueryOp {
            flags: 0,
            full_collection_name: "db.coll".into(),
            num_to_skip: 0,
            num_to_return: 10,
            query: doc! { "x": 1_i32 },
            return_fields: None,
        }));
        roundtrip(Op::Reply(ReplyOp {
            response_flags: 0,
            cursor_id: 77,
            starting_from: 0,
            num_returned: 1,
            docs: vec![doc! { "ok": 1.0 }],
        }));
        roundtrip(Op::Insert(InsertOp {
            flags: 0,
            full_collection_name: "db.coll".into(),
            docs: vec![doc! { "a": 1_i32 }],
        }));
        roundtrip(Op::Update(UpdateOp {
            full_collection_name: "db.coll".into(),
            flags: 0,
            selector: doc! { "a": 1_i32 },
            update: doc! { "$inc": { "a": 1_i32 } },
        }));
        roundtrip(Op::Delete(DeleteOp {
            full_collection_name: "db.coll".into(),
            flags: 0,
            selector: doc! {},
        }));
        roundtrip(Op::GetMore(GetMoreOp {
            full_collection_name: "db.coll".into(),
            num_to_return: 0,
            cursor_id: 12,
        }));
        roundtrip(Op::KillCursors(KillCursorsOp {
            cursor_ids: vec![1, 2],
        }));
        roundtrip(Op::Command(CommandOp {
            database: "db".into(),
            command_name: "count".into(),
            metadata: doc! {},
            command_args: doc! { "count": "coll" },
            input_docs: vec![],
        }));
        roundtrip(Op::CommandReply(CommandReplyOp {
            metadata: doc! {},
            command_reply: doc! { "ok": 1.0 },
            output_docs: vec![],
        }));
        roundtrip(Op::Message(MessageOp {
            message: vec![9, 9, 9],
        }));
    }

    #[test]
    fn test_get_more_command_is_reclassified() {
        let command = CommandOp {
            database: "app".into(),
            command_name: "getMore".into(),
            metadata: doc! {},
            command_args: doc! { "getMore": 55_i64, "collection": "c" },
            input_docs: vec![],
        };
        let op = Op::Command(command);
        // encode as a plain command, decode comes back distinguished
        let body = op.encode_body().unwrap();
        let header = MsgHeader {
            message_length: (HEADER_LEN + body.len()) as i32,
            request_id: 1,
            response_to: 0,
            op_code: OpCode::Command.as_i32(),
        };
        let decoded = Op::decode(&header, &body).unwrap();
        match &decoded {
            Op::CommandGetMore(get_more) => {
                assert_eq!(get_more.cursor_ids(), vec![55]);
            }
            other => panic!("expected CommandGetMore, got {:?}", other.opcode()),
        }
        assert!(decoded.cursor_bearing().is_some());
    }

    #[test]
    fn test_compressed_decode() {
        let inner = Op::Query(QueryOp {
            flags: 0,
            full_collection_name: "db.coll".into(),
            num_to_skip: 0,
            num_to_return: 1,
            query: doc! { "a": 1_i32 },
            return_fields: None,
        });
        let inner_body = inner.encode_body().unwrap();
        let body = compressed::wrap(
            OpCode::Query.as_i32(),
            &inner_body,
            compressed::COMPRESSOR_SNAPPY,
        )
        .unwrap();
        let header = MsgHeader {
            message_length: (HEADER_LEN + body.len()) as i32,
            request_id: 5,
            response_to: 0,
            op_code: OpCode::Compressed.as_i32(),
        };
        let decoded = Op::decode(&header, &body).unwrap();
        assert_eq!(decoded, inner);
    }

    #[test]
    fn test_capabilities() {
        let get_more = Op::GetMore(GetMoreOp {
            full_collection_name: "db.c".into(),
            num_to_return: 0,
            cursor_id: 5,
        });
        assert!(get_more.cursor_bearing().is_some());
        assert!(get_more.replyable().is_none());
        assert!(get_more.is_request());
        assert!(get_more.expects_reply());

        let reply = Op::Reply(ReplyOp {
            response_flags: 0,
            cursor_id: 5,
            starting_from: 0,
            num_returned: 0,
            docs: vec![],
        });
        assert!(reply.cursor_bearing().is_none());
        assert!(reply.replyable().is_some());
        assert!(!reply.is_request());

        let insert = Op::Insert(InsertOp {
            flags: 0,
            full_collection_name: "db.c".into(),
            docs: vec![],
        });
        assert!(!insert.expects_reply());
    }

    #[test]
    fn test_driver_op_classification() {
        let is_master = Op::Query(QueryOp {
            flags: 0,
            full_collection_name: "admin.$cmd".into(),
            num_to_skip: 0,
            num_to_return: -1,
            query: doc! { "isMaster": 1_i32 },
            return_fields: None,
        });
        assert!(is_master.is_driver_op());

        let ping = Op::Command(CommandOp {
            database: "admin".into(),
            command_name: "ping".into(),
            metadata: doc! {},
            command_args: doc! { "ping": 1_i32 },
            input_docs: vec![],
        });
        assert!(ping.is_driver_op());

        let find = Op::Query(QueryOp {
            flags: 0,
            full_collection_name: "app.users".into(),
            num_to_skip: 0,
            num_to_return: 0,
            query: doc! { "name": "a" },
            return_fields: None,
        });
        assert!(!find.is_driver_op());
    }

    #[test]
    fn test_unknown_opcode_preserved() {
        let header = MsgHeader {
            message_length: (HEADER_LEN + 3) as i32,
            request_id: 1,
            response_to: 0,
            op_code: 2013,
        };
        let decoded = Op::decode(&header, &[1, 2, 3]).unwrap();
        match &decoded {
            Op::Unknown(op) => assert_eq!(op.op_code, 2013),
            other => panic!("expected Unknown, got {:?}", other.opcode()),
        }
        assert_eq!(decoded.encode_body().unwrap(), vec![1, 2, 3]);
    }
}
