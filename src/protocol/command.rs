//! Intermediate command protocol (opcodes 2010/2011)
//!
//! A command whose name is `getMore` is reclassified by the codec into
//! [`CommandGetMoreOp`] so cursor remapping can treat it uniformly with the
//! legacy get-more operation.

use crate::error::{ProtocolError, Result};
use crate::protocol::op::{CursorBearing, OpMetadata, Replyable};
use crate::protocol::wire::{abbreviated, WireReader, WireWriter};
use bson::{Bson, Document};
use std::fmt;

#[derive(Debug, Clone, PartialEq)]
pub struct CommandOp {
    pub database: String,
    pub command_name: String,
    pub metadata: Document,
    pub command_args: Document,
    pub input_docs: Vec<Document>,
}

impl CommandOp {
    pub fn decode(body: &[u8]) -> Result<Self> {
        let mut r = WireReader::new(body);
        let database = r.read_cstring()?;
        let command_name = r.read_cstring()?;
        let metadata = r.read_document()?;
        let command_args = r.read_document()?;
        let input_docs = r.read_documents_to_end()?;
        Ok(Self {
            database,
            command_name,
            metadata,
            command_args,
            input_docs,
        })
    }

    pub fn encode(&self, w: &mut WireWriter) -> Result<()> {
        w.write_cstring(&self.database);
        w.write_cstring(&self.command_name);
        w.write_document(&self.metadata)?;
        w.write_document(&self.command_args)?;
        for doc in &self.input_docs {
            w.write_document(doc)?;
        }
        Ok(())
    }

    pub fn is_get_more(&self) -> bool {
        self.command_name == "getMore"
    }

    pub fn meta(&self) -> OpMetadata {
        OpMetadata {
            op: "command",
            namespace: self.database.clone(),
            command: self.command_name.clone(),
        }
    }
}

impl fmt::Display for CommandOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "command {}.{} {}",
            self.database,
            self.command_name,
            abbreviated(self.command_args.to_string(), 256)
        )
    }
}

/// A `getMore` expressed through the command protocol
///
/// Wraps the underlying command so encode stays the inverse of decode while
/// exposing the referenced cursor the way legacy get-more does.
#[derive(Debug, Clone, PartialEq)]
pub struct CommandGetMoreOp {
    pub command: CommandOp,
}

impl CommandGetMoreOp {
    pub fn new(command: CommandOp) -> Self {
        Self { command }
    }

    /// Cursor id from the `getMore` argument, if present and numeric
    pub fn cursor_id(&self) -> Option<i64> {
        match self.command.command_args.get("getMore") {
            Some(Bson::Int64(id)) => Some(*id),
            Some(Bson::Int32(id)) => Some(*id as i64),
            _ => None,
        }
    }

    pub fn encode(&self, w: &mut WireWriter) -> Result<()> {
        self.command.encode(w)
    }

    pub fn meta(&self) -> OpMetadata {
        let mut meta = self.command.meta();
        meta.op = "command(getmore)";
        meta
    }
}

impl CursorBearing for CommandGetMoreOp {
    fn cursor_ids(&self) -> Vec<i64> {
        self.cursor_id().map(|id| vec![id]).unwrap_or_default()
    }

    fn set_cursor_ids(&mut self, ids: &[i64]) -> Result<()> {
        match ids {
            [id] => {
                self.command.command_args.insert("getMore", Bson::Int64(*id));
                Ok(())
            }
            _ => Err(ProtocolError::invalid_field(
                "cursor_ids",
                format!("getMore command takes exactly one cursor, got {}", ids.len()),
            )
            .into()),
        }
    }
}

impl fmt::Display for CommandGetMoreOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "command getmore {} cursor={}",
            self.command.database,
            self.cursor_id().unwrap_or(0)
        )
    }
}

/// Reply to a command-protocol request (opcode 2011)
#[derive(Debug, Clone, PartialEq)]
pub struct CommandReplyOp {
    pub metadata: Document,
    pub command_reply: Document,
    pub output_docs: Vec<Document>,
}

impl CommandReplyOp {
    pub fn decode(body: &[u8]) -> Result<Self> {
        let mut r = WireReader::new(body);
        let metadata = r.read_document()?;
        let command_reply = r.read_document()?;
        let output_docs = r.read_documents_to_end()?;
        Ok(Self {
            metadata,
            command_reply,
            output_docs,
        })
    }

    pub fn encode(&self, w: &mut WireWriter) -> Result<()> {
        w.write_document(&self.metadata)?;
        w.write_document(&self.command_reply)?;
        for doc in &self.output_docs {
            w.write_document(doc)?;
        }
        Ok(())
    }

    /// Drop the batch documents inside the reply to bound file size
    pub fn shorten(&mut self) {
        self.output_docs.truncate(1);
        if let Some(Bson::Document(cursor)) = self.command_reply.get_mut("cursor") {
            for key in ["firstBatch", "nextBatch"] {
                if let Some(Bson::Array(batch)) = cursor.get_mut(key) {
                    batch.truncate(1);
                }
            }
        }
    }

    fn cursor_doc(&self) -> Option<&Document> {
        self.command_reply.get_document("cursor").ok()
    }

    pub fn meta(&self) -> OpMetadata {
        OpMetadata {
            op: "command_reply",
            namespace: String::new(),
            command: String::new(),
        }
    }
}

impl Replyable for CommandReplyOp {
    fn cursor_id(&self) -> Option<i64> {
        let id = self.cursor_doc()?.get_i64("id").ok()?;
        if id != 0 {
            Some(id)
        } else {
            None
        }
    }

    fn num_returned(&self) -> i32 {
        let batch_len = |key: &str| -> Option<usize> {
            match self.cursor_doc()?.get(key) {
                Some(Bson::Array(batch)) => Some(batch.len()),
                _ => None,
            }
        };
        batch_len("firstBatch")
            .or_else(|| batch_len("nextBatch"))
            .unwrap_or(self.output_docs.len()) as i32
    }

    fn error_messages(&self) -> Vec<String> {
        let mut errors = Vec::new();
        if let Ok(msg) = self.command_reply.get_str("errmsg") {
            // ok: 1 replies may still carry an informational errmsg
            let failed = match self.command_reply.get("ok") {
                Some(Bson::Double(ok)) => *ok == 0.0,
                Some(Bson::Int32(ok)) => *ok == 0,
                Some(Bson::Int64(ok)) => *ok == 0,
                _ => true,
            };
            if failed {
                errors.push(msg.to_string());
            }
        }
        errors
    }
}

impl fmt::Display for CommandReplyOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "command_reply {}",
            abbreviated(self.command_reply.to_string(), 256)
        )
    }
}
