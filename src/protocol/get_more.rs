//! Legacy get-more operation (opcode 2005)

use crate::error::{ProtocolError, Result};
use crate::protocol::op::{CursorBearing, OpMetadata};
use crate::protocol::wire::{WireReader, WireWriter};
use std::fmt;

#[derive(Debug, Clone, PartialEq)]
pub struct GetMoreOp {
    pub full_collection_name: String,
    pub num_to_return: i32,
    pub cursor_id: i64,
}

impl GetMoreOp {
    pub fn decode(body: &[u8]) -> Result<Self> {
        let mut r = WireReader::new(body);
        r.read_i32()?; // reserved
        let full_collection_name = r.read_cstring()?;
        let num_to_return = r.read_i32()?;
        let cursor_id = r.read_i64()?;
        Ok(Self {
            full_collection_name,
            num_to_return,
            cursor_id,
        })
    }

    pub fn encode(&self, w: &mut WireWriter) -> Result<()> {
        w.write_i32(0);
        w.write_cstring(&self.full_collection_name);
        w.write_i32(self.num_to_return);
        w.write_i64(self.cursor_id);
        Ok(())
    }

    pub fn meta(&self) -> OpMetadata {
        OpMetadata {
            op: "getmore",
            namespace: self.full_collection_name.clone(),
            command: String::new(),
        }
    }
}

impl CursorBearing for GetMoreOp {
    fn cursor_ids(&self) -> Vec<i64> {
        vec![self.cursor_id]
    }

    fn set_cursor_ids(&mut self, ids: &[i64]) -> Result<()> {
        match ids {
            [id] => {
                self.cursor_id = *id;
                Ok(())
            }
            _ => Err(ProtocolError::invalid_field(
                "cursor_ids",
                format!("getmore takes exactly one cursor, got {}", ids.len()),
            )
            .into()),
        }
    }
}

impl fmt::Display for GetMoreOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "getmore {} cursor={} limit={}",
            self.full_collection_name, self.cursor_id, self.num_to_return
        )
    }
}
