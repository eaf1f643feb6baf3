//! Legacy update operation (opcode 2001)

use crate::error::Result;
use crate::protocol::op::OpMetadata;
use crate::protocol::wire::{abbreviated, WireReader, WireWriter};
use bson::Document;
use std::fmt;

#[derive(Debug, Clone, PartialEq)]
pub struct UpdateOp {
    pub full_collection_name: String,
    pub flags: i32,
    pub selector: Document,
    pub update: Document,
}

impl UpdateOp {
    pub fn decode(body: &[u8]) -> Result<Self> {
        let mut r = WireReader::new(body);
        r.read_i32()?; // reserved
        let full_collection_name = r.read_cstring()?;
        let flags = r.read_i32()?;
        let selector = r.read_document()?;
        let update = r.read_document()?;
        Ok(Self {
            full_collection_name,
            flags,
            selector,
            update,
        })
    }

    pub fn encode(&self, w: &mut WireWriter) -> Result<()> {
        w.write_i32(0);
        w.write_cstring(&self.full_collection_name);
        w.write_i32(self.flags);
        w.write_document(&self.selector)?;
        w.write_document(&self.update)?;
        Ok(())
    }

    pub fn meta(&self) -> OpMetadata {
        OpMetadata {
            op: "update",
            namespace: self.full_collection_name.clone(),
            command: String::new(),
        }
    }
}

impl fmt::Display for UpdateOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "update {} {} -> {}",
            self.full_collection_name,
            abbreviated(self.selector.to_string(), 128),
            abbreviated(self.update.to_string(), 128)
        )
    }
}
