//! Legacy insert operation (opcode 2002)

use crate::error::Result;
use crate::protocol::op::OpMetadata;
use crate::protocol::wire::{abbreviated, WireReader, WireWriter};
use bson::Document;
use std::fmt;

#[derive(Debug, Clone, PartialEq)]
pub struct InsertOp {
    pub flags: i32,
    pub full_collection_name: String,
    pub docs: Vec<Document>,
}

impl InsertOp {
    pub fn decode(body: &[u8]) -> Result<Self> {
        let mut r = WireReader::new(body);
        let flags = r.read_i32()?;
        let full_collection_name = r.read_cstring()?;
        let docs = r.read_documents_to_end()?;
        Ok(Self {
            flags,
            full_collection_name,
            docs,
        })
    }

    pub fn encode(&self, w: &mut WireWriter) -> Result<()> {
        w.write_i32(self.flags);
        w.write_cstring(&self.full_collection_name);
        for doc in &self.docs {
            w.write_document(doc)?;
        }
        Ok(())
    }

    pub fn meta(&self) -> OpMetadata {
        OpMetadata {
            op: "insert",
            namespace: self.full_collection_name.clone(),
            command: String::new(),
        }
    }
}

impl fmt::Display for InsertOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let first = self
            .docs
            .first()
            .map(|d| abbreviated(d.to_string(), 128))
            .unwrap_or_default();
        write!(
            f,
            "insert {} docs={} {}",
            self.full_collection_name,
            self.docs.len(),
            first
        )
    }
}
