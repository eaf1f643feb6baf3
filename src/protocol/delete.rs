//! Legacy delete operation (opcode 2006)

use crate::error::Result;
use crate::protocol::op::OpMetadata;
use crate::protocol::wire::{abbreviated, WireReader, WireWriter};
use bson::Document;
use std::fmt;

#[derive(Debug, Clone, PartialEq)]
pub struct DeleteOp {
    pub full_collection_name: String,
    pub flags: i32,
    pub selector: Document,
}

impl DeleteOp {
    pub fn decode(body: &[u8]) -> Result<Self> {
        let mut r = WireReader::new(body);
        r.read_i32()?; // reserved
        let full_collection_name = r.read_cstring()?;
        let flags = r.read_i32()?;
        let selector = r.read_document()?;
        Ok(Self {
            full_collection_name,
            flags,
            selector,
        })
    }

    pub fn encode(&self, w: &mut WireWriter) -> Result<()> {
        w.write_i32(0);
        w.write_cstring(&self.full_collection_name);
        w.write_i32(self.flags);
        w.write_document(&self.selector)?;
        Ok(())
    }

    pub fn meta(&self) -> OpMetadata {
        OpMetadata {
            op: "delete",
            namespace: self.full_collection_name.clone(),
            command: String::new(),
        }
    }
}

impl fmt::Display for DeleteOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "delete {} {}",
            self.full_collection_name,
            abbreviated(self.selector.to_string(), 128)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bson::doc;

    #[test]
    fn test_delete_roundtrip() {
        let op = DeleteOp {
            full_collection_name: "app.sessions".to_string(),
            flags: 1,
            selector: doc! { "expired": true },
        };
        let mut w = WireWriter::new();
        op.encode(&mut w).unwrap();
        let decoded = DeleteOp::decode(&w.into_bytes()).unwrap();
        assert_eq!(decoded, op);
    }

    #[test]
    fn test_delete_truncated_selector() {
        let mut w = WireWriter::new();
        w.write_i32(0);
        w.write_cstring("app.sessions");
        w.write_i32(0);
        w.write_i32(64); // document length with no document bytes
        assert!(DeleteOp::decode(&w.into_bytes()).is_err());
    }
}
