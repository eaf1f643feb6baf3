//! Legacy query operation (opcode 2004)

use crate::error::Result;
use crate::protocol::op::OpMetadata;
use crate::protocol::wire::{abbreviated, WireReader, WireWriter};
use bson::Document;
use std::fmt;

/// A legacy wire query: flags, namespace, skip/limit, selector, optional
/// projection
#[derive(Debug, Clone, PartialEq)]
pub struct QueryOp {
    pub flags: i32,
    pub full_collection_name: String,
    pub num_to_skip: i32,
    pub num_to_return: i32,
    pub query: Document,
    pub return_fields: Option<Document>,
}

impl QueryOp {
    pub fn decode(body: &[u8]) -> Result<Self> {
        let mut r = WireReader::new(body);
        let flags = r.read_i32()?;
        let full_collection_name = r.read_cstring()?;
        let num_to_skip = r.read_i32()?;
        let num_to_return = r.read_i32()?;
        let query = r.read_document()?;
        let return_fields = if r.is_empty() { None } else { Some(r.read_document()?) };
        Ok(Self {
            flags,
            full_collection_name,
            num_to_skip,
            num_to_return,
            query,
            return_fields,
        })
    }

    pub fn encode(&self, w: &mut WireWriter) -> Result<()> {
        w.write_i32(self.flags);
        w.write_cstring(&self.full_collection_name);
        w.write_i32(self.num_to_skip);
        w.write_i32(self.num_to_return);
        w.write_document(&self.query)?;
        if let Some(ref fields) = self.return_fields {
            w.write_document(fields)?;
        }
        Ok(())
    }

    /// Command name when this query targets a `$cmd` namespace
    pub fn command_name(&self) -> Option<&str> {
        if self.full_collection_name.ends_with(".$cmd") {
            self.query.keys().next().map(|k| k.as_str())
        } else {
            None
        }
    }

    pub fn meta(&self) -> OpMetadata {
        OpMetadata {
            op: "query",
            namespace: self.full_collection_name.clone(),
            command: self.command_name().unwrap_or("").to_string(),
        }
    }
}

impl fmt::Display for QueryOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "query {} skip={} limit={} {}",
            self.full_collection_name,
            self.num_to_skip,
            self.num_to_return,
            abbreviated(self.query.to_string(), 256)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bson::doc;

    #[test]
    fn test_query_roundtrip() {
        let op = QueryOp {
            flags: 4,
            full_collection_name: "app.users".to_string(),
            num_to_skip: 2,
            num_to_return: 100,
            query: doc! { "name": "a" },
            return_fields: Some(doc! { "name": 1_i32 }),
        };
        let mut w = WireWriter::new();
        op.encode(&mut w).unwrap();
        let decoded = QueryOp::decode(&w.into_bytes()).unwrap();
        assert_eq!(decoded, op);
    }

    #[test]
    fn test_query_roundtrip_without_projection() {
        let op = QueryOp {
            flags: 0,
            full_collection_name: "app.events".to_string(),
            num_to_skip: 0,
            num_to_return: 0,
            query: doc! {},
            return_fields: None,
        };
        let mut w = WireWriter::new();
        op.encode(&mut w).unwrap();
        let decoded = QueryOp::decode(&w.into_bytes()).unwrap();
        assert_eq!(decoded, op);
    }

    #[test]
    fn test_command_name_only_on_cmd_namespace() {
        let mut op = QueryOp {
            flags: 0,
            full_collection_name: "admin.$cmd".to_string(),
            num_to_skip: 0,
            num_to_return: -1,
            query: doc! { "isMaster": 1_i32 },
            return_fields: None,
        };
        assert_eq!(op.command_name(), Some("isMaster"));
        op.full_collection_name = "admin.users".to_string();
        assert_eq!(op.command_name(), None);
    }
}
