//! Legacy reply operation (opcode 1)

use crate::error::Result;
use crate::protocol::op::{OpMetadata, Replyable};
use crate::protocol::wire::{WireReader, WireWriter};
use bson::{Bson, Document};
use std::fmt;

/// Server reply to a legacy query or get-more
#[derive(Debug, Clone, PartialEq)]
pub struct ReplyOp {
    pub response_flags: i32,
    pub cursor_id: i64,
    pub starting_from: i32,
    pub num_returned: i32,
    pub docs: Vec<Document>,
}

impl ReplyOp {
    pub fn decode(body: &[u8]) -> Result<Self> {
        let mut r = WireReader::new(body);
        let response_flags = r.read_i32()?;
        let cursor_id = r.read_i64()?;
        let starting_from = r.read_i32()?;
        let num_returned = r.read_i32()?;
        let docs = r.read_documents_to_end()?;
        Ok(Self {
            response_flags,
            cursor_id,
            starting_from,
            num_returned,
            docs,
        })
    }

    pub fn encode(&self, w: &mut WireWriter) -> Result<()> {
        w.write_i32(self.response_flags);
        w.write_i64(self.cursor_id);
        w.write_i32(self.starting_from);
        w.write_i32(self.num_returned);
        for doc in &self.docs {
            w.write_document(doc)?;
        }
        Ok(())
    }

    /// Drop all but the first returned document to bound playback file size
    ///
    /// `num_returned` keeps the original count so statistics survive the cut.
    pub fn shorten(&mut self) {
        self.docs.truncate(1);
    }

    pub fn meta(&self) -> OpMetadata {
        OpMetadata {
            op: "reply",
            namespace: String::new(),
            command: String::new(),
        }
    }
}

impl Replyable for ReplyOp {
    fn cursor_id(&self) -> Option<i64> {
        if self.cursor_id != 0 {
            Some(self.cursor_id)
        } else {
            None
        }
    }

    fn num_returned(&self) -> i32 {
        self.num_returned
    }

    fn error_messages(&self) -> Vec<String> {
        self.docs
            .iter()
            .filter_map(|doc| match doc.get("$err") {
                Some(Bson::String(msg)) => Some(msg.clone()),
                _ => None,
            })
            .collect()
    }
}

impl fmt::Display for ReplyOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "reply cursor={} returned={} from={}",
            self.cursor_id, self.num_returned, self.starting_from
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bson::doc;

    #[test]
    fn test_reply_roundtrip() {
        let op = ReplyOp {
            response_flags: 8,
            cursor_id: 4567,
            starting_from: 0,
            num_returned: 2,
            docs: vec![doc! { "a": 1_i32 }, doc! { "a": 2_i32 }],
        };
        let mut w = WireWriter::new();
        op.encode(&mut w).unwrap();
        let decoded = ReplyOp::decode(&w.into_bytes()).unwrap();
        assert_eq!(decoded, op);
    }

    #[test]
    fn test_cursor_id_zero_means_none() {
        let op = ReplyOp {
            response_flags: 0,
            cursor_id: 0,
            starting_from: 0,
            num_returned: 0,
            docs: vec![],
        };
        assert_eq!(op.cursor_id(), None);
    }

    #[test]
    fn test_error_messages() {
        let op = ReplyOp {
            response_flags: 2,
            cursor_id: 0,
            starting_from: 0,
            num_returned: 1,
            docs: vec![doc! { "$err": "not authorized", "code": 13_i32 }],
        };
        assert_eq!(op.error_messages(), vec!["not authorized".to_string()]);
    }

    #[test]
    fn test_shorten_keeps_first_doc_and_count() {
        let mut op = ReplyOp {
            response_flags: 0,
            cursor_id: 9,
            starting_from: 0,
            num_returned: 3,
            docs: vec![doc! { "i": 0_i32 }, doc! { "i": 1_i32 }, doc! { "i": 2_i32 }],
        };
        op.shorten();
        assert_eq!(op.docs.len(), 1);
        assert_eq!(op.num_returned, 3);
        assert_eq!(op.docs[0].get_i32("i").unwrap(), 0);
    }
}
