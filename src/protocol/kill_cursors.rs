//! Legacy kill-cursors operation (opcode 2007)

use crate::error::{ProtocolError, Result};
use crate::protocol::op::{CursorBearing, OpMetadata};
use crate::protocol::wire::{WireReader, WireWriter};
use std::fmt;

#[derive(Debug, Clone, PartialEq)]
pub struct KillCursorsOp {
    pub cursor_ids: Vec<i64>,
}

impl KillCursorsOp {
    pub fn decode(body: &[u8]) -> Result<Self> {
        let mut r = WireReader::new(body);
        r.read_i32()?; // reserved
        let count = r.read_i32()?;
        if count < 0 {
            return Err(
                ProtocolError::invalid_field("number_of_cursor_ids", format!("{}", count)).into(),
            );
        }
        let mut cursor_ids = Vec::with_capacity(count as usize);
        for _ in 0..count {
            cursor_ids.push(r.read_i64()?);
        }
        Ok(Self { cursor_ids })
    }

    pub fn encode(&self, w: &mut WireWriter) -> Result<()> {
        w.write_i32(0);
        w.write_i32(self.cursor_ids.len() as i32);
        for id in &self.cursor_ids {
            w.write_i64(*id);
        }
        Ok(())
    }

    pub fn meta(&self) -> OpMetadata {
        OpMetadata {
            op: "killcursors",
            namespace: String::new(),
            command: String::new(),
        }
    }
}

impl CursorBearing for KillCursorsOp {
    fn cursor_ids(&self) -> Vec<i64> {
        self.cursor_ids.clone()
    }

    fn set_cursor_ids(&mut self, ids: &[i64]) -> Result<()> {
        self.cursor_ids = ids.to_vec();
        Ok(())
    }
}

impl fmt::Display for KillCursorsOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "killcursors {:?}", self.cursor_ids)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kill_cursors_roundtrip() {
        let op = KillCursorsOp {
            cursor_ids: vec![1, -2, 1 << 50],
        };
        let mut w = WireWriter::new();
        op.encode(&mut w).unwrap();
        let decoded = KillCursorsOp::decode(&w.into_bytes()).unwrap();
        assert_eq!(decoded, op);
    }

    #[test]
    fn test_kill_cursors_truncated_ids() {
        let mut w = WireWriter::new();
        w.write_i32(0);
        w.write_i32(2);
        w.write_i64(1);
        assert!(KillCursorsOp::decode(&w.into_bytes()).is_err());
    }

    #[test]
    fn test_cursor_rewrite_can_shrink() {
        let mut op = KillCursorsOp {
            cursor_ids: vec![10, 20, 30],
        };
        op.set_cursor_ids(&[99]).unwrap();
        assert_eq!(op.cursor_ids, vec![99]);
    }
}
