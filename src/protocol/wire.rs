//! Read/write primitives for legacy wire-operation bodies
//!
//! Operation bodies are a flat concatenation of little-endian integers,
//! NUL-terminated namespace strings, and length-prefixed BSON documents.
//! [`WireReader`] walks a borrowed body slice; [`WireWriter`] builds the
//! inverse encoding for the playback format and for rewritten dispatch.

use crate::error::{ProtocolError, Result};
use bson::Document;

/// Cursor over a wire-operation body slice
pub struct WireReader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> WireReader<'a> {
    pub fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    pub fn remaining(&self) -> usize {
        self.buf.len() - self.pos
    }

    pub fn is_empty(&self) -> bool {
        self.remaining() == 0
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8]> {
        if self.remaining() < n {
            return Err(ProtocolError::truncated(n, self.remaining()).into());
        }
        let slice = &self.buf[self.pos..self.pos + n];
        self.pos += n;
        Ok(slice)
    }

    pub fn read_u8(&mut self) -> Result<u8> {
        Ok(self.take(1)?[0])
    }

    pub fn read_i32(&mut self) -> Result<i32> {
        let b = self.take(4)?;
        Ok(i32::from_le_bytes([b[0], b[1], b[2], b[3]]))
    }

    pub fn read_i64(&mut self) -> Result<i64> {
        let b = self.take(8)?;
        Ok(i64::from_le_bytes([b[0], b[1], b[2], b[3], b[4], b[5], b[6], b[7]]))
    }

    /// Read a NUL-terminated string (namespace, command name)
    pub fn read_cstring(&mut self) -> Result<String> {
        let rest = &self.buf[self.pos..];
        let nul = rest
            .iter()
            .position(|&b| b == 0)
            .ok_or_else(|| ProtocolError::from("unterminated cstring".to_string()))?;
        let s = std::str::from_utf8(&rest[..nul])
            .map_err(|e| ProtocolError::invalid_field("cstring", e.to_string()))?
            .to_string();
        self.pos += nul + 1;
        Ok(s)
    }

    /// Read one length-prefixed BSON document
    pub fn read_document(&mut self) -> Result<Document> {
        if self.remaining() < 4 {
            return Err(ProtocolError::truncated(4, self.remaining()).into());
        }
        let at = self.pos;
        let len = i32::from_le_bytes([
            self.buf[at],
            self.buf[at + 1],
            self.buf[at + 2],
            self.buf[at + 3],
        ]);
        if len < 5 {
            return Err(ProtocolError::invalid_field("document", format!("length {}", len)).into());
        }
        let len = len as usize;
        let slice = self.take(len)?;
        let doc = Document::from_reader(&mut &slice[..])?;
        Ok(doc)
    }

    /// Read documents until the body is exhausted
    pub fn read_documents_to_end(&mut self) -> Result<Vec<Document>> {
        let mut docs = Vec::new();
        while !self.is_empty() {
            docs.push(self.read_document()?);
        }
        Ok(docs)
    }

    /// Remainder of the body as a byte slice, consuming it
    pub fn read_rest(&mut self) -> &'a [u8] {
        let rest = &self.buf[self.pos..];
        self.pos = self.buf.len();
        rest
    }
}

/// Builder for a wire-operation body
#[derive(Default)]
pub struct WireWriter {
    buf: Vec<u8>,
}

impl WireWriter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn write_u8(&mut self, v: u8) {
        self.buf.push(v);
    }

    pub fn write_i32(&mut self, v: i32) {
        self.buf.extend_from_slice(&v.to_le_bytes());
    }

    pub fn write_i64(&mut self, v: i64) {
        self.buf.extend_from_slice(&v.to_le_bytes());
    }

    pub fn write_cstring(&mut self, s: &str) {
        self.buf.extend_from_slice(s.as_bytes());
        self.buf.push(0);
    }

    pub fn write_document(&mut self, doc: &Document) -> Result<()> {
        doc.to_writer(&mut self.buf)?;
        Ok(())
    }

    pub fn write_bytes(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.buf
    }
}

/// Truncate a display string to at most `max` characters, marking the cut
pub fn abbreviated(s: String, max: usize) -> String {
    if s.len() <= max {
        return s;
    }
    let mut cut = max.saturating_sub(3);
    while cut > 0 && !s.is_char_boundary(cut) {
        cut -= 1;
    }
    format!("{}...", &s[..cut])
}

#[cfg(test)]
mod tests {
    use super::*;
    use bson::doc;

    #[test]
    fn test_scalar_roundtrip() {
        let mut w = WireWriter::new();
        w.write_i32(-5);
        w.write_i64(1 << 40);
        w.write_u8(7);
        w.write_cstring("db.coll");
        let bytes = w.into_bytes();

        let mut r = WireReader::new(&bytes);
        assert_eq!(r.read_i32().unwrap(), -5);
        assert_eq!(r.read_i64().unwrap(), 1 << 40);
        assert_eq!(r.read_u8().unwrap(), 7);
        assert_eq!(r.read_cstring().unwrap(), "db.coll");
        assert!(r.is_empty());
    }

    #[test]
    fn test_document_roundtrip() {
        let doc = doc! { "find": "users", "limit": 10_i32 };
        let mut w = WireWriter::new();
        w.write_document(&doc).unwrap();
        let bytes = w.into_bytes();

        let mut r = WireReader::new(&bytes);
        assert_eq!(r.read_document().unwrap(), doc);
    }

    #[test]
    fn test_truncated_document_errors() {
        let doc = doc! { "a": 1_i32 };
        let mut w = WireWriter::new();
        w.write_document(&doc).unwrap();
        let mut bytes = w.into_bytes();
        bytes.truncate(bytes.len() - 2);

        let mut r = WireReader::new(&bytes);
        assert!(r.read_document().is_err());
    }

    #[test]
    fn test_unterminated_cstring_errors() {
        let mut r = WireReader::new(b"no-nul-here");
        assert!(r.read_cstring().is_err());
    }

    #[test]
    fn test_read_documents_to_end() {
        let mut w = WireWriter::new();
        w.write_document(&doc! { "i": 0_i32 }).unwrap();
        w.write_document(&doc! { "i": 1_i32 }).unwrap();
        let bytes = w.into_bytes();

        let mut r = WireReader::new(&bytes);
        let docs = r.read_documents_to_end().unwrap();
        assert_eq!(docs.len(), 2);
        assert_eq!(docs[1].get_i32("i").unwrap(), 1);
    }

    #[test]
    fn test_abbreviated() {
        assert_eq!(abbreviated("short".to_string(), 32), "short");
        let long = "x".repeat(64);
        let cut = abbreviated(long, 16);
        assert_eq!(cut.len(), 16);
        assert!(cut.ends_with("..."));
    }
}
