//! Playback file writer
//!
//! Append-only framed BSON: one metadata document, then one document per
//! recorded op. The whole file can be gzip-compressed end to end. Reply
//! bodies are optionally shortened to their first document so long query
//! results do not balloon the file.

use crate::error::{PlaybackError, Result};
use crate::playback::format::{PlaybackFileMetadata, RawOp, RecordedOp};
use crate::protocol::{Op, HEADER_LEN};
use flate2::write::GzEncoder;
use flate2::Compression;
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::Path;
use tracing::debug;

enum Output {
    Plain(BufWriter<File>),
    Gzip(GzEncoder<BufWriter<File>>),
}

impl Output {
    fn write_all(&mut self, data: &[u8]) -> std::io::Result<()> {
        match self {
            Output::Plain(w) => w.write_all(data),
            Output::Gzip(w) => w.write_all(data),
        }
    }

    fn finish(self) -> std::io::Result<()> {
        match self {
            Output::Plain(mut w) => w.flush(),
            Output::Gzip(w) => w.finish().and_then(|mut inner| inner.flush()),
        }
    }
}

/// Writes recorded ops to a playback file
pub struct PlaybackWriter {
    out: Option<Output>,
    shorten_replies: bool,
    ops_written: u64,
}

impl PlaybackWriter {
    /// Create a playback file, writing the metadata document immediately
    pub fn create(
        path: impl AsRef<Path>,
        metadata: PlaybackFileMetadata,
        gzip: bool,
        shorten_replies: bool,
    ) -> Result<Self> {
        let path = path.as_ref();
        let file = File::create(path).map_err(|e| {
            PlaybackError::operation("create", format!("{}: {}", path.display(), e))
        })?;
        let buffered = BufWriter::new(file);
        let mut out = if gzip {
            Output::Gzip(GzEncoder::new(buffered, Compression::default()))
        } else {
            Output::Plain(buffered)
        };

        let doc = bson::to_vec(&metadata)?;
        out.write_all(&doc)
            .map_err(|e| PlaybackError::operation("write metadata", e.to_string()))?;

        Ok(Self {
            out: Some(out),
            shorten_replies,
            ops_written: 0,
        })
    }

    pub fn ops_written(&self) -> u64 {
        self.ops_written
    }

    /// Append one recorded op
    pub fn write_op(&mut self, op: &RecordedOp) -> Result<()> {
        let doc = if self.shorten_replies && !op.is_eof() {
            bson::to_vec(&shorten_if_reply(op)?)?
        } else {
            bson::to_vec(op)?
        };
        let out = self
            .out
            .as_mut()
            .ok_or_else(|| PlaybackError::operation("write op", "writer already finished"))?;
        out.write_all(&doc)
            .map_err(|e| PlaybackError::operation("write op", e.to_string()))?;
        self.ops_written += 1;
        Ok(())
    }

    /// Flush and close the file
    pub fn finish(mut self) -> Result<u64> {
        if let Some(out) = self.out.take() {
            out.finish()
                .map_err(|e| PlaybackError::operation("finish", e.to_string()))?;
        }
        debug!(ops = self.ops_written, "playback file closed");
        Ok(self.ops_written)
    }
}

/// Rebuild the raw message with a shortened reply body, leaving every
/// non-reply op untouched
fn shorten_if_reply(op: &RecordedOp) -> Result<RecordedOp> {
    let parsed = match op.parse() {
        Ok(parsed) => parsed,
        // undecodable ops are persisted as captured
        Err(_) => return Ok(op.clone()),
    };
    let shortened = match parsed {
        Op::Reply(mut reply) => {
            if reply.docs.len() <= 1 {
                return Ok(op.clone());
            }
            reply.shorten();
            Op::Reply(reply)
        }
        Op::CommandReply(mut reply) => {
            reply.shorten();
            Op::CommandReply(reply)
        }
        _ => return Ok(op.clone()),
    };

    let body = shortened.encode_body()?;
    let mut header = op.raw.header;
    header.message_length = (HEADER_LEN + body.len()) as i32;
    let mut out = op.clone();
    out.raw = RawOp::new(header, body);
    Ok(out)
}
