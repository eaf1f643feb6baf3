//! Recorded operation and playback file documents
//!
//! [`RecordedOp`] is the unit of ordering, persistence, and replay. It is
//! created by the reassembler, given its order index by the orderer, and
//! annotated with play times by the player; ownership moves along the
//! pipeline through single-consumer queues so no two stages ever mutate one
//! concurrently.

use crate::error::Result;
use crate::protocol::{MsgHeader, Op, HEADER_LEN};
use bson::spec::BinarySubtype;
use bson::Binary;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Current playback file format version
pub const PLAYBACK_FILE_VERSION: i32 = 1;

/// Leading metadata document of every playback file
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlaybackFileMetadata {
    pub playback_file_version: i32,
    pub driver_ops_filtered: bool,
}

impl PlaybackFileMetadata {
    pub fn new(driver_ops_filtered: bool) -> Self {
        Self {
            playback_file_version: PLAYBACK_FILE_VERSION,
            driver_ops_filtered,
        }
    }
}

/// Capture timestamps persist as int64 nanoseconds since the epoch
pub(crate) mod nanos {
    use chrono::{DateTime, Utc};
    use serde::{Deserialize, Deserializer, Serialize, Serializer};

    pub fn serialize<S: Serializer>(dt: &DateTime<Utc>, s: S) -> Result<S::Ok, S::Error> {
        dt.timestamp_nanos_opt().unwrap_or_default().serialize(s)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<DateTime<Utc>, D::Error> {
        let nanos = i64::deserialize(d)?;
        Ok(DateTime::from_timestamp_nanos(nanos))
    }
}

/// A raw wire message: parsed header plus opaque body bytes
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawOp {
    pub header: MsgHeader,
    pub body: Binary,
}

impl RawOp {
    pub fn new(header: MsgHeader, body: Vec<u8>) -> Self {
        Self {
            header,
            body: Binary {
                subtype: BinarySubtype::Generic,
                bytes: body,
            },
        }
    }

    /// Empty raw op used by end-of-stream markers
    pub fn empty() -> Self {
        Self::new(MsgHeader::default(), Vec::new())
    }

    pub fn body_bytes(&self) -> &[u8] {
        &self.body.bytes
    }

    /// Full wire message bytes (header + body)
    pub fn message_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(HEADER_LEN + self.body.bytes.len());
        out.extend_from_slice(&self.header.to_bytes());
        out.extend_from_slice(&self.body.bytes);
        out
    }

    /// Decode into the typed operation model
    pub fn parse(&self) -> Result<Op> {
        Op::decode(&self.header, &self.body.bytes)
    }
}

/// One captured operation with its pipeline annotations
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecordedOp {
    /// Capture timestamp
    #[serde(with = "nanos")]
    pub seen: DateTime<Utc>,
    /// Source endpoint (address:port) of the captured message
    pub src: String,
    /// Destination endpoint of the captured message
    pub dst: String,
    /// Logical connection number, stable per TCP flow for the capture
    pub connection_num: u64,
    /// Global order index assigned by the temporal orderer
    pub order: u64,
    /// End-of-stream marker: closes the connection's replay queue
    #[serde(default)]
    pub eof: bool,
    /// The raw wire message
    pub raw: RawOp,

    /// Which repeat generation this op belongs to (replay only)
    #[serde(skip)]
    pub generation: u32,
    /// When the player scheduled this op to run
    #[serde(skip)]
    pub play_at: Option<tokio::time::Instant>,
    /// When the player actually dispatched it
    #[serde(skip)]
    pub played_at: Option<DateTime<Utc>>,
}

impl RecordedOp {
    pub fn new(seen: DateTime<Utc>, src: String, dst: String, connection_num: u64, raw: RawOp) -> Self {
        Self {
            seen,
            src,
            dst,
            connection_num,
            order: 0,
            eof: false,
            raw,
            generation: 0,
            play_at: None,
            played_at: None,
        }
    }

    /// End-of-stream marker for a connection
    pub fn eof(seen: DateTime<Utc>, connection_num: u64) -> Self {
        let mut op = Self::new(seen, String::new(), String::new(), connection_num, RawOp::empty());
        op.eof = true;
        op
    }

    pub fn is_eof(&self) -> bool {
        self.eof
    }

    /// Decode the raw message into the typed model
    pub fn parse(&self) -> Result<Op> {
        self.raw.parse()
    }

    /// Pairing key for matching this request's reply: the reply's
    /// `response_to` will equal this op's `request_id` on the same
    /// connection
    pub fn request_key(&self) -> (u64, i32) {
        (self.connection_num, self.raw.header.request_id)
    }

    /// Pairing key carried by a reply-shaped op
    pub fn response_key(&self) -> (u64, i32) {
        (self.connection_num, self.raw.header.response_to)
    }
}
