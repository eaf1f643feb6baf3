//! Playback log codec
//!
//! Persists globally ordered operation streams to a framed BSON file and
//! reads them back, with optional gzip compression and repeated
//! generations for looped replay.

pub mod format;
pub mod reader;
pub mod writer;

pub use format::{PlaybackFileMetadata, RawOp, RecordedOp, PLAYBACK_FILE_VERSION};
pub use reader::{stream_ops, PlaybackReader};
pub use writer::PlaybackWriter;
