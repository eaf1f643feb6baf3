//! Playback file reader and repeat-generation streaming
//!
//! Reads the framed BSON op stream back, transparently detecting gzip by
//! its magic bytes. Repeated playback re-reads the file per generation;
//! each generation's timestamps are shifted forward by the elapsed
//! duration of the previous generation so scheduling stays monotonic, and
//! end-of-stream markers are suppressed on all but the final generation so
//! replay workers are not torn down between generations.

use crate::error::{PlaybackError, Result};
use crate::playback::format::{PlaybackFileMetadata, RecordedOp, PLAYBACK_FILE_VERSION};
use chrono::Duration;
use flate2::read::GzDecoder;
use std::fs::File;
use std::io::{BufReader, Read};
use std::path::{Path, PathBuf};
use tokio::sync::mpsc;
use tracing::{debug, warn};

const GZIP_MAGIC: [u8; 2] = [0x1f, 0x8b];

enum Input {
    Plain(BufReader<File>),
    Gzip(BufReader<GzDecoder<BufReader<File>>>),
}

impl Input {
    fn read_exact(&mut self, buf: &mut [u8]) -> std::io::Result<()> {
        match self {
            Input::Plain(r) => r.read_exact(buf),
            Input::Gzip(r) => r.read_exact(buf),
        }
    }
}

/// Sequential reader over a playback file
pub struct PlaybackReader {
    input: Input,
    metadata: PlaybackFileMetadata,
    path: PathBuf,
}

impl PlaybackReader {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let mut input = open_input(&path)?;

        let metadata: PlaybackFileMetadata = match read_document(&mut input)? {
            Some(doc) => doc,
            None => {
                return Err(PlaybackError::Corrupt("missing metadata document".to_string()).into())
            }
        };
        if metadata.playback_file_version != PLAYBACK_FILE_VERSION {
            return Err(PlaybackError::UnsupportedVersion(metadata.playback_file_version).into());
        }
        debug!(
            version = metadata.playback_file_version,
            driver_ops_filtered = metadata.driver_ops_filtered,
            "opened playback file"
        );

        Ok(Self {
            input,
            metadata,
            path,
        })
    }

    pub fn metadata(&self) -> &PlaybackFileMetadata {
        &self.metadata
    }

    /// Next recorded op, or `None` at end of file
    pub fn next_op(&mut self) -> Result<Option<RecordedOp>> {
        read_document(&mut self.input)
    }

    /// Return to the first op (just past the metadata document)
    ///
    /// The file is reopened rather than seeked so gzip inputs rewind the
    /// same way plain ones do.
    pub fn rewind(&mut self) -> Result<()> {
        let mut input = open_input(&self.path)?;
        let _: Option<PlaybackFileMetadata> = read_document(&mut input)?;
        self.input = input;
        Ok(())
    }
}

fn open_input(path: &Path) -> Result<Input> {
    let mut probe = File::open(path)
        .map_err(|e| PlaybackError::operation("open", format!("{}: {}", path.display(), e)))?;
    let mut magic = [0u8; 2];
    let gzip = match probe.read_exact(&mut magic) {
        Ok(()) => magic == GZIP_MAGIC,
        Err(_) => false,
    };

    let file = File::open(path)
        .map_err(|e| PlaybackError::operation("open", format!("{}: {}", path.display(), e)))?;
    let buffered = BufReader::new(file);
    Ok(if gzip {
        Input::Gzip(BufReader::new(GzDecoder::new(buffered)))
    } else {
        Input::Plain(buffered)
    })
}

/// Read one length-prefixed BSON document, `None` on clean end of stream
fn read_document<T: serde::de::DeserializeOwned>(input: &mut Input) -> Result<Option<T>> {
    let mut len_bytes = [0u8; 4];
    match input.read_exact(&mut len_bytes) {
        Ok(()) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(PlaybackError::operation("read document", e.to_string()).into()),
    }
    let len = i32::from_le_bytes(len_bytes);
    // a document wraps at most one wire message plus framing overhead
    if !(5..=crate::protocol::MAX_MESSAGE_SIZE + 4096).contains(&len) {
        return Err(PlaybackError::Corrupt(format!("document length {}", len)).into());
    }
    let mut doc = vec![0u8; len as usize];
    doc[0..4].copy_from_slice(&len_bytes);
    input
        .read_exact(&mut doc[4..])
        .map_err(|e| PlaybackError::operation("read document", e.to_string()))?;
    Ok(Some(bson::from_slice(&doc)?))
}

/// Stream the file's ops into `tx`, repeating for `repeat` generations
///
/// Returns the number of ops sent. Decode failures on individual documents
/// abort the stream; callers treat that as a fatal file error.
pub async fn stream_ops(
    mut reader: PlaybackReader,
    repeat: usize,
    tx: mpsc::Sender<RecordedOp>,
) -> Result<u64> {
    let repeat = repeat.max(1);
    let mut sent: u64 = 0;
    let mut generation_span: Option<Duration> = None;

    for generation in 0..repeat {
        if generation > 0 {
            reader.rewind()?;
        }
        let last_generation = generation == repeat - 1;
        let offset = match generation_span {
            Some(span) => span * generation as i32,
            None => Duration::zero(),
        };

        let mut first_seen = None;
        let mut last_seen = None;

        while let Some(mut op) = reader.next_op()? {
            first_seen.get_or_insert(op.seen);
            last_seen = Some(op.seen);

            if op.is_eof() && !last_generation {
                continue;
            }
            op.seen += offset;
            op.generation = generation as u32;
            if tx.send(op).await.is_err() {
                warn!("playback consumer gone, stopping stream");
                return Ok(sent);
            }
            sent += 1;
        }

        if generation_span.is_none() {
            generation_span = match (first_seen, last_seen) {
                (Some(first), Some(last)) => Some(last - first),
                _ => Some(Duration::zero()),
            };
        }
    }

    debug!(ops = sent, generations = repeat, "playback stream complete");
    Ok(sent)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::playback::format::{PlaybackFileMetadata, RawOp};
    use crate::playback::writer::PlaybackWriter;
    use chrono::{TimeZone, Utc};
    use tempfile::TempDir;

    fn op_at(millis: i64, connection: u64, eof: bool) -> RecordedOp {
        let seen = Utc.timestamp_millis_opt(millis).unwrap();
        if eof {
            RecordedOp::eof(seen, connection)
        } else {
            RecordedOp::new(seen, "s".into(), "d".into(), connection, RawOp::empty())
        }
    }

    fn write_file(path: &Path, ops: &[RecordedOp]) {
        let mut writer =
            PlaybackWriter::create(path, PlaybackFileMetadata::new(false), false, false).unwrap();
        for op in ops {
            writer.write_op(op).unwrap();
        }
        writer.finish().unwrap();
    }

    async fn collect(reader: PlaybackReader, repeat: usize) -> Vec<RecordedOp> {
        let (tx, mut rx) = mpsc::channel(1024);
        let task = tokio::spawn(stream_ops(reader, repeat, tx));
        let mut ops = Vec::new();
        while let Some(op) = rx.recv().await {
            ops.push(op);
        }
        task.await.unwrap().unwrap();
        ops
    }

    #[test]
    fn test_rewind_restarts_at_first_op() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("ops.playback");
        write_file(&path, &[op_at(10, 0, false), op_at(20, 0, false)]);

        let mut reader = PlaybackReader::open(&path).unwrap();
        assert_eq!(reader.next_op().unwrap().unwrap().seen.timestamp_millis(), 10);
        assert_eq!(reader.next_op().unwrap().unwrap().seen.timestamp_millis(), 20);
        assert!(reader.next_op().unwrap().is_none());

        reader.rewind().unwrap();
        assert_eq!(reader.next_op().unwrap().unwrap().seen.timestamp_millis(), 10);
    }

    #[test]
    fn test_truncated_file_is_corrupt() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("ops.playback");
        write_file(&path, &[op_at(10, 0, false)]);
        let bytes = std::fs::read(&path).unwrap();
        std::fs::write(&path, &bytes[..bytes.len() - 3]).unwrap();

        let mut reader = PlaybackReader::open(&path).unwrap();
        assert!(reader.next_op().is_err());
    }

    #[tokio::test]
    async fn test_repeat_shifts_generations_by_elapsed_duration() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("ops.playback");
        // generation spans 100ms
        write_file(&path, &[op_at(1000, 0, false), op_at(1100, 0, false)]);

        let reader = PlaybackReader::open(&path).unwrap();
        let ops = collect(reader, 3).await;
        assert_eq!(ops.len(), 6);

        let times: Vec<_> = ops.iter().map(|op| op.seen.timestamp_millis()).collect();
        assert_eq!(times, vec![1000, 1100, 1100, 1200, 1200, 1300]);
        let generations: Vec<_> = ops.iter().map(|op| op.generation).collect();
        assert_eq!(generations, vec![0, 0, 1, 1, 2, 2]);
    }

    #[tokio::test]
    async fn test_repeat_suppresses_eof_until_last_generation() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("ops.playback");
        write_file(&path, &[op_at(0, 0, false), op_at(50, 0, true)]);

        let reader = PlaybackReader::open(&path).unwrap();
        let ops = collect(reader, 3).await;

        let eof_generations: Vec<_> = ops
            .iter()
            .filter(|op| op.is_eof())
            .map(|op| op.generation)
            .collect();
        assert_eq!(eof_generations, vec![2]);
    }

    #[tokio::test]
    async fn test_single_generation_keeps_eof() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("ops.playback");
        write_file(&path, &[op_at(0, 0, false), op_at(5, 0, true)]);

        let reader = PlaybackReader::open(&path).unwrap();
        let ops = collect(reader, 1).await;
        assert!(ops.last().unwrap().is_eof());
    }
}
