//! `filter`: transform or split a playback file
//!
//! Drops driver-issued housekeeping ops, truncates everything captured
//! before a start time, and shards the remainder by connection number
//! across N output files while preserving relative order within a shard.

use crate::error::Result;
use crate::playback::{PlaybackFileMetadata, PlaybackReader, PlaybackWriter};
use chrono::{DateTime, Utc};
use std::path::{Path, PathBuf};
use tracing::info;

/// Options for one filter run
#[derive(Debug, Clone)]
pub struct FilterConfig {
    /// Input playback file
    pub input: PathBuf,
    /// Output playback file (base name when splitting)
    pub output: PathBuf,
    /// Drop driver-issued ops (handshakes, auth, liveness)
    pub remove_driver_ops: bool,
    /// Drop ops captured before this instant
    pub start_at: Option<DateTime<Utc>>,
    /// Shard output across this many files by connection number
    pub split: usize,
    /// Gzip-compress the outputs
    pub gzip: bool,
}

impl FilterConfig {
    pub fn new(input: impl Into<PathBuf>, output: impl Into<PathBuf>) -> Self {
        Self {
            input: input.into(),
            output: output.into(),
            remove_driver_ops: false,
            start_at: None,
            split: 1,
            gzip: false,
        }
    }

    pub fn with_remove_driver_ops(mut self, remove: bool) -> Self {
        self.remove_driver_ops = remove;
        self
    }

    pub fn with_start_at(mut self, start_at: DateTime<Utc>) -> Self {
        self.start_at = Some(start_at);
        self
    }

    pub fn with_split(mut self, split: usize) -> Self {
        self.split = split.max(1);
        self
    }
}

/// Counters from a completed filter run
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FilterSummary {
    pub read: u64,
    pub written: u64,
    pub dropped_driver: u64,
    pub dropped_before_start: u64,
}

/// Shard file name: `ops.playback` -> `ops-03.playback`
fn shard_path(base: &Path, shard: usize) -> PathBuf {
    let stem = base
        .file_stem()
        .and_then(|s| s.to_str())
        .unwrap_or("filtered");
    let name = match base.extension().and_then(|e| e.to_str()) {
        Some(ext) => format!("{}-{:02}.{}", stem, shard, ext),
        None => format!("{}-{:02}", stem, shard),
    };
    base.with_file_name(name)
}

/// Run the filter, returning per-category counts
pub fn run(config: FilterConfig) -> Result<FilterSummary> {
    let mut reader = PlaybackReader::open(&config.input)?;
    let split = config.split.max(1);
    let driver_ops_filtered =
        reader.metadata().driver_ops_filtered || config.remove_driver_ops;
    let metadata = PlaybackFileMetadata::new(driver_ops_filtered);

    info!(
        input = %config.input.display(),
        output = %config.output.display(),
        split,
        remove_driver_ops = config.remove_driver_ops,
        "filtering"
    );

    let mut writers = Vec::with_capacity(split);
    for shard in 0..split {
        let path = if split == 1 {
            config.output.clone()
        } else {
            shard_path(&config.output, shard)
        };
        writers.push(PlaybackWriter::create(&path, metadata, config.gzip, false)?);
    }

    let mut summary = FilterSummary::default();
    while let Some(op) = reader.next_op()? {
        summary.read += 1;

        if !op.is_eof() {
            if let Some(start_at) = config.start_at {
                if op.seen < start_at {
                    summary.dropped_before_start += 1;
                    continue;
                }
            }
            if config.remove_driver_ops {
                let is_driver = op.parse().map(|parsed| parsed.is_driver_op()).unwrap_or(false);
                if is_driver {
                    summary.dropped_driver += 1;
                    continue;
                }
            }
        }

        let shard = (op.connection_num % split as u64) as usize;
        writers[shard].write_op(&op)?;
        summary.written += 1;
    }

    for writer in writers {
        writer.finish()?;
    }

    info!(
        read = summary.read,
        written = summary.written,
        dropped_driver = summary.dropped_driver,
        dropped_before_start = summary.dropped_before_start,
        "filter complete"
    );
    Ok(summary)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::playback::{RawOp, RecordedOp};
    use crate::protocol::{CommandOp, MsgHeader, Op, QueryOp, HEADER_LEN};
    use bson::doc;
    use chrono::TimeZone;
    use tempfile::TempDir;

    fn recorded(op: Op, connection: u64, millis: i64) -> RecordedOp {
        let body = op.encode_body().unwrap();
        let header = MsgHeader {
            message_length: (HEADER_LEN + body.len()) as i32,
            request_id: 1,
            response_to: 0,
            op_code: op.opcode().as_i32(),
        };
        RecordedOp::new(
            Utc.timestamp_millis_opt(millis).unwrap(),
            "s".into(),
            "d".into(),
            connection,
            RawOp::new(header, body),
        )
    }

    fn query(connection: u64, millis: i64) -> RecordedOp {
        recorded(
            Op::Query(QueryOp {
                flags: 0,
                full_collection_name: "app.users".into(),
                num_to_skip: 0,
                num_to_return: 1,
                query: doc! { "t": millis },
                return_fields: None,
            }),
            connection,
            millis,
        )
    }

    fn is_master(connection: u64, millis: i64) -> RecordedOp {
        recorded(
            Op::Command(CommandOp {
                database: "admin".into(),
                command_name: "isMaster".into(),
                metadata: doc! {},
                command_args: doc! { "isMaster": 1_i32 },
                input_docs: vec![],
            }),
            connection,
            millis,
        )
    }

    fn write_input(path: &Path, ops: &[RecordedOp]) {
        let mut writer =
            PlaybackWriter::create(path, PlaybackFileMetadata::new(false), false, false).unwrap();
        for op in ops {
            writer.write_op(op).unwrap();
        }
        writer.finish().unwrap();
    }

    fn read_all(path: &Path) -> Vec<RecordedOp> {
        let mut reader = PlaybackReader::open(path).unwrap();
        let mut ops = Vec::new();
        while let Some(op) = reader.next_op().unwrap() {
            ops.push(op);
        }
        ops
    }

    #[test]
    fn test_remove_driver_ops_preserves_order() {
        let dir = TempDir::new().unwrap();
        let input = dir.path().join("in.playback");
        let output = dir.path().join("out.playback");
        write_input(
            &input,
            &[
                is_master(0, 0),
                query(0, 1),
                is_master(0, 2),
                query(0, 3),
            ],
        );

        let summary = run(FilterConfig::new(&input, &output).with_remove_driver_ops(true)).unwrap();
        assert_eq!(summary.dropped_driver, 2);
        assert_eq!(summary.written, 2);

        let ops = read_all(&output);
        let times: Vec<_> = ops.iter().map(|op| op.seen.timestamp_millis()).collect();
        assert_eq!(times, vec![1, 3]);
        // metadata records the filtering
        let reader = PlaybackReader::open(&output).unwrap();
        assert!(reader.metadata().driver_ops_filtered);
    }

    #[test]
    fn test_start_at_truncates() {
        let dir = TempDir::new().unwrap();
        let input = dir.path().join("in.playback");
        let output = dir.path().join("out.playback");
        write_input(&input, &[query(0, 0), query(0, 100), query(0, 200)]);

        let summary = run(FilterConfig::new(&input, &output)
            .with_start_at(Utc.timestamp_millis_opt(100).unwrap()))
        .unwrap();
        assert_eq!(summary.dropped_before_start, 1);
        assert_eq!(read_all(&output).len(), 2);
    }

    #[test]
    fn test_split_shards_by_connection() {
        let dir = TempDir::new().unwrap();
        let input = dir.path().join("in.playback");
        let output = dir.path().join("out.playback");
        let ops: Vec<_> = (0..6).map(|i| query(i % 3, i as i64)).collect();
        write_input(&input, &ops);

        let summary = run(FilterConfig::new(&input, &output).with_split(3)).unwrap();
        assert_eq!(summary.written, 6);

        let mut total = 0;
        for shard in 0..3 {
            let ops = read_all(&shard_path(&output, shard));
            assert_eq!(ops.len(), 2);
            for op in &ops {
                assert_eq!(op.connection_num % 3, shard as u64);
            }
            // relative order preserved inside the shard
            assert!(ops[0].seen <= ops[1].seen);
            total += ops.len();
        }
        assert_eq!(total, 6);
    }

    #[test]
    fn test_eof_markers_survive_filtering() {
        let dir = TempDir::new().unwrap();
        let input = dir.path().join("in.playback");
        let output = dir.path().join("out.playback");
        write_input(
            &input,
            &[
                query(0, 0),
                RecordedOp::eof(Utc.timestamp_millis_opt(1).unwrap(), 0),
            ],
        );

        let summary = run(FilterConfig::new(&input, &output)
            .with_start_at(Utc.timestamp_millis_opt(1).unwrap()))
        .unwrap();
        assert_eq!(summary.written, 1, "eof survives even before start_at");
        assert!(read_all(&output)[0].is_eof());
    }
}
