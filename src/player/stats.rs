//! Replay telemetry
//!
//! Every completed, skipped, or failed op produces an [`OpStat`]. A
//! dedicated collector task drains them from a channel into pluggable
//! recorders so replay workers never block on stat IO.

use crate::error::{PlayerError, Result};
use crate::protocol::OpMetadata;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::Path;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Outcome of one replayed op
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum OpOutcome {
    /// Dispatched (and, where applicable, its reply paired)
    Played,
    /// Not dispatched: unresolved cursors or undecodable body
    Skipped,
    /// Dispatch failed
    Failed,
}

/// One telemetry record
#[derive(Debug, Clone, Serialize)]
pub struct OpStat {
    pub outcome: OpOutcome,
    #[serde(flatten)]
    pub meta: OpMetadata,
    pub connection_num: u64,
    pub order: u64,
    pub generation: u32,
    pub seen: DateTime<Utc>,
    pub played_at: Option<DateTime<Utc>>,
    /// Round-trip latency in microseconds, when a reply was paired
    pub latency_us: Option<i64>,
    pub num_returned: Option<i32>,
    /// Cursor id carried by the paired reply
    pub cursor_id: Option<i64>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub errors: Vec<String>,
}

/// Sink for stat records
pub trait StatRecorder: Send {
    fn record(&mut self, stat: &OpStat) -> Result<()>;
    fn close(&mut self) -> Result<()> {
        Ok(())
    }
}

/// JSON-lines recorder, one object per op
pub struct JsonStatRecorder {
    out: BufWriter<File>,
}

impl JsonStatRecorder {
    pub fn create(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let file = File::create(path).map_err(|e| {
            PlayerError::task_failed("stat recorder", format!("{}: {}", path.display(), e))
        })?;
        Ok(Self {
            out: BufWriter::new(file),
        })
    }
}

impl StatRecorder for JsonStatRecorder {
    fn record(&mut self, stat: &OpStat) -> Result<()> {
        serde_json::to_writer(&mut self.out, stat)?;
        self.out
            .write_all(b"\n")
            .map_err(|e| PlayerError::task_failed("stat recorder", e.to_string()))?;
        Ok(())
    }

    fn close(&mut self) -> Result<()> {
        self.out
            .flush()
            .map_err(|e| PlayerError::task_failed("stat recorder", e.to_string()))?;
        Ok(())
    }
}

/// In-memory recorder used by tests and the monitor summary
#[derive(Default)]
pub struct BufferedStatRecorder {
    pub stats: Vec<OpStat>,
}

impl StatRecorder for BufferedStatRecorder {
    fn record(&mut self, stat: &OpStat) -> Result<()> {
        self.stats.push(stat.clone());
        Ok(())
    }
}

/// Aggregate counters reported when a run finishes
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StatSummary {
    pub played: u64,
    pub skipped: u64,
    pub failed: u64,
    pub replies_paired: u64,
}

impl StatSummary {
    pub fn total(&self) -> u64 {
        self.played + self.skipped + self.failed
    }
}

/// Collector task handle
pub struct StatCollector {
    tx: mpsc::Sender<OpStat>,
    handle: JoinHandle<StatSummary>,
}

impl StatCollector {
    /// Spawn the collector; drop every [`StatSender`] clone, then call
    /// [`StatCollector::finish`]
    pub fn spawn(mut recorders: Vec<Box<dyn StatRecorder>>) -> Self {
        let (tx, mut rx) = mpsc::channel::<OpStat>(1024);
        let handle = tokio::spawn(async move {
            let mut summary = StatSummary::default();
            while let Some(stat) = rx.recv().await {
                match stat.outcome {
                    OpOutcome::Played => summary.played += 1,
                    OpOutcome::Skipped => summary.skipped += 1,
                    OpOutcome::Failed => summary.failed += 1,
                }
                if stat.latency_us.is_some() {
                    summary.replies_paired += 1;
                }
                for recorder in recorders.iter_mut() {
                    if let Err(e) = recorder.record(&stat) {
                        warn!(error = %e, "stat recorder failed");
                    }
                }
            }
            for recorder in recorders.iter_mut() {
                if let Err(e) = recorder.close() {
                    warn!(error = %e, "stat recorder close failed");
                }
            }
            debug!(
                played = summary.played,
                skipped = summary.skipped,
                failed = summary.failed,
                "stat collection complete"
            );
            summary
        });
        Self { tx, handle }
    }

    pub fn sender(&self) -> StatSender {
        StatSender {
            tx: self.tx.clone(),
        }
    }

    /// Wait for the collector to drain and report
    pub async fn finish(self) -> Result<StatSummary> {
        drop(self.tx);
        self.handle
            .await
            .map_err(|e| PlayerError::task_failed("stat collector", e.to_string()).into())
    }
}

/// Cheap cloneable handle replay workers use to emit stats
#[derive(Clone)]
pub struct StatSender {
    tx: mpsc::Sender<OpStat>,
}

impl StatSender {
    pub async fn send(&self, stat: OpStat) {
        if self.tx.send(stat).await.is_err() {
            warn!("stat collector gone, dropping stat");
        }
    }
}

/// Log a run summary at the always-visible level
pub fn log_summary(kind: &str, summary: &StatSummary) {
    info!(
        run = kind,
        ops = summary.total(),
        played = summary.played,
        skipped = summary.skipped,
        failed = summary.failed,
        replies_paired = summary.replies_paired,
        "run complete"
    );
}
