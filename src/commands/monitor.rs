//! `monitor`: observe recorded or captured traffic without executing it
//!
//! Pairs each recorded reply with its request purely from the capture and
//! reports per-op latency and error telemetry. No byte is sent anywhere.

use crate::capture::{dissect, PacketSource, PcapFileSource, StreamReassembler};
use crate::error::{Result, WireplayError};
use crate::order::{order_ops, DEFAULT_ORDER_BUFFER};
use crate::playback::format::RecordedOp;
use crate::playback::{stream_ops, PlaybackReader};
use crate::player::{
    log_summary, JsonStatRecorder, OpOutcome, OpStat, StatCollector, StatRecorder, StatSummary,
};
use crate::protocol::{OpMetadata, Replyable};
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::path::PathBuf;
use tokio::sync::mpsc;
use tracing::{debug, info};

/// Options for one monitoring run
#[derive(Debug, Clone, Default)]
pub struct MonitorConfig {
    /// Read ops from a playback file
    pub playback_file: Option<PathBuf>,
    /// Or reassemble them from a pcap capture file
    pub pcap_file: Option<PathBuf>,
    /// Only report ops whose reply was paired
    pub paired_only: bool,
    /// Write per-op stats as JSON lines to this file
    pub stats_file: Option<PathBuf>,
    /// Lookahead window of the temporal orderer (pcap input only)
    pub order_buffer: usize,
}

impl MonitorConfig {
    pub fn from_playback(path: impl Into<PathBuf>) -> Self {
        Self {
            playback_file: Some(path.into()),
            order_buffer: DEFAULT_ORDER_BUFFER,
            ..Default::default()
        }
    }

    pub fn from_pcap(path: impl Into<PathBuf>) -> Self {
        Self {
            pcap_file: Some(path.into()),
            order_buffer: DEFAULT_ORDER_BUFFER,
            ..Default::default()
        }
    }
}

struct PendingRequest {
    seen: DateTime<Utc>,
    meta: OpMetadata,
    op: RecordedOp,
}

/// Run the monitor pipeline
pub async fn run(config: MonitorConfig) -> Result<StatSummary> {
    let (tx, rx) = mpsc::channel(1024);

    let producer: tokio::task::JoinHandle<Result<()>> = match (&config.playback_file, &config.pcap_file) {
        (Some(path), _) => {
            info!(playback = %path.display(), "monitoring playback file");
            let reader = PlaybackReader::open(path)?;
            tokio::spawn(async move {
                stream_ops(reader, 1, tx).await?;
                Ok(())
            })
        }
        (None, Some(path)) => {
            info!(capture = %path.display(), "monitoring capture file");
            let mut source = PcapFileSource::open(path)?;
            let order_buffer = config.order_buffer;
            tokio::spawn(async move {
                let (raw_tx, raw_rx) = mpsc::channel(1024);
                let orderer = tokio::spawn(order_ops(raw_rx, tx, order_buffer));
                let link = source.link_type();
                let mut reassembler = StreamReassembler::new(raw_tx, 256);
                loop {
                    let Some(packet) = source.next_packet()? else {
                        break;
                    };
                    let Some(segment) = dissect(link, &packet) else {
                        continue;
                    };
                    reassembler.handle_segment(segment).await?;
                }
                reassembler.finish().await?;
                orderer
                    .await
                    .map_err(|e| WireplayError::capture("orderer task", e.to_string()))??;
                Ok(())
            })
        }
        (None, None) => {
            return Err(WireplayError::config(
                "monitor",
                "either a playback file or a capture file is required",
            ))
        }
    };

    let summary = pair_and_report(rx, &config).await?;
    producer
        .await
        .map_err(|e| WireplayError::capture("monitor producer", e.to_string()))??;
    log_summary("monitor", &summary);
    Ok(summary)
}

async fn pair_and_report(
    mut rx: mpsc::Receiver<RecordedOp>,
    config: &MonitorConfig,
) -> Result<StatSummary> {
    let mut recorders: Vec<Box<dyn StatRecorder>> = Vec::new();
    if let Some(ref stats_file) = config.stats_file {
        recorders.push(Box::new(JsonStatRecorder::create(stats_file)?));
    }
    let collector = StatCollector::spawn(recorders);
    let sender = collector.sender();

    let mut pending: HashMap<(u64, i32), PendingRequest> = HashMap::new();

    while let Some(op) = rx.recv().await {
        if op.is_eof() {
            continue;
        }
        let parsed = match op.parse() {
            Ok(parsed) => parsed,
            Err(e) => {
                debug!(order = op.order, error = %e, "skipping undecodable op");
                sender
                    .send(stat_for(
                        OpOutcome::Skipped,
                        &op,
                        OpMetadata::default(),
                        None,
                        None,
                        None,
                        vec![e.to_string()],
                    ))
                    .await;
                continue;
            }
        };

        match parsed.replyable() {
            None => {
                pending.insert(
                    op.request_key(),
                    PendingRequest {
                        seen: op.seen,
                        meta: parsed.meta(),
                        op: op.clone(),
                    },
                );
            }
            Some(replyable) => {
                let key = op.response_key();
                let cursor_id = replyable.cursor_id();
                let num_returned = replyable.num_returned();
                let errors = replyable.error_messages();
                match pending.remove(&key) {
                    Some(request) => {
                        let latency_us = (op.seen - request.seen).num_microseconds();
                        sender
                            .send(stat_for(
                                OpOutcome::Played,
                                &request.op,
                                request.meta,
                                latency_us,
                                Some(num_returned),
                                cursor_id,
                                errors,
                            ))
                            .await;
                    }
                    None if !config.paired_only => {
                        // reply with no visible request, e.g. capture
                        // started mid-exchange
                        sender
                            .send(stat_for(
                                OpOutcome::Played,
                                &op,
                                parsed.meta(),
                                None,
                                Some(num_returned),
                                cursor_id,
                                errors,
                            ))
                            .await;
                    }
                    None => {}
                }
            }
        }
    }

    // requests that never saw a reply
    if !config.paired_only {
        for (_, request) in pending {
            sender
                .send(stat_for(
                    OpOutcome::Played,
                    &request.op,
                    request.meta,
                    None,
                    None,
                    None,
                    Vec::new(),
                ))
                .await;
        }
    }

    drop(sender);
    collector.finish().await
}

#[allow(clippy::too_many_arguments)]
fn stat_for(
    outcome: OpOutcome,
    op: &RecordedOp,
    meta: OpMetadata,
    latency_us: Option<i64>,
    num_returned: Option<i32>,
    cursor_id: Option<i64>,
    errors: Vec<String>,
) -> OpStat {
    OpStat {
        outcome,
        meta,
        connection_num: op.connection_num,
        order: op.order,
        generation: op.generation,
        seen: op.seen,
        played_at: None,
        latency_us,
        num_returned,
        cursor_id,
        errors,
    }
}
