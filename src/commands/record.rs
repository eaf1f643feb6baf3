//! `record`: capture file -> reassembly -> ordering -> playback file

use crate::capture::{dissect, PacketSource, PcapFileSource, ReassemblyStats, StreamReassembler};
use crate::error::Result;
use crate::order::{order_ops, OrderSummary, DEFAULT_ORDER_BUFFER};
use crate::playback::{PlaybackFileMetadata, PlaybackWriter};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{info, warn};

/// Options for one recording run
#[derive(Debug, Clone)]
pub struct RecordConfig {
    /// pcap capture file to read packets from
    pub pcap_file: PathBuf,
    /// Playback file to write
    pub output: PathBuf,
    /// Gzip-compress the playback file
    pub gzip: bool,
    /// Keep full reply bodies instead of shortening to the first document
    pub full_replies: bool,
    /// Lookahead window of the temporal orderer, in buffered ops
    pub order_buffer: usize,
}

impl RecordConfig {
    pub fn new(pcap_file: impl Into<PathBuf>, output: impl Into<PathBuf>) -> Self {
        Self {
            pcap_file: pcap_file.into(),
            output: output.into(),
            gzip: false,
            full_replies: false,
            order_buffer: DEFAULT_ORDER_BUFFER,
        }
    }

    pub fn with_gzip(mut self, gzip: bool) -> Self {
        self.gzip = gzip;
        self
    }

    pub fn with_full_replies(mut self, full: bool) -> Self {
        self.full_replies = full;
        self
    }

    pub fn with_order_buffer(mut self, buffer: usize) -> Self {
        self.order_buffer = buffer.max(1);
        self
    }
}

/// Counters from a completed recording
#[derive(Debug, Clone, Copy, Default)]
pub struct RecordSummary {
    pub reassembly: ReassemblyStats,
    pub order: OrderSummary,
    pub ops_written: u64,
    pub interrupted: bool,
}

/// Run the record pipeline to completion (or interrupt)
pub async fn run(config: RecordConfig) -> Result<RecordSummary> {
    let source = PcapFileSource::open(&config.pcap_file)?;
    run_with_source(config, Box::new(source)).await
}

/// Record from any packet source; the CLI uses pcap files, tests and
/// live-capture integrations plug in their own sources
pub async fn run_with_source(
    config: RecordConfig,
    mut source: Box<dyn PacketSource>,
) -> Result<RecordSummary> {
    info!(
        capture = %config.pcap_file.display(),
        output = %config.output.display(),
        "recording"
    );

    let writer = PlaybackWriter::create(
        &config.output,
        PlaybackFileMetadata::new(false),
        config.gzip,
        !config.full_replies,
    )?;

    let (raw_tx, raw_rx) = mpsc::channel(1024);
    let (ordered_tx, mut ordered_rx) = mpsc::channel(1024);

    let orderer = tokio::spawn(order_ops(raw_rx, ordered_tx, config.order_buffer));
    let writer_task = tokio::spawn(async move {
        let mut writer = writer;
        while let Some(op) = ordered_rx.recv().await {
            writer.write_op(&op)?;
        }
        writer.finish()
    });

    // an interrupt stops packet consumption; in-flight reassembly state is
    // still flushed below
    let interrupted = Arc::new(AtomicBool::new(false));
    {
        let interrupted = Arc::clone(&interrupted);
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                warn!("interrupt received, stopping capture");
                interrupted.store(true, Ordering::SeqCst);
            }
        });
    }

    let link = source.link_type();
    let mut reassembler = StreamReassembler::new(raw_tx, 256);
    while !interrupted.load(Ordering::SeqCst) {
        let Some(packet) = source.next_packet()? else {
            break;
        };
        let Some(segment) = dissect(link, &packet) else {
            continue;
        };
        reassembler.handle_segment(segment).await?;
    }

    let reassembly = reassembler.finish().await?;
    let order = orderer
        .await
        .map_err(|e| crate::error::WireplayError::capture("orderer task", e.to_string()))??;
    let ops_written = writer_task
        .await
        .map_err(|e| crate::error::WireplayError::capture("writer task", e.to_string()))??;

    let summary = RecordSummary {
        reassembly,
        order,
        ops_written,
        interrupted: interrupted.load(Ordering::SeqCst),
    };
    info!(
        packets = summary.reassembly.packets,
        messages = summary.reassembly.messages,
        connections = summary.reassembly.connections,
        ops_written = summary.ops_written,
        "recording complete"
    );
    Ok(summary)
}
