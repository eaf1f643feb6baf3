//! TCP stream reassembly into wire messages
//!
//! Each half-connection runs two layers: a sequence buffer that puts
//! possibly-reordered segments back into byte order, and a framer state
//! machine that cuts the byte stream into whole protocol messages. A
//! header that fails the sanity check drops the framer out of sync; it
//! then rescans byte by byte until a plausible header reappears.
//!
//! The two halves of a connection share one bidi record with a single
//! delivery channel; a consumer task per bidi forwards completed messages
//! to the orderer. The bidi is torn down only once both directions have
//! reported completion.

use crate::capture::packet::{FlowKey, TcpSegment};
use crate::error::Result;
use crate::playback::format::{RawOp, RecordedOp};
use crate::protocol::{MsgHeader, HEADER_LEN};
use bytes::{Buf, Bytes, BytesMut};
use chrono::{DateTime, Utc};
use std::collections::{BTreeMap, HashMap};
use std::net::SocketAddr;
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tracing::{debug, trace, warn};

/// Upper bound on parked out-of-order segments per half-connection
const MAX_PENDING_SEGMENTS: usize = 4096;

/// Framing state of one half-connection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FrameState {
    /// The next bytes must be a valid 16-byte header
    BeforeMessage,
    /// Header accepted, accumulating body bytes
    InMessage { header: MsgHeader },
    /// Header validation failed; scanning for the next plausible header
    OutOfSync,
}

/// Cuts an in-order byte stream into whole wire messages
#[derive(Debug)]
pub struct MessageFramer {
    buffer: BytesMut,
    state: FrameState,
    resync_drops: u64,
}

impl MessageFramer {
    pub fn new() -> Self {
        Self {
            buffer: BytesMut::new(),
            state: FrameState::BeforeMessage,
            resync_drops: 0,
        }
    }

    /// Bytes discarded while out of sync
    pub fn resync_drops(&self) -> u64 {
        self.resync_drops
    }

    /// Feed stream bytes, collecting every completed message
    pub fn push(&mut self, data: &[u8], out: &mut Vec<(MsgHeader, Bytes)>) {
        self.buffer.extend_from_slice(data);
        loop {
            match self.state {
                FrameState::BeforeMessage => {
                    let Some(header) = MsgHeader::parse(&self.buffer) else {
                        return;
                    };
                    if !header.looks_valid() {
                        self.state = FrameState::OutOfSync;
                        continue;
                    }
                    self.state = FrameState::InMessage { header };
                }
                FrameState::InMessage { header } => {
                    let total = header.message_length as usize;
                    if self.buffer.len() < total {
                        return;
                    }
                    let message = self.buffer.split_to(total).freeze();
                    out.push((header, message.slice(HEADER_LEN..)));
                    self.state = FrameState::BeforeMessage;
                }
                FrameState::OutOfSync => {
                    while self.buffer.len() >= HEADER_LEN {
                        let candidate = MsgHeader::parse(&self.buffer);
                        if candidate.map(|h| h.looks_valid()).unwrap_or(false) {
                            self.state = FrameState::BeforeMessage;
                            break;
                        }
                        self.buffer.advance(1);
                        self.resync_drops += 1;
                    }
                    if self.state == FrameState::OutOfSync {
                        return;
                    }
                }
            }
        }
    }
}

impl Default for MessageFramer {
    fn default() -> Self {
        Self::new()
    }
}

/// Restores byte order across reordered, overlapping, or retransmitted
/// TCP segments
#[derive(Debug, Default)]
struct SeqBuffer {
    next_seq: Option<u32>,
    pending: BTreeMap<u32, Bytes>,
}

impl SeqBuffer {
    /// Offer a segment; in-order bytes are passed to `deliver`
    fn push(&mut self, seq: u32, syn: bool, payload: Bytes, deliver: &mut impl FnMut(&[u8])) {
        if syn {
            self.next_seq = Some(seq.wrapping_add(1));
            return;
        }
        if payload.is_empty() {
            return;
        }
        let next = *self.next_seq.get_or_insert(seq);
        let diff = seq.wrapping_sub(next) as i32;
        if diff > 0 {
            if self.pending.len() >= MAX_PENDING_SEGMENTS {
                warn!(seq, "segment gap buffer full, dropping segment");
                return;
            }
            self.pending.insert(seq, payload);
            return;
        }
        self.accept(next, diff, payload, deliver);
        self.drain_pending(deliver);
    }

    fn accept(&mut self, next: u32, diff: i32, payload: Bytes, deliver: &mut impl FnMut(&[u8])) {
        if diff == 0 {
            deliver(&payload);
            self.next_seq = Some(next.wrapping_add(payload.len() as u32));
            return;
        }
        // diff < 0: overlap with already-delivered bytes
        let skip = (-diff) as usize;
        if skip < payload.len() {
            let fresh = &payload[skip..];
            deliver(fresh);
            self.next_seq = Some(next.wrapping_add(fresh.len() as u32));
        }
    }

    fn drain_pending(&mut self, deliver: &mut impl FnMut(&[u8])) {
        loop {
            let next = match self.next_seq {
                Some(n) => n,
                None => return,
            };
            let Some((&seq, _)) = self.pending.iter().next() else {
                return;
            };
            let diff = seq.wrapping_sub(next) as i32;
            if diff > 0 {
                return;
            }
            let payload = self.pending.remove(&seq).unwrap_or_default();
            self.accept(next, diff, payload, deliver);
        }
    }
}

/// One direction of a TCP connection
struct HalfConn {
    flow: FlowKey,
    seq: SeqBuffer,
    framer: MessageFramer,
    finished: bool,
}

impl HalfConn {
    fn new(flow: FlowKey) -> Self {
        Self {
            flow,
            seq: SeqBuffer::default(),
            framer: MessageFramer::new(),
            finished: false,
        }
    }
}

/// Both halves of a TCP connection with their shared delivery channel
struct BidiStream {
    connection_num: u64,
    halves: [Option<HalfConn>; 2],
    tx: mpsc::Sender<RecordedOp>,
    last_seen: DateTime<Utc>,
}

impl BidiStream {
    /// Both directions must report completion before teardown; a half that
    /// was never seen keeps the bidi alive until the capture-wide flush
    fn finished_halves(&self) -> usize {
        self.halves
            .iter()
            .flatten()
            .filter(|half| half.finished)
            .count()
    }
}

/// Counters reported when a capture finishes
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReassemblyStats {
    pub packets: u64,
    pub messages: u64,
    pub connections: u64,
    pub resync_drops: u64,
}

/// Reassembles dissected TCP segments into [`RecordedOp`]s
///
/// Completed messages flow through one channel per bidi into the shared
/// orderer channel; connection numbers are assigned on first sight of a
/// flow and stay stable for the life of the capture.
pub struct StreamReassembler {
    bidis: HashMap<(SocketAddr, SocketAddr), BidiStream>,
    next_connection: u64,
    orderer_tx: mpsc::Sender<RecordedOp>,
    channel_capacity: usize,
    forwarders: JoinSet<()>,
    stats: ReassemblyStats,
}

impl StreamReassembler {
    pub fn new(orderer_tx: mpsc::Sender<RecordedOp>, channel_capacity: usize) -> Self {
        Self {
            bidis: HashMap::new(),
            next_connection: 0,
            orderer_tx,
            channel_capacity,
            forwarders: JoinSet::new(),
            stats: ReassemblyStats::default(),
        }
    }

    /// Feed one dissected segment through reassembly
    pub async fn handle_segment(&mut self, segment: TcpSegment) -> Result<()> {
        self.stats.packets += 1;
        let key = segment.flow.bidi_key();

        if !self.bidis.contains_key(&key) {
            let (tx, mut rx) = mpsc::channel::<RecordedOp>(self.channel_capacity);
            let orderer_tx = self.orderer_tx.clone();
            self.forwarders.spawn(async move {
                while let Some(op) = rx.recv().await {
                    if orderer_tx.send(op).await.is_err() {
                        return;
                    }
                }
            });
            let connection_num = self.next_connection;
            self.next_connection += 1;
            self.stats.connections += 1;
            debug!(
                connection = connection_num,
                src = %segment.flow.src,
                dst = %segment.flow.dst,
                "new connection"
            );
            self.bidis.insert(
                key,
                BidiStream {
                    connection_num,
                    halves: [None, None],
                    tx,
                    last_seen: segment.timestamp,
                },
            );
        }

        let mut completed = Vec::new();
        let teardown;
        let delivery = {
            let Some(bidi) = self.bidis.get_mut(&key) else {
                return Ok(());
            };
            bidi.last_seen = segment.timestamp;
            let direction = segment.flow.direction();
            let half = bidi.halves[direction].get_or_insert_with(|| HalfConn::new(segment.flow));

            let framer = &mut half.framer;
            let mut frames = Vec::new();
            half.seq
                .push(segment.seq, segment.syn, segment.payload.clone(), &mut |data| {
                    framer.push(data, &mut frames);
                });

            for (header, body) in frames {
                trace!(
                    connection = bidi.connection_num,
                    opcode = header.op_code,
                    len = header.message_length,
                    "message reassembled"
                );
                completed.push(RecordedOp::new(
                    segment.timestamp,
                    half.flow.src.to_string(),
                    half.flow.dst.to_string(),
                    bidi.connection_num,
                    RawOp::new(header, body.to_vec()),
                ));
            }

            if segment.fin || segment.rst {
                half.finished = true;
            }
            teardown = segment.rst || bidi.finished_halves() == 2;
            bidi.tx.clone()
        };

        self.stats.messages += completed.len() as u64;
        for op in completed {
            if delivery.send(op).await.is_err() {
                warn!("orderer channel closed during reassembly");
            }
        }

        if teardown {
            self.close_bidi(key).await;
        }
        Ok(())
    }

    /// Flush every live bidi, emitting end-of-stream markers
    pub async fn finish(mut self) -> Result<ReassemblyStats> {
        let keys: Vec<_> = self.bidis.keys().copied().collect();
        for key in keys {
            self.close_bidi(key).await;
        }
        // forwarders exit once their bidi sender is dropped
        while self.forwarders.join_next().await.is_some() {}
        Ok(self.stats)
    }

    async fn close_bidi(&mut self, key: (SocketAddr, SocketAddr)) {
        let Some(bidi) = self.bidis.remove(&key) else {
            return;
        };
        for half in bidi.halves.iter().flatten() {
            self.stats.resync_drops += half.framer.resync_drops();
        }
        debug!(connection = bidi.connection_num, "connection closed");
        let eof = RecordedOp::eof(bidi.last_seen, bidi.connection_num);
        if bidi.tx.send(eof).await.is_err() {
            warn!("orderer channel closed before eof marker");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{Op, OpCode, QueryOp};
    use bson::doc;

    fn message_bytes(request_id: i32) -> Vec<u8> {
        let op = Op::Query(QueryOp {
            flags: 0,
            full_collection_name: "db.c".into(),
            num_to_skip: 0,
            num_to_return: 1,
            query: doc! { "i": request_id },
            return_fields: None,
        });
        op.encode_message(request_id, 0).unwrap()
    }

    fn frame_all(framer: &mut MessageFramer, chunks: &[&[u8]]) -> Vec<(MsgHeader, Bytes)> {
        let mut out = Vec::new();
        for chunk in chunks {
            framer.push(chunk, &mut out);
        }
        out
    }

    #[test]
    fn test_framer_single_buffer_equals_small_chunks() {
        let mut stream = Vec::new();
        for id in 0..3 {
            stream.extend_from_slice(&message_bytes(id));
        }

        let whole = frame_all(&mut MessageFramer::new(), &[&stream]);

        let mut chunked = MessageFramer::new();
        let mut out = Vec::new();
        for byte in &stream {
            chunked.push(std::slice::from_ref(byte), &mut out);
        }

        assert_eq!(whole.len(), 3);
        assert_eq!(out.len(), 3);
        for ((ha, ba), (hb, bb)) in whole.iter().zip(out.iter()) {
            assert_eq!(ha, hb);
            assert_eq!(ba, bb);
        }
    }

    #[test]
    fn test_framer_resyncs_after_garbage() {
        let mut stream = vec![0xff; 37]; // garbage with no plausible header
        stream.extend_from_slice(&message_bytes(5));

        let mut framer = MessageFramer::new();
        let out = frame_all(&mut framer, &[&stream]);
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].0.request_id, 5);
        assert_eq!(out[0].0.opcode(), OpCode::Query);
        assert!(framer.resync_drops() > 0);
    }

    #[test]
    fn test_seq_buffer_reorders_segments() {
        let mut delivered = Vec::new();
        let mut buf = SeqBuffer::default();
        let mut sink = |data: &[u8]| delivered.extend_from_slice(data);

        buf.push(1000, false, Bytes::from_static(b"abc"), &mut sink);
        buf.push(1006, false, Bytes::from_static(b"ghi"), &mut sink);
        buf.push(1003, false, Bytes::from_static(b"def"), &mut sink);
        assert_eq!(delivered, b"abcdefghi");
    }

    #[test]
    fn test_seq_buffer_drops_retransmission() {
        let mut delivered = Vec::new();
        let mut buf = SeqBuffer::default();
        let mut sink = |data: &[u8]| delivered.extend_from_slice(data);

        buf.push(0, false, Bytes::from_static(b"abcd"), &mut sink);
        buf.push(0, false, Bytes::from_static(b"abcd"), &mut sink);
        buf.push(2, false, Bytes::from_static(b"cdef"), &mut sink);
        assert_eq!(delivered, b"abcdef");
    }

    #[test]
    fn test_seq_buffer_honors_syn() {
        let mut delivered = Vec::new();
        let mut buf = SeqBuffer::default();
        let mut sink = |data: &[u8]| delivered.extend_from_slice(data);

        buf.push(499, true, Bytes::new(), &mut sink);
        buf.push(500, false, Bytes::from_static(b"xy"), &mut sink);
        assert_eq!(delivered, b"xy");
    }

    async fn run_reassembly(segments: Vec<TcpSegment>) -> Vec<RecordedOp> {
        let (tx, mut rx) = mpsc::channel(256);
        let mut reassembler = StreamReassembler::new(tx, 16);
        for segment in segments {
            reassembler.handle_segment(segment).await.unwrap();
        }
        reassembler.finish().await.unwrap();
        let mut ops = Vec::new();
        while let Some(op) = rx.recv().await {
            ops.push(op);
        }
        ops
    }

    fn segment(flow: FlowKey, seq: u32, payload: &[u8], fin: bool) -> TcpSegment {
        TcpSegment {
            timestamp: Utc::now(),
            flow,
            seq,
            syn: false,
            fin,
            rst: false,
            payload: Bytes::copy_from_slice(payload),
        }
    }

    #[tokio::test]
    async fn test_reassembler_emits_ops_and_eof() {
        let client = FlowKey {
            src: "10.0.0.1:50000".parse().unwrap(),
            dst: "10.0.0.2:27017".parse().unwrap(),
        };
        let message = message_bytes(9);
        let (first, second) = message.split_at(20);

        let ops = run_reassembly(vec![
            segment(client, 0, first, false),
            segment(client, 20, second, false),
        ])
        .await;

        assert_eq!(ops.len(), 2);
        assert_eq!(ops[0].raw.header.request_id, 9);
        assert_eq!(ops[0].connection_num, 0);
        assert!(!ops[0].is_eof());
        assert!(ops[1].is_eof());
        assert_eq!(ops[1].connection_num, 0);
    }

    #[tokio::test]
    async fn test_reassembler_shares_connection_across_directions() {
        let client = FlowKey {
            src: "10.0.0.1:50000".parse().unwrap(),
            dst: "10.0.0.2:27017".parse().unwrap(),
        };
        let server = FlowKey {
            src: client.dst,
            dst: client.src,
        };

        let request = message_bytes(1);
        let reply = {
            let op = Op::Reply(crate::protocol::ReplyOp {
                response_flags: 0,
                cursor_id: 0,
                starting_from: 0,
                num_returned: 0,
                docs: vec![],
            });
            op.encode_message(100, 1).unwrap()
        };

        let ops = run_reassembly(vec![
            segment(client, 0, &request, false),
            segment(server, 0, &reply, false),
        ])
        .await;

        let conns: Vec<_> = ops.iter().map(|op| op.connection_num).collect();
        assert!(conns.iter().all(|&c| c == 0), "one bidi, one connection");
        assert_eq!(ops.iter().filter(|op| !op.is_eof()).count(), 2);
        // endpoints follow the emitting direction
        let request_op = ops
            .iter()
            .find(|op| !op.is_eof() && op.raw.header.request_id == 1)
            .unwrap();
        assert_eq!(request_op.src, "10.0.0.1:50000");
        assert_eq!(request_op.dst, "10.0.0.2:27017");
    }

    #[tokio::test]
    async fn test_fin_on_both_halves_tears_down() {
        let client = FlowKey {
            src: "10.0.0.1:50000".parse().unwrap(),
            dst: "10.0.0.2:27017".parse().unwrap(),
        };
        let server = FlowKey {
            src: client.dst,
            dst: client.src,
        };
        let message = message_bytes(2);

        let ops = run_reassembly(vec![
            segment(client, 0, &message, true),
            segment(server, 0, b"", true),
        ])
        .await;

        // exactly one eof even though finish() runs afterwards
        assert_eq!(ops.iter().filter(|op| op.is_eof()).count(), 1);
    }
}
