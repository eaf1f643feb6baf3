//! Reply pairing
//!
//! The capture holds both sides of every exchange: the request and the
//! recorded reply. During replay the live server produces a *new* reply
//! for each dispatched request. Pairing joins the two on the
//! connection-qualified request id; a completed pair yields the latency
//! measurement, the `recorded cursor -> live cursor` lesson for the
//! remapping manager, and one telemetry record.

use crate::cursors::CursorManager;
use crate::playback::format::RecordedOp;
use crate::player::session::WireResponse;
use crate::player::stats::{OpOutcome, OpStat, StatSender};
use crate::protocol::{Op, OpMetadata, Replyable};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, trace};

/// The recorded half of a pair, taken from the capture's reply op
#[derive(Debug, Clone)]
struct FileReply {
    cursor_id: Option<i64>,
    num_returned: i32,
    errors: Vec<String>,
}

/// The live half of a pair, plus the stat fields of the dispatched request
#[derive(Debug, Clone)]
struct LiveReply {
    response: WireResponse,
    stat: StatSeed,
}

/// Request-side fields carried into the final stat record
#[derive(Debug, Clone)]
pub struct StatSeed {
    pub meta: OpMetadata,
    pub connection_num: u64,
    pub order: u64,
    pub generation: u32,
    pub seen: chrono::DateTime<chrono::Utc>,
    pub played_at: Option<chrono::DateTime<chrono::Utc>>,
}

impl StatSeed {
    pub fn from_op(op: &RecordedOp, meta: OpMetadata) -> Self {
        Self {
            meta,
            connection_num: op.connection_num,
            order: op.order,
            generation: op.generation,
            seen: op.seen,
            played_at: op.played_at,
        }
    }
}

enum Pending {
    File(FileReply),
    Live(LiveReply),
}

/// Joins recorded replies with live responses across all replay workers
pub struct ExecutionContext {
    pending: Mutex<HashMap<(u64, i32), Pending>>,
    cursors: Arc<dyn CursorManager>,
    stats: StatSender,
}

impl ExecutionContext {
    pub fn new(cursors: Arc<dyn CursorManager>, stats: StatSender) -> Self {
        Self {
            pending: Mutex::new(HashMap::new()),
            cursors,
            stats,
        }
    }

    /// Offer the recorded (file) side of a pair
    ///
    /// Reply-shaped recorded ops are never dispatched; they exist to be
    /// joined against the live responses of their requests.
    pub async fn add_from_file(&self, op: &RecordedOp, parsed: &Op) {
        let Some(replyable) = parsed.replyable() else {
            return;
        };
        let file = FileReply {
            cursor_id: replyable.cursor_id(),
            num_returned: replyable.num_returned(),
            errors: replyable.error_messages(),
        };
        let key = op.response_key();

        let matched = {
            let mut pending = self.pending.lock();
            match pending.remove(&key) {
                Some(Pending::Live(live)) => Some(live),
                Some(Pending::File(_)) => {
                    // two recorded replies to one request: keep the newer
                    debug!(connection = key.0, request_id = key.1, "duplicate recorded reply");
                    pending.insert(key, Pending::File(file.clone()));
                    None
                }
                None => {
                    pending.insert(key, Pending::File(file.clone()));
                    None
                }
            }
        };

        if let Some(live) = matched {
            self.complete(key, file, live).await;
        }
    }

    /// Offer the live (wire) side of a pair after a dispatch returned a
    /// response
    pub async fn add_from_wire(&self, key: (u64, i32), response: WireResponse, stat: StatSeed) {
        let live = LiveReply { response, stat };
        let matched = {
            let mut pending = self.pending.lock();
            match pending.remove(&key) {
                Some(Pending::File(file)) => Some((file, live)),
                Some(Pending::Live(_)) => {
                    debug!(connection = key.0, request_id = key.1, "duplicate live reply");
                    pending.insert(key, Pending::Live(live));
                    None
                }
                None => {
                    pending.insert(key, Pending::Live(live));
                    None
                }
            }
        };

        if let Some((file, live)) = matched {
            self.complete(key, file, live).await;
        }
    }

    async fn complete(&self, key: (u64, i32), file: FileReply, live: LiveReply) {
        if let (Some(recorded_cursor), Some(live_cursor)) =
            (file.cursor_id, live.response.cursor_id)
        {
            self.cursors.set_cursor(recorded_cursor, live_cursor);
        }
        trace!(
            connection = key.0,
            request_id = key.1,
            latency_us = live.response.latency.as_micros() as i64,
            "reply paired"
        );
        if file.num_returned != live.response.num_returned {
            debug!(
                connection = key.0,
                request_id = key.1,
                recorded = file.num_returned,
                live = live.response.num_returned,
                "reply document count differs from capture"
            );
        }

        let mut errors = live.response.errors.clone();
        for recorded_error in file.errors {
            // errors present in the capture are expected; only note them
            errors.push(format!("recorded: {}", recorded_error));
        }
        let stat = OpStat {
            outcome: OpOutcome::Played,
            meta: live.stat.meta,
            connection_num: live.stat.connection_num,
            order: live.stat.order,
            generation: live.stat.generation,
            seen: live.stat.seen,
            played_at: live.stat.played_at,
            latency_us: Some(live.response.latency.as_micros() as i64),
            num_returned: Some(live.response.num_returned),
            cursor_id: live.response.cursor_id,
            errors,
        };
        self.stats.send(stat).await;
    }

    /// Pairs that never found their other half
    pub fn unpaired(&self) -> usize {
        self.pending.lock().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cursors::TtlCursorManager;
    use crate::playback::format::RawOp;
    use crate::player::stats::StatCollector;
    use crate::protocol::{MsgHeader, OpCode, ReplyOp, HEADER_LEN};
    use bson::doc;
    use chrono::Utc;
    use std::time::Duration;

    fn recorded_reply(cursor_id: i64, response_to: i32, connection: u64) -> (RecordedOp, Op) {
        let op = Op::Reply(ReplyOp {
            response_flags: 0,
            cursor_id,
            starting_from: 0,
            num_returned: 1,
            docs: vec![doc! { "a": 1_i32 }],
        });
        let body = op.encode_body().unwrap();
        let header = MsgHeader {
            message_length: (HEADER_LEN + body.len()) as i32,
            request_id: 7,
            response_to,
            op_code: OpCode::Reply.as_i32(),
        };
        let recorded = RecordedOp::new(
            Utc::now(),
            "s".into(),
            "d".into(),
            connection,
            RawOp::new(header, body),
        );
        (recorded, op)
    }

    fn seed(connection: u64) -> StatSeed {
        StatSeed {
            meta: OpMetadata {
                op: "query",
                namespace: "app.users".into(),
                command: String::new(),
            },
            connection_num: connection,
            order: 0,
            generation: 0,
            seen: Utc::now(),
            played_at: Some(Utc::now()),
        }
    }

    fn wire_response(cursor_id: Option<i64>) -> WireResponse {
        WireResponse {
            latency: Duration::from_micros(150),
            cursor_id,
            num_returned: 1,
            errors: Vec::new(),
        }
    }

    #[tokio::test]
    async fn test_pairing_learns_cursor_mapping_either_order() {
        for file_first in [true, false] {
            let cursors = Arc::new(TtlCursorManager::default());
            let collector = StatCollector::spawn(vec![]);
            let context = ExecutionContext::new(cursors.clone(), collector.sender());

            let (recorded, parsed) = recorded_reply(4567, 1000, 3);
            let key = (3, 1000);

            if file_first {
                context.add_from_file(&recorded, &parsed).await;
                context.add_from_wire(key, wire_response(Some(8910)), seed(3)).await;
            } else {
                context.add_from_wire(key, wire_response(Some(8910)), seed(3)).await;
                context.add_from_file(&recorded, &parsed).await;
            }

            assert_eq!(context.unpaired(), 0);
            assert_eq!(cursors.get_cursor(4567, 0).await, Some(8910));

            drop(context);
            let summary = collector.finish().await.unwrap();
            assert_eq!(summary.played, 1);
            assert_eq!(summary.replies_paired, 1);
        }
    }

    #[tokio::test]
    async fn test_unpaired_halves_are_tracked() {
        let cursors = Arc::new(TtlCursorManager::default());
        let collector = StatCollector::spawn(vec![]);
        let context = ExecutionContext::new(cursors, collector.sender());

        let (recorded, parsed) = recorded_reply(1, 500, 0);
        context.add_from_file(&recorded, &parsed).await;
        assert_eq!(context.unpaired(), 1);

        drop(context);
        let summary = collector.finish().await.unwrap();
        assert_eq!(summary.total(), 0);
    }

    #[tokio::test]
    async fn test_recorded_errors_are_annotated() {
        let cursors = Arc::new(TtlCursorManager::default());
        let recorder_probe = std::sync::Arc::new(parking_lot::Mutex::new(Vec::new()));
        struct Probe(std::sync::Arc<parking_lot::Mutex<Vec<OpStat>>>);
        impl crate::player::stats::StatRecorder for Probe {
            fn record(&mut self, stat: &OpStat) -> crate::error::Result<()> {
                self.0.lock().push(stat.clone());
                Ok(())
            }
        }
        let collector = StatCollector::spawn(vec![Box::new(Probe(recorder_probe.clone()))]);
        let context = ExecutionContext::new(cursors, collector.sender());

        let op = Op::Reply(ReplyOp {
            response_flags: 2,
            cursor_id: 0,
            starting_from: 0,
            num_returned: 0,
            docs: vec![doc! { "$err": "unauthorized" }],
        });
        let body = op.encode_body().unwrap();
        let header = MsgHeader {
            message_length: (HEADER_LEN + body.len()) as i32,
            request_id: 7,
            response_to: 42,
            op_code: OpCode::Reply.as_i32(),
        };
        let recorded = RecordedOp::new(Utc::now(), "s".into(), "d".into(), 0, RawOp::new(header, body));

        context.add_from_file(&recorded, &op).await;
        context.add_from_wire((0, 42), wire_response(None), seed(0)).await;

        drop(context);
        collector.finish().await.unwrap();
        let stats = recorder_probe.lock();
        assert_eq!(stats.len(), 1);
        assert!(stats[0].errors.iter().any(|e| e.contains("unauthorized")));
    }
}
