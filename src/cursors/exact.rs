//! Exact cursor mapping via capture preprocessing
//!
//! A first pass over the whole capture records, for every cursor id, how
//! many future ops will consume it, which connection carries the reply
//! that defines it, and which request that reply answers. During replay a
//! lookup blocks on a per-cursor channel until the defining reply has
//! executed live, with two escape hatches that prevent deadlock: a lookup
//! from the very connection expected to produce the reply returns
//! unresolved immediately (the reply cannot have run yet on that
//! connection), and a failed dispatch fails the cursor so every waiter is
//! released. Each successful lookup burns one expected use; the mapping is
//! dropped when none remain.
//!
//! The shared maps are guarded by a mutex held only for reads and updates;
//! the blocking wait itself rides a per-cursor watch channel, never the
//! lock.

use crate::cursors::CursorManager;
use crate::playback::format::RecordedOp;
use crate::protocol::{CursorBearing, Replyable};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, trace, warn};

/// Default upper bound on one blocking lookup
pub const DEFAULT_RESOLVE_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CursorState {
    Pending,
    Resolved(i64),
    Failed,
}

struct CursorInfo {
    remaining_uses: i64,
    reply_conn: u64,
    tx: watch::Sender<CursorState>,
    rx: watch::Receiver<CursorState>,
}

impl CursorInfo {
    fn new(reply_conn: u64) -> Self {
        let (tx, rx) = watch::channel(CursorState::Pending);
        Self {
            remaining_uses: 0,
            reply_conn,
            tx,
            rx,
        }
    }
}

/// Blocking, preprocessed cursor manager
pub struct ExactCursorManager {
    cursors: Mutex<HashMap<i64, CursorInfo>>,
    /// (connection, request id) of a defining request -> the cursor its
    /// reply creates; consulted when that request's dispatch fails
    request_to_cursor: Mutex<HashMap<(u64, i32), i64>>,
    timeout: Duration,
}

impl ExactCursorManager {
    pub fn new(timeout: Duration) -> Self {
        Self {
            cursors: Mutex::new(HashMap::new()),
            request_to_cursor: Mutex::new(HashMap::new()),
            timeout,
        }
    }

    /// Build the manager from one full pass over the recorded ops
    pub fn preprocess<I>(ops: I, timeout: Duration) -> Self
    where
        I: IntoIterator<Item = RecordedOp>,
    {
        let manager = Self::new(timeout);
        for op in ops {
            manager.observe(&op);
        }
        manager
    }

    /// Account one recorded op during the preprocessing pass
    pub fn observe(&self, op: &RecordedOp) {
        if op.is_eof() {
            return;
        }
        let parsed = match op.parse() {
            Ok(parsed) => parsed,
            Err(_) => return,
        };

        if let Some(replyable) = parsed.replyable() {
            if let Some(cursor_id) = replyable.cursor_id() {
                let mut cursors = self.cursors.lock();
                if !cursors.contains_key(&cursor_id) {
                    // first reply carrying this cursor defines it
                    cursors.insert(cursor_id, CursorInfo::new(op.connection_num));
                    self.request_to_cursor
                        .lock()
                        .insert(op.response_key(), cursor_id);
                    trace!(
                        cursor = cursor_id,
                        connection = op.connection_num,
                        "cursor defined"
                    );
                }
            }
            return;
        }

        if let Some(bearing) = parsed.cursor_bearing() {
            let mut cursors = self.cursors.lock();
            for cursor_id in bearing.cursor_ids() {
                if cursor_id == 0 {
                    continue;
                }
                if let Some(info) = cursors.get_mut(&cursor_id) {
                    info.remaining_uses += 1;
                }
                // a consumer with no defining reply in the capture stays
                // unresolvable; replay will skip it
            }
        }
    }

    /// Number of cursors still tracked
    pub fn tracked(&self) -> usize {
        self.cursors.lock().len()
    }

    #[cfg(test)]
    fn remaining_uses(&self, cursor_id: i64) -> Option<i64> {
        self.cursors.lock().get(&cursor_id).map(|info| info.remaining_uses)
    }

    /// Burn one expected use, dropping the mapping when exhausted
    fn consume(&self, cursor_id: i64) {
        let mut cursors = self.cursors.lock();
        if let Some(info) = cursors.get_mut(&cursor_id) {
            info.remaining_uses -= 1;
            if info.remaining_uses <= 0 {
                cursors.remove(&cursor_id);
                trace!(cursor = cursor_id, "cursor mapping exhausted");
            }
        }
    }
}

#[async_trait]
impl CursorManager for ExactCursorManager {
    async fn get_cursor(&self, recorded_id: i64, connection_num: u64) -> Option<i64> {
        // fast path and wait setup under the lock, the wait itself outside
        let mut rx = {
            let cursors = self.cursors.lock();
            let info = cursors.get(&recorded_id)?;
            let state = *info.rx.borrow();
            match state {
                CursorState::Resolved(live_id) => {
                    drop(cursors);
                    self.consume(recorded_id);
                    return Some(live_id);
                }
                CursorState::Failed => return None,
                CursorState::Pending => {
                    if info.reply_conn == connection_num {
                        // the defining reply is expected on this very
                        // connection and has not executed; waiting here
                        // would deadlock the worker on itself
                        debug!(
                            cursor = recorded_id,
                            connection = connection_num,
                            "skipping same-connection cursor wait"
                        );
                        return None;
                    }
                    info.rx.clone()
                }
            }
        };

        let wait = async {
            loop {
                match *rx.borrow_and_update() {
                    CursorState::Resolved(live_id) => return Some(live_id),
                    CursorState::Failed => return None,
                    CursorState::Pending => {}
                }
                if rx.changed().await.is_err() {
                    return None;
                }
            }
        };

        match tokio::time::timeout(self.timeout, wait).await {
            Ok(Some(live_id)) => {
                self.consume(recorded_id);
                Some(live_id)
            }
            Ok(None) => None,
            Err(_) => {
                warn!(
                    cursor = recorded_id,
                    connection = connection_num,
                    timeout_secs = self.timeout.as_secs(),
                    "cursor resolution timed out"
                );
                None
            }
        }
    }

    fn set_cursor(&self, recorded_id: i64, live_id: i64) {
        let cursors = self.cursors.lock();
        if let Some(info) = cursors.get(&recorded_id) {
            trace!(recorded = recorded_id, live = live_id, "cursor resolved");
            info.tx.send_replace(CursorState::Resolved(live_id));
        }
    }

    fn mark_failed(&self, op: &RecordedOp) {
        let cursor_id = {
            let requests = self.request_to_cursor.lock();
            match requests.get(&op.request_key()) {
                Some(cursor_id) => *cursor_id,
                None => return,
            }
        };
        let cursors = self.cursors.lock();
        if let Some(info) = cursors.get(&cursor_id) {
            if *info.rx.borrow() == CursorState::Pending {
                debug!(cursor = cursor_id, "cursor marked failed");
                info.tx.send_replace(CursorState::Failed);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::playback::format::RawOp;
    use crate::protocol::{GetMoreOp, MsgHeader, Op, QueryOp, ReplyOp, HEADER_LEN};
    use bson::doc;
    use chrono::Utc;
    use std::sync::Arc;

    fn recorded(op: Op, request_id: i32, response_to: i32, connection: u64) -> RecordedOp {
        let body = op.encode_body().unwrap();
        let header = MsgHeader {
            message_length: (HEADER_LEN + body.len()) as i32,
            request_id,
            response_to,
            op_code: op.opcode().as_i32(),
        };
        RecordedOp::new(Utc::now(), "s".into(), "d".into(), connection, RawOp::new(header, body))
    }

    fn query(request_id: i32, connection: u64) -> RecordedOp {
        recorded(
            Op::Query(QueryOp {
                flags: 0,
                full_collection_name: "app.events".into(),
                num_to_skip: 0,
                num_to_return: 2,
                query: doc! {},
                return_fields: None,
            }),
            request_id,
            0,
            connection,
        )
    }

    fn reply(cursor_id: i64, request_id: i32, response_to: i32, connection: u64) -> RecordedOp {
        recorded(
            Op::Reply(ReplyOp {
                response_flags: 0,
                cursor_id,
                starting_from: 0,
                num_returned: 1,
                docs: vec![doc! { "a": 1_i32 }],
            }),
            request_id,
            response_to,
            connection,
        )
    }

    fn get_more(cursor_id: i64, request_id: i32, connection: u64) -> RecordedOp {
        recorded(
            Op::GetMore(GetMoreOp {
                full_collection_name: "app.events".into(),
                num_to_return: 2,
                cursor_id,
            }),
            request_id,
            0,
            connection,
        )
    }

    fn capture_scenario() -> Vec<RecordedOp> {
        // query -> reply defining cursor 4567 -> one dependent getmore
        vec![
            query(1000, 0),
            reply(4567, 900, 1000, 0),
            get_more(4567, 1001, 0),
        ]
    }

    #[test]
    fn test_preprocess_counts_uses() {
        let manager =
            ExactCursorManager::preprocess(capture_scenario(), DEFAULT_RESOLVE_TIMEOUT);
        assert_eq!(manager.remaining_uses(4567), Some(1));
    }

    #[tokio::test]
    async fn test_get_after_set_resolves() {
        let manager =
            ExactCursorManager::preprocess(capture_scenario(), DEFAULT_RESOLVE_TIMEOUT);
        manager.set_cursor(4567, 111_222);
        assert_eq!(manager.get_cursor(4567, 1).await, Some(111_222));
        // single expected use: mapping discarded afterwards
        assert_eq!(manager.tracked(), 0);
    }

    #[tokio::test]
    async fn test_get_blocks_until_set() {
        let manager = Arc::new(ExactCursorManager::preprocess(
            capture_scenario(),
            DEFAULT_RESOLVE_TIMEOUT,
        ));

        let waiter = {
            let manager = Arc::clone(&manager);
            tokio::spawn(async move { manager.get_cursor(4567, 1).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!waiter.is_finished(), "lookup must block before set_cursor");

        manager.set_cursor(4567, 42);
        assert_eq!(waiter.await.unwrap(), Some(42));
    }

    #[tokio::test]
    async fn test_get_released_by_mark_failed() {
        let ops = capture_scenario();
        let defining_request = ops[0].clone();
        let manager = Arc::new(ExactCursorManager::preprocess(ops, DEFAULT_RESOLVE_TIMEOUT));

        let waiter = {
            let manager = Arc::clone(&manager);
            tokio::spawn(async move { manager.get_cursor(4567, 1).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!waiter.is_finished());

        manager.mark_failed(&defining_request);
        assert_eq!(waiter.await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_same_connection_returns_immediately() {
        let manager =
            ExactCursorManager::preprocess(capture_scenario(), DEFAULT_RESOLVE_TIMEOUT);
        // reply is expected on connection 0; a lookup from connection 0
        // must not block
        let start = std::time::Instant::now();
        assert_eq!(manager.get_cursor(4567, 0).await, None);
        assert!(start.elapsed() < Duration::from_millis(50));
    }

    #[tokio::test]
    async fn test_timeout_returns_unresolved() {
        let manager =
            ExactCursorManager::preprocess(capture_scenario(), Duration::from_millis(30));
        assert_eq!(manager.get_cursor(4567, 1).await, None);
    }

    #[tokio::test]
    async fn test_unknown_cursor_is_unresolved() {
        let manager = ExactCursorManager::new(DEFAULT_RESOLVE_TIMEOUT);
        assert_eq!(manager.get_cursor(777, 0).await, None);
    }

    #[tokio::test]
    async fn test_interleaved_cursors_resolve_independently() {
        // two cursors defined on different connections, consumers crossed
        let ops = vec![
            query(1, 0),
            reply(100, 50, 1, 0),
            query(2, 1),
            reply(200, 51, 2, 1),
            get_more(100, 3, 1),
            get_more(200, 4, 0),
        ];
        let manager = Arc::new(ExactCursorManager::preprocess(ops, DEFAULT_RESOLVE_TIMEOUT));

        let wait_100 = {
            let manager = Arc::clone(&manager);
            tokio::spawn(async move { manager.get_cursor(100, 1).await })
        };
        let wait_200 = {
            let manager = Arc::clone(&manager);
            tokio::spawn(async move { manager.get_cursor(200, 0).await })
        };

        manager.set_cursor(200, 2000);
        manager.set_cursor(100, 1000);

        assert_eq!(wait_100.await.unwrap(), Some(1000));
        assert_eq!(wait_200.await.unwrap(), Some(2000));
    }
}
