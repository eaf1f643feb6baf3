//! Timed replay engine
//!
//! One worker per recorded connection, spawned on first sight, each with
//! its own live session and bounded input queue. The feeder computes every
//! op's scheduled play time from its capture offset and the speed
//! multiplier, and never queues work further ahead than the read-ahead
//! window; workers sleep until the scheduled instant, rewrite cursors,
//! dispatch, and feed the pairing context. End-of-stream markers close a
//! worker's queue; the run completes when every worker has drained.

use crate::cursors::CursorManager;
use crate::error::Result;
use crate::playback::format::RecordedOp;
use crate::player::context::{ExecutionContext, StatSeed};
use crate::player::session::SessionFactory;
use crate::player::stats::{OpOutcome, OpStat, StatSender};
use crate::protocol::{CursorBearing, OpMetadata};
use chrono::{DateTime, Utc};
use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Default read-ahead window of scheduled work
pub const DEFAULT_QUEUE_AHEAD: Duration = Duration::from_secs(10);

/// Replay tuning knobs
#[derive(Debug, Clone)]
pub struct PlayerConfig {
    /// Playback speed multiplier; 2.0 replays twice as fast
    pub speed: f64,
    /// Never queue work scheduled further than this ahead of now
    pub queue_ahead: Duration,
    /// Abort a worker on its first dispatch failure
    pub stop_on_error: bool,
    /// Per-worker input queue depth
    pub worker_queue_capacity: usize,
}

impl Default for PlayerConfig {
    fn default() -> Self {
        Self {
            speed: 1.0,
            queue_ahead: DEFAULT_QUEUE_AHEAD,
            stop_on_error: false,
            worker_queue_capacity: 256,
        }
    }
}

impl PlayerConfig {
    pub fn with_speed(mut self, speed: f64) -> Self {
        self.speed = speed.max(0.01);
        self
    }

    pub fn with_queue_ahead(mut self, window: Duration) -> Self {
        self.queue_ahead = window;
        self
    }

    pub fn with_stop_on_error(mut self, stop: bool) -> Self {
        self.stop_on_error = stop;
        self
    }
}

/// Per-connection outcome counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ConnectionSummary {
    pub played: u64,
    pub skipped: u64,
    pub failed: u64,
}

impl ConnectionSummary {
    fn absorb(&mut self, other: ConnectionSummary) {
        self.played += other.played;
        self.skipped += other.skipped;
        self.failed += other.failed;
    }
}

/// Whole-run outcome counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PlaySummary {
    pub connections: u64,
    pub ops: ConnectionSummary,
    pub unpaired: usize,
}

/// Drives replay of an ordered op stream against a live target
pub struct Player {
    config: PlayerConfig,
    factory: Arc<dyn SessionFactory>,
    cursors: Arc<dyn CursorManager>,
    context: Arc<ExecutionContext>,
    stats: StatSender,
}

impl Player {
    pub fn new(
        config: PlayerConfig,
        factory: Arc<dyn SessionFactory>,
        cursors: Arc<dyn CursorManager>,
        context: Arc<ExecutionContext>,
        stats: StatSender,
    ) -> Self {
        Self {
            config,
            factory,
            cursors,
            context,
            stats,
        }
    }

    /// Replay every op from `rx` until the stream closes and all workers
    /// drain
    pub async fn play(self, mut rx: mpsc::Receiver<RecordedOp>) -> Result<PlaySummary> {
        let start = Instant::now();
        let mut first_seen: Option<DateTime<Utc>> = None;
        let mut workers: HashMap<u64, mpsc::Sender<RecordedOp>> = HashMap::new();
        let mut join_set: JoinSet<ConnectionSummary> = JoinSet::new();
        let mut summary = PlaySummary::default();

        while let Some(mut op) = rx.recv().await {
            let first = *first_seen.get_or_insert(op.seen);
            op.play_at = Some(self.schedule(start, first, op.seen));

            // bounded read-ahead keeps memory flat when replay runs ahead
            // of the clock
            if let Some(play_at) = op.play_at {
                let release_at = play_at.checked_sub(self.config.queue_ahead);
                if let Some(release_at) = release_at {
                    if release_at > Instant::now() {
                        tokio::time::sleep_until(release_at).await;
                    }
                }
            }

            if op.is_eof() {
                // closing the queue is the worker's termination signal
                if workers.remove(&op.connection_num).is_some() {
                    debug!(connection = op.connection_num, "connection stream ended");
                }
                continue;
            }

            let connection = op.connection_num;
            let tx = match workers.entry(connection) {
                Entry::Occupied(entry) => entry.into_mut(),
                Entry::Vacant(entry) => {
                    let (tx, worker_rx) = mpsc::channel(self.config.worker_queue_capacity);
                    join_set.spawn(run_connection(
                        connection,
                        worker_rx,
                        Arc::clone(&self.factory),
                        Arc::clone(&self.cursors),
                        Arc::clone(&self.context),
                        self.stats.clone(),
                        self.config.stop_on_error,
                    ));
                    summary.connections += 1;
                    entry.insert(tx)
                }
            };
            if tx.send(op).await.is_err() {
                warn!(connection, "replay worker gone, dropping op");
            }
        }

        // input exhausted: close remaining queues and wait for the drain
        workers.clear();
        while let Some(joined) = join_set.join_next().await {
            match joined {
                Ok(connection_summary) => summary.ops.absorb(connection_summary),
                Err(e) => warn!(error = %e, "replay worker panicked"),
            }
        }
        summary.unpaired = self.context.unpaired();
        if summary.unpaired > 0 {
            info!(unpaired = summary.unpaired, "replies left unpaired at end of run");
        }
        Ok(summary)
    }

    /// Scheduled play instant: capture offset scaled by speed, from a
    /// shared start
    fn schedule(&self, start: Instant, first_seen: DateTime<Utc>, seen: DateTime<Utc>) -> Instant {
        let offset_nanos = (seen - first_seen).num_nanoseconds().unwrap_or(0).max(0) as f64;
        let scaled = (offset_nanos / self.config.speed.max(0.01)) as u64;
        start + Duration::from_nanos(scaled)
    }
}

async fn run_connection(
    connection: u64,
    mut rx: mpsc::Receiver<RecordedOp>,
    factory: Arc<dyn SessionFactory>,
    cursors: Arc<dyn CursorManager>,
    context: Arc<ExecutionContext>,
    stats: StatSender,
    stop_on_error: bool,
) -> ConnectionSummary {
    let mut summary = ConnectionSummary::default();
    let mut session = match factory.connect().await {
        Ok(session) => Some(session),
        Err(e) => {
            warn!(connection, error = %e, "session connect failed, ops on this connection will be skipped");
            None
        }
    };

    while let Some(mut op) = rx.recv().await {
        if let Some(play_at) = op.play_at {
            tokio::time::sleep_until(play_at).await;
        }
        op.played_at = Some(Utc::now());

        let mut parsed = match op.parse() {
            Ok(parsed) => parsed,
            Err(e) => {
                warn!(connection, order = op.order, error = %e, "skipping undecodable op");
                cursors.mark_failed(&op);
                stats
                    .send(outcome_stat(
                        OpOutcome::Skipped,
                        StatSeed::from_op(&op, OpMetadata::default()),
                        vec![e.to_string()],
                    ))
                    .await;
                summary.skipped += 1;
                continue;
            }
        };

        // reply-shaped recorded ops feed the pairing map instead of
        // being dispatched
        if !parsed.is_request() {
            context.add_from_file(&op, &parsed).await;
            continue;
        }

        let meta = parsed.meta();

        // rewrite cursor references to the live server's ids
        let recorded_ids = parsed.cursor_bearing().map(|bearing| bearing.cursor_ids());
        if let Some(recorded_ids) = recorded_ids {
            if !recorded_ids.is_empty() {
                let mut resolved = Vec::with_capacity(recorded_ids.len());
                for recorded_id in &recorded_ids {
                    if *recorded_id == 0 {
                        resolved.push(0);
                        continue;
                    }
                    if let Some(live_id) = cursors.get_cursor(*recorded_id, connection).await {
                        resolved.push(live_id);
                    }
                }
                if resolved.is_empty() {
                    debug!(connection, order = op.order, "no cursors resolved, skipping dispatch");
                    cursors.mark_failed(&op);
                    stats
                        .send(outcome_stat(
                            OpOutcome::Skipped,
                            StatSeed::from_op(&op, meta),
                            vec!["unresolved cursors".to_string()],
                        ))
                        .await;
                    summary.skipped += 1;
                    continue;
                }
                let rewrite = match parsed.cursor_bearing_mut() {
                    Some(bearing) => bearing.set_cursor_ids(&resolved),
                    None => Ok(()),
                };
                if let Err(e) = rewrite {
                    warn!(connection, order = op.order, error = %e, "cursor rewrite failed");
                    cursors.mark_failed(&op);
                    summary.skipped += 1;
                    continue;
                }
            }
        }

        let Some(live_session) = session.as_mut() else {
            cursors.mark_failed(&op);
            stats
                .send(outcome_stat(
                    OpOutcome::Skipped,
                    StatSeed::from_op(&op, meta),
                    vec!["no session".to_string()],
                ))
                .await;
            summary.skipped += 1;
            continue;
        };

        match live_session.execute(&parsed).await {
            Ok(Some(response)) => {
                summary.played += 1;
                context
                    .add_from_wire(op.request_key(), response, StatSeed::from_op(&op, meta))
                    .await;
            }
            Ok(None) => {
                summary.played += 1;
                stats
                    .send(outcome_stat(
                        OpOutcome::Played,
                        StatSeed::from_op(&op, meta),
                        Vec::new(),
                    ))
                    .await;
            }
            Err(e) => {
                summary.failed += 1;
                warn!(connection, order = op.order, error = %e, "dispatch failed");
                // release anyone blocked on this op's reply
                cursors.mark_failed(&op);
                stats
                    .send(outcome_stat(
                        OpOutcome::Failed,
                        StatSeed::from_op(&op, meta),
                        vec![e.to_string()],
                    ))
                    .await;
                if stop_on_error {
                    warn!(connection, "stopping worker after dispatch failure");
                    break;
                }
            }
        }
    }

    debug!(
        connection,
        played = summary.played,
        skipped = summary.skipped,
        failed = summary.failed,
        "replay worker finished"
    );
    summary
}

fn outcome_stat(outcome: OpOutcome, seed: StatSeed, errors: Vec<String>) -> OpStat {
    OpStat {
        outcome,
        meta: seed.meta,
        connection_num: seed.connection_num,
        order: seed.order,
        generation: seed.generation,
        seen: seed.seen,
        played_at: seed.played_at,
        latency_us: None,
        num_returned: None,
        cursor_id: None,
        errors,
    }
}
