//! Cursor identifier remapping
//!
//! A replayed get-more or kill-cursors must target the cursor the *live*
//! server handed out, not the stale id from the capture. The manager
//! learns `recorded id -> live id` correspondences as replies execute and
//! translates references just before dispatch.
//!
//! Two strategies exist: a best-effort TTL cache for monitoring-grade
//! fidelity, and an exact manager that preprocesses the whole capture and
//! blocks lookups until the defining reply has executed.

pub mod exact;
pub mod ttl;

pub use exact::ExactCursorManager;
pub use ttl::TtlCursorManager;

use crate::playback::format::RecordedOp;
use async_trait::async_trait;

/// Translates recorded cursor ids into live ones during replay
#[async_trait]
pub trait CursorManager: Send + Sync {
    /// Live id for a recorded cursor, or `None` if it cannot be resolved
    ///
    /// `connection_num` identifies the asking replay worker; the exact
    /// strategy uses it to refuse (rather than deadlock on) waits for a
    /// reply expected on the asker's own connection.
    async fn get_cursor(&self, recorded_id: i64, connection_num: u64) -> Option<i64>;

    /// Record that the reply defining `recorded_id` produced `live_id`
    fn set_cursor(&self, recorded_id: i64, live_id: i64);

    /// Report a failed dispatch so waits on its reply's cursor are released
    fn mark_failed(&self, op: &RecordedOp);
}
