//! Timed replay against a live target
//!
//! Coordinates per-connection workers, reply pairing, cursor rewriting,
//! and telemetry for the `play` and `monitor` subcommands.

pub mod context;
pub mod player;
pub mod session;
pub mod stats;

pub use context::{ExecutionContext, StatSeed};
pub use player::{ConnectionSummary, Player, PlayerConfig, PlaySummary, DEFAULT_QUEUE_AHEAD};
pub use session::{Session, SessionFactory, TcpSession, TcpSessionFactory, WireResponse};
pub use stats::{
    log_summary, BufferedStatRecorder, JsonStatRecorder, OpOutcome, OpStat, StatCollector,
    StatRecorder, StatSender, StatSummary,
};
