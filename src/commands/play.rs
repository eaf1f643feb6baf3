//! `play`: playback file -> timed replay against a live target

use crate::cursors::{CursorManager, ExactCursorManager, TtlCursorManager};
use crate::error::Result;
use crate::playback::{stream_ops, PlaybackReader};
use crate::player::{
    log_summary, ExecutionContext, JsonStatRecorder, Player, PlayerConfig, PlaySummary,
    SessionFactory, StatCollector, StatRecorder, StatSummary, TcpSessionFactory,
    DEFAULT_QUEUE_AHEAD,
};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::info;

/// Options for one replay run
#[derive(Debug, Clone)]
pub struct PlayConfig {
    /// Playback file to replay
    pub playback_file: PathBuf,
    /// Target host:port
    pub host: String,
    /// Playback speed multiplier
    pub speed: f64,
    /// Number of generations to replay
    pub repeat: usize,
    /// Use the best-effort TTL manager instead of exact preprocessing
    pub no_preprocess: bool,
    /// Abort a connection's worker on its first dispatch failure
    pub stop_on_error: bool,
    /// Write per-op stats as JSON lines to this file
    pub stats_file: Option<PathBuf>,
    /// Read-ahead window for scheduled work
    pub queue_ahead: Duration,
    /// Upper bound on one blocking cursor wait
    pub cursor_timeout: Duration,
}

impl PlayConfig {
    pub fn new(playback_file: impl Into<PathBuf>, host: impl Into<String>) -> Self {
        Self {
            playback_file: playback_file.into(),
            host: host.into(),
            speed: 1.0,
            repeat: 1,
            no_preprocess: false,
            stop_on_error: false,
            stats_file: None,
            queue_ahead: DEFAULT_QUEUE_AHEAD,
            cursor_timeout: crate::cursors::exact::DEFAULT_RESOLVE_TIMEOUT,
        }
    }

    pub fn with_speed(mut self, speed: f64) -> Self {
        self.speed = speed.max(0.01);
        self
    }

    pub fn with_repeat(mut self, repeat: usize) -> Self {
        self.repeat = repeat.max(1);
        self
    }

    pub fn with_no_preprocess(mut self, no_preprocess: bool) -> Self {
        self.no_preprocess = no_preprocess;
        self
    }
}

/// Outcome of a replay run
#[derive(Debug, Clone, Copy, Default)]
pub struct PlayReport {
    pub play: PlaySummary,
    pub stats: StatSummary,
}

/// Run replay with the default TCP session factory
pub async fn run(config: PlayConfig) -> Result<PlayReport> {
    let factory = Arc::new(TcpSessionFactory::new(config.host.clone()));
    run_with_factory(config, factory).await
}

/// Run replay against any session factory (tests use scripted sessions)
pub async fn run_with_factory(
    config: PlayConfig,
    factory: Arc<dyn SessionFactory>,
) -> Result<PlayReport> {
    info!(
        playback = %config.playback_file.display(),
        host = %config.host,
        speed = config.speed,
        repeat = config.repeat,
        preprocess = !config.no_preprocess,
        "playing"
    );

    let cursors: Arc<dyn CursorManager> = if config.no_preprocess {
        Arc::new(TtlCursorManager::default())
    } else {
        Arc::new(preprocess(&config).await?)
    };

    let mut recorders: Vec<Box<dyn StatRecorder>> = Vec::new();
    if let Some(ref stats_file) = config.stats_file {
        recorders.push(Box::new(JsonStatRecorder::create(stats_file)?));
    }
    let collector = StatCollector::spawn(recorders);
    let context = Arc::new(ExecutionContext::new(
        Arc::clone(&cursors),
        collector.sender(),
    ));

    let player = Player::new(
        PlayerConfig::default()
            .with_speed(config.speed)
            .with_queue_ahead(config.queue_ahead)
            .with_stop_on_error(config.stop_on_error),
        factory,
        Arc::clone(&cursors),
        Arc::clone(&context),
        collector.sender(),
    );

    let reader = PlaybackReader::open(&config.playback_file)?;
    let (tx, rx) = mpsc::channel(1024);
    let streamer = tokio::spawn(stream_ops(reader, config.repeat, tx));

    let play = player.play(rx).await?;
    streamer
        .await
        .map_err(|e| crate::error::PlayerError::task_failed("playback stream", e.to_string()))??;

    drop(context);
    let stats = collector.finish().await?;
    log_summary("play", &stats);
    Ok(PlayReport { play, stats })
}

/// First pass over the whole (repeated) op stream to build the exact
/// cursor manager
async fn preprocess(config: &PlayConfig) -> Result<ExactCursorManager> {
    let reader = PlaybackReader::open(&config.playback_file)?;
    let (tx, mut rx) = mpsc::channel(1024);
    let streamer = tokio::spawn(stream_ops(reader, config.repeat, tx));

    let manager = ExactCursorManager::new(config.cursor_timeout);
    while let Some(op) = rx.recv().await {
        manager.observe(&op);
    }
    streamer
        .await
        .map_err(|e| crate::error::PlayerError::task_failed("preprocess stream", e.to_string()))??;

    info!(cursors = manager.tracked(), "preprocessing complete");
    Ok(manager)
}
