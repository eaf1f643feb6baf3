//! wireplay - capture and replay wire-protocol traffic

use chrono::DateTime;
use clap::{ArgAction, Parser, Subcommand};
use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Duration;
use tracing::error;
use tracing_subscriber::EnvFilter;
use wireplay::commands::{filter, monitor, play, record};
use wireplay::commands::{FilterConfig, MonitorConfig, PlayConfig, RecordConfig};
use wireplay::error::WireplayError;
use wireplay::Result;

/// Capture, inspect, and replay wire-protocol traffic
#[derive(Parser, Debug)]
#[command(name = "wireplay")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Capture, inspect, and replay MongoDB-compatible wire-protocol traffic")]
struct Cli {
    /// Increase log verbosity (-v: debug, -vv: trace)
    #[arg(short = 'v', long = "verbose", action = ArgAction::Count, global = true)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Record captured traffic into a playback file
    Record(RecordArgs),
    /// Replay a playback file against a live target
    Play(PlayArgs),
    /// Report on recorded or captured traffic without executing it
    Monitor(MonitorArgs),
    /// Transform or split a playback file
    Filter(FilterArgs),
}

#[derive(clap::Args, Debug)]
struct RecordArgs {
    /// pcap capture file to read
    #[arg(short = 'f', long)]
    pcap_file: PathBuf,

    /// Playback file to write
    #[arg(short = 'p', long)]
    playback_file: PathBuf,

    /// Gzip-compress the playback file
    #[arg(long)]
    gzip: bool,

    /// Keep full reply bodies instead of the first document only
    #[arg(long)]
    full_replies: bool,

    /// Ordering lookahead window, in buffered ops
    #[arg(long, default_value_t = wireplay::order::DEFAULT_ORDER_BUFFER)]
    order_buffer: usize,
}

#[derive(clap::Args, Debug)]
struct PlayArgs {
    /// Playback file to replay
    #[arg(short = 'p', long)]
    playback_file: PathBuf,

    /// Target host:port
    #[arg(long)]
    host: String,

    /// Playback speed multiplier
    #[arg(long, default_value_t = 1.0)]
    speed: f64,

    /// Number of times to replay the whole file
    #[arg(long, default_value_t = 1)]
    repeat: usize,

    /// Use the best-effort cursor cache instead of exact preprocessing
    #[arg(long)]
    no_preprocess: bool,

    /// Stop a connection's replay on its first dispatch failure
    #[arg(long)]
    stop_on_error: bool,

    /// Write per-op stats as JSON lines to this file
    #[arg(long)]
    stats: Option<PathBuf>,

    /// Read-ahead window for scheduled work, in seconds
    #[arg(long, default_value_t = 10)]
    queue_ahead: u64,

    /// Upper bound on one blocking cursor wait, in seconds
    #[arg(long, default_value_t = 30)]
    cursor_timeout: u64,
}

#[derive(clap::Args, Debug)]
struct MonitorArgs {
    /// Playback file to monitor
    #[arg(short = 'p', long, conflicts_with = "pcap_file")]
    playback_file: Option<PathBuf>,

    /// pcap capture file to monitor
    #[arg(short = 'f', long)]
    pcap_file: Option<PathBuf>,

    /// Only report ops whose reply was paired
    #[arg(long)]
    paired: bool,

    /// Write per-op stats as JSON lines to this file
    #[arg(long)]
    stats: Option<PathBuf>,

    /// Ordering lookahead window, in buffered ops (pcap input)
    #[arg(long, default_value_t = wireplay::order::DEFAULT_ORDER_BUFFER)]
    order_buffer: usize,
}

#[derive(clap::Args, Debug)]
struct FilterArgs {
    /// Input playback file
    #[arg(short = 'p', long)]
    playback_file: PathBuf,

    /// Output playback file (base name when splitting)
    #[arg(short = 'o', long)]
    output: PathBuf,

    /// Drop driver-issued ops (handshakes, auth, liveness)
    #[arg(long)]
    remove_driver_ops: bool,

    /// Drop ops captured before this RFC 3339 instant
    #[arg(long)]
    start_at: Option<String>,

    /// Shard output across N files by connection number
    #[arg(long, default_value_t = 1)]
    split: usize,

    /// Gzip-compress the outputs
    #[arg(long)]
    gzip: bool,
}

fn init_logging(verbose: u8) {
    let default_level = match verbose {
        0 => "info",
        1 => "debug",
        _ => "trace",
    };
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("wireplay={}", default_level)));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    let runtime = match tokio::runtime::Builder::new_multi_thread().enable_all().build() {
        Ok(runtime) => runtime,
        Err(e) => {
            eprintln!("wireplay: failed to start runtime: {}", e);
            return ExitCode::from(1);
        }
    };

    match runtime.block_on(run(cli.command)) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!(error = %e, "run failed");
            eprintln!("wireplay: {}", e);
            ExitCode::from(1)
        }
    }
}

async fn run(command: Commands) -> Result<()> {
    match command {
        Commands::Record(args) => {
            let config = RecordConfig::new(args.pcap_file, args.playback_file)
                .with_gzip(args.gzip)
                .with_full_replies(args.full_replies)
                .with_order_buffer(args.order_buffer);
            record::run(config).await?;
        }
        Commands::Play(args) => {
            let mut config = PlayConfig::new(args.playback_file, args.host)
                .with_speed(args.speed)
                .with_repeat(args.repeat)
                .with_no_preprocess(args.no_preprocess);
            config.stop_on_error = args.stop_on_error;
            config.stats_file = args.stats;
            config.queue_ahead = Duration::from_secs(args.queue_ahead);
            config.cursor_timeout = Duration::from_secs(args.cursor_timeout);
            play::run(config).await?;
        }
        Commands::Monitor(args) => {
            let config = MonitorConfig {
                playback_file: args.playback_file,
                pcap_file: args.pcap_file,
                paired_only: args.paired,
                stats_file: args.stats,
                order_buffer: args.order_buffer,
            };
            monitor::run(config).await?;
        }
        Commands::Filter(args) => {
            let mut config = FilterConfig::new(args.playback_file, args.output)
                .with_remove_driver_ops(args.remove_driver_ops)
                .with_split(args.split);
            config.gzip = args.gzip;
            if let Some(ref start_at) = args.start_at {
                let parsed = DateTime::parse_from_rfc3339(start_at).map_err(|e| {
                    WireplayError::config("start-at", format!("{}: {}", start_at, e))
                })?;
                config.start_at = Some(parsed.into());
            }
            filter::run(config)?;
        }
    }
    Ok(())
}
