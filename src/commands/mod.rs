//! Subcommand drivers
//!
//! Each submodule wires the pipeline for one CLI subcommand and exposes a
//! `run` function plus its config struct, so the same entry points serve
//! the binary and integration tests.

pub mod filter;
pub mod monitor;
pub mod play;
pub mod record;

pub use filter::{FilterConfig, FilterSummary};
pub use monitor::MonitorConfig;
pub use play::{PlayConfig, PlayReport};
pub use record::{RecordConfig, RecordSummary};
