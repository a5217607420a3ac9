//! PeerLink CLI
//!
//! Key generation, configuration inspection, a WebRTC offer check and an
//! in-process two-peer simulation.

pub mod cli;
pub mod commands;
pub mod config;
pub mod error;
pub mod simulate;

pub use cli::{Cli, Commands};
pub use config::CliConfig;
pub use error::{CliError, Result};
