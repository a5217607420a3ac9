//! Command-line interface definitions and parsing

use clap::{Parser, Subcommand};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Enable verbose logging
    #[arg(short, long)]
    pub verbose: bool,

    /// Configuration file path
    #[arg(short, long)]
    pub config: Option<String>,

    /// Override the negotiation attempt budget
    #[arg(long)]
    pub max_attempts: Option<u32>,

    /// Override the negotiation timeout, in milliseconds
    #[arg(long)]
    pub connect_timeout_ms: Option<u64>,
}

#[derive(Subcommand, Debug, PartialEq, Eq)]
pub enum Commands {
    /// Generate a wallet and print its address and secret key
    Keygen,
    /// Print the effective configuration as TOML
    Config,
    /// Print a WebRTC offer built from the configured ICE servers
    Offer,
    /// Run two in-process peers over the loopback network
    Simulate {
        /// Number of messages from alice to bob
        #[arg(short, long, default_value_t = 3)]
        messages: usize,
        /// Refuse direct channels so every message takes the fallback store
        #[arg(long)]
        break_direct: bool,
        /// Send without end-to-end encryption
        #[arg(long)]
        plaintext: bool,
        /// Mark messages burn-after-reading and read them on bob's side
        #[arg(long)]
        burn: bool,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_simulate_flags() {
        let cli = Cli::try_parse_from([
            "peerlink",
            "--verbose",
            "simulate",
            "--messages",
            "5",
            "--break-direct",
        ])
        .unwrap();

        assert!(cli.verbose);
        assert_eq!(
            cli.command,
            Commands::Simulate {
                messages: 5,
                break_direct: true,
                plaintext: false,
                burn: false,
            }
        );
    }

    #[test]
    fn test_parse_overrides() {
        let cli =
            Cli::try_parse_from(["peerlink", "--max-attempts", "5", "config"]).unwrap();
        assert_eq!(cli.max_attempts, Some(5));
        assert_eq!(cli.command, Commands::Config);
    }
}
