//! Command dispatch

use peerlink_core::{LocalWallet, NegotiationRole, PeerTransport};
use peerlink_webrtc::WebRtcTransport;
use tracing::info;

use crate::cli::{Cli, Commands};
use crate::config::CliConfig;
use crate::error::Result;
use crate::simulate::{self, SimulationOptions};

pub struct CommandDispatcher;

impl CommandDispatcher {
    pub async fn execute(cli: Cli, config: CliConfig) -> Result<()> {
        match cli.command {
            Commands::Keygen => Self::keygen(),
            Commands::Config => Self::show_config(&config),
            Commands::Offer => Self::offer(&config).await,
            Commands::Simulate {
                messages,
                break_direct,
                plaintext,
                burn,
            } => {
                let options = SimulationOptions {
                    messages,
                    break_direct,
                    encrypted: !plaintext,
                    burn,
                };
                let report = simulate::run(&config.peerlink, config.wallet()?, &options).await?;
                simulate::print_report(&report)
            }
        }
    }

    fn keygen() -> Result<()> {
        let wallet = LocalWallet::generate();
        println!("address:    {}", wallet.address());
        println!("secret_key: {}", wallet.secret_hex());
        Ok(())
    }

    fn show_config(config: &CliConfig) -> Result<()> {
        print!("{}", config.to_toml()?);
        Ok(())
    }

    async fn offer(config: &CliConfig) -> Result<()> {
        let wallet = config.wallet()?;
        let local = wallet.address();
        let transport = WebRtcTransport::new()?;
        let options = &config.peerlink.connection.channel;
        info!(
            "Creating offer with {} ICE server(s)",
            options.ice_servers.len()
        );

        let handle = transport
            .create_session(&local, &local, NegotiationRole::Initiator, options)
            .await?;
        let offer = handle.session.create_offer().await;
        handle.session.close().await;

        println!("{}", offer?);
        Ok(())
    }
}
