//! Two-peer simulation over the in-process harness
//!
//! Alice and Bob each run a full delivery coordinator against a shared
//! signal relay, fallback store, key directory and loopback network. With
//! `break_direct` the network refuses Bob's sessions, so every message goes
//! through the fallback store and Bob fetches it by id afterwards.

use std::sync::Arc;
use std::time::Duration;

use peerlink_core::{
    Address, Conversation, DeliveryStatus, LocalWallet, MessageId, MessageView, PeerlinkConfig,
    SendOptions,
};
use peerlink_harness::{
    LoopbackNetwork, MemoryFallbackStore, MemoryKeyDirectory, MemorySignalRelay, NetworkStats,
};
use peerlink_runtime::{DeliveryCoordinator, RuntimeBuilder};
use serde::Serialize;
use tracing::{debug, info};

use crate::error::Result;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SimulationOptions {
    pub messages: usize,
    pub break_direct: bool,
    pub encrypted: bool,
    pub burn: bool,
}

impl Default for SimulationOptions {
    fn default() -> Self {
        Self {
            messages: 3,
            break_direct: false,
            encrypted: true,
            burn: false,
        }
    }
}

/// What each side saw once the run settled
#[derive(Debug, Clone, Serialize)]
pub struct SimulationReport {
    pub alice: Address,
    pub bob: Address,
    pub sent: Vec<MessageView>,
    pub received: Vec<MessageView>,
    pub bob_conversations: Vec<Conversation>,
    pub stored_envelopes: usize,
    #[serde(skip)]
    pub network: NetworkStats,
}

impl SimulationReport {
    pub fn count_status(&self, status: DeliveryStatus) -> usize {
        self.sent.iter().filter(|view| view.status == status).count()
    }
}

struct Harness {
    relay: MemorySignalRelay,
    store: MemoryFallbackStore,
    directory: MemoryKeyDirectory,
    network: LoopbackNetwork,
}

impl Harness {
    fn new() -> Self {
        Self {
            relay: MemorySignalRelay::new(),
            store: MemoryFallbackStore::new(),
            directory: MemoryKeyDirectory::new(),
            network: LoopbackNetwork::new(),
        }
    }

    fn coordinator(&self, config: &PeerlinkConfig) -> Result<DeliveryCoordinator> {
        Ok(RuntimeBuilder::new()
            .with_config(config.clone())
            .with_signal_relay(Arc::new(self.relay.clone()))
            .with_fallback_store(Arc::new(self.store.clone()))
            .with_key_directory(Arc::new(self.directory.clone()))
            .with_transport(Arc::new(self.network.transport()))
            .build()?)
    }
}

pub async fn run(
    config: &PeerlinkConfig,
    alice_wallet: LocalWallet,
    options: &SimulationOptions,
) -> Result<SimulationReport> {
    let harness = Harness::new();
    let bob_wallet = LocalWallet::generate();
    let alice = alice_wallet.address();
    let bob = bob_wallet.address();

    let alice_node = harness.coordinator(config)?;
    let bob_node = harness.coordinator(config)?;
    alice_node.connect(Arc::new(alice_wallet)).await?;
    bob_node.connect(Arc::new(bob_wallet)).await?;
    info!("Simulating {} -> {}", alice, bob);

    if options.break_direct {
        harness.network.reject(bob.clone());
    }

    let send_options = if options.burn {
        SendOptions::burn_after_reading()
    } else {
        SendOptions::default()
    };

    let mut ids: Vec<MessageId> = Vec::with_capacity(options.messages);
    for index in 0..options.messages {
        let content = format!("message {} from alice", index + 1);
        let id = alice_node
            .send_message_with(&content, &bob, options.encrypted, send_options)
            .await?;
        debug!("Queued {}", id);
        ids.push(id);
    }

    if options.break_direct {
        for id in &ids {
            if let Some(received) = bob_node.fetch_offline(id).await? {
                debug!("Bob fetched {} from the fallback store", received);
            }
        }
    }

    // Receipts travel back over the channel asynchronously
    tokio::time::sleep(Duration::from_millis(100)).await;

    let mut received = bob_node.thread(&alice).await?;
    if options.burn {
        for view in &received {
            bob_node.mark_read(&view.id).await?;
        }
        tokio::time::sleep(config.delivery.burn_delay + Duration::from_millis(50)).await;
        received = bob_node.thread(&alice).await?;
    }

    let report = SimulationReport {
        sent: alice_node.thread(&bob).await?,
        received,
        bob_conversations: bob_node.conversations().await?,
        stored_envelopes: harness.store.len(),
        network: harness.network.stats(),
        alice,
        bob,
    };

    alice_node.disconnect().await;
    bob_node.disconnect().await;
    Ok(report)
}

pub fn print_report(report: &SimulationReport) -> Result<()> {
    println!("alice: {}", report.alice);
    println!("bob:   {}", report.bob);
    println!();
    println!("Sent by alice:");
    for view in &report.sent {
        println!("  [{}] {} {}", view.status, view.id, view.content.as_text());
    }
    println!("Received by bob:");
    for view in &report.received {
        let read = if view.read { " (read)" } else { "" };
        println!("  {} {}{}", view.id, view.content.as_text(), read);
    }
    println!();
    println!(
        "sessions: {} created, {} rejected; frames delivered: {}; stored envelopes: {}",
        report.network.sessions_created,
        report.network.sessions_rejected,
        report.network.frames_delivered,
        report.stored_envelopes
    );
    println!("Bob's conversations:");
    println!("{}", serde_json::to_string_pretty(&report.bob_conversations)?);
    Ok(())
}
