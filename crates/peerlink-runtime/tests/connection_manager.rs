//! Connection manager behaviour over the loopback network

use async_trait::async_trait;
use peerlink_core::{
    Address, ConnectionConfig, ConnectionError, CryptographicError, FrameKind, IceCandidate,
    IdentityProvider, LocalWallet, SendError, Signal, SignalRelay, Signature,
};
use peerlink_harness::{LoopbackNetwork, MemorySignalRelay, MockTimeSource};
use peerlink_runtime::PeerConnectionManager;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

struct Fixture {
    relay: MemorySignalRelay,
    network: LoopbackNetwork,
}

impl Fixture {
    fn new() -> Self {
        Self {
            relay: MemorySignalRelay::new(),
            network: LoopbackNetwork::new(),
        }
    }

    async fn manager<I: IdentityProvider + 'static>(&self, identity: I) -> PeerConnectionManager {
        self.manager_with(identity, ConnectionConfig::testing()).await
    }

    async fn manager_with<I: IdentityProvider + 'static>(
        &self,
        identity: I,
        config: ConnectionConfig,
    ) -> PeerConnectionManager {
        PeerConnectionManager::start(
            Arc::new(identity),
            Arc::new(self.relay.clone()),
            Arc::new(self.network.transport()),
            config,
            Arc::new(MockTimeSource::new()),
        )
        .await
        .unwrap()
    }
}

fn wallet(seed: u8) -> LocalWallet {
    LocalWallet::from_secret_bytes(&[seed; 32]).unwrap()
}

/// Let spawned tasks run; time is paused so this costs nothing
async fn settle() {
    tokio::time::sleep(Duration::from_millis(50)).await;
}

#[tokio::test(start_paused = true)]
async fn test_init_connection_opens_both_sides() {
    let fx = Fixture::new();
    let (alice, bob) = (wallet(1), wallet(2));
    let (alice_addr, bob_addr) = (alice.address(), bob.address());
    let a = fx.manager(alice).await;
    let b = fx.manager(bob).await;

    a.init_connection(&bob_addr, true).await.unwrap();
    settle().await;

    assert!(a.is_open(&bob_addr).await);
    assert!(b.is_open(&alice_addr).await);
    assert_eq!(a.open_peers().await, vec![bob_addr.clone()]);
    assert_eq!(a.attempts(&bob_addr).await, 0);
    assert_eq!(fx.network.stats().channels_opened, 1);

    let offers = fx.relay.published_between(&alice_addr, &bob_addr);
    assert!(matches!(offers.first(), Some(Signal::Offer { .. })));
    let answers = fx.relay.published_between(&bob_addr, &alice_addr);
    assert!(answers.iter().any(|signal| matches!(signal, Signal::Answer { .. })));
}

#[tokio::test(start_paused = true)]
async fn test_init_connection_is_idempotent_when_open() {
    let fx = Fixture::new();
    let bob = wallet(2);
    let bob_addr = bob.address();
    let a = fx.manager(wallet(1)).await;
    let _b = fx.manager(bob).await;

    a.init_connection(&bob_addr, true).await.unwrap();
    let sessions = fx.network.stats().sessions_created;

    a.init_connection(&bob_addr, true).await.unwrap();
    assert_eq!(fx.network.stats().sessions_created, sessions);
    assert_eq!(a.stats().await.negotiations_started, 1);
}

#[tokio::test(start_paused = true)]
async fn test_frames_reach_subscribers() {
    let fx = Fixture::new();
    let (alice, bob) = (wallet(1), wallet(2));
    let (alice_addr, bob_addr) = (alice.address(), bob.address());
    let a = fx.manager(alice).await;
    let b = fx.manager(bob).await;
    let mut inbound = b.on_message().await;

    a.init_connection(&bob_addr, true).await.unwrap();
    a.send(&bob_addr, "ping").await.unwrap();

    let frame = inbound.recv().await.unwrap();
    assert_eq!(frame.from, alice_addr);
    assert_eq!(frame.kind, FrameKind::Message);
    assert_eq!(frame.content, "ping");
    assert_eq!(a.stats().await.frames_sent, 1);
    assert_eq!(b.stats().await.frames_received, 1);
}

#[tokio::test(start_paused = true)]
async fn test_send_requires_open_channel() {
    let fx = Fixture::new();
    let bob_addr = wallet(2).address();
    let a = fx.manager(wallet(1)).await;

    let err = a.send(&bob_addr, "hello").await.unwrap_err();
    assert_eq!(err, SendError::NoChannel { peer: bob_addr.clone() });

    // negotiation in flight, nobody answering
    fx.network.blackhole(bob_addr.clone());
    let pending = {
        let a = a.clone();
        let bob_addr = bob_addr.clone();
        tokio::spawn(async move { a.init_connection(&bob_addr, true).await })
    };
    settle().await;
    let err = a.send(&bob_addr, "hello").await.unwrap_err();
    assert_eq!(err, SendError::ChannelNotReady { peer: bob_addr.clone() });

    let result = pending.await.unwrap();
    assert!(matches!(result, Err(ConnectionError::ConnectionTimeout { .. })));
}

#[tokio::test(start_paused = true)]
async fn test_retry_bound_fails_fourth_attempt_immediately() {
    let fx = Fixture::new();
    let bob = wallet(2);
    let bob_addr = bob.address();
    let a = fx.manager(wallet(1)).await;
    let _b = fx.manager(bob).await;
    fx.network.blackhole(bob_addr.clone());

    for attempt in 1..=3 {
        let err = a.init_connection(&bob_addr, true).await.unwrap_err();
        assert!(
            matches!(err, ConnectionError::ConnectionTimeout { timeout_ms: 2000, .. }),
            "attempt {attempt}: {err:?}"
        );
        assert_eq!(a.attempts(&bob_addr).await, attempt);
    }

    let started = Instant::now();
    let err = a.init_connection(&bob_addr, true).await.unwrap_err();
    assert_eq!(
        err,
        ConnectionError::MaxRetriesExceeded {
            peer: bob_addr.clone(),
            attempts: 3
        }
    );
    assert_eq!(started.elapsed(), Duration::ZERO);
    assert_eq!(a.attempts(&bob_addr).await, 0);

    let stats = a.stats().await;
    assert_eq!(stats.timeouts, 3);
    assert_eq!(stats.retries_exhausted, 1);

    // the counter was cleared, so a healed network gets a fresh budget
    fx.network.heal();
    settle().await;
    a.init_connection(&bob_addr, true).await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_rejected_session_fails_without_tracking() {
    let fx = Fixture::new();
    let bob_addr = wallet(2).address();
    let a = fx.manager(wallet(1)).await;
    fx.network.reject(bob_addr.clone());

    let err = a.init_connection(&bob_addr, true).await.unwrap_err();
    assert!(matches!(err, ConnectionError::ConnectionFailed { .. }));
    assert!(a.state(&bob_addr).await.is_none());
    assert_eq!(a.stats().await.negotiations_failed, 1);
}

#[tokio::test(start_paused = true)]
async fn test_stalled_offer_publish_times_out() {
    let fx = Fixture::new();
    let bob = wallet(2);
    let bob_addr = bob.address();
    let a = fx.manager(wallet(1)).await;
    let _b = fx.manager(bob).await;
    fx.relay.stall_kind("offer");

    let started = Instant::now();
    let err = a.init_connection(&bob_addr, true).await.unwrap_err();
    assert!(
        matches!(err, ConnectionError::ConnectionTimeout { timeout_ms: 2000, .. }),
        "{err:?}"
    );
    assert!(started.elapsed() >= Duration::from_secs(2));
    assert!(started.elapsed() < Duration::from_secs(3));

    assert!(a.state(&bob_addr).await.is_none());
    assert_eq!(a.attempts(&bob_addr).await, 1);
    assert_eq!(a.stats().await.timeouts, 1);
}

#[tokio::test(start_paused = true)]
async fn test_failed_connectivity_checks_fail_attempt() {
    let fx = Fixture::new();
    let (alice, bob) = (wallet(1), wallet(2));
    let (alice_addr, bob_addr) = (alice.address(), bob.address());
    let a = fx.manager(alice).await;
    let b = fx.manager(bob).await;
    fx.network.fail_negotiation(bob_addr.clone());

    let err = a.init_connection(&bob_addr, true).await.unwrap_err();
    assert!(matches!(err, ConnectionError::ConnectionFailed { .. }), "{err:?}");
    settle().await;

    assert!(a.state(&bob_addr).await.is_none());
    assert!(b.state(&alice_addr).await.is_none());
    assert_eq!(a.stats().await.negotiations_failed, 1);
    assert_eq!(a.stats().await.timeouts, 0);
    assert_eq!(fx.network.stats().channels_opened, 0);
}

#[tokio::test(start_paused = true)]
async fn test_buffered_offers_are_capped() {
    let fx = Fixture::new();
    let alice = wallet(1);
    let alice_addr = alice.address();
    let config = ConnectionConfig {
        auto_accept_offers: false,
        ..ConnectionConfig::testing()
    };
    let a = fx.manager_with(alice, config).await;

    for n in 0..70u32 {
        let stranger = Address::new(format!("0x{n:040x}"));
        let offer = Signal::Offer { sdp: format!("v=0 {n}") };
        fx.relay.publish(&stranger, &alice_addr, offer).await.unwrap();
    }
    settle().await;

    assert_eq!(a.buffered_offers().await, 64);
    assert_eq!(a.stats().await.signals_dropped, 6);

    // a repeat offer from a peer already held still replaces its entry
    let held = Address::new(format!("0x{:040x}", 0));
    let offer = Signal::Offer { sdp: "v=0 again".into() };
    fx.relay.publish(&held, &alice_addr, offer).await.unwrap();
    settle().await;
    assert_eq!(a.buffered_offers().await, 64);
    assert_eq!(a.stats().await.signals_dropped, 6);
}

#[tokio::test(start_paused = true)]
async fn test_buffered_candidates_are_capped() {
    let fx = Fixture::new();
    let alice = wallet(1);
    let alice_addr = alice.address();
    let bob_addr = wallet(2).address();
    let a = fx.manager(alice).await;

    for n in 0..70 {
        let candidate = Signal::Candidate(IceCandidate::new(format!("candidate:{n}")));
        fx.relay.publish(&bob_addr, &alice_addr, candidate).await.unwrap();
    }
    for n in 0..70u32 {
        let stranger = Address::new(format!("0x{n:040x}"));
        let candidate = Signal::Candidate(IceCandidate::new("candidate:0"));
        fx.relay.publish(&stranger, &alice_addr, candidate).await.unwrap();
    }
    settle().await;

    assert_eq!(a.buffered_candidates(&bob_addr).await, 64);
    // bob holds one of the 64 peer slots
    assert_eq!(a.stats().await.signals_dropped, 6 + 7);
}

#[tokio::test(start_paused = true)]
async fn test_failed_attempt_discards_buffered_candidates() {
    let fx = Fixture::new();
    let alice = wallet(1);
    let alice_addr = alice.address();
    let bob_addr = wallet(2).address();
    let a = fx.manager(alice).await;

    let candidate = Signal::Candidate(IceCandidate::new("candidate:early"));
    fx.relay.publish(&bob_addr, &alice_addr, candidate).await.unwrap();
    settle().await;
    assert_eq!(a.buffered_candidates(&bob_addr).await, 1);

    fx.network.reject(bob_addr.clone());
    a.init_connection(&bob_addr, true).await.unwrap_err();
    assert_eq!(a.buffered_candidates(&bob_addr).await, 0);
}

#[tokio::test(start_paused = true)]
async fn test_timed_out_attempt_discards_buffered_candidates() {
    let fx = Fixture::new();
    let alice = wallet(1);
    let alice_addr = alice.address();
    let bob_addr = wallet(2).address();
    let a = fx.manager(alice).await;
    fx.relay.stall_kind("offer");

    let candidate = Signal::Candidate(IceCandidate::new("candidate:early"));
    fx.relay.publish(&bob_addr, &alice_addr, candidate).await.unwrap();
    settle().await;
    assert_eq!(a.buffered_candidates(&bob_addr).await, 1);

    a.init_connection(&bob_addr, true).await.unwrap_err();
    assert_eq!(a.buffered_candidates(&bob_addr).await, 0);
}

#[tokio::test(start_paused = true)]
async fn test_cannot_connect_to_self() {
    let fx = Fixture::new();
    let alice = wallet(1);
    let alice_addr = alice.address();
    let a = fx.manager(alice).await;

    let err = a.init_connection(&alice_addr, true).await.unwrap_err();
    assert!(matches!(err, ConnectionError::ConnectionFailed { .. }));
}

#[tokio::test(start_paused = true)]
async fn test_simultaneous_offers_converge() {
    let fx = Fixture::new();
    let (alice, bob) = (wallet(1), wallet(2));
    let (alice_addr, bob_addr) = (alice.address(), bob.address());
    let a = fx.manager(alice).await;
    let b = fx.manager(bob).await;

    let (left, right) = tokio::join!(
        a.init_connection(&bob_addr, true),
        b.init_connection(&alice_addr, true)
    );
    left.unwrap();
    right.unwrap();
    settle().await;

    assert!(a.is_open(&bob_addr).await);
    assert!(b.is_open(&alice_addr).await);
    assert_eq!(fx.network.stats().channels_opened, 1);

    // only the greater address answers
    let (low, high) = if alice_addr < bob_addr {
        (alice_addr, bob_addr)
    } else {
        (bob_addr, alice_addr)
    };
    let answered = |from: &Address, to: &Address| {
        fx.relay
            .published_between(from, to)
            .iter()
            .any(|signal| matches!(signal, Signal::Answer { .. }))
    };
    assert!(answered(&high, &low));
    assert!(!answered(&low, &high));
}

#[tokio::test(start_paused = true)]
async fn test_candidate_publish_failure_is_not_fatal() {
    let fx = Fixture::new();
    let bob = wallet(2);
    let bob_addr = bob.address();
    let a = fx.manager(wallet(1)).await;
    let _b = fx.manager(bob).await;
    fx.relay.fail_kind("candidate");

    a.init_connection(&bob_addr, true).await.unwrap();
    assert!(a.is_open(&bob_addr).await);
}

#[tokio::test(start_paused = true)]
async fn test_offers_wait_when_auto_accept_disabled() {
    let fx = Fixture::new();
    let (alice, bob) = (wallet(1), wallet(2));
    let (alice_addr, bob_addr) = (alice.address(), bob.address());
    let a = fx.manager(alice).await;
    let config = ConnectionConfig {
        auto_accept_offers: false,
        ..ConnectionConfig::testing()
    };
    let b = fx.manager_with(bob, config).await;

    let (left, right) = tokio::join!(a.init_connection(&bob_addr, true), async {
        settle().await;
        assert!(b.state(&alice_addr).await.is_none());
        b.init_connection(&alice_addr, false).await
    });
    left.unwrap();
    right.unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_destroy_cancels_negotiation_and_is_idempotent() {
    let fx = Fixture::new();
    let bob_addr = wallet(2).address();
    let a = fx.manager(wallet(1)).await;
    fx.network.blackhole(bob_addr.clone());

    let pending = {
        let a = a.clone();
        let bob_addr = bob_addr.clone();
        tokio::spawn(async move { a.init_connection(&bob_addr, true).await })
    };
    settle().await;
    assert!(a.state(&bob_addr).await.is_some());

    a.destroy().await;
    a.destroy().await;

    assert_eq!(pending.await.unwrap(), Err(ConnectionError::Shutdown));
    assert!(a.state(&bob_addr).await.is_none());
    assert_eq!(a.attempts(&bob_addr).await, 0);
    assert_eq!(fx.network.live_sessions(), 0);

    let trail = a.audit_trail(10).await;
    let last = trail.last().unwrap();
    assert_eq!(last.event, "Teardown");
    assert_eq!(last.to_state, "Closed");
}

#[tokio::test(start_paused = true)]
async fn test_destroy_closes_subscriptions() {
    let fx = Fixture::new();
    let a = fx.manager(wallet(1)).await;
    let mut inbound = a.on_message().await;

    a.destroy().await;
    assert!(inbound.recv().await.is_none());
}

#[tokio::test(start_paused = true)]
async fn test_remote_close_allows_reconnect() {
    let fx = Fixture::new();
    let (alice, bob) = (wallet(1), wallet(2));
    let (alice_addr, bob_addr) = (alice.address(), bob.address());
    let a = fx.manager(alice).await;
    let b = fx.manager(bob).await;

    a.init_connection(&bob_addr, true).await.unwrap();
    fx.network.sever(&alice_addr, &bob_addr);
    settle().await;

    assert!(a.state(&bob_addr).await.is_none());
    assert!(b.state(&alice_addr).await.is_none());

    a.init_connection(&bob_addr, true).await.unwrap();
    assert!(a.is_open(&bob_addr).await);
}

/// Claims one address but signs with another key
struct Impostor {
    claimed: Address,
    signer: LocalWallet,
}

#[async_trait]
impl IdentityProvider for Impostor {
    fn address(&self) -> Address {
        self.claimed.clone()
    }

    async fn sign(&self, message: &[u8]) -> Result<Signature, CryptographicError> {
        Ok(self.signer.sign_message(message))
    }
}

#[tokio::test(start_paused = true)]
async fn test_frames_with_foreign_signature_are_dropped() {
    let fx = Fixture::new();
    let (alice, bob) = (wallet(1), wallet(2));
    let (alice_addr, bob_addr) = (alice.address(), bob.address());
    let impostor = Impostor {
        claimed: alice_addr.clone(),
        signer: wallet(3),
    };
    let a = fx.manager(impostor).await;
    let b = fx.manager(bob).await;
    let mut inbound = b.on_message().await;

    a.init_connection(&bob_addr, true).await.unwrap();
    a.send(&bob_addr, "trust me").await.unwrap();
    settle().await;

    assert!(inbound.try_recv().is_err());
    assert_eq!(b.stats().await.frames_rejected, 1);
    assert_eq!(b.stats().await.frames_received, 0);
    assert!(b.is_open(&alice_addr).await);
}
