//! PeerLink Harness
//!
//! In-memory implementations of every external collaborator the runtime
//! talks to (signal relay, fallback store, key directory, presence feed), a
//! loopback transport with failure injection and a controllable clock. The
//! runtime's integration tests and the CLI simulator are built on these.

pub mod loopback;
pub mod presence;
pub mod relay;
pub mod store;
pub mod time;

pub use loopback::{LoopbackNetwork, LoopbackSession, LoopbackTransport, NetworkStats};
pub use presence::MemoryPresenceFeed;
pub use relay::MemorySignalRelay;
pub use store::{MemoryFallbackStore, MemoryKeyDirectory};
pub use time::MockTimeSource;
