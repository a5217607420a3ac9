//! Linear Link State Machine
//!
//! Lifecycle of a direct channel to one peer. States are consumed on every
//! transition so an invalid sequence (for example opening a channel that was
//! never negotiated) is rejected instead of silently overwritten.
//!
//! ```text
//! Idle -> Negotiating -> Open -> Closed
//!              |
//!              +-> Failed
//! ```

use core::time::Duration;
use serde::{Deserialize, Serialize};

use crate::errors::StateTransitionError;
use crate::types::{Address, Timestamp};

// ----------------------------------------------------------------------------
// Link State Types
// ----------------------------------------------------------------------------

/// Which side of the offer/answer exchange this peer plays
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NegotiationRole {
    Initiator,
    Responder,
}

/// Linear link state that must be consumed to transition
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum LinkState {
    Idle(IdleState),
    Negotiating(NegotiatingState),
    Open(OpenState),
    Closed(ClosedState),
    Failed(FailedState),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IdleState {
    pub peer: Address,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NegotiatingState {
    pub peer: Address,
    pub role: NegotiationRole,
    pub started_at: Timestamp,
    pub deadline: Timestamp,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OpenState {
    pub peer: Address,
    pub role: NegotiationRole,
    pub opened_at: Timestamp,
    pub last_activity: Timestamp,
    pub frames_sent: u64,
    pub frames_received: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClosedState {
    pub peer: Address,
    pub closed_at: Timestamp,
    pub reason: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FailedState {
    pub peer: Address,
    pub failed_at: Timestamp,
    pub reason: String,
}

// ----------------------------------------------------------------------------
// Link Events
// ----------------------------------------------------------------------------

/// Events that drive link transitions
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum LinkEvent {
    /// Begin an offer/answer exchange
    StartNegotiation { role: NegotiationRole, timeout: Duration },
    /// Switch roles mid-negotiation after simultaneous offers
    YieldToRemoteOffer,
    /// The data channel reported open
    ChannelOpened,
    /// A frame was sent on the open channel
    FrameSent,
    /// A frame arrived on the open channel
    FrameReceived,
    /// Negotiation could not complete
    NegotiationFailed { reason: String },
    /// The negotiation deadline elapsed
    Timeout,
    /// The open channel was closed by either side
    ChannelClosed { reason: String },
    /// Local teardown
    Teardown,
}

impl LinkEvent {
    fn name(&self) -> &'static str {
        match self {
            LinkEvent::StartNegotiation { .. } => "StartNegotiation",
            LinkEvent::YieldToRemoteOffer => "YieldToRemoteOffer",
            LinkEvent::ChannelOpened => "ChannelOpened",
            LinkEvent::FrameSent => "FrameSent",
            LinkEvent::FrameReceived => "FrameReceived",
            LinkEvent::NegotiationFailed { .. } => "NegotiationFailed",
            LinkEvent::Timeout => "Timeout",
            LinkEvent::ChannelClosed { .. } => "ChannelClosed",
            LinkEvent::Teardown => "Teardown",
        }
    }
}

// ----------------------------------------------------------------------------
// Transition Results
// ----------------------------------------------------------------------------

/// Result of a link transition
#[derive(Debug, Clone)]
pub struct LinkTransition {
    pub new_state: LinkState,
    pub audit_entry: AuditEntry,
}

/// Audit trail entry for link transitions
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuditEntry {
    pub timestamp: Timestamp,
    pub peer: Address,
    pub from_state: String,
    pub to_state: String,
    pub event: String,
}

// ----------------------------------------------------------------------------
// State Machine Implementation
// ----------------------------------------------------------------------------

impl LinkState {
    pub fn new_idle(peer: Address) -> Self {
        LinkState::Idle(IdleState { peer })
    }

    pub fn peer(&self) -> &Address {
        match self {
            LinkState::Idle(s) => &s.peer,
            LinkState::Negotiating(s) => &s.peer,
            LinkState::Open(s) => &s.peer,
            LinkState::Closed(s) => &s.peer,
            LinkState::Failed(s) => &s.peer,
        }
    }

    pub fn state_name(&self) -> &'static str {
        match self {
            LinkState::Idle(_) => "Idle",
            LinkState::Negotiating(_) => "Negotiating",
            LinkState::Open(_) => "Open",
            LinkState::Closed(_) => "Closed",
            LinkState::Failed(_) => "Failed",
        }
    }

    pub fn is_open(&self) -> bool {
        matches!(self, LinkState::Open(_))
    }

    pub fn is_negotiating(&self) -> bool {
        matches!(self, LinkState::Negotiating(_))
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, LinkState::Closed(_) | LinkState::Failed(_))
    }

    /// Negotiation role, while negotiating or open
    pub fn role(&self) -> Option<NegotiationRole> {
        match self {
            LinkState::Negotiating(s) => Some(s.role),
            LinkState::Open(s) => Some(s.role),
            _ => None,
        }
    }

    /// Process an event at time `now` (consumes self)
    pub fn transition(
        self,
        event: LinkEvent,
        now: Timestamp,
    ) -> Result<LinkTransition, StateTransitionError> {
        let peer = self.peer().clone();
        let from_state = self.state_name().to_string();
        let event_name = event.name().to_string();

        let new_state = match (self, event) {
            (LinkState::Idle(state), LinkEvent::StartNegotiation { role, timeout }) => {
                LinkState::Negotiating(NegotiatingState {
                    peer: state.peer,
                    role,
                    started_at: now,
                    deadline: now + timeout,
                })
            }

            (LinkState::Negotiating(mut state), LinkEvent::YieldToRemoteOffer) => {
                state.role = NegotiationRole::Responder;
                LinkState::Negotiating(state)
            }

            (LinkState::Negotiating(state), LinkEvent::ChannelOpened) => {
                LinkState::Open(OpenState {
                    peer: state.peer,
                    role: state.role,
                    opened_at: now,
                    last_activity: now,
                    frames_sent: 0,
                    frames_received: 0,
                })
            }

            (LinkState::Negotiating(state), LinkEvent::NegotiationFailed { reason }) => {
                LinkState::Failed(FailedState {
                    peer: state.peer,
                    failed_at: now,
                    reason,
                })
            }

            (LinkState::Negotiating(state), LinkEvent::Timeout) => LinkState::Failed(FailedState {
                peer: state.peer,
                failed_at: now,
                reason: "Negotiation timeout".to_string(),
            }),

            (LinkState::Negotiating(state), LinkEvent::ChannelClosed { reason }) => {
                LinkState::Failed(FailedState {
                    peer: state.peer,
                    failed_at: now,
                    reason,
                })
            }

            // From Open
            (LinkState::Open(mut state), LinkEvent::FrameSent) => {
                state.frames_sent += 1;
                state.last_activity = now;
                LinkState::Open(state)
            }

            (LinkState::Open(mut state), LinkEvent::FrameReceived) => {
                state.frames_received += 1;
                state.last_activity = now;
                LinkState::Open(state)
            }

            (LinkState::Open(state), LinkEvent::ChannelClosed { reason }) => {
                LinkState::Closed(ClosedState {
                    peer: state.peer,
                    closed_at: now,
                    reason,
                })
            }

            // Universal transitions
            (_, LinkEvent::Teardown) => LinkState::Closed(ClosedState {
                peer,
                closed_at: now,
                reason: "Torn down locally".to_string(),
            }),

            // Invalid transitions
            (_, _) => {
                return Err(StateTransitionError::InvalidTransition {
                    from_state,
                    event: event_name,
                });
            }
        };

        let audit_entry = AuditEntry {
            timestamp: now,
            peer: new_state.peer().clone(),
            from_state,
            to_state: new_state.state_name().to_string(),
            event: event_name,
        };

        Ok(LinkTransition {
            new_state,
            audit_entry,
        })
    }

    /// Negotiation deadline, if one is pending
    pub fn deadline(&self) -> Option<Timestamp> {
        match self {
            LinkState::Negotiating(s) => Some(s.deadline),
            _ => None,
        }
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------
