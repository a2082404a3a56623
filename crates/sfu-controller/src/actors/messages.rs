//! Message types for actor communication.
//!
//! All inter-actor communication uses strongly-typed message passing via `tokio::sync::mpsc`.
//! Request-reply uses `tokio::sync::oneshot`.

use super::endpoint::TrackDeclaration;
use crate::errors::SfuError;
use crate::registry::{ChildId, TrackEntry};
use crate::signaling::SignalingEvent;
use crate::topology::ForwardingEdge;
use crate::types::{Capabilities, Encoding, PeerId, TrackId, VoiceActivity};

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;
use tokio::sync::oneshot;

/// Messages sent to `SfuEngine`.
#[derive(Debug)]
pub enum EngineMessage {
    /// A decoded signaling event.
    Signaling { event: SignalingEvent },

    /// A raw signaling frame still to be decoded.
    SignalingFrame { frame: Vec<u8> },

    /// Admission authority accepted a pending join.
    AcceptPeer {
        peer_id: PeerId,
        respond_to: oneshot::Sender<Result<(), SfuError>>,
    },

    /// Admission authority denied a pending join.
    DenyPeer {
        peer_id: PeerId,
        respond_to: oneshot::Sender<Result<(), SfuError>>,
    },

    /// Force removal of an admitted peer.
    RemovePeer {
        peer_id: PeerId,
        respond_to: oneshot::Sender<RemovalOutcome>,
    },

    /// Mark (or clear) the peer whose screen share is active.
    SetScreenShareSource { peer_id: Option<PeerId> },

    /// Notification from a peer's media endpoint.
    Endpoint(EndpointEvent),

    /// Get a snapshot of the engine state.
    GetState {
        respond_to: oneshot::Sender<EngineState>,
    },

    /// Stop admitting, close every endpoint, and stop the loop.
    Shutdown { respond_to: oneshot::Sender<()> },
}

/// Notifications from an endpoint actor. `instance` identifies which endpoint of the peer
/// sent it, so reports from a replaced endpoint can be told apart.
#[derive(Debug)]
pub enum EndpointEvent {
    /// The endpoint discovered one of its peer's inbound tracks.
    NewTrack {
        peer_id: PeerId,
        instance: u64,
        track_id: TrackId,
        encoding: Encoding,
    },

    /// Payload to relay to the peer through the signaling codec.
    Signal {
        peer_id: PeerId,
        instance: u64,
        payload: Value,
    },

    VoiceActivity {
        peer_id: PeerId,
        instance: u64,
        activity: VoiceActivity,
    },

    /// The endpoint actor task ended.
    Exited {
        peer_id: PeerId,
        instance: u64,
        panicked: bool,
    },
}

impl EndpointEvent {
    #[must_use]
    pub const fn kind(&self) -> &'static str {
        match self {
            EndpointEvent::NewTrack { .. } => "new_track",
            EndpointEvent::Signal { .. } => "endpoint_signal",
            EndpointEvent::VoiceActivity { .. } => "vad",
            EndpointEvent::Exited { .. } => "endpoint_exited",
        }
    }
}

/// Commands sent to an `EndpointActor`.
#[derive(Debug)]
pub enum EndpointCommand {
    /// Open the fan-out point (with its discard sink) for one of the peer's own tracks.
    OpenFanOut { track_id: TrackId, encoding: Encoding },

    /// Start delivering another peer's track to this peer.
    ForwardTrack { track: TrackDeclaration },

    /// Tracks this peer receives are going away.
    WithdrawTracks { track_ids: Vec<TrackId> },

    /// Signaling payload from the peer.
    ApplySignal { signal: PeerSignal },
}

/// Signaling payload forwarded from a peer to its endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum PeerSignal {
    SdpAnswer(String),
    Candidate(String),
}

/// Result of a peer removal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RemovalOutcome {
    /// The peer was admitted and has been removed; `peer_left` was published.
    Removed,
    /// Nothing to remove.
    AlreadyAbsent,
}

/// One admitted peer in an [`EngineState`] snapshot.
#[derive(Debug, Clone, Serialize)]
pub struct PeerSnapshot {
    pub peer_id: PeerId,
    pub capabilities: Capabilities,
    pub tracks: Vec<TrackId>,
    pub admitted_at: DateTime<Utc>,
    /// Whether the peer has a live endpoint actor.
    pub endpoint_live: bool,
}

/// Snapshot of the engine state.
#[derive(Debug, Clone, Serialize)]
pub struct EngineState {
    pub sfu_id: String,
    /// Ordered by peer id.
    pub peers: Vec<PeerSnapshot>,
    /// Ordered by track id.
    pub tracks: Vec<TrackEntry>,
    pub forwarding_edges: Vec<ForwardingEdge>,
    pub pending_admissions: usize,
    pub endpoint_children: Vec<ChildId>,
    pub mailbox_depth: usize,
    pub is_shutting_down: bool,
}

impl EngineState {
    #[must_use]
    pub fn peer(&self, peer_id: &PeerId) -> Option<&PeerSnapshot> {
        self.peers.iter().find(|p| &p.peer_id == peer_id)
    }

    /// Consumers currently wired to `track_id`.
    #[must_use]
    pub fn consumers_of(&self, track_id: &TrackId) -> Vec<&PeerId> {
        self.forwarding_edges
            .iter()
            .filter(|e| &e.track_id == track_id)
            .map(|e| &e.consumer)
            .collect()
    }
}
