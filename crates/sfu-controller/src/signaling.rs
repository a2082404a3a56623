//! Signaling events at the codec boundary.
//!
//! The engine only consumes decoded [`SignalingEvent`] values and produces
//! [`OutboundEvent`] values. [`decode_event`] and [`encode_event`] give the surrounding
//! transport a JSON rendition (internally tagged by `"type"`).

use crate::errors::SfuError;
use crate::types::{AdmissionKey, Capabilities, PeerId};

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;

/// Decoded inbound signaling event. Every event is scoped by its admission key.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SignalingEvent {
    /// Request to join; starts the admission flow.
    Join {
        key: AdmissionKey,
        /// Generated when absent.
        #[serde(default)]
        peer_id: Option<PeerId>,
        #[serde(default)]
        metadata: Value,
        #[serde(default)]
        track_metadata: Value,
        #[serde(default)]
        relay_audio: bool,
        #[serde(default)]
        relay_video: bool,
        #[serde(default)]
        receive_media: bool,
    },

    /// SDP answer for the peer's endpoint.
    Answer {
        key: AdmissionKey,
        sdp_answer: String,
        #[serde(default)]
        mid_to_track_metadata: HashMap<String, Value>,
    },

    /// ICE candidate for the peer's endpoint.
    Candidate { key: AdmissionKey, candidate: String },

    /// Peer leaves.
    Leave { key: AdmissionKey },
}

impl SignalingEvent {
    /// The admission key this event is scoped to.
    #[must_use]
    pub fn key(&self) -> &AdmissionKey {
        match self {
            SignalingEvent::Join { key, .. }
            | SignalingEvent::Answer { key, .. }
            | SignalingEvent::Candidate { key, .. }
            | SignalingEvent::Leave { key } => key,
        }
    }

    /// Bounded name for logs and metric labels.
    #[must_use]
    pub const fn kind(&self) -> &'static str {
        match self {
            SignalingEvent::Join { .. } => "join",
            SignalingEvent::Answer { .. } => "answer",
            SignalingEvent::Candidate { .. } => "candidate",
            SignalingEvent::Leave { .. } => "leave",
        }
    }

    /// Capabilities declared by a join, `None` for other events.
    #[must_use]
    pub fn capabilities(&self) -> Option<Capabilities> {
        match self {
            SignalingEvent::Join {
                relay_audio,
                relay_video,
                receive_media,
                ..
            } => Some(Capabilities {
                relay_audio: *relay_audio,
                relay_video: *relay_video,
                receive_media: *receive_media,
            }),
            _ => None,
        }
    }
}

/// One row of the peer directory sent with `peer_accepted`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PeerDirectoryEntry {
    pub peer_id: PeerId,
    pub metadata: Value,
    /// Track metadata from the join, until the peer's answer replaces it.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub join_track_metadata: Option<Value>,
    /// Track metadata by SDP mid, as last reported in the peer's answer.
    pub track_metadata: HashMap<String, Value>,
}

/// Event produced by the engine for the signaling codec.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum OutboundEvent {
    /// The peer was admitted; carries the other peers currently in the SFU.
    PeerAccepted {
        peer_id: PeerId,
        directory: Vec<PeerDirectoryEntry>,
    },

    /// The admission authority denied the join.
    PeerDenied { peer_id: PeerId },

    /// Opaque payload emitted by the peer's media endpoint.
    Signal { peer_id: PeerId, payload: Value },
}

impl OutboundEvent {
    /// The peer this event is addressed to.
    #[must_use]
    pub fn peer_id(&self) -> &PeerId {
        match self {
            OutboundEvent::PeerAccepted { peer_id, .. }
            | OutboundEvent::PeerDenied { peer_id }
            | OutboundEvent::Signal { peer_id, .. } => peer_id,
        }
    }
}

/// Decode one inbound signaling frame.
pub fn decode_event(frame: &[u8]) -> Result<SignalingEvent, SfuError> {
    Ok(serde_json::from_slice(frame)?)
}

/// Encode one outbound event.
pub fn encode_event(event: &OutboundEvent) -> Result<String, SfuError> {
    serde_json::to_string(event).map_err(|e| SfuError::Encode(e.to_string()))
}
