//! Session registry.
//!
//! Owned by the engine actor, so nothing here is synchronized. Holds every admitted
//! peer session, the tracks those peers publish, the admission key index, and the set of
//! endpoint children (endpoints, fan-out points, discard sinks) that are currently alive.

use crate::actors::admission::PendingAdmission;
use crate::errors::SfuError;
use crate::signaling::PeerDirectoryEntry;
use crate::types::{AdmissionKey, Capabilities, Encoding, Medium, PeerId, StreamId, TrackId};

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;
use std::collections::{HashMap, HashSet};

/// An admitted peer.
#[derive(Debug, Clone)]
pub struct PeerSession {
    pub peer_id: PeerId,
    pub key: AdmissionKey,
    pub metadata: Value,
    /// Track metadata from the join. Cleared once the peer's answer reports metadata per mid.
    pub track_metadata: Option<Value>,
    pub mid_to_track_metadata: HashMap<String, Value>,
    pub capabilities: Capabilities,
    pub stream_id: StreamId,
    pub tracks: Vec<TrackId>,
    pub admitted_at: DateTime<Utc>,
}

/// A track published by an admitted peer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TrackEntry {
    pub track_id: TrackId,
    pub stream_id: StreamId,
    pub medium: Medium,
    /// Unknown until the owning endpoint reports it.
    pub encoding: Option<Encoding>,
    pub owner: PeerId,
    pub enabled: bool,
}

impl TrackEntry {
    /// A track can be wired to consumers once its encoding is known.
    #[must_use]
    pub fn is_routable(&self) -> bool {
        self.enabled && self.encoding.is_some()
    }
}

/// A runtime structure owned by one peer's failure-isolation unit.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(tag = "kind", content = "id", rename_all = "snake_case")]
pub enum ChildId {
    Endpoint(PeerId),
    FanOut(TrackId),
    DiscardSink(TrackId),
}

/// Result of reporting a track's encoding.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EncodingUpdate {
    /// First report; the track just became routable.
    Recorded,
    /// The encoding was already known.
    Unchanged,
}

#[derive(Debug, Default)]
pub struct SessionRegistry {
    peers: HashMap<PeerId, PeerSession>,
    key_index: HashMap<AdmissionKey, PeerId>,
    tracks: HashMap<TrackId, TrackEntry>,
    endpoint_children: HashSet<ChildId>,
}

impl SessionRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Promote a pending join to an admitted session.
    ///
    /// Creates one placeholder track per published medium, all in one stream.
    ///
    /// # Errors
    ///
    /// Returns `SfuError::Conflict` if the key or the peer id is already registered.
    pub fn admit(&mut self, pending: PendingAdmission) -> Result<&PeerSession, SfuError> {
        if self.key_index.contains_key(&pending.key) {
            return Err(SfuError::Conflict(
                "admission key already registered".to_string(),
            ));
        }
        if self.peers.contains_key(&pending.peer_id) {
            return Err(SfuError::Conflict(format!(
                "peer {} already admitted",
                pending.peer_id
            )));
        }

        let stream_id = StreamId::generate();
        let mut track_ids = Vec::new();
        for medium in pending.capabilities.published_media() {
            let track_id = TrackId::generate();
            self.tracks.insert(
                track_id.clone(),
                TrackEntry {
                    track_id: track_id.clone(),
                    stream_id: stream_id.clone(),
                    medium,
                    encoding: None,
                    owner: pending.peer_id.clone(),
                    enabled: true,
                },
            );
            track_ids.push(track_id);
        }

        let peer_id = pending.peer_id.clone();
        self.key_index.insert(pending.key.clone(), peer_id.clone());
        let session = PeerSession {
            peer_id: pending.peer_id,
            key: pending.key,
            metadata: pending.metadata,
            track_metadata: Some(pending.track_metadata).filter(|m| !m.is_null()),
            mid_to_track_metadata: HashMap::new(),
            capabilities: pending.capabilities,
            stream_id,
            tracks: track_ids,
            admitted_at: Utc::now(),
        };

        Ok(self.peers.entry(peer_id).or_insert(session))
    }

    #[must_use]
    pub fn peer(&self, peer_id: &PeerId) -> Option<&PeerSession> {
        self.peers.get(peer_id)
    }

    pub fn peer_mut(&mut self, peer_id: &PeerId) -> Option<&mut PeerSession> {
        self.peers.get_mut(peer_id)
    }

    #[must_use]
    pub fn peer_by_key(&self, key: &AdmissionKey) -> Option<&PeerSession> {
        self.key_index.get(key).and_then(|id| self.peers.get(id))
    }

    #[must_use]
    pub fn peer_id_for_key(&self, key: &AdmissionKey) -> Option<&PeerId> {
        self.key_index.get(key)
    }

    #[must_use]
    pub fn contains_key(&self, key: &AdmissionKey) -> bool {
        self.key_index.contains_key(key)
    }

    #[must_use]
    pub fn contains_peer(&self, peer_id: &PeerId) -> bool {
        self.peers.contains_key(peer_id)
    }

    /// Take the peer's session and all its tracks out of the registry.
    ///
    /// Returned tracks are marked disabled. `None` if the peer was not admitted.
    pub fn remove_peer(&mut self, peer_id: &PeerId) -> Option<(PeerSession, Vec<TrackEntry>)> {
        let session = self.peers.remove(peer_id)?;
        self.key_index.remove(&session.key);

        let tracks = session
            .tracks
            .iter()
            .filter_map(|track_id| self.tracks.remove(track_id))
            .map(|mut track| {
                track.enabled = false;
                track
            })
            .collect();

        Some((session, tracks))
    }

    #[must_use]
    pub fn track(&self, track_id: &TrackId) -> Option<&TrackEntry> {
        self.tracks.get(track_id)
    }

    /// Record the encoding the owning endpoint reported for `track_id`.
    ///
    /// # Errors
    ///
    /// Returns `SfuError::PeerNotFound` if the track does not exist or `owner` does not
    /// own it.
    pub fn record_encoding(
        &mut self,
        track_id: &TrackId,
        owner: &PeerId,
        encoding: Encoding,
    ) -> Result<EncodingUpdate, SfuError> {
        let track = self
            .tracks
            .get_mut(track_id)
            .filter(|t| &t.owner == owner)
            .ok_or_else(|| {
                SfuError::PeerNotFound(format!("peer {owner} does not own track {track_id}"))
            })?;

        if track.encoding.is_some() {
            return Ok(EncodingUpdate::Unchanged);
        }
        track.encoding = Some(encoding);
        Ok(EncodingUpdate::Recorded)
    }

    /// Routable tracks, ordered by track id.
    #[must_use]
    pub fn routable_tracks(&self) -> Vec<&TrackEntry> {
        let mut tracks: Vec<_> = self
            .tracks
            .values()
            .filter(|t| t.is_routable() && self.peers.contains_key(&t.owner))
            .collect();
        tracks.sort_by(|a, b| a.track_id.cmp(&b.track_id));
        tracks
    }

    /// Peers that asked to receive media.
    pub fn receivers(&self) -> impl Iterator<Item = &PeerId> {
        self.peers
            .values()
            .filter(|p| p.capabilities.receive_media)
            .map(|p| &p.peer_id)
    }

    /// All peers except `exclude`, ordered by peer id.
    #[must_use]
    pub fn directory(&self, exclude: &PeerId) -> Vec<PeerDirectoryEntry> {
        let mut entries: Vec<_> = self
            .peers
            .values()
            .filter(|p| &p.peer_id != exclude)
            .map(|p| PeerDirectoryEntry {
                peer_id: p.peer_id.clone(),
                metadata: p.metadata.clone(),
                join_track_metadata: p.track_metadata.clone(),
                track_metadata: p.mid_to_track_metadata.clone(),
            })
            .collect();
        entries.sort_by(|a, b| a.peer_id.cmp(&b.peer_id));
        entries
    }

    pub fn peer_ids(&self) -> impl Iterator<Item = &PeerId> {
        self.peers.keys()
    }

    #[must_use]
    pub fn peer_count(&self) -> usize {
        self.peers.len()
    }

    #[must_use]
    pub fn track_count(&self) -> usize {
        self.tracks.len()
    }

    /// Returns false if the child was already present.
    pub fn add_child(&mut self, child: ChildId) -> bool {
        self.endpoint_children.insert(child)
    }

    /// Remove the given children, returning only the ones that still existed.
    pub fn remove_children(&mut self, children: &[ChildId]) -> Vec<ChildId> {
        children
            .iter()
            .filter(|child| self.endpoint_children.remove(*child))
            .cloned()
            .collect()
    }

    /// Live endpoint children, sorted.
    #[must_use]
    pub fn children(&self) -> Vec<ChildId> {
        let mut children: Vec<_> = self.endpoint_children.iter().cloned().collect();
        children.sort();
        children
    }

    /// Tracks owned by `peer_id`, in declaration order.
    #[must_use]
    pub fn tracks_of(&self, peer_id: &PeerId) -> Vec<&TrackEntry> {
        self.peers
            .get(peer_id)
            .map(|p| p.tracks.iter().filter_map(|t| self.tracks.get(t)).collect())
            .unwrap_or_default()
    }

    /// Snapshot of every track, ordered by track id.
    #[must_use]
    pub fn all_tracks(&self) -> Vec<TrackEntry> {
        let mut tracks: Vec<_> = self.tracks.values().cloned().collect();
        tracks.sort_by(|a, b| a.track_id.cmp(&b.track_id));
        tracks
    }
}
