//! Forwarding topology.
//!
//! An explicit adjacency structure: each routable track has one fan-out point, and each
//! fan-out point has a set of consumer peers. [`Topology::reconcile`] diffs the current
//! edges against what the registry says should exist and returns the minimal list of
//! edge operations, which the engine turns into endpoint commands.
//!
//! After `reconcile` the edge set is exactly
//! `{(t, p) : t routable, p admitted, p != owner(t), p receives media}`.

use crate::registry::SessionRegistry;
use crate::types::{Encoding, PeerId, TrackId};

use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet};

/// A fan-out point duplicating one track to its consumers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FanOut {
    pub track_id: TrackId,
    pub owner: PeerId,
    pub encoding: Encoding,
    pub consumers: BTreeSet<PeerId>,
}

/// One wiring change.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EdgeOp {
    /// Wire the track's fan-out to `consumer`.
    Add {
        track_id: TrackId,
        owner: PeerId,
        consumer: PeerId,
        encoding: Encoding,
    },
    /// Unwire the track from `consumer`.
    Remove { track_id: TrackId, consumer: PeerId },
}

/// A (track, consumer) pair currently wired for delivery.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub struct ForwardingEdge {
    pub track_id: TrackId,
    pub consumer: PeerId,
}

#[derive(Debug, Default)]
pub struct Topology {
    fan_outs: BTreeMap<TrackId, FanOut>,
}

impl Topology {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Open a fan-out point for a newly discovered track.
    ///
    /// Returns false if one is already open for `track_id`.
    pub fn open_fan_out(&mut self, track_id: TrackId, owner: PeerId, encoding: Encoding) -> bool {
        if self.fan_outs.contains_key(&track_id) {
            return false;
        }
        self.fan_outs.insert(
            track_id.clone(),
            FanOut {
                track_id,
                owner,
                encoding,
                consumers: BTreeSet::new(),
            },
        );
        true
    }

    /// Close every fan-out point owned by `owner`, returning the closed track ids.
    ///
    /// The consumers of those fan-outs are not reported here; callers withdraw the tracks
    /// from other peers explicitly.
    pub fn close_fan_outs_owned_by(&mut self, owner: &PeerId) -> Vec<TrackId> {
        let closed: Vec<TrackId> = self
            .fan_outs
            .values()
            .filter(|f| &f.owner == owner)
            .map(|f| f.track_id.clone())
            .collect();
        for track_id in &closed {
            self.fan_outs.remove(track_id);
        }
        closed
    }

    #[must_use]
    pub fn fan_out(&self, track_id: &TrackId) -> Option<&FanOut> {
        self.fan_outs.get(track_id)
    }

    #[must_use]
    pub fn fan_out_count(&self) -> usize {
        self.fan_outs.len()
    }

    /// Bring the edge set in line with the registry and return what changed.
    ///
    /// Fan-outs whose track is no longer routable lose all their consumers; they are not
    /// closed here. Removals come before additions in the returned list.
    pub fn reconcile(&mut self, registry: &SessionRegistry) -> Vec<EdgeOp> {
        let receivers: BTreeSet<&PeerId> = registry.receivers().collect();
        let mut removes = Vec::new();
        let mut adds = Vec::new();

        for fan_out in self.fan_outs.values_mut() {
            let routable = registry
                .track(&fan_out.track_id)
                .is_some_and(|t| t.is_routable() && registry.contains_peer(&t.owner));

            let desired: BTreeSet<PeerId> = if routable {
                receivers
                    .iter()
                    .filter(|p| ***p != fan_out.owner)
                    .map(|p| (*p).clone())
                    .collect()
            } else {
                BTreeSet::new()
            };

            for stale in fan_out.consumers.difference(&desired) {
                removes.push(EdgeOp::Remove {
                    track_id: fan_out.track_id.clone(),
                    consumer: stale.clone(),
                });
            }
            for missing in desired.difference(&fan_out.consumers) {
                adds.push(EdgeOp::Add {
                    track_id: fan_out.track_id.clone(),
                    owner: fan_out.owner.clone(),
                    consumer: missing.clone(),
                    encoding: fan_out.encoding.clone(),
                });
            }
            fan_out.consumers = desired;
        }

        removes.extend(adds);
        removes
    }

    /// Current forwarding edges, ordered by track then consumer.
    #[must_use]
    pub fn edges(&self) -> Vec<ForwardingEdge> {
        self.fan_outs
            .values()
            .flat_map(|f| {
                f.consumers.iter().map(|c| ForwardingEdge {
                    track_id: f.track_id.clone(),
                    consumer: c.clone(),
                })
            })
            .collect()
    }

    #[must_use]
    pub fn edge_count(&self) -> usize {
        self.fan_outs.values().map(|f| f.consumers.len()).sum()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::actors::admission::PendingAdmission;
    use crate::types::{AdmissionKey, Capabilities};
    use serde_json::Value;
    use tokio::time::Instant;

    fn admit(registry: &mut SessionRegistry, peer: &str, caps: Capabilities) -> Vec<TrackId> {
        registry
            .admit(PendingAdmission {
                key: AdmissionKey::from(format!("key-{peer}")),
                peer_id: PeerId::from(peer),
                metadata: Value::Null,
                track_metadata: Value::Null,
                capabilities: caps,
                deadline: Instant::now(),
            })
            .unwrap()
            .tracks
            .clone()
    }

    fn caps(audio: bool, video: bool, receive: bool) -> Capabilities {
        Capabilities {
            relay_audio: audio,
            relay_video: video,
            receive_media: receive,
        }
    }

    fn discover(
        registry: &mut SessionRegistry,
        topology: &mut Topology,
        owner: &str,
        track_id: &TrackId,
        encoding: &str,
    ) {
        let owner = PeerId::from(owner);
        registry
            .record_encoding(track_id, &owner, Encoding::from(encoding))
            .unwrap();
        topology.open_fan_out(track_id.clone(), owner, Encoding::from(encoding));
    }

    /// Edge set required by the registry, computed independently of `reconcile`.
    fn expected_edges(registry: &SessionRegistry) -> Vec<ForwardingEdge> {
        let mut edges = Vec::new();
        for track in registry.routable_tracks() {
            for peer in registry.receivers() {
                if peer != &track.owner {
                    edges.push(ForwardingEdge {
                        track_id: track.track_id.clone(),
                        consumer: peer.clone(),
                    });
                }
            }
        }
        edges.sort();
        edges
    }

    #[tokio::test]
    async fn test_publisher_to_receiver_edge() {
        let mut registry = SessionRegistry::new();
        let mut topology = Topology::new();

        let a_tracks = admit(&mut registry, "a", caps(false, true, false));
        admit(&mut registry, "b", caps(false, false, true));

        discover(&mut registry, &mut topology, "a", &a_tracks[0], "VP8");
        let ops = topology.reconcile(&registry);

        assert_eq!(
            ops,
            vec![EdgeOp::Add {
                track_id: a_tracks[0].clone(),
                owner: PeerId::from("a"),
                consumer: PeerId::from("b"),
                encoding: Encoding::from("VP8"),
            }]
        );
        assert_eq!(topology.edges(), expected_edges(&registry));
    }

    #[tokio::test]
    async fn test_reconcile_twice_is_noop() {
        let mut registry = SessionRegistry::new();
        let mut topology = Topology::new();
        let a_tracks = admit(&mut registry, "a", caps(true, true, true));
        admit(&mut registry, "b", caps(false, false, true));
        discover(&mut registry, &mut topology, "a", &a_tracks[0], "OPUS");

        assert_eq!(topology.reconcile(&registry).len(), 1);
        assert!(topology.reconcile(&registry).is_empty());
    }

    #[tokio::test]
    async fn test_owner_never_consumes_own_track() {
        let mut registry = SessionRegistry::new();
        let mut topology = Topology::new();
        let a_tracks = admit(&mut registry, "a", caps(true, false, true));
        discover(&mut registry, &mut topology, "a", &a_tracks[0], "OPUS");

        assert!(topology.reconcile(&registry).is_empty());
        assert_eq!(topology.edge_count(), 0);
    }

    #[tokio::test]
    async fn test_open_fan_out_is_idempotent() {
        let mut topology = Topology::new();
        let track = TrackId::from("t1");
        assert!(topology.open_fan_out(track.clone(), PeerId::from("a"), Encoding::from("VP8")));
        assert!(!topology.open_fan_out(track, PeerId::from("a"), Encoding::from("VP8")));
        assert_eq!(topology.fan_out_count(), 1);
    }

    #[tokio::test]
    async fn test_removed_consumer_edges_are_dropped() {
        let mut registry = SessionRegistry::new();
        let mut topology = Topology::new();
        let a_tracks = admit(&mut registry, "a", caps(true, true, false));
        admit(&mut registry, "b", caps(false, false, true));
        admit(&mut registry, "c", caps(false, false, true));
        for (track, enc) in a_tracks.iter().zip(["OPUS", "H264"]) {
            discover(&mut registry, &mut topology, "a", track, enc);
        }
        assert_eq!(topology.reconcile(&registry).len(), 4);

        registry.remove_peer(&PeerId::from("b"));
        let ops = topology.reconcile(&registry);
        assert_eq!(ops.len(), 2);
        assert!(ops.iter().all(|op| matches!(
            op,
            EdgeOp::Remove { consumer, .. } if consumer.as_str() == "b"
        )));
        assert_eq!(topology.edges(), expected_edges(&registry));
    }

    #[tokio::test]
    async fn test_owner_removal_closes_fan_outs() {
        let mut registry = SessionRegistry::new();
        let mut topology = Topology::new();
        let a_tracks = admit(&mut registry, "a", caps(false, true, false));
        admit(&mut registry, "b", caps(false, false, true));
        discover(&mut registry, &mut topology, "a", &a_tracks[0], "VP8");
        topology.reconcile(&registry);

        registry.remove_peer(&PeerId::from("a"));
        let closed = topology.close_fan_outs_owned_by(&PeerId::from("a"));
        assert_eq!(closed, a_tracks);
        assert!(topology.reconcile(&registry).is_empty());
        assert!(topology.edges().is_empty());
    }

    #[tokio::test]
    async fn test_late_receiver_gets_existing_tracks() {
        let mut registry = SessionRegistry::new();
        let mut topology = Topology::new();
        let a_tracks = admit(&mut registry, "a", caps(true, true, false));
        for (track, enc) in a_tracks.iter().zip(["OPUS", "VP8"]) {
            discover(&mut registry, &mut topology, "a", track, enc);
        }
        assert!(topology.reconcile(&registry).is_empty());

        admit(&mut registry, "late", caps(false, false, true));
        let ops = topology.reconcile(&registry);
        assert_eq!(ops.len(), 2);
        assert_eq!(topology.edges(), expected_edges(&registry));
    }

    #[tokio::test]
    async fn test_edges_match_formula_across_mixed_sequence() {
        let mut registry = SessionRegistry::new();
        let mut topology = Topology::new();
        let profiles = [
            ("p0", caps(true, true, true)),
            ("p1", caps(false, true, false)),
            ("p2", caps(true, false, true)),
            ("p3", caps(false, false, true)),
            ("p4", caps(true, true, false)),
        ];

        for (i, (peer, c)) in profiles.iter().enumerate() {
            let tracks = admit(&mut registry, peer, *c);
            // Only discover the first track of every other peer.
            if i % 2 == 0 {
                if let Some(track) = tracks.first() {
                    discover(&mut registry, &mut topology, peer, track, "OPUS");
                }
            }
            topology.reconcile(&registry);
            assert_eq!(topology.edges(), expected_edges(&registry));
        }

        for peer in ["p2", "p3"] {
            let owner = PeerId::from(peer);
            registry.remove_peer(&owner);
            topology.close_fan_outs_owned_by(&owner);
            topology.reconcile(&registry);
            assert_eq!(topology.edges(), expected_edges(&registry));
        }
    }
}
