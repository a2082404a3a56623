//! A started SFU with an accepting authority and recording endpoints.
//!
//! Wraps the usual test setup so scenario tests read as a sequence of joins, leaves,
//! and assertions.

use crate::fixtures::{
    candidate, next_admission_result, start_service_with, JoinBuilder, TestConfig,
};
use crate::mock_authority::MockAuthority;
use crate::mock_endpoint::{MockEndpointFactory, RecordedCommand};

use sfu_controller::actors::{EngineState, PeerSignal};
use sfu_controller::signaling::OutboundEvent;
use sfu_controller::topology::ForwardingEdge;
use sfu_controller::types::{AdmissionKey, PeerId, TrackId};
use sfu_controller::{Config, SfuService};
use std::collections::BTreeSet;
use tokio::sync::mpsc;

/// A peer admitted through [`TestConference::admit`].
#[derive(Debug, Clone)]
pub struct AdmittedPeer {
    pub peer_id: PeerId,
    pub key: AdmissionKey,
    /// Tracks reported as discovered right after admission.
    pub tracks: Vec<TrackId>,
}

pub struct TestConference {
    pub service: SfuService,
    pub outbound: mpsc::Receiver<OutboundEvent>,
    pub factory: MockEndpointFactory,
    _authority: MockAuthority,
}

impl TestConference {
    #[must_use]
    pub fn start() -> Self {
        Self::start_with(&TestConfig::new().build(), MockEndpointFactory::new())
    }

    #[must_use]
    pub fn start_with(config: &Config, factory: MockEndpointFactory) -> Self {
        let (service, outbound) = start_service_with(config, factory.clone());
        let authority = MockAuthority::accept_all(service.dispatcher(), service.handle());
        Self {
            service,
            outbound,
            factory,
            _authority: authority,
        }
    }

    /// Join, wait for `peer_accepted`, and report every published track as discovered.
    ///
    /// # Panics
    ///
    /// Panics if the join is not accepted.
    pub async fn admit(
        &mut self,
        peer: &str,
        configure: impl FnOnce(JoinBuilder) -> JoinBuilder,
    ) -> AdmittedPeer {
        let key = self.service.issue_admission_key().unwrap();
        let join = configure(JoinBuilder::new(&key, peer)).build();
        self.service.handle().signaling(join).await.unwrap();

        let event = next_admission_result(&mut self.outbound).await;
        let OutboundEvent::PeerAccepted { peer_id, .. } = event else {
            panic!("expected peer_accepted for {peer}, got {event:?}");
        };
        let tracks = self.factory.publish_all(&peer_id).await;
        AdmittedPeer {
            peer_id,
            key,
            tracks,
        }
    }

    pub async fn state(&self) -> EngineState {
        self.service.handle().get_state().await.unwrap()
    }

    /// Wait until the peer's endpoint has processed every command sent before this call.
    ///
    /// Sends a marker candidate through the engine and waits for it to be recorded.
    pub async fn sync_endpoint(&self, peer: &AdmittedPeer, marker: &str) {
        self.service
            .handle()
            .signaling(candidate(&peer.key, marker))
            .await
            .unwrap();
        let expected = RecordedCommand::Signal(PeerSignal::Candidate(marker.to_string()));
        self.factory
            .wait_until(|f| f.commands(&peer.peer_id).contains(&expected))
            .await;
    }
}

/// The edge set the engine state should have:
/// `{(t, p) : t routable, p admitted, p != owner(t), p receives media}`.
#[must_use]
pub fn expected_edges(state: &EngineState) -> BTreeSet<ForwardingEdge> {
    let receivers: Vec<&PeerId> = state
        .peers
        .iter()
        .filter(|p| p.capabilities.receive_media)
        .map(|p| &p.peer_id)
        .collect();

    state
        .tracks
        .iter()
        .filter(|t| t.is_routable())
        .flat_map(|t| {
            receivers
                .iter()
                .filter(move |p| ***p != t.owner)
                .map(move |p| ForwardingEdge {
                    track_id: t.track_id.clone(),
                    consumer: (*p).clone(),
                })
        })
        .collect()
}

#[must_use]
pub fn actual_edges(state: &EngineState) -> BTreeSet<ForwardingEdge> {
    state.forwarding_edges.iter().cloned().collect()
}
