//! Recording Media Endpoint factory.
//!
//! Every endpoint the factory creates appends the commands it receives to a shared log,
//! keyed by peer id. Tests read the log to see what the engine told each peer, and use
//! the captured [`EndpointNotifier`]s to play the media layer (track discovery, signals,
//! voice activity).
//!
//! # Example
//!
//! ```rust,ignore
//! use sfu_test_utils::MockEndpointFactory;
//!
//! let factory = MockEndpointFactory::new()
//!     .fail_creation_for("bob")
//!     .panic_on_withdraw_for("carol");
//!
//! // After admitting alice:
//! factory.publish_all(&"alice".into()).await;
//! factory.wait_until(|f| f.forwarded_to(&"dave".into()).len() == 2).await;
//! ```

use async_trait::async_trait;
use sfu_controller::actors::{
    EndpointFactory, EndpointNotifier, EndpointSpec, MediaEndpoint, PeerSignal, TrackDeclaration,
};
use sfu_controller::types::{Encoding, Medium, PeerId, TrackId};
use sfu_controller::SfuError;
use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// How long [`MockEndpointFactory::wait_until`] polls before failing the test.
pub const WAIT_TIMEOUT: Duration = Duration::from_secs(5);

/// One command an endpoint received.
#[derive(Debug, Clone, PartialEq)]
pub enum RecordedCommand {
    OpenFanOut { track_id: TrackId, encoding: Encoding },
    Forward { track: TrackDeclaration },
    Withdraw { track_ids: Vec<TrackId> },
    Signal(PeerSignal),
    Close,
}

#[derive(Default)]
struct Inner {
    commands: Mutex<HashMap<PeerId, Vec<RecordedCommand>>>,
    notifiers: Mutex<HashMap<PeerId, EndpointNotifier>>,
    specs: Mutex<HashMap<PeerId, EndpointSpec>>,
    created: Mutex<Vec<PeerId>>,
    fail_creation: Mutex<HashSet<PeerId>>,
    fail_on_signal: Mutex<HashSet<PeerId>>,
    panic_on_withdraw: Mutex<HashSet<PeerId>>,
}

/// Factory for recording endpoints. Cheap to clone; clones share the same log.
#[derive(Clone, Default)]
pub struct MockEndpointFactory {
    inner: Arc<Inner>,
}

impl MockEndpointFactory {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Make endpoint creation fail for this peer.
    #[must_use]
    pub fn fail_creation_for(self, peer_id: impl Into<PeerId>) -> Self {
        self.inner.fail_creation.lock().unwrap().insert(peer_id.into());
        self
    }

    /// Make this peer's endpoint return a driver error on its first signal.
    #[must_use]
    pub fn fail_on_signal_for(self, peer_id: impl Into<PeerId>) -> Self {
        self.inner.fail_on_signal.lock().unwrap().insert(peer_id.into());
        self
    }

    /// Make this peer's endpoint panic when tracks are withdrawn from it.
    #[must_use]
    pub fn panic_on_withdraw_for(self, peer_id: impl Into<PeerId>) -> Self {
        self.inner
            .panic_on_withdraw
            .lock()
            .unwrap()
            .insert(peer_id.into());
        self
    }

    /// The factory as the engine expects it.
    #[must_use]
    pub fn as_factory(&self) -> Arc<dyn EndpointFactory> {
        Arc::new(self.clone())
    }

    /// Commands received by this peer's endpoints, in order.
    #[must_use]
    pub fn commands(&self, peer_id: &PeerId) -> Vec<RecordedCommand> {
        self.inner
            .commands
            .lock()
            .unwrap()
            .get(peer_id)
            .cloned()
            .unwrap_or_default()
    }

    /// Tracks currently forwarded to this peer: every `Forward` not later withdrawn.
    #[must_use]
    pub fn forwarded_to(&self, peer_id: &PeerId) -> BTreeSet<TrackId> {
        let mut current = BTreeSet::new();
        for command in self.commands(peer_id) {
            match command {
                RecordedCommand::Forward { track } => {
                    current.insert(track.track_id);
                }
                RecordedCommand::Withdraw { track_ids } => {
                    for track_id in track_ids {
                        current.remove(&track_id);
                    }
                }
                _ => {}
            }
        }
        current
    }

    /// Number of `Forward` commands this peer received for `track_id`.
    #[must_use]
    pub fn forward_count(&self, peer_id: &PeerId, track_id: &TrackId) -> usize {
        self.commands(peer_id)
            .iter()
            .filter(|c| {
                matches!(c, RecordedCommand::Forward { track } if &track.track_id == track_id)
            })
            .count()
    }

    /// Every track id this peer was told to withdraw, in order.
    #[must_use]
    pub fn withdrawn_from(&self, peer_id: &PeerId) -> Vec<TrackId> {
        self.commands(peer_id)
            .into_iter()
            .filter_map(|c| match c {
                RecordedCommand::Withdraw { track_ids } => Some(track_ids),
                _ => None,
            })
            .flatten()
            .collect()
    }

    #[must_use]
    pub fn was_closed(&self, peer_id: &PeerId) -> bool {
        self.commands(peer_id).contains(&RecordedCommand::Close)
    }

    /// Notifier of the most recent endpoint created for this peer.
    #[must_use]
    pub fn notifier(&self, peer_id: &PeerId) -> Option<EndpointNotifier> {
        self.inner.notifiers.lock().unwrap().get(peer_id).cloned()
    }

    /// Spec of the most recent endpoint created for this peer.
    #[must_use]
    pub fn spec(&self, peer_id: &PeerId) -> Option<EndpointSpec> {
        self.inner.specs.lock().unwrap().get(peer_id).cloned()
    }

    /// Peers an endpoint was created for, in creation order (repeats on re-admission).
    #[must_use]
    pub fn created(&self) -> Vec<PeerId> {
        self.inner.created.lock().unwrap().clone()
    }

    /// Report every inbound placeholder of the peer as discovered, with a default
    /// encoding per medium (`OPUS` for audio, `H264` for video). Returns the track ids.
    ///
    /// # Panics
    ///
    /// Panics if no endpoint was created for the peer.
    pub async fn publish_all(&self, peer_id: &PeerId) -> Vec<TrackId> {
        let spec = self
            .spec(peer_id)
            .unwrap_or_else(|| panic!("no endpoint created for {peer_id}"));
        let notifier = self.notifier(peer_id).unwrap();

        let mut published = Vec::new();
        for track in spec.inbound {
            let encoding = match track.medium {
                Medium::Audio => Encoding::from("OPUS"),
                Medium::Video => Encoding::from("H264"),
            };
            notifier
                .new_track(track.track_id.clone(), encoding)
                .await
                .unwrap();
            published.push(track.track_id);
        }
        published
    }

    /// Poll until `condition` holds.
    ///
    /// # Panics
    ///
    /// Panics if the condition does not hold within [`WAIT_TIMEOUT`].
    pub async fn wait_until(&self, condition: impl Fn(&Self) -> bool) {
        let deadline = tokio::time::Instant::now() + WAIT_TIMEOUT;
        while !condition(self) {
            assert!(
                tokio::time::Instant::now() < deadline,
                "condition not reached within {WAIT_TIMEOUT:?}"
            );
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }

    fn contains(set: &Mutex<HashSet<PeerId>>, peer_id: &PeerId) -> bool {
        set.lock().unwrap().contains(peer_id)
    }
}

impl EndpointFactory for MockEndpointFactory {
    fn create(
        &self,
        spec: EndpointSpec,
        notifier: EndpointNotifier,
    ) -> Result<Box<dyn MediaEndpoint>, SfuError> {
        let peer_id = spec.peer_id.clone();
        if Self::contains(&self.inner.fail_creation, &peer_id) {
            return Err(SfuError::Endpoint(format!(
                "mock endpoint creation refused for {peer_id}"
            )));
        }

        self.inner.created.lock().unwrap().push(peer_id.clone());
        self.inner
            .notifiers
            .lock()
            .unwrap()
            .insert(peer_id.clone(), notifier);
        self.inner
            .specs
            .lock()
            .unwrap()
            .insert(peer_id.clone(), spec);

        Ok(Box::new(MockEndpoint {
            fail_on_signal: Self::contains(&self.inner.fail_on_signal, &peer_id),
            panic_on_withdraw: Self::contains(&self.inner.panic_on_withdraw, &peer_id),
            peer_id,
            inner: Arc::clone(&self.inner),
        }))
    }
}

struct MockEndpoint {
    peer_id: PeerId,
    inner: Arc<Inner>,
    fail_on_signal: bool,
    panic_on_withdraw: bool,
}

impl MockEndpoint {
    fn record(&self, command: RecordedCommand) {
        self.inner
            .commands
            .lock()
            .unwrap()
            .entry(self.peer_id.clone())
            .or_default()
            .push(command);
    }
}

#[async_trait]
impl MediaEndpoint for MockEndpoint {
    async fn open_fan_out(
        &mut self,
        track_id: &TrackId,
        encoding: &Encoding,
    ) -> Result<(), SfuError> {
        self.record(RecordedCommand::OpenFanOut {
            track_id: track_id.clone(),
            encoding: encoding.clone(),
        });
        Ok(())
    }

    async fn forward_track(&mut self, track: &TrackDeclaration) -> Result<(), SfuError> {
        self.record(RecordedCommand::Forward {
            track: track.clone(),
        });
        Ok(())
    }

    async fn withdraw_tracks(&mut self, track_ids: &[TrackId]) -> Result<(), SfuError> {
        assert!(
            !self.panic_on_withdraw,
            "mock endpoint for {} panicking on withdraw",
            self.peer_id
        );
        self.record(RecordedCommand::Withdraw {
            track_ids: track_ids.to_vec(),
        });
        Ok(())
    }

    async fn apply_signal(&mut self, signal: PeerSignal) -> Result<(), SfuError> {
        self.record(RecordedCommand::Signal(signal));
        if self.fail_on_signal {
            return Err(SfuError::Endpoint("mock transport failure".to_string()));
        }
        Ok(())
    }

    async fn close(&mut self) -> Result<(), SfuError> {
        self.record(RecordedCommand::Close);
        Ok(())
    }
}
