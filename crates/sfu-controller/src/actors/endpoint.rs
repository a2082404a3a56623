//! `EndpointActor` - per-peer media endpoint actor.
//!
//! Each admitted peer gets one Media Endpoint, created through the [`EndpointFactory`]
//! and driven by its own `EndpointActor` task. That task, together with the fan-out
//! points and discard sinks the endpoint owns, is the peer's failure-isolation unit:
//!
//! - A driver error or panic ends only this actor
//! - A watcher task reports the exit to the engine as `EndpointEvent::Exited`
//! - Cancellation arrives through a child token of the engine's token
//!
//! The endpoint talks back to the engine only through its [`EndpointNotifier`].

use crate::errors::SfuError;
use crate::registry::TrackEntry;
use crate::types::{Encoding, Medium, PeerId, StreamId, TrackId, VoiceActivity};

use super::messages::{EndpointCommand, EndpointEvent, EngineMessage, PeerSignal};
use super::metrics::{ActorMetrics, ActorType, MailboxMonitor};

use async_trait::async_trait;
use serde::Serialize;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

/// A track as declared to a Media Endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TrackDeclaration {
    pub track_id: TrackId,
    pub stream_id: StreamId,
    pub medium: Medium,
    /// `None` for inbound placeholders whose encoding is not known yet.
    pub encoding: Option<Encoding>,
    pub owner: PeerId,
}

impl From<&TrackEntry> for TrackDeclaration {
    fn from(track: &TrackEntry) -> Self {
        Self {
            track_id: track.track_id.clone(),
            stream_id: track.stream_id.clone(),
            medium: track.medium,
            encoding: track.encoding.clone(),
            owner: track.owner.clone(),
        }
    }
}

/// What a new Media Endpoint is created with.
#[derive(Debug, Clone)]
pub struct EndpointSpec {
    pub peer_id: PeerId,
    /// Placeholders for the tracks the peer will publish.
    pub inbound: Vec<TrackDeclaration>,
    /// Routable tracks of other peers at creation time. Empty unless the peer receives media.
    /// Each one is also wired with a `forward_track` call once the actor runs.
    pub outbound: Vec<TrackDeclaration>,
}

/// Per-peer transport/session object implemented by the media layer.
#[async_trait]
pub trait MediaEndpoint: Send {
    /// Create the fan-out point for one of this peer's tracks, with a discard sink on its
    /// primary output.
    async fn open_fan_out(&mut self, track_id: &TrackId, encoding: &Encoding)
        -> Result<(), SfuError>;

    /// Deliver another peer's track to this peer.
    async fn forward_track(&mut self, track: &TrackDeclaration) -> Result<(), SfuError>;

    /// Stop delivering the given tracks to this peer.
    async fn withdraw_tracks(&mut self, track_ids: &[TrackId]) -> Result<(), SfuError>;

    /// Apply an SDP answer or ICE candidate from the peer.
    async fn apply_signal(&mut self, signal: PeerSignal) -> Result<(), SfuError>;

    /// Tear down the endpoint and every fan-out/discard structure it owns.
    async fn close(&mut self) -> Result<(), SfuError>;
}

/// Creates Media Endpoints for admitted peers.
pub trait EndpointFactory: Send + Sync {
    /// Instantiate the endpoint for one peer.
    ///
    /// # Errors
    ///
    /// An error leaves the peer without an endpoint; the engine removes the peer again.
    fn create(
        &self,
        spec: EndpointSpec,
        notifier: EndpointNotifier,
    ) -> Result<Box<dyn MediaEndpoint>, SfuError>;
}

/// The endpoint's way back into the engine.
#[derive(Clone, Debug)]
pub struct EndpointNotifier {
    peer_id: PeerId,
    instance: u64,
    sender: mpsc::Sender<EngineMessage>,
}

impl EndpointNotifier {
    #[must_use]
    pub fn new(peer_id: PeerId, instance: u64, sender: mpsc::Sender<EngineMessage>) -> Self {
        Self {
            peer_id,
            instance,
            sender,
        }
    }

    #[must_use]
    pub fn peer_id(&self) -> &PeerId {
        &self.peer_id
    }

    /// Report that one of the peer's tracks arrived with the given encoding.
    pub async fn new_track(&self, track_id: TrackId, encoding: Encoding) -> Result<(), SfuError> {
        self.send(EndpointEvent::NewTrack {
            peer_id: self.peer_id.clone(),
            instance: self.instance,
            track_id,
            encoding,
        })
        .await
    }

    /// Relay a payload (offer, locally gathered candidate, ...) to the peer.
    pub async fn signal(&self, payload: Value) -> Result<(), SfuError> {
        self.send(EndpointEvent::Signal {
            peer_id: self.peer_id.clone(),
            instance: self.instance,
            payload,
        })
        .await
    }

    pub async fn voice_activity(&self, activity: VoiceActivity) -> Result<(), SfuError> {
        self.send(EndpointEvent::VoiceActivity {
            peer_id: self.peer_id.clone(),
            instance: self.instance,
            activity,
        })
        .await
    }

    async fn exited(&self, panicked: bool) -> Result<(), SfuError> {
        self.send(EndpointEvent::Exited {
            peer_id: self.peer_id.clone(),
            instance: self.instance,
            panicked,
        })
        .await
    }

    async fn send(&self, event: EndpointEvent) -> Result<(), SfuError> {
        self.sender
            .send(EngineMessage::Endpoint(event))
            .await
            .map_err(|e| SfuError::Internal(format!("channel send failed: {e}")))
    }
}

/// Handle to an `EndpointActor`.
#[derive(Clone, Debug)]
pub struct EndpointActorHandle {
    // Unbounded so the engine never waits on a peer's endpoint.
    sender: mpsc::UnboundedSender<EndpointCommand>,
    cancel_token: CancellationToken,
    /// Cancelled by the watcher once the actor task has ended.
    finished: CancellationToken,
    peer_id: PeerId,
    instance: u64,
}

impl EndpointActorHandle {
    #[must_use]
    pub fn peer_id(&self) -> &PeerId {
        &self.peer_id
    }

    #[must_use]
    pub fn instance(&self) -> u64 {
        self.instance
    }

    /// Queue a command for the endpoint.
    pub fn send(&self, command: EndpointCommand) -> Result<(), SfuError> {
        self.sender
            .send(command)
            .map_err(|e| SfuError::Endpoint(format!("endpoint actor gone: {e}")))
    }

    /// Cancel the endpoint actor. The endpoint is closed before the task ends.
    pub fn cancel(&self) {
        self.cancel_token.cancel();
    }

    /// True once termination has been requested.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.cancel_token.is_cancelled()
    }

    #[must_use]
    pub fn is_finished(&self) -> bool {
        self.finished.is_cancelled()
    }

    /// Wait for the actor task to end. Returns false on timeout.
    pub async fn wait_finished(&self, timeout: Duration) -> bool {
        tokio::time::timeout(timeout, self.finished.cancelled())
            .await
            .is_ok()
    }
}

/// The `EndpointActor` implementation.
pub struct EndpointActor {
    peer_id: PeerId,
    instance: u64,
    endpoint: Box<dyn MediaEndpoint>,
    receiver: mpsc::UnboundedReceiver<EndpointCommand>,
    cancel_token: CancellationToken,
    metrics: Arc<ActorMetrics>,
    mailbox: MailboxMonitor,
}

impl EndpointActor {
    /// Spawn the actor and its watcher.
    ///
    /// The watcher awaits the actor task and reports how it ended through `notifier`.
    pub fn spawn(
        endpoint: Box<dyn MediaEndpoint>,
        notifier: EndpointNotifier,
        cancel_token: CancellationToken,
        metrics: Arc<ActorMetrics>,
    ) -> EndpointActorHandle {
        let (sender, receiver) = mpsc::unbounded_channel();
        let peer_id = notifier.peer_id.clone();
        let instance = notifier.instance;
        let finished = CancellationToken::new();

        let actor = Self {
            peer_id: peer_id.clone(),
            instance,
            endpoint,
            receiver,
            cancel_token: cancel_token.clone(),
            metrics: Arc::clone(&metrics),
            mailbox: MailboxMonitor::new(ActorType::Endpoint, peer_id.as_str()),
        };

        metrics.endpoint_started();
        let task_handle = tokio::spawn(actor.run());

        let done = finished.clone();
        tokio::spawn(async move {
            let panicked = match task_handle.await {
                Ok(()) => false,
                Err(join_error) => {
                    if join_error.is_panic() {
                        metrics.record_panic(ActorType::Endpoint);
                    }
                    join_error.is_panic()
                }
            };
            metrics.endpoint_stopped();
            done.cancel();

            if let Err(e) = notifier.exited(panicked).await {
                debug!(
                    target: "sfu.actor.endpoint",
                    peer_id = %notifier.peer_id,
                    error = %e,
                    "Engine gone before endpoint exit was reported"
                );
            }
        });

        EndpointActorHandle {
            sender,
            cancel_token,
            finished,
            peer_id,
            instance,
        }
    }

    #[instrument(
        skip_all,
        name = "sfu.actor.endpoint",
        fields(peer_id = %self.peer_id, instance = self.instance)
    )]
    async fn run(mut self) {
        debug!(
            target: "sfu.actor.endpoint",
            peer_id = %self.peer_id,
            instance = self.instance,
            "EndpointActor started"
        );

        loop {
            tokio::select! {
                () = self.cancel_token.cancelled() => {
                    debug!(
                        target: "sfu.actor.endpoint",
                        peer_id = %self.peer_id,
                        "EndpointActor received cancellation signal"
                    );
                    self.close().await;
                    break;
                }

                msg = self.receiver.recv() => {
                    let Some(command) = msg else {
                        debug!(
                            target: "sfu.actor.endpoint",
                            peer_id = %self.peer_id,
                            "EndpointActor channel closed, exiting"
                        );
                        self.close().await;
                        break;
                    };

                    let kind = command_kind(&command);
                    let result = self.execute(command).await;
                    self.mailbox.record_dequeue(self.receiver.len());
                    self.metrics.record_message_processed();

                    if let Err(e) = result {
                        error!(
                            target: "sfu.actor.endpoint",
                            peer_id = %self.peer_id,
                            command = kind,
                            error = %e,
                            "Media endpoint command failed, stopping endpoint"
                        );
                        crate::observability::metrics::record_endpoint_failure("driver_error");
                        self.close().await;
                        break;
                    }
                }
            }
        }

        info!(
            target: "sfu.actor.endpoint",
            peer_id = %self.peer_id,
            instance = self.instance,
            messages_processed = self.mailbox.messages_processed(),
            "EndpointActor stopped"
        );
    }

    async fn execute(&mut self, command: EndpointCommand) -> Result<(), SfuError> {
        match command {
            EndpointCommand::OpenFanOut { track_id, encoding } => {
                self.endpoint.open_fan_out(&track_id, &encoding).await
            }
            EndpointCommand::ForwardTrack { track } => self.endpoint.forward_track(&track).await,
            EndpointCommand::WithdrawTracks { track_ids } => {
                self.endpoint.withdraw_tracks(&track_ids).await
            }
            EndpointCommand::ApplySignal { signal } => self.endpoint.apply_signal(signal).await,
        }
    }

    async fn close(&mut self) {
        if let Err(e) = self.endpoint.close().await {
            warn!(
                target: "sfu.actor.endpoint",
                peer_id = %self.peer_id,
                error = %e,
                "Media endpoint close failed"
            );
        }
    }
}

const fn command_kind(command: &EndpointCommand) -> &'static str {
    match command {
        EndpointCommand::OpenFanOut { .. } => "open_fan_out",
        EndpointCommand::ForwardTrack { .. } => "forward_track",
        EndpointCommand::WithdrawTracks { .. } => "withdraw_tracks",
        EndpointCommand::ApplySignal { .. } => "apply_signal",
    }
}
