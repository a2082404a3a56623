//! `SfuEngine` - the single owner of all session, track, and forwarding state.
//!
//! The engine processes, one at a time and in arrival order:
//!
//! - Signaling events from peers (join, answer, candidate, leave)
//! - Control messages from the surrounding process (accept/deny, forced removal, state)
//! - Notifications from media endpoints (new track, signal, voice activity, exit)
//!
//! # Admission
//!
//! A join never blocks the loop. It is parked in a pending table keyed by peer id and
//! a `new_peer` notification is published. The admission authority later calls
//! `accept_new_peer` / `deny_new_peer` through the handle, and a periodic sweep treats
//! joins that outlive the admission timeout as denied.
//!
//! # Forwarding
//!
//! Every mutation of peers or routable tracks ends with a call to
//! [`Topology::reconcile`], and the resulting edge operations become endpoint commands.

use crate::config::{Config, WithdrawalExclusion};
use crate::errors::SfuError;
use crate::notifications::{LeaveReason, Notification, NotificationDispatcher};
use crate::observability::metrics as prom;
use crate::registry::{ChildId, SessionRegistry};
use crate::signaling::{decode_event, OutboundEvent, SignalingEvent};
use crate::topology::{EdgeOp, Topology};
use crate::types::{AdmissionKey, Capabilities, Encoding, PeerId, TrackId};

use super::admission::{AdmissionKeyManager, PendingAdmission};
use super::endpoint::{
    EndpointActor, EndpointActorHandle, EndpointFactory, EndpointNotifier, EndpointSpec,
    TrackDeclaration,
};
use super::messages::{
    EndpointCommand, EndpointEvent, EngineMessage, EngineState, PeerSignal, PeerSnapshot,
    RemovalOutcome,
};
use super::metrics::{ActorMetrics, ActorType, MailboxMonitor};

use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

/// Default channel buffer size for the engine mailbox.
const ENGINE_CHANNEL_BUFFER: usize = 1000;

/// How often pending admissions are checked against their deadline.
const ADMISSION_SWEEP_INTERVAL: Duration = Duration::from_secs(1);

/// Engine settings, usually taken from [`Config`].
#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub sfu_id: String,
    pub admission_timeout: Duration,
    pub endpoint_shutdown_timeout: Duration,
    pub withdrawal_exclusion: WithdrawalExclusion,
}

impl From<&Config> for EngineConfig {
    fn from(config: &Config) -> Self {
        Self {
            sfu_id: config.sfu_id.clone(),
            admission_timeout: config.admission_timeout,
            endpoint_shutdown_timeout: config.endpoint_shutdown_timeout,
            withdrawal_exclusion: config.withdrawal_exclusion,
        }
    }
}

/// Handle to the `SfuEngine`.
///
/// Cheap to clone. Every method is a message to the engine mailbox.
#[derive(Clone, Debug)]
pub struct SfuEngineHandle {
    sender: mpsc::Sender<EngineMessage>,
    cancel_token: CancellationToken,
    sfu_id: String,
}

impl SfuEngineHandle {
    #[must_use]
    pub fn sfu_id(&self) -> &str {
        &self.sfu_id
    }

    /// Submit a decoded signaling event.
    pub async fn signaling(&self, event: SignalingEvent) -> Result<(), SfuError> {
        self.send(EngineMessage::Signaling { event }).await
    }

    /// Submit a raw signaling frame. Frames that fail to decode are logged and dropped.
    pub async fn signaling_frame(&self, frame: Vec<u8>) -> Result<(), SfuError> {
        self.send(EngineMessage::SignalingFrame { frame }).await
    }

    /// Accept every pending join of `peer_id`.
    ///
    /// Returns `SfuError::PeerNotFound` if no join is pending for that peer id.
    pub async fn accept_new_peer(&self, peer_id: PeerId) -> Result<(), SfuError> {
        let (tx, rx) = oneshot::channel();
        self.send(EngineMessage::AcceptPeer {
            peer_id,
            respond_to: tx,
        })
        .await?;

        rx.await
            .map_err(|e| SfuError::Internal(format!("response receive failed: {e}")))?
    }

    /// Deny every pending join of `peer_id`.
    pub async fn deny_new_peer(&self, peer_id: PeerId) -> Result<(), SfuError> {
        let (tx, rx) = oneshot::channel();
        self.send(EngineMessage::DenyPeer {
            peer_id,
            respond_to: tx,
        })
        .await?;

        rx.await
            .map_err(|e| SfuError::Internal(format!("response receive failed: {e}")))?
    }

    /// Remove an admitted peer. Removing an absent peer is not an error.
    pub async fn remove_peer(&self, peer_id: PeerId) -> Result<RemovalOutcome, SfuError> {
        let (tx, rx) = oneshot::channel();
        self.send(EngineMessage::RemovePeer {
            peer_id,
            respond_to: tx,
        })
        .await?;

        rx.await
            .map_err(|e| SfuError::Internal(format!("response receive failed: {e}")))
    }

    /// Mark the peer whose screen share is active, or clear it with `None`.
    pub async fn set_screen_share_source(&self, peer_id: Option<PeerId>) -> Result<(), SfuError> {
        self.send(EngineMessage::SetScreenShareSource { peer_id }).await
    }

    pub async fn get_state(&self) -> Result<EngineState, SfuError> {
        let (tx, rx) = oneshot::channel();
        self.send(EngineMessage::GetState { respond_to: tx }).await?;

        rx.await
            .map_err(|e| SfuError::Internal(format!("response receive failed: {e}")))
    }

    /// Remove every peer, close every endpoint, and stop the engine.
    pub async fn shutdown(&self) -> Result<(), SfuError> {
        let (tx, rx) = oneshot::channel();
        self.send(EngineMessage::Shutdown { respond_to: tx })
            .await?;

        rx.await
            .map_err(|e| SfuError::Internal(format!("response receive failed: {e}")))
    }

    /// Cancel the engine (and, through child tokens, every endpoint actor).
    pub fn cancel(&self) {
        self.cancel_token.cancel();
    }

    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.cancel_token.is_cancelled()
    }

    async fn send(&self, message: EngineMessage) -> Result<(), SfuError> {
        self.sender
            .send(message)
            .await
            .map_err(|e| SfuError::Internal(format!("channel send failed: {e}")))
    }
}

/// The `SfuEngine` implementation.
pub struct SfuEngine {
    config: EngineConfig,
    key_manager: Arc<AdmissionKeyManager>,
    dispatcher: NotificationDispatcher,
    factory: Arc<dyn EndpointFactory>,
    outbound: mpsc::Sender<OutboundEvent>,
    receiver: mpsc::Receiver<EngineMessage>,
    /// Given to endpoint notifiers.
    sender: mpsc::Sender<EngineMessage>,
    cancel_token: CancellationToken,
    metrics: Arc<ActorMetrics>,
    mailbox: MailboxMonitor,

    registry: SessionRegistry,
    topology: Topology,
    /// Joins waiting for the admission authority, by peer id.
    pending: HashMap<PeerId, Vec<PendingAdmission>>,
    /// Live endpoint actors, by peer id.
    endpoints: HashMap<PeerId, EndpointActorHandle>,
    next_instance: u64,
    screen_share_source: Option<PeerId>,
    is_shutting_down: bool,
}

impl SfuEngine {
    /// Spawn the engine.
    ///
    /// Outbound events for the signaling codec are sent on `outbound`.
    pub fn spawn(
        config: EngineConfig,
        key_manager: Arc<AdmissionKeyManager>,
        dispatcher: NotificationDispatcher,
        factory: Arc<dyn EndpointFactory>,
        outbound: mpsc::Sender<OutboundEvent>,
        cancel_token: CancellationToken,
    ) -> (SfuEngineHandle, JoinHandle<()>) {
        let (sender, receiver) = mpsc::channel(ENGINE_CHANNEL_BUFFER);
        let sfu_id = config.sfu_id.clone();

        let actor = Self {
            mailbox: MailboxMonitor::new(ActorType::Engine, &sfu_id),
            config,
            key_manager,
            dispatcher,
            factory,
            outbound,
            receiver,
            sender: sender.clone(),
            cancel_token: cancel_token.clone(),
            metrics: ActorMetrics::new(),
            registry: SessionRegistry::new(),
            topology: Topology::new(),
            pending: HashMap::new(),
            endpoints: HashMap::new(),
            next_instance: 0,
            screen_share_source: None,
            is_shutting_down: false,
        };

        let task_handle = tokio::spawn(actor.run());

        let handle = SfuEngineHandle {
            sender,
            cancel_token,
            sfu_id,
        };

        (handle, task_handle)
    }

    #[instrument(skip_all, name = "sfu.actor.engine", fields(sfu_id = %self.config.sfu_id))]
    async fn run(mut self) {
        info!(
            target: "sfu.actor.engine",
            sfu_id = %self.config.sfu_id,
            "SfuEngine started"
        );

        let mut admission_check = tokio::time::interval(ADMISSION_SWEEP_INTERVAL);

        loop {
            tokio::select! {
                () = self.cancel_token.cancelled() => {
                    info!(
                        target: "sfu.actor.engine",
                        sfu_id = %self.config.sfu_id,
                        "SfuEngine received cancellation signal"
                    );
                    self.graceful_shutdown().await;
                    break;
                }

                _ = admission_check.tick() => {
                    self.expire_pending_admissions().await;
                }

                msg = self.receiver.recv() => {
                    // The engine holds a sender itself, so the channel never closes here.
                    let Some(message) = msg else { break };
                    let should_exit = self.handle_message(message).await;
                    self.mailbox.record_dequeue(self.receiver.len());
                    self.metrics.record_message_processed();

                    if should_exit {
                        break;
                    }
                }
            }
        }

        info!(
            target: "sfu.actor.engine",
            sfu_id = %self.config.sfu_id,
            messages_processed = self.mailbox.messages_processed(),
            "SfuEngine stopped"
        );
    }

    /// Handle a single message. Returns true if the engine should exit.
    async fn handle_message(&mut self, message: EngineMessage) -> bool {
        match message {
            EngineMessage::Signaling { event } => {
                self.handle_signaling(event).await;
            }

            EngineMessage::SignalingFrame { frame } => match decode_event(&frame) {
                Ok(event) => self.handle_signaling(event).await,
                Err(e) => {
                    warn!(
                        target: "sfu.actor.engine",
                        sfu_id = %self.config.sfu_id,
                        frame_len = frame.len(),
                        error = %e,
                        "Dropping undecodable signaling frame"
                    );
                    prom::record_signaling_event("undecodable");
                }
            },

            EngineMessage::AcceptPeer {
                peer_id,
                respond_to,
            } => {
                let result = self.handle_accept(peer_id).await;
                let _ = respond_to.send(result);
            }

            EngineMessage::DenyPeer {
                peer_id,
                respond_to,
            } => {
                let result = self.handle_deny(peer_id).await;
                let _ = respond_to.send(result);
            }

            EngineMessage::RemovePeer {
                peer_id,
                respond_to,
            } => {
                let outcome = self.remove_peer(&peer_id, LeaveReason::Removed);
                let _ = respond_to.send(outcome);
            }

            EngineMessage::SetScreenShareSource { peer_id } => {
                debug!(
                    target: "sfu.actor.engine",
                    peer_id = ?peer_id.as_ref().map(PeerId::as_str),
                    "Screen share source updated"
                );
                self.screen_share_source = peer_id;
            }

            EngineMessage::Endpoint(event) => {
                let start = std::time::Instant::now();
                let kind = event.kind();
                self.handle_endpoint_event(event).await;
                prom::record_event_latency(kind, start.elapsed());
            }

            EngineMessage::GetState { respond_to } => {
                let _ = respond_to.send(self.snapshot());
            }

            EngineMessage::Shutdown { respond_to } => {
                self.graceful_shutdown().await;
                let _ = respond_to.send(());
                return true;
            }
        }
        false
    }

    async fn handle_signaling(&mut self, event: SignalingEvent) {
        let start = std::time::Instant::now();
        let kind = event.kind();
        prom::record_signaling_event(kind);

        let result = match event {
            SignalingEvent::Join {
                key,
                peer_id,
                metadata,
                track_metadata,
                relay_audio,
                relay_video,
                receive_media,
            } => {
                let capabilities = Capabilities {
                    relay_audio,
                    relay_video,
                    receive_media,
                };
                self.handle_join(key, peer_id, metadata, track_metadata, capabilities)
                    .await
            }
            SignalingEvent::Answer {
                key,
                sdp_answer,
                mid_to_track_metadata,
            } => self.handle_answer(&key, sdp_answer, mid_to_track_metadata),
            SignalingEvent::Candidate { key, candidate } => self.handle_candidate(&key, candidate),
            SignalingEvent::Leave { key } => self.handle_leave(&key),
        };

        match result {
            Ok(()) => {}
            Err(SfuError::UnknownAdmissionKey) => {
                warn!(
                    target: "sfu.actor.engine",
                    sfu_id = %self.config.sfu_id,
                    event = kind,
                    "Signaling event for unknown admission key, ignoring"
                );
                prom::record_protocol_violation(kind);
            }
            Err(e) => {
                warn!(
                    target: "sfu.actor.engine",
                    sfu_id = %self.config.sfu_id,
                    event = kind,
                    error = %e,
                    "Signaling event rejected"
                );
            }
        }

        prom::record_event_latency(kind, start.elapsed());
    }

    /// Validate the key and park the join until the admission authority decides.
    #[instrument(skip_all, name = "sfu.engine.join", fields(sfu_id = %self.config.sfu_id))]
    async fn handle_join(
        &mut self,
        key: AdmissionKey,
        peer_id: Option<PeerId>,
        metadata: Value,
        track_metadata: Value,
        capabilities: Capabilities,
    ) -> Result<(), SfuError> {
        if self.is_shutting_down {
            return Err(SfuError::Draining);
        }

        if let Err(e) = self.key_manager.validate(&key) {
            prom::record_admission("invalid_key");
            return Err(e.into());
        }

        let peer_id = peer_id.unwrap_or_else(PeerId::generate);

        let waiters = self.pending.entry(peer_id.clone()).or_default();
        if waiters.iter().any(|p| p.key == key) {
            debug!(
                target: "sfu.actor.engine",
                peer_id = %peer_id,
                "Repeated join for a pending admission, ignoring"
            );
            return Ok(());
        }
        waiters.push(PendingAdmission {
            key,
            peer_id: peer_id.clone(),
            metadata: metadata.clone(),
            track_metadata,
            capabilities,
            deadline: Instant::now() + self.config.admission_timeout,
        });

        info!(
            target: "sfu.actor.engine",
            sfu_id = %self.config.sfu_id,
            peer_id = %peer_id,
            relay_audio = capabilities.relay_audio,
            relay_video = capabilities.relay_video,
            receive_media = capabilities.receive_media,
            "Join waiting for admission"
        );

        self.dispatcher.publish(Notification::NewPeer { peer_id, metadata });
        Ok(())
    }

    #[instrument(skip_all, name = "sfu.engine.accept", fields(peer_id = %peer_id))]
    async fn handle_accept(&mut self, peer_id: PeerId) -> Result<(), SfuError> {
        let Some(waiters) = self.pending.remove(&peer_id) else {
            warn!(
                target: "sfu.actor.engine",
                sfu_id = %self.config.sfu_id,
                peer_id = %peer_id,
                "Accept for a peer with no pending join, ignoring"
            );
            return Err(SfuError::PeerNotFound(peer_id.to_string()));
        };

        for pending in waiters {
            self.admit(pending).await;
        }
        Ok(())
    }

    async fn handle_deny(&mut self, peer_id: PeerId) -> Result<(), SfuError> {
        if self.pending.remove(&peer_id).is_none() {
            warn!(
                target: "sfu.actor.engine",
                sfu_id = %self.config.sfu_id,
                peer_id = %peer_id,
                "Deny for a peer with no pending join, ignoring"
            );
            return Err(SfuError::PeerNotFound(peer_id.to_string()));
        }

        info!(
            target: "sfu.actor.engine",
            sfu_id = %self.config.sfu_id,
            peer_id = %peer_id,
            "Join denied"
        );
        prom::record_admission("denied");
        self.reject(peer_id).await;
        Ok(())
    }

    async fn reject(&mut self, peer_id: PeerId) {
        self.emit(OutboundEvent::PeerDenied {
            peer_id: peer_id.clone(),
        })
        .await;
        self.dispatcher.publish(Notification::PeerDenied { peer_id });
    }

    /// Deny joins whose admission deadline has passed.
    async fn expire_pending_admissions(&mut self) {
        if self.pending.is_empty() {
            return;
        }

        let now = Instant::now();
        let mut expired = Vec::new();
        self.pending.retain(|_, waiters| {
            let (overdue, live): (Vec<_>, Vec<_>) = std::mem::take(waiters)
                .into_iter()
                .partition(|p| p.is_expired(now));
            expired.extend(overdue);
            *waiters = live;
            !waiters.is_empty()
        });

        // One denial per overdue join, even when the peer id has other joins pending
        for PendingAdmission { peer_id, .. } in expired {
            warn!(
                target: "sfu.actor.engine",
                sfu_id = %self.config.sfu_id,
                peer_id = %peer_id,
                timeout_secs = self.config.admission_timeout.as_secs(),
                "Admission decision timed out, treating as denied"
            );
            prom::record_admission("expired");
            self.reject(peer_id).await;
        }
    }

    /// Promote a pending join to a session, start its endpoint, and wire it up.
    async fn admit(&mut self, pending: PendingAdmission) {
        let peer_id = pending.peer_id.clone();

        if self.registry.contains_key(&pending.key) || self.registry.contains_peer(&peer_id) {
            warn!(
                target: "sfu.actor.engine",
                sfu_id = %self.config.sfu_id,
                peer_id = %peer_id,
                "Peer or admission key already admitted, ignoring second acceptance"
            );
            prom::record_admission("duplicate");
            return;
        }

        let receive_media = match self.registry.admit(pending) {
            Ok(session) => session.capabilities.receive_media,
            Err(e) => {
                warn!(
                    target: "sfu.actor.engine",
                    peer_id = %peer_id,
                    error = %e,
                    "Admission failed"
                );
                return;
            }
        };

        let inbound = self
            .registry
            .tracks_of(&peer_id)
            .into_iter()
            .map(TrackDeclaration::from)
            .collect();
        let outbound = if receive_media {
            self.registry
                .routable_tracks()
                .into_iter()
                .filter(|t| t.owner != peer_id)
                .map(TrackDeclaration::from)
                .collect()
        } else {
            Vec::new()
        };

        let spec = EndpointSpec {
            peer_id: peer_id.clone(),
            inbound,
            outbound,
        };
        if let Err(e) = self.start_endpoint(spec) {
            error!(
                target: "sfu.actor.engine",
                sfu_id = %self.config.sfu_id,
                peer_id = %peer_id,
                error = %e,
                "Media endpoint creation failed, rejecting peer"
            );
            prom::record_endpoint_failure("create_failed");
            prom::record_admission("endpoint_failed");
            self.registry.remove_peer(&peer_id);
            self.reject(peer_id).await;
            return;
        }

        let ops = self.topology.reconcile(&self.registry);
        self.apply_edge_ops(ops);

        let directory = self.registry.directory(&peer_id);
        info!(
            target: "sfu.actor.engine",
            sfu_id = %self.config.sfu_id,
            peer_id = %peer_id,
            peers = self.registry.peer_count(),
            "Peer admitted"
        );
        prom::record_admission("accepted");
        self.update_gauges();

        self.emit(OutboundEvent::PeerAccepted {
            peer_id: peer_id.clone(),
            directory,
        })
        .await;
        self.dispatcher.publish(Notification::PeerAccepted { peer_id });
    }

    fn start_endpoint(&mut self, spec: EndpointSpec) -> Result<(), SfuError> {
        self.next_instance += 1;
        let peer_id = spec.peer_id.clone();
        let notifier =
            EndpointNotifier::new(peer_id.clone(), self.next_instance, self.sender.clone());

        let endpoint = self.factory.create(spec, notifier.clone())?;
        let handle = EndpointActor::spawn(
            endpoint,
            notifier,
            self.cancel_token.child_token(),
            Arc::clone(&self.metrics),
        );

        self.registry.add_child(ChildId::Endpoint(peer_id.clone()));
        self.endpoints.insert(peer_id, handle);
        Ok(())
    }

    fn handle_answer(
        &mut self,
        key: &AdmissionKey,
        sdp_answer: String,
        mid_to_track_metadata: HashMap<String, Value>,
    ) -> Result<(), SfuError> {
        let peer_id = self
            .registry
            .peer_id_for_key(key)
            .cloned()
            .ok_or(SfuError::UnknownAdmissionKey)?;

        if let Some(session) = self.registry.peer_mut(&peer_id) {
            session.track_metadata = None;
            session.mid_to_track_metadata = mid_to_track_metadata;
        }

        self.send_to_endpoint(
            &peer_id,
            EndpointCommand::ApplySignal {
                signal: PeerSignal::SdpAnswer(sdp_answer),
            },
        );
        Ok(())
    }

    fn handle_candidate(&mut self, key: &AdmissionKey, candidate: String) -> Result<(), SfuError> {
        let peer_id = self
            .registry
            .peer_id_for_key(key)
            .cloned()
            .ok_or(SfuError::UnknownAdmissionKey)?;

        self.send_to_endpoint(
            &peer_id,
            EndpointCommand::ApplySignal {
                signal: PeerSignal::Candidate(candidate),
            },
        );
        Ok(())
    }

    fn handle_leave(&mut self, key: &AdmissionKey) -> Result<(), SfuError> {
        if let Some(peer_id) = self.registry.peer_id_for_key(key).cloned() {
            self.remove_peer(&peer_id, LeaveReason::Left);
            return Ok(());
        }

        if self.cancel_pending(key) {
            info!(
                target: "sfu.actor.engine",
                sfu_id = %self.config.sfu_id,
                "Leave cancelled a pending join"
            );
            return Ok(());
        }

        Err(SfuError::UnknownAdmissionKey)
    }

    /// Drop the pending join carrying `key`. Returns false if there was none.
    fn cancel_pending(&mut self, key: &AdmissionKey) -> bool {
        let mut found = false;
        self.pending.retain(|_, waiters| {
            let before = waiters.len();
            waiters.retain(|p| &p.key != key);
            found |= waiters.len() != before;
            !waiters.is_empty()
        });
        found
    }

    /// Remove a peer, withdraw its tracks from everyone else, and tear down its endpoint.
    fn remove_peer(&mut self, peer_id: &PeerId, reason: LeaveReason) -> RemovalOutcome {
        let Some((_session, tracks)) = self.registry.remove_peer(peer_id) else {
            debug!(
                target: "sfu.actor.engine",
                sfu_id = %self.config.sfu_id,
                peer_id = %peer_id,
                "Peer already absent, nothing to remove"
            );
            return RemovalOutcome::AlreadyAbsent;
        };

        let track_ids: Vec<TrackId> = tracks.into_iter().map(|t| t.track_id).collect();

        if !track_ids.is_empty() {
            for (other, handle) in &self.endpoints {
                if other == peer_id || self.is_withdrawal_excluded(other) {
                    continue;
                }
                if let Err(e) = handle.send(EndpointCommand::WithdrawTracks {
                    track_ids: track_ids.clone(),
                }) {
                    debug!(
                        target: "sfu.actor.engine",
                        peer_id = %other,
                        error = %e,
                        "Could not withdraw tracks from endpoint"
                    );
                }
            }
        }

        self.topology.close_fan_outs_owned_by(peer_id);
        let ops = self.topology.reconcile(&self.registry);
        self.apply_edge_ops(ops);

        if let Some(handle) = self.endpoints.remove(peer_id) {
            if !handle.is_cancelled() {
                handle.cancel();
                self.await_endpoint_shutdown(handle);
            }
        }

        let mut children = vec![ChildId::Endpoint(peer_id.clone())];
        for track_id in &track_ids {
            children.push(ChildId::FanOut(track_id.clone()));
            children.push(ChildId::DiscardSink(track_id.clone()));
        }
        let removed = self.registry.remove_children(&children);

        if self.screen_share_source.as_ref() == Some(peer_id) {
            self.screen_share_source = None;
        }

        info!(
            target: "sfu.actor.engine",
            sfu_id = %self.config.sfu_id,
            peer_id = %peer_id,
            reason = reason.as_str(),
            withdrawn_tracks = track_ids.len(),
            children_removed = removed.len(),
            peers = self.registry.peer_count(),
            "Peer removed"
        );
        self.update_gauges();

        self.dispatcher.publish(Notification::PeerLeft {
            peer_id: peer_id.clone(),
            reason,
        });
        RemovalOutcome::Removed
    }

    fn is_withdrawal_excluded(&self, peer_id: &PeerId) -> bool {
        match self.config.withdrawal_exclusion {
            WithdrawalExclusion::None => false,
            WithdrawalExclusion::ScreenShareSource => {
                self.screen_share_source.as_ref() == Some(peer_id)
            }
        }
    }

    /// Wait for a cancelled endpoint in the background so the loop is never blocked.
    fn await_endpoint_shutdown(&self, handle: EndpointActorHandle) {
        let timeout = self.config.endpoint_shutdown_timeout;
        tokio::spawn(async move {
            if handle.wait_finished(timeout).await {
                debug!(
                    target: "sfu.actor.engine",
                    peer_id = %handle.peer_id(),
                    "Endpoint actor stopped cleanly"
                );
            } else {
                warn!(
                    target: "sfu.actor.engine",
                    peer_id = %handle.peer_id(),
                    timeout_secs = timeout.as_secs(),
                    "Endpoint actor shutdown timed out"
                );
            }
        });
    }

    async fn handle_endpoint_event(&mut self, event: EndpointEvent) {
        match event {
            EndpointEvent::NewTrack {
                peer_id,
                instance,
                track_id,
                encoding,
            } => {
                if self.is_live_instance(&peer_id, instance) {
                    self.handle_new_track(peer_id, track_id, encoding);
                } else {
                    debug!(
                        target: "sfu.actor.engine",
                        peer_id = %peer_id,
                        track_id = %track_id,
                        "Track discovery from a stale endpoint, ignoring"
                    );
                }
            }

            EndpointEvent::Signal {
                peer_id,
                instance,
                payload,
            } => {
                if self.is_live_instance(&peer_id, instance) {
                    self.emit(OutboundEvent::Signal { peer_id, payload }).await;
                }
            }

            EndpointEvent::VoiceActivity {
                peer_id,
                instance,
                activity,
            } => {
                if self.is_live_instance(&peer_id, instance) {
                    self.dispatcher
                        .publish(Notification::VoiceActivity { peer_id, activity });
                }
            }

            EndpointEvent::Exited {
                peer_id,
                instance,
                panicked,
            } => {
                if !self.is_live_instance(&peer_id, instance) {
                    debug!(
                        target: "sfu.actor.engine",
                        peer_id = %peer_id,
                        instance,
                        "Exit of a replaced or removed endpoint, ignoring"
                    );
                    return;
                }

                warn!(
                    target: "sfu.actor.engine",
                    sfu_id = %self.config.sfu_id,
                    peer_id = %peer_id,
                    panicked,
                    "Media endpoint terminated, removing peer"
                );
                self.remove_peer(&peer_id, LeaveReason::EndpointFailed);
            }
        }
    }

    /// Open a fan-out for a newly discovered track and wire it to every receiver.
    fn handle_new_track(&mut self, owner: PeerId, track_id: TrackId, encoding: Encoding) {
        if let Err(e) = self
            .registry
            .record_encoding(&track_id, &owner, encoding.clone())
        {
            warn!(
                target: "sfu.actor.engine",
                peer_id = %owner,
                track_id = %track_id,
                error = %e,
                "Track discovery for an unknown track, ignoring"
            );
            return;
        }

        if !self
            .topology
            .open_fan_out(track_id.clone(), owner.clone(), encoding.clone())
        {
            debug!(
                target: "sfu.actor.engine",
                peer_id = %owner,
                track_id = %track_id,
                "Track already wired, ignoring repeated discovery"
            );
            return;
        }

        self.registry.add_child(ChildId::FanOut(track_id.clone()));
        self.registry
            .add_child(ChildId::DiscardSink(track_id.clone()));
        self.send_to_endpoint(
            &owner,
            EndpointCommand::OpenFanOut {
                track_id: track_id.clone(),
                encoding: encoding.clone(),
            },
        );

        info!(
            target: "sfu.actor.engine",
            sfu_id = %self.config.sfu_id,
            peer_id = %owner,
            track_id = %track_id,
            encoding = %encoding,
            "Track routable"
        );

        let ops = self.topology.reconcile(&self.registry);
        self.apply_edge_ops(ops);
    }

    fn apply_edge_ops(&mut self, ops: Vec<EdgeOp>) {
        for op in ops {
            match op {
                EdgeOp::Add {
                    track_id,
                    owner,
                    consumer,
                    encoding,
                } => {
                    let Some(track) = self.registry.track(&track_id) else {
                        continue;
                    };
                    debug!(
                        target: "sfu.actor.engine",
                        track_id = %track_id,
                        owner = %owner,
                        consumer = %consumer,
                        encoding = %encoding,
                        "Forwarding edge added"
                    );
                    let track = TrackDeclaration::from(track);
                    self.send_to_endpoint(&consumer, EndpointCommand::ForwardTrack { track });
                }
                EdgeOp::Remove { track_id, consumer } => {
                    // Departures already sent their own withdrawals.
                    if self.registry.track(&track_id).is_none()
                        || !self.registry.contains_peer(&consumer)
                    {
                        continue;
                    }
                    debug!(
                        target: "sfu.actor.engine",
                        track_id = %track_id,
                        consumer = %consumer,
                        "Forwarding edge removed"
                    );
                    self.send_to_endpoint(
                        &consumer,
                        EndpointCommand::WithdrawTracks {
                            track_ids: vec![track_id],
                        },
                    );
                }
            }
        }
        prom::set_forwarding_edges(self.topology.edge_count());
    }

    fn send_to_endpoint(&self, peer_id: &PeerId, command: EndpointCommand) {
        let Some(handle) = self.endpoints.get(peer_id) else {
            return;
        };
        if let Err(e) = handle.send(command) {
            // The exit report will follow and remove the peer.
            debug!(
                target: "sfu.actor.engine",
                peer_id = %peer_id,
                error = %e,
                "Endpoint command not delivered"
            );
        }
    }

    fn is_live_instance(&self, peer_id: &PeerId, instance: u64) -> bool {
        self.endpoints
            .get(peer_id)
            .is_some_and(|h| h.instance() == instance)
    }

    async fn emit(&self, event: OutboundEvent) {
        if self.outbound.send(event).await.is_err() {
            debug!(
                target: "sfu.actor.engine",
                sfu_id = %self.config.sfu_id,
                "Outbound event receiver dropped"
            );
        }
    }

    fn update_gauges(&self) {
        prom::set_peers_active(self.registry.peer_count());
        prom::set_forwarding_edges(self.topology.edge_count());
    }

    fn snapshot(&self) -> EngineState {
        let mut peers: Vec<PeerSnapshot> = self
            .registry
            .peer_ids()
            .filter_map(|id| self.registry.peer(id))
            .map(|session| PeerSnapshot {
                peer_id: session.peer_id.clone(),
                capabilities: session.capabilities,
                tracks: session.tracks.clone(),
                admitted_at: session.admitted_at,
                endpoint_live: self
                    .endpoints
                    .get(&session.peer_id)
                    .is_some_and(|h| !h.is_finished()),
            })
            .collect();
        peers.sort_by(|a, b| a.peer_id.cmp(&b.peer_id));

        EngineState {
            sfu_id: self.config.sfu_id.clone(),
            peers,
            tracks: self.registry.all_tracks(),
            forwarding_edges: self.topology.edges(),
            pending_admissions: self.pending.values().map(Vec::len).sum(),
            endpoint_children: self.registry.children(),
            mailbox_depth: self.receiver.len(),
            is_shutting_down: self.is_shutting_down,
        }
    }

    /// Stop admitting, deny pending joins, and remove every peer.
    async fn graceful_shutdown(&mut self) {
        if self.is_shutting_down {
            return;
        }
        self.is_shutting_down = true;

        info!(
            target: "sfu.actor.engine",
            sfu_id = %self.config.sfu_id,
            peers = self.registry.peer_count(),
            pending = self.pending.len(),
            "SfuEngine shutting down"
        );

        let pending: Vec<PeerId> = self.pending.drain().map(|(peer_id, _)| peer_id).collect();
        for peer_id in pending {
            self.reject(peer_id).await;
        }

        let peers: Vec<PeerId> = self.registry.peer_ids().cloned().collect();
        for peer_id in peers {
            self.remove_peer(&peer_id, LeaveReason::Shutdown);
        }
    }
}
