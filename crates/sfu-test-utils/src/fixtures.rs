//! Pre-configured test data for SFU controller tests.
//!
//! Provides:
//! - A valid admission key secret and `Config` builder
//! - A started `SfuService` backed by the mock endpoint factory
//! - Builders for signaling events
//! - Helpers to await outbound events and notifications with a timeout

use crate::mock_endpoint::MockEndpointFactory;

use base64::Engine;
use secrecy::SecretBox;
use sfu_controller::actors::AdmissionKeyManager;
use sfu_controller::notifications::Notification;
use sfu_controller::signaling::{OutboundEvent, SignalingEvent};
use sfu_controller::types::{AdmissionKey, PeerId};
use sfu_controller::{Config, SfuService, WithdrawalExclusion};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::time::Duration;
use tokio::sync::mpsc;

/// Raw bytes of the admission key secret used throughout the tests.
pub const TEST_SECRET_BYTES: [u8; 32] = [0x2a; 32];

/// How long the `next_*` helpers wait before failing the test.
pub const EVENT_TIMEOUT: Duration = Duration::from_secs(5);

/// Base64 form of [`TEST_SECRET_BYTES`], as it appears in `SFU_ADMISSION_KEY_SECRET`.
#[must_use]
pub fn test_secret_b64() -> String {
    base64::engine::general_purpose::STANDARD.encode(TEST_SECRET_BYTES)
}

/// Key manager for `sfu_id`, using the test secret.
#[must_use]
pub fn test_key_manager(sfu_id: &str) -> AdmissionKeyManager {
    AdmissionKeyManager::new(sfu_id, &SecretBox::new(Box::new(TEST_SECRET_BYTES.to_vec())))
        .expect("test secret is long enough")
}

/// Builder for a test `Config`.
#[derive(Debug, Clone)]
pub struct TestConfig {
    vars: HashMap<String, String>,
}

impl Default for TestConfig {
    fn default() -> Self {
        Self::new()
    }
}

impl TestConfig {
    #[must_use]
    pub fn new() -> Self {
        let vars = HashMap::from([
            ("SFU_ADMISSION_KEY_SECRET".to_string(), test_secret_b64()),
            ("SFU_ID".to_string(), "sfu-test".to_string()),
            (
                "SFU_HEALTH_BIND_ADDRESS".to_string(),
                "127.0.0.1:0".to_string(),
            ),
            ("SFU_ENDPOINT_SHUTDOWN_TIMEOUT_SECONDS".to_string(), "1".to_string()),
        ]);
        Self { vars }
    }

    #[must_use]
    pub fn admission_timeout_secs(mut self, secs: u64) -> Self {
        self.vars
            .insert("SFU_ADMISSION_TIMEOUT_SECONDS".to_string(), secs.to_string());
        self
    }

    #[must_use]
    pub fn withdrawal_exclusion(mut self, policy: WithdrawalExclusion) -> Self {
        self.vars.insert(
            "SFU_WITHDRAWAL_EXCLUSION".to_string(),
            policy.as_str().to_string(),
        );
        self
    }

    #[must_use]
    pub fn build(self) -> Config {
        Config::from_vars(&self.vars).expect("test config is valid")
    }
}

/// Start a service with the default test config.
#[must_use]
pub fn start_service(factory: MockEndpointFactory) -> (SfuService, mpsc::Receiver<OutboundEvent>) {
    start_service_with(&TestConfig::new().build(), factory)
}

#[must_use]
pub fn start_service_with(
    config: &Config,
    factory: MockEndpointFactory,
) -> (SfuService, mpsc::Receiver<OutboundEvent>) {
    SfuService::start(config, factory.as_factory()).expect("service starts")
}

/// Builder for `join` events.
#[derive(Debug, Clone)]
pub struct JoinBuilder {
    key: AdmissionKey,
    peer_id: Option<PeerId>,
    metadata: Value,
    track_metadata: Value,
    relay_audio: bool,
    relay_video: bool,
    receive_media: bool,
}

impl JoinBuilder {
    /// A join for `peer_id` that publishes nothing and receives media.
    #[must_use]
    pub fn new(key: &AdmissionKey, peer_id: &str) -> Self {
        Self {
            key: key.clone(),
            peer_id: Some(PeerId::from(peer_id)),
            metadata: json!({ "display_name": peer_id }),
            track_metadata: Value::Null,
            relay_audio: false,
            relay_video: false,
            receive_media: true,
        }
    }

    #[must_use]
    pub fn without_peer_id(mut self) -> Self {
        self.peer_id = None;
        self
    }

    #[must_use]
    pub fn publishes_audio(mut self) -> Self {
        self.relay_audio = true;
        self
    }

    #[must_use]
    pub fn publishes_video(mut self) -> Self {
        self.relay_video = true;
        self
    }

    /// Publish both media, as most conference participants do.
    #[must_use]
    pub fn publishes_av(self) -> Self {
        self.publishes_audio().publishes_video()
    }

    #[must_use]
    pub fn receive_only(mut self) -> Self {
        self.relay_audio = false;
        self.relay_video = false;
        self.receive_media = true;
        self
    }

    #[must_use]
    pub fn send_only(mut self) -> Self {
        self.receive_media = false;
        self
    }

    #[must_use]
    pub fn track_metadata(mut self, metadata: Value) -> Self {
        self.track_metadata = metadata;
        self
    }

    #[must_use]
    pub fn build(self) -> SignalingEvent {
        SignalingEvent::Join {
            key: self.key,
            peer_id: self.peer_id,
            metadata: self.metadata,
            track_metadata: self.track_metadata,
            relay_audio: self.relay_audio,
            relay_video: self.relay_video,
            receive_media: self.receive_media,
        }
    }
}

#[must_use]
pub fn answer(key: &AdmissionKey, sdp: &str) -> SignalingEvent {
    SignalingEvent::Answer {
        key: key.clone(),
        sdp_answer: sdp.to_string(),
        mid_to_track_metadata: HashMap::new(),
    }
}

#[must_use]
pub fn candidate(key: &AdmissionKey, candidate: &str) -> SignalingEvent {
    SignalingEvent::Candidate {
        key: key.clone(),
        candidate: candidate.to_string(),
    }
}

#[must_use]
pub fn leave(key: &AdmissionKey) -> SignalingEvent {
    SignalingEvent::Leave { key: key.clone() }
}

/// Next outbound event.
///
/// # Panics
///
/// Panics if nothing arrives within [`EVENT_TIMEOUT`] or the engine is gone.
pub async fn next_outbound(outbound: &mut mpsc::Receiver<OutboundEvent>) -> OutboundEvent {
    tokio::time::timeout(EVENT_TIMEOUT, outbound.recv())
        .await
        .expect("timed out waiting for outbound event")
        .expect("outbound channel closed")
}

/// Next outbound event other than `signal` (admission results only).
pub async fn next_admission_result(
    outbound: &mut mpsc::Receiver<OutboundEvent>,
) -> OutboundEvent {
    loop {
        let event = next_outbound(outbound).await;
        if !matches!(event, OutboundEvent::Signal { .. }) {
            return event;
        }
    }
}

/// Next notification on a subscription.
///
/// # Panics
///
/// Panics if nothing arrives within [`EVENT_TIMEOUT`].
pub async fn next_notification(
    notifications: &mut mpsc::UnboundedReceiver<Notification>,
) -> Notification {
    tokio::time::timeout(EVENT_TIMEOUT, notifications.recv())
        .await
        .expect("timed out waiting for notification")
        .expect("subscription closed")
}

/// Install a test tracing subscriber once; later calls are no-ops.
pub fn init_test_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "sfu_controller=debug".into()),
        )
        .with_test_writer()
        .try_init();
}
