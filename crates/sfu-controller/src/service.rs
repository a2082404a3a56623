//! Service bootstrap: wires configuration, admission keys, the notification dispatcher,
//! the engine, and the health probes together.

use crate::actors::{AdmissionKeyManager, EndpointFactory, EngineConfig, SfuEngine, SfuEngineHandle};
use crate::config::Config;
use crate::errors::SfuError;
use crate::notifications::NotificationDispatcher;
use crate::observability::{health_router, HealthState};
use crate::signaling::OutboundEvent;
use crate::types::AdmissionKey;

use axum::Router;
use metrics_exporter_prometheus::PrometheusHandle;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

/// Buffer between the engine and the Signaling Codec.
const OUTBOUND_CHANNEL_BUFFER: usize = 1000;

/// How long `shutdown` waits for the engine task after it acknowledged.
const ENGINE_STOP_TIMEOUT: Duration = Duration::from_secs(5);

/// A running SFU controller.
pub struct SfuService {
    handle: SfuEngineHandle,
    engine_task: JoinHandle<()>,
    dispatcher: NotificationDispatcher,
    key_manager: Arc<AdmissionKeyManager>,
    health_state: Arc<HealthState>,
    cancel_token: CancellationToken,
    health_bind_address: String,
}

impl SfuService {
    /// Start the engine.
    ///
    /// Returns the service and the receiver of outbound events (`peer_accepted`,
    /// `peer_denied`, `signal`) for the Signaling Codec to encode and deliver.
    ///
    /// # Errors
    ///
    /// Returns `SfuError::Config` if the admission key secret is invalid.
    pub fn start(
        config: &Config,
        factory: Arc<dyn EndpointFactory>,
    ) -> Result<(Self, mpsc::Receiver<OutboundEvent>), SfuError> {
        let secret = config
            .admission_secret_bytes()
            .map_err(|e| SfuError::Config(e.to_string()))?;
        let key_manager = Arc::new(AdmissionKeyManager::new(&config.sfu_id, &secret)?);

        let dispatcher = NotificationDispatcher::new();
        let cancel_token = CancellationToken::new();
        let (outbound_tx, outbound_rx) = mpsc::channel(OUTBOUND_CHANNEL_BUFFER);

        let (handle, engine_task) = SfuEngine::spawn(
            EngineConfig::from(config),
            Arc::clone(&key_manager),
            dispatcher.clone(),
            factory,
            outbound_tx,
            cancel_token.child_token(),
        );

        let health_state = Arc::new(HealthState::new());
        health_state.set_ready();

        info!(
            target: "sfu.service",
            sfu_id = %config.sfu_id,
            admission_timeout_secs = config.admission_timeout.as_secs(),
            withdrawal_exclusion = config.withdrawal_exclusion.as_str(),
            "SFU controller started"
        );

        Ok((
            Self {
                handle,
                engine_task,
                dispatcher,
                key_manager,
                health_state,
                cancel_token,
                health_bind_address: config.health_bind_address.clone(),
            },
            outbound_rx,
        ))
    }

    #[must_use]
    pub fn handle(&self) -> &SfuEngineHandle {
        &self.handle
    }

    #[must_use]
    pub fn dispatcher(&self) -> &NotificationDispatcher {
        &self.dispatcher
    }

    #[must_use]
    pub fn health_state(&self) -> Arc<HealthState> {
        Arc::clone(&self.health_state)
    }

    /// Issue a fresh admission key for a peer about to join.
    ///
    /// # Errors
    ///
    /// Returns `SfuError::Internal` if the system random source fails.
    pub fn issue_admission_key(&self) -> Result<AdmissionKey, SfuError> {
        self.key_manager.issue()
    }

    /// Bind the health server (`/health`, `/ready`, and `/metrics` when a Prometheus handle
    /// is given) on the configured address and serve it until shutdown.
    ///
    /// Returns the bound address.
    ///
    /// # Errors
    ///
    /// Returns `SfuError::Config` for an unparsable address and `SfuError::Internal` if
    /// the listener cannot be bound.
    pub async fn serve_health(
        &self,
        prometheus: Option<PrometheusHandle>,
    ) -> Result<SocketAddr, SfuError> {
        let addr: SocketAddr = self.health_bind_address.parse().map_err(|e| {
            SfuError::Config(format!(
                "Invalid health bind address {}: {e}",
                self.health_bind_address
            ))
        })?;

        let mut app = health_router(Arc::clone(&self.health_state));
        if let Some(handle) = prometheus {
            app = app.merge(Router::new().route(
                "/metrics",
                axum::routing::get(move || {
                    let handle = handle.clone();
                    async move { handle.render() }
                }),
            ));
        }

        // Bind before spawning to fail fast on bind errors
        let listener = tokio::net::TcpListener::bind(addr)
            .await
            .map_err(|e| {
                SfuError::Internal(format!("Failed to bind health server to {addr}: {e}"))
            })?;
        let local_addr = listener
            .local_addr()
            .map_err(|e| SfuError::Internal(format!("Failed to read health server address: {e}")))?;

        let shutdown_token = self.cancel_token.child_token();
        tokio::spawn(async move {
            info!(target: "sfu.service", addr = %local_addr, "Health server starting");
            let server = axum::serve(listener, app).with_graceful_shutdown(async move {
                shutdown_token.cancelled().await;
                info!(target: "sfu.service", "Health server shutting down");
            });
            if let Err(e) = server.await {
                error!(target: "sfu.service", error = %e, "Health server failed");
            }
        });

        Ok(local_addr)
    }

    /// Drain and stop: readiness goes false, every peer is removed, the engine stops.
    ///
    /// # Errors
    ///
    /// Returns `SfuError::Internal` if the engine task panicked.
    pub async fn shutdown(self) -> Result<(), SfuError> {
        self.health_state.set_not_ready();

        if let Err(e) = self.handle.shutdown().await {
            warn!(
                target: "sfu.service",
                error = %e,
                "Engine already stopped before shutdown"
            );
        }

        let result = match tokio::time::timeout(ENGINE_STOP_TIMEOUT, self.engine_task).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(join_error)) => {
                error!(
                    target: "sfu.service",
                    error = %join_error,
                    "Engine task failed"
                );
                Err(SfuError::Internal(format!("engine task failed: {join_error}")))
            }
            Err(_) => {
                warn!(
                    target: "sfu.service",
                    timeout_secs = ENGINE_STOP_TIMEOUT.as_secs(),
                    "Engine did not stop in time, cancelling"
                );
                Ok(())
            }
        };

        self.cancel_token.cancel();
        info!(target: "sfu.service", "SFU controller stopped");
        result
    }
}
