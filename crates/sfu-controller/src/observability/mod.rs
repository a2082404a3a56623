//! Observability for the SFU controller: tracing setup, Prometheus metrics, health probes.
//!
//! # Privacy by Default
//!
//! Actor loops and admission handlers use `#[instrument(skip_all)]` with explicit fields.
//! Admission keys are never logged; peer ids are. Metric labels are bounded by code.
//!
//! # Metrics
//!
//! | Metric | Type | Labels | Purpose |
//! |--------|------|--------|---------|
//! | `sfu_peers_active` | Gauge | none | Admitted peers |
//! | `sfu_forwarding_edges` | Gauge | none | Wired (track, consumer) pairs |
//! | `sfu_signaling_events_total` | Counter | `event` | Inbound signaling volume |
//! | `sfu_admissions_total` | Counter | `outcome` | Admission decisions |
//! | `sfu_protocol_violations_total` | Counter | `event` | Events for unknown admission keys |
//! | `sfu_endpoint_failures_total` | Counter | `reason` | Media endpoint failures |
//! | `sfu_event_latency_seconds` | Histogram | `event` | Engine handling time per event |
//! | `sfu_actor_mailbox_depth` | Gauge | `actor_type` | Engine backpressure |

pub mod health;
pub mod metrics;

pub use health::{health_router, HealthState};
pub use metrics::init_metrics_recorder;

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Install the global tracing subscriber.
///
/// `RUST_LOG` wins when set; otherwise `default_directive` (e.g. `"sfu_controller=info"`)
/// is used.
///
/// # Errors
///
/// Returns error if a global subscriber is already installed.
pub fn init_tracing(default_directive: &str) -> Result<(), String> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| default_directive.into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .try_init()
        .map_err(|e| format!("Failed to install tracing subscriber: {e}"))
}
