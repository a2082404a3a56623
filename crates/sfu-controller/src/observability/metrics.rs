//! Prometheus metrics for the SFU controller.
//!
//! All metrics follow Prometheus naming conventions:
//! - `sfu_` prefix
//! - `_total` suffix for counters
//! - `_seconds` suffix for duration histograms
//!
//! # Cardinality
//!
//! Every label value comes from a fixed set in code:
//! - `event`: signaling and endpoint event kinds (~10 values)
//! - `outcome`: admission outcomes (accepted, denied, expired, invalid_key, duplicate,
//!   endpoint_failed)
//! - `reason`: endpoint failure reasons (create_failed, driver_error, panic)
//! - `actor_type`: engine, endpoint

use metrics::{counter, gauge, histogram};
use metrics_exporter_prometheus::{Matcher, PrometheusBuilder, PrometheusHandle};
use std::time::Duration;

/// Install the Prometheus recorder and return the handle used to render `/metrics`.
///
/// Must be called before any metrics are recorded.
///
/// # Errors
///
/// Returns error if the recorder fails to install (e.g., already installed).
pub fn init_metrics_recorder() -> Result<PrometheusHandle, String> {
    PrometheusBuilder::new()
        // Event latency buckets - in-process handling, p99 target 10ms
        .set_buckets_for_metric(
            Matcher::Prefix("sfu_event_latency".to_string()),
            &[
                0.0001, 0.0005, 0.001, 0.0025, 0.005, 0.010, 0.025, 0.050, 0.100, 0.250,
            ],
        )
        .map_err(|e| format!("Failed to set event latency buckets: {e}"))?
        .install_recorder()
        .map_err(|e| format!("Failed to install Prometheus metrics recorder: {e}"))
}

// ============================================================================
// Session Metrics (Gauges)
// ============================================================================

/// Metric: `sfu_peers_active`
pub fn set_peers_active(count: usize) {
    // usize to f64 conversion is safe for realistic peer counts
    #[allow(clippy::cast_precision_loss)]
    gauge!("sfu_peers_active").set(count as f64);
}

/// Metric: `sfu_forwarding_edges`
///
/// Number of (track, consumer) pairs currently wired.
pub fn set_forwarding_edges(count: usize) {
    #[allow(clippy::cast_precision_loss)]
    gauge!("sfu_forwarding_edges").set(count as f64);
}

/// Set the mailbox depth for an actor type.
///
/// Metric: `sfu_actor_mailbox_depth`
/// Labels: `actor_type`
pub fn set_actor_mailbox_depth(actor_type: &str, depth: usize) {
    #[allow(clippy::cast_precision_loss)]
    gauge!("sfu_actor_mailbox_depth", "actor_type" => actor_type.to_string()).set(depth as f64);
}

// ============================================================================
// Event Metrics
// ============================================================================

/// Metric: `sfu_signaling_events_total`
/// Labels: `event`
pub fn record_signaling_event(event: &str) {
    counter!("sfu_signaling_events_total", "event" => event.to_string()).increment(1);
}

/// Record how long the engine spent handling one event.
///
/// Metric: `sfu_event_latency_seconds`
/// Labels: `event`
pub fn record_event_latency(event: &str, duration: Duration) {
    histogram!("sfu_event_latency_seconds", "event" => event.to_string())
        .record(duration.as_secs_f64());
}

/// Metric: `sfu_admissions_total`
/// Labels: `outcome`
pub fn record_admission(outcome: &str) {
    counter!("sfu_admissions_total", "outcome" => outcome.to_string()).increment(1);
}

/// Record a signaling event that referenced no known session.
///
/// Metric: `sfu_protocol_violations_total`
/// Labels: `event`
///
/// A steady non-zero rate points at a misbehaving signaling client.
pub fn record_protocol_violation(event: &str) {
    counter!("sfu_protocol_violations_total", "event" => event.to_string()).increment(1);
}

/// Metric: `sfu_endpoint_failures_total`
/// Labels: `reason`
///
/// ALERT: `panic` indicates a bug in a media endpoint.
pub fn record_endpoint_failure(reason: &str) {
    counter!("sfu_endpoint_failures_total", "reason" => reason.to_string()).increment(1);
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]
mod tests {
    use super::*;
    use metrics_util::debugging::{DebugValue, DebuggingRecorder};
    use metrics_util::MetricKind;

    /// Run `f` against a thread-local debugging recorder and return what it recorded as
    /// `(kind, name, labels, value)`.
    fn capture(f: impl FnOnce()) -> Vec<(MetricKind, String, Vec<(String, String)>, DebugValue)> {
        let recorder = DebuggingRecorder::new();
        let snapshotter = recorder.snapshotter();
        metrics::with_local_recorder(&recorder, f);

        snapshotter
            .snapshot()
            .into_vec()
            .into_iter()
            .map(|(key, _, _, value)| {
                let (kind, key) = key.into_parts();
                let labels = key
                    .labels()
                    .map(|l| (l.key().to_string(), l.value().to_string()))
                    .collect();
                (kind, key.name().to_string(), labels, value)
            })
            .collect()
    }

    #[test]
    fn test_gauges_are_recorded() {
        let recorded = capture(|| {
            set_peers_active(3);
            set_forwarding_edges(6);
            set_actor_mailbox_depth("engine", 12);
        });

        let gauge = |name: &str| {
            recorded
                .iter()
                .find(|(kind, n, _, _)| *kind == MetricKind::Gauge && n == name)
                .map(|(_, _, _, v)| v)
                .unwrap()
        };
        assert_eq!(*gauge("sfu_peers_active"), DebugValue::Gauge(3.0.into()));
        assert_eq!(*gauge("sfu_forwarding_edges"), DebugValue::Gauge(6.0.into()));
        assert_eq!(
            *gauge("sfu_actor_mailbox_depth"),
            DebugValue::Gauge(12.0.into())
        );
    }

    #[test]
    fn test_counters_carry_labels() {
        let recorded = capture(|| {
            record_signaling_event("join");
            record_signaling_event("join");
            record_admission("accepted");
            record_protocol_violation("candidate");
            record_endpoint_failure("panic");
        });

        let joins = recorded
            .iter()
            .find(|(_, name, labels, _)| {
                name == "sfu_signaling_events_total"
                    && labels == &[("event".to_string(), "join".to_string())]
            })
            .unwrap();
        assert_eq!(joins.3, DebugValue::Counter(2));

        for name in [
            "sfu_admissions_total",
            "sfu_protocol_violations_total",
            "sfu_endpoint_failures_total",
        ] {
            assert!(
                recorded
                    .iter()
                    .any(|(kind, n, _, v)| *kind == MetricKind::Counter
                        && n == name
                        && *v == DebugValue::Counter(1)),
                "{name} should be recorded once"
            );
        }
    }

    #[test]
    fn test_event_latency_histogram() {
        let recorded = capture(|| {
            record_event_latency("answer", Duration::from_millis(2));
        });

        let (_, _, labels, value) = recorded
            .iter()
            .find(|(kind, name, _, _)| {
                *kind == MetricKind::Histogram && name == "sfu_event_latency_seconds"
            })
            .unwrap();
        assert_eq!(labels, &vec![("event".to_string(), "answer".to_string())]);
        match value {
            DebugValue::Histogram(samples) => assert_eq!(samples.len(), 1),
            other => panic!("expected histogram, got {other:?}"),
        }
    }

    #[test]
    fn test_recording_without_recorder_is_noop() {
        set_peers_active(0);
        record_admission("denied");
        record_event_latency("leave", Duration::from_micros(50));
    }
}
