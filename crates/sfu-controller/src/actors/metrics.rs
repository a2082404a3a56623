//! Actor metrics and mailbox monitoring.
//!
//! | Actor Type | Normal | Warning | Critical |
//! |------------|--------|---------|----------|
//! | Engine     | < 100  | 100-500 | > 500    |
//! | Endpoint   | < 50   | 50-200  | > 200    |

use crate::observability::metrics as prom;

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use tracing::{debug, warn};

/// Mailbox depth thresholds for the engine actor.
pub const ENGINE_MAILBOX_NORMAL: usize = 100;
pub const ENGINE_MAILBOX_WARNING: usize = 500;

/// Mailbox depth thresholds for endpoint actors.
pub const ENDPOINT_MAILBOX_NORMAL: usize = 50;
pub const ENDPOINT_MAILBOX_WARNING: usize = 200;

/// Actor type for metrics labeling.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActorType {
    /// `SfuEngine` (singleton).
    Engine,
    /// `EndpointActor` (one per admitted peer).
    Endpoint,
}

impl ActorType {
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            ActorType::Engine => "engine",
            ActorType::Endpoint => "endpoint",
        }
    }

    #[must_use]
    pub const fn warning_threshold(&self) -> usize {
        match self {
            ActorType::Engine => ENGINE_MAILBOX_WARNING,
            ActorType::Endpoint => ENDPOINT_MAILBOX_WARNING,
        }
    }

    #[must_use]
    pub const fn normal_threshold(&self) -> usize {
        match self {
            ActorType::Engine => ENGINE_MAILBOX_NORMAL,
            ActorType::Endpoint => ENDPOINT_MAILBOX_NORMAL,
        }
    }
}

/// Mailbox depth level for alerting.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MailboxLevel {
    Normal,
    Warning,
    Critical,
}

/// Tracks one actor's queue depth.
///
/// The owning actor passes the receiver's queue length on every dequeue; the monitor
/// keeps the peak, logs threshold crossings, and updates `sfu_actor_mailbox_depth`.
#[derive(Debug)]
pub struct MailboxMonitor {
    actor_type: ActorType,
    actor_id: String,
    depth: AtomicUsize,
    peak_depth: AtomicUsize,
    messages_processed: AtomicU64,
}

impl MailboxMonitor {
    #[must_use]
    pub fn new(actor_type: ActorType, actor_id: impl Into<String>) -> Self {
        Self {
            actor_type,
            actor_id: actor_id.into(),
            depth: AtomicUsize::new(0),
            peak_depth: AtomicUsize::new(0),
            messages_processed: AtomicU64::new(0),
        }
    }

    /// Record that one message was taken off the queue, leaving `remaining` behind.
    pub fn record_dequeue(&self, remaining: usize) {
        self.messages_processed.fetch_add(1, Ordering::Relaxed);
        let previous = self.depth.swap(remaining, Ordering::Relaxed);
        self.peak_depth.fetch_max(remaining, Ordering::Relaxed);

        match self.level_for_depth(remaining) {
            MailboxLevel::Critical => warn!(
                target: "sfu.actor.mailbox",
                actor_type = self.actor_type.as_str(),
                actor_id = %self.actor_id,
                depth = remaining,
                threshold = self.actor_type.warning_threshold(),
                "Mailbox depth critical"
            ),
            // Log once when crossing into the warning band
            MailboxLevel::Warning if previous <= self.actor_type.normal_threshold() => debug!(
                target: "sfu.actor.mailbox",
                actor_type = self.actor_type.as_str(),
                actor_id = %self.actor_id,
                depth = remaining,
                "Mailbox depth elevated"
            ),
            _ => {}
        }

        if self.actor_type == ActorType::Engine {
            prom::set_actor_mailbox_depth(self.actor_type.as_str(), remaining);
        }
    }

    #[must_use]
    pub fn current_depth(&self) -> usize {
        self.depth.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn peak_depth(&self) -> usize {
        self.peak_depth.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn messages_processed(&self) -> u64 {
        self.messages_processed.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn current_level(&self) -> MailboxLevel {
        self.level_for_depth(self.current_depth())
    }

    fn level_for_depth(&self, depth: usize) -> MailboxLevel {
        if depth > self.actor_type.warning_threshold() {
            MailboxLevel::Critical
        } else if depth > self.actor_type.normal_threshold() {
            MailboxLevel::Warning
        } else {
            MailboxLevel::Normal
        }
    }
}

/// Aggregated metrics for the actor system, shared by the engine and its endpoints.
#[derive(Debug, Default)]
pub struct ActorMetrics {
    /// Endpoint actors currently running.
    pub active_endpoints: AtomicUsize,
    /// Total actor panics (indicates bugs).
    pub actor_panics: AtomicU64,
    /// Total messages processed across all actors.
    pub total_messages_processed: AtomicU64,
}

impl ActorMetrics {
    #[must_use]
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn endpoint_started(&self) {
        self.active_endpoints.fetch_add(1, Ordering::Relaxed);
    }

    pub fn endpoint_stopped(&self) {
        let _ = self
            .active_endpoints
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |n| {
                Some(n.saturating_sub(1))
            });
    }

    /// Record an actor panic.
    pub fn record_panic(&self, actor_type: ActorType) {
        self.actor_panics.fetch_add(1, Ordering::Relaxed);
        prom::record_endpoint_failure("panic");
        tracing::error!(
            target: "sfu.actor.panic",
            actor_type = actor_type.as_str(),
            total_panics = self.actor_panics.load(Ordering::Relaxed),
            "Actor panic detected - indicates bug, investigation required"
        );
    }

    pub fn record_message_processed(&self) {
        self.total_messages_processed
            .fetch_add(1, Ordering::Relaxed);
    }

    #[must_use]
    pub fn endpoint_count(&self) -> usize {
        self.active_endpoints.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn panic_count(&self) -> u64 {
        self.actor_panics.load(Ordering::Relaxed)
    }
}
