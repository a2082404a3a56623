//! Notification dispatcher.
//!
//! A publish/subscribe table scoped to one SFU instance. Any number of subscribers can
//! register under the same topic and every one of them receives each message published
//! to that topic. There is no retained history: a subscriber only sees messages
//! published after it registered.
//!
//! The dispatcher is cheap to clone and safe to use from any task concurrently with
//! publishing.

use crate::types::{PeerId, VoiceActivity};

use dashmap::DashMap;
use serde::Serialize;
use serde_json::Value;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, info};

/// Notification topics.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Topic {
    /// A join is waiting for the admission authority.
    NewPeer,
    PeerAccepted,
    PeerDenied,
    PeerLeft,
    VoiceActivity,
}

impl Topic {
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Topic::NewPeer => "new_peer",
            Topic::PeerAccepted => "peer_accepted",
            Topic::PeerDenied => "peer_denied",
            Topic::PeerLeft => "peer_left",
            Topic::VoiceActivity => "voice_activity",
        }
    }
}

/// Why a peer left the SFU.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LeaveReason {
    /// The peer sent `leave`.
    Left,
    /// The surrounding process asked for the removal.
    Removed,
    /// The peer's media endpoint failed or exited.
    EndpointFailed,
    /// The SFU is shutting down.
    Shutdown,
}

impl LeaveReason {
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            LeaveReason::Left => "left",
            LeaveReason::Removed => "removed",
            LeaveReason::EndpointFailed => "endpoint_failed",
            LeaveReason::Shutdown => "shutdown",
        }
    }
}

/// Message delivered to subscribers.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Notification {
    NewPeer { peer_id: PeerId, metadata: Value },
    PeerAccepted { peer_id: PeerId },
    PeerDenied { peer_id: PeerId },
    PeerLeft { peer_id: PeerId, reason: LeaveReason },
    VoiceActivity {
        peer_id: PeerId,
        activity: VoiceActivity,
    },
}

impl Notification {
    /// The topic this notification is published under.
    #[must_use]
    pub const fn topic(&self) -> Topic {
        match self {
            Notification::NewPeer { .. } => Topic::NewPeer,
            Notification::PeerAccepted { .. } => Topic::PeerAccepted,
            Notification::PeerDenied { .. } => Topic::PeerDenied,
            Notification::PeerLeft { .. } => Topic::PeerLeft,
            Notification::VoiceActivity { .. } => Topic::VoiceActivity,
        }
    }

    #[must_use]
    pub fn peer_id(&self) -> &PeerId {
        match self {
            Notification::NewPeer { peer_id, .. }
            | Notification::PeerAccepted { peer_id }
            | Notification::PeerDenied { peer_id }
            | Notification::PeerLeft { peer_id, .. }
            | Notification::VoiceActivity { peer_id, .. } => peer_id,
        }
    }
}

/// Identifies one registration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriberId(u64);

impl fmt::Display for SubscriberId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "sub-{}", self.0)
    }
}

#[derive(Debug)]
struct Subscriber {
    id: SubscriberId,
    sender: mpsc::UnboundedSender<Notification>,
}

/// Publish/subscribe registry for SFU notifications.
#[derive(Clone, Default)]
pub struct NotificationDispatcher {
    topics: Arc<DashMap<Topic, Vec<Subscriber>>>,
    next_id: Arc<AtomicU64>,
}

impl NotificationDispatcher {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a subscriber for `topic`.
    ///
    /// Dropping the returned receiver is enough to unsubscribe; the entry is pruned on
    /// the next publish to that topic.
    pub fn register(
        &self,
        topic: Topic,
    ) -> (SubscriberId, mpsc::UnboundedReceiver<Notification>) {
        let (sender, receiver) = mpsc::unbounded_channel();
        let id = SubscriberId(self.next_id.fetch_add(1, Ordering::Relaxed));

        self.topics
            .entry(topic)
            .or_default()
            .push(Subscriber { id, sender });

        info!(
            target: "sfu.notifications",
            subscriber = %id,
            topic = topic.as_str(),
            "Subscriber registered"
        );

        (id, receiver)
    }

    /// Remove a subscriber. Returns false if it was not registered.
    pub fn unregister(&self, id: SubscriberId) -> bool {
        let mut removed = false;
        for mut entry in self.topics.iter_mut() {
            let before = entry.value().len();
            entry.value_mut().retain(|sub| sub.id != id);
            removed |= entry.value().len() != before;
        }
        self.topics.retain(|_, subscribers| !subscribers.is_empty());

        if removed {
            info!(
                target: "sfu.notifications",
                subscriber = %id,
                "Subscriber unregistered"
            );
        }
        removed
    }

    /// Deliver `notification` to every subscriber of its topic.
    ///
    /// Returns the number of subscribers that received it.
    pub fn publish(&self, notification: Notification) -> usize {
        let topic = notification.topic();
        let mut delivered = 0;
        let mut closed = Vec::new();

        if let Some(subscribers) = self.topics.get(&topic) {
            for subscriber in subscribers.iter() {
                if subscriber.sender.send(notification.clone()).is_ok() {
                    delivered += 1;
                } else {
                    closed.push(subscriber.id);
                }
            }
        }

        if !closed.is_empty() {
            if let Some(mut subscribers) = self.topics.get_mut(&topic) {
                subscribers.retain(|sub| !closed.contains(&sub.id));
            }
            debug!(
                target: "sfu.notifications",
                topic = topic.as_str(),
                pruned = closed.len(),
                "Pruned closed subscribers"
            );
        }

        debug!(
            target: "sfu.notifications",
            topic = topic.as_str(),
            peer_id = %notification.peer_id(),
            delivered,
            "Notification published"
        );

        delivered
    }

    /// Number of live registrations for `topic`.
    #[must_use]
    pub fn subscriber_count(&self, topic: Topic) -> usize {
        self.topics.get(&topic).map_or(0, |subs| subs.len())
    }
}

impl fmt::Debug for NotificationDispatcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NotificationDispatcher")
            .field("topics", &self.topics.len())
            .finish_non_exhaustive()
    }
}
