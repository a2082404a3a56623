//! Scripted admission authority.
//!
//! Subscribes to the `new_peer` topic and answers every join through the engine handle,
//! the same way a real authority would. Decisions can be fixed per peer; peers without
//! a scripted decision get the default.

use sfu_controller::actors::SfuEngineHandle;
use sfu_controller::notifications::{Notification, NotificationDispatcher, Topic};
use sfu_controller::types::PeerId;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tokio::task::JoinHandle;

/// What the authority answers for a join.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    Accept,
    Deny,
    /// Never answer; the join waits for the admission timeout.
    Ignore,
}

/// A running scripted authority. Dropping it stops answering.
pub struct MockAuthority {
    seen: Arc<Mutex<Vec<PeerId>>>,
    task: JoinHandle<()>,
}

impl MockAuthority {
    /// Accept every join.
    #[must_use]
    pub fn accept_all(dispatcher: &NotificationDispatcher, handle: &SfuEngineHandle) -> Self {
        Self::scripted(dispatcher, handle, Decision::Accept, HashMap::new())
    }

    /// Answer `decisions[peer]` for scripted peers and `default` for the rest.
    #[must_use]
    pub fn scripted(
        dispatcher: &NotificationDispatcher,
        handle: &SfuEngineHandle,
        default: Decision,
        decisions: HashMap<PeerId, Decision>,
    ) -> Self {
        let (_, mut new_peers) = dispatcher.register(Topic::NewPeer);
        let handle = handle.clone();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let seen_clone = Arc::clone(&seen);

        let task = tokio::spawn(async move {
            while let Some(notification) = new_peers.recv().await {
                let Notification::NewPeer { peer_id, .. } = notification else {
                    continue;
                };
                seen_clone.lock().unwrap().push(peer_id.clone());

                let decision = decisions.get(&peer_id).copied().unwrap_or(default);
                let result = match decision {
                    Decision::Accept => handle.accept_new_peer(peer_id).await,
                    Decision::Deny => handle.deny_new_peer(peer_id).await,
                    Decision::Ignore => Ok(()),
                };
                if let Err(e) = result {
                    tracing::debug!(error = %e, "mock authority decision not applied");
                }
            }
        });

        Self { seen, task }
    }

    /// Peers the authority was asked about, in order.
    #[must_use]
    pub fn seen(&self) -> Vec<PeerId> {
        self.seen.lock().unwrap().clone()
    }

    pub fn stop(&self) {
        self.task.abort();
    }
}

impl Drop for MockAuthority {
    fn drop(&mut self) {
        self.task.abort();
    }
}
