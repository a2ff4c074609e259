use std::{collections::HashMap, sync::Arc};

use common::api::Snapshot;
use tokio::sync::{mpsc, RwLock};
use uuid::Uuid;

use crate::telemetry;

/// Snapshots waiting for an agent. One slot is enough: the channel only
/// has to hold the value the session has not picked up yet.
pub const DELIVERY_CHANNEL_CAPACITY: usize = 1;

/// Connected agents keyed by identity (their remote address).
#[derive(Clone, Default)]
pub struct SubscriberRegistry {
    inner: Arc<RwLock<HashMap<String, Subscriber>>>,
}

#[derive(Clone, Debug)]
pub struct Subscriber {
    /// Distinguishes successive sessions registered under the same identity.
    pub session_id: Uuid,
    pub sender: mpsc::Sender<Arc<Snapshot>>,
}

impl SubscriberRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a fresh delivery channel for `name`.
    ///
    /// A previous entry under the same name is replaced; dropping its sender
    /// closes the older session's channel.
    pub async fn register(&self, name: &str) -> (Uuid, mpsc::Receiver<Arc<Snapshot>>) {
        let (sender, receiver) = mpsc::channel(DELIVERY_CHANNEL_CAPACITY);
        let session_id = Uuid::new_v4();
        let mut guard = self.inner.write().await;
        guard.insert(
            name.to_string(),
            Subscriber { session_id, sender },
        );
        telemetry::record_subscribers(guard.len());
        (session_id, receiver)
    }

    /// Removes `name` if it is still owned by `session_id`.
    pub async fn remove(&self, name: &str, session_id: Uuid, reason: &str) -> bool {
        let mut guard = self.inner.write().await;
        let owned = guard
            .get(name)
            .is_some_and(|subscriber| subscriber.session_id == session_id);
        if !owned {
            return false;
        }
        guard.remove(name);
        telemetry::record_subscriber_removed(reason);
        telemetry::record_subscribers(guard.len());
        true
    }

    /// Stable copy of the current subscribers, taken without holding the lock
    /// past the clone.
    pub async fn snapshot(&self) -> Vec<(String, Subscriber)> {
        let guard = self.inner.read().await;
        guard
            .iter()
            .map(|(name, subscriber)| (name.clone(), subscriber.clone()))
            .collect()
    }

    pub async fn contains(&self, name: &str) -> bool {
        self.inner.read().await.contains_key(name)
    }

    pub async fn len(&self) -> usize {
        self.inner.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.inner.read().await.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn register_and_remove_round_trip() {
        let registry = SubscriberRegistry::new();
        let (session, _rx) = registry.register("10.0.0.1:5000").await;
        assert!(registry.contains("10.0.0.1:5000").await);
        assert_eq!(registry.len().await, 1);

        assert!(registry.remove("10.0.0.1:5000", session, "disconnect").await);
        assert!(registry.is_empty().await);
    }

    #[tokio::test]
    async fn stale_session_cannot_remove_newer_registration() {
        let registry = SubscriberRegistry::new();
        let (old_session, mut old_rx) = registry.register("agent").await;
        let (new_session, _new_rx) = registry.register("agent").await;
        assert_ne!(old_session, new_session);

        // The replaced sender is gone, so the old session sees its channel close.
        assert!(old_rx.recv().await.is_none());

        assert!(!registry.remove("agent", old_session, "disconnect").await);
        assert!(registry.contains("agent").await);
        assert!(registry.remove("agent", new_session, "disconnect").await);
    }

    #[tokio::test]
    async fn snapshot_is_detached_from_registry() {
        let registry = SubscriberRegistry::new();
        let (a, _ra) = registry.register("a").await;
        let (_b, _rb) = registry.register("b").await;

        let copy = registry.snapshot().await;
        registry.remove("a", a, "timeout").await;

        let mut names: Vec<_> = copy.into_iter().map(|(name, _)| name).collect();
        names.sort();
        assert_eq!(names, vec!["a", "b"]);
        assert_eq!(registry.len().await, 1);
    }
}
