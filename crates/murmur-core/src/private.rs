//! Two-party private sessions.
//!
//! A session is identified by the canonical ordering of its two
//! participants, so either side derives the same key without any handshake.
//! Subscriptions are per identity: once an identity joined a session, every
//! live connection of that identity receives the session's messages.

use crate::error::ChatError;
use crate::event::{deliver, Event, Outbox, PrivateMessage};
use crate::fanout::validate_text;
use crate::identity::{now_millis, Identity, Sequence};
use crate::registry::ConnectionRegistry;
use crate::store::PrivateMessageStore;
use dashmap::DashMap;
use std::collections::{BTreeSet, HashSet};
use std::fmt;
use std::sync::Arc;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::{debug, trace, warn};

/// Canonical key of a two-party session.
///
/// `low` is the lexicographically smaller identity, `high` the larger. For
/// any pair, `derive(a, b) == derive(b, a)`.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SessionKey {
    low: Identity,
    high: Identity,
}

impl SessionKey {
    /// Derive the key for a pair of identities.
    #[must_use]
    pub fn derive(a: &Identity, b: &Identity) -> Self {
        if a <= b {
            Self {
                low: a.clone(),
                high: b.clone(),
            }
        } else {
            Self {
                low: b.clone(),
                high: a.clone(),
            }
        }
    }
}

impl fmt::Display for SessionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "private:{}:{}", self.low, self.high)
    }
}

/// Live state of one session.
#[derive(Debug)]
struct Session {
    subscribers: BTreeSet<Identity>,
    retired: bool,
}

/// Routes private messages between exactly two participants.
pub struct PrivateRouter {
    registry: Arc<ConnectionRegistry>,
    store: Arc<dyn PrivateMessageStore>,
    sessions: DashMap<SessionKey, Arc<Mutex<Session>>>,
    /// Sessions each identity subscribed to, for disconnect cleanup.
    subscriptions: DashMap<Identity, HashSet<SessionKey>>,
    max_message_length: usize,
}

impl PrivateRouter {
    /// Create a router.
    #[must_use]
    pub fn new(
        registry: Arc<ConnectionRegistry>,
        store: Arc<dyn PrivateMessageStore>,
        max_message_length: usize,
    ) -> Self {
        Self {
            registry,
            store,
            sessions: DashMap::new(),
            subscriptions: DashMap::new(),
            max_message_length,
        }
    }

    async fn lock(&self, key: &SessionKey) -> OwnedMutexGuard<Session> {
        loop {
            let cell = self
                .sessions
                .entry(key.clone())
                .or_insert_with(|| {
                    Arc::new(Mutex::new(Session {
                        subscribers: BTreeSet::new(),
                        retired: false,
                    }))
                })
                .clone();
            let guard = cell.lock_owned().await;
            if !guard.retired {
                return guard;
            }
        }
    }

    fn release(&self, key: &SessionKey, mut guard: OwnedMutexGuard<Session>) {
        if !guard.subscribers.is_empty() {
            return;
        }
        guard.retired = true;
        let mine = OwnedMutexGuard::mutex(&guard);
        self.sessions.remove_if(key, |_, cell| Arc::ptr_eq(cell, mine));
    }

    fn check_pair(from: &Identity, to: &Identity) -> Result<(), ChatError> {
        if from == to {
            return Err(ChatError::MalformedPayload(
                "Private session needs two distinct identities",
            ));
        }
        Ok(())
    }

    /// Subscribe `identity` to its session with `other`. Idempotent.
    ///
    /// # Errors
    ///
    /// Returns [`ChatError::MalformedPayload`] if both identities are equal.
    pub async fn join(&self, identity: &Identity, other: &Identity) -> Result<SessionKey, ChatError> {
        Self::check_pair(identity, other)?;
        let key = SessionKey::derive(identity, other);

        let mut guard = self.lock(&key).await;
        if guard.subscribers.insert(identity.clone()) {
            debug!(session = %key, identity = %identity, "Subscribed to private session");
        }
        // Recorded even when already subscribed: a concurrent
        // `unsubscribe_all` may have taken the index entry already.
        self.record_subscription(identity, &key);
        drop(guard);

        Ok(key)
    }

    /// Persist a private message and deliver it to subscribed participants.
    ///
    /// # Errors
    ///
    /// Returns [`ChatError::MalformedPayload`] or
    /// [`ChatError::PersistenceFailure`]. On error nothing is delivered.
    pub async fn send(&self, from: &Identity, to: &Identity, text: &str) -> Result<Sequence, ChatError> {
        Self::check_pair(from, to)?;
        validate_text(text, self.max_message_length)?;
        let key = SessionKey::derive(from, to);

        let guard = self.lock(&key).await;
        let timestamp = now_millis();

        let sequence = match self.store.persist(from, to, text, timestamp).await {
            Ok(sequence) => sequence,
            Err(e) => {
                warn!(session = %key, error = %e, "Persist failed, private message dropped");
                self.release(&key, guard);
                return Err(e.into());
            }
        };

        let targets: Vec<Outbox> = guard
            .subscribers
            .iter()
            .flat_map(|identity| self.registry.outboxes_of(identity))
            .collect();
        let recipients = deliver(
            Event::PrivateMessage(PrivateMessage {
                from: from.clone(),
                to: to.clone(),
                text: text.to_string(),
                timestamp,
                sequence,
            }),
            &targets,
        );
        self.release(&key, guard);

        trace!(session = %key, sequence, recipients, "Private message delivered");
        Ok(sequence)
    }

    /// Full history of the session between `identity` and `other`.
    ///
    /// # Errors
    ///
    /// Returns [`ChatError::PersistenceFailure`] if the store fails.
    pub async fn history(
        &self,
        identity: &Identity,
        other: &Identity,
    ) -> Result<Vec<PrivateMessage>, ChatError> {
        let key = SessionKey::derive(identity, other);
        Ok(self.store.query(&key).await?)
    }

    fn record_subscription(&self, identity: &Identity, key: &SessionKey) {
        self.subscriptions
            .entry(identity.clone())
            .or_default()
            .insert(key.clone());
    }

    /// Drop every subscription of an identity that went offline.
    ///
    /// If the identity reconnects while this runs, the sessions it is still
    /// subscribed to are kept.
    pub async fn unsubscribe_all(&self, identity: &Identity) {
        let Some((_, keys)) = self.subscriptions.remove(identity) else {
            return;
        };
        let mut kept = 0usize;
        for key in keys {
            let mut guard = self.lock(&key).await;
            if self.registry.is_online(identity) {
                if guard.subscribers.contains(identity) {
                    self.record_subscription(identity, &key);
                    kept += 1;
                }
            } else {
                guard.subscribers.remove(identity);
            }
            self.release(&key, guard);
        }
        debug!(identity = %identity, kept, "Dropped private subscriptions");
    }

    /// Check if `identity` is subscribed to `key`.
    #[must_use]
    pub fn is_subscribed(&self, identity: &Identity, key: &SessionKey) -> bool {
        self.subscriptions
            .get(identity)
            .map(|keys| keys.contains(key))
            .unwrap_or(false)
    }

    /// Number of sessions with at least one subscriber.
    #[must_use]
    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::StoreError;
    use crate::event::outbox;
    use crate::memory::MemoryPrivateStore;
    use async_trait::async_trait;

    struct BrokenStore;

    #[async_trait]
    impl PrivateMessageStore for BrokenStore {
        async fn persist(
            &self,
            _from: &Identity,
            _to: &Identity,
            _text: &str,
            _timestamp: u64,
        ) -> Result<Sequence, StoreError> {
            Err(StoreError::Unavailable("offline".into()))
        }

        async fn query(&self, _key: &SessionKey) -> Result<Vec<PrivateMessage>, StoreError> {
            Err(StoreError::Unavailable("offline".into()))
        }
    }

    fn router() -> (PrivateRouter, Arc<ConnectionRegistry>) {
        let registry = Arc::new(ConnectionRegistry::new());
        let router = PrivateRouter::new(
            Arc::clone(&registry),
            Arc::new(MemoryPrivateStore::new()),
            4096,
        );
        (router, registry)
    }

    #[test]
    fn test_key_is_commutative() {
        let pairs = [("alice", "bob"), ("bob", "alice"), ("x", "xy"), ("Z", "a")];
        for (a, b) in pairs {
            let (a, b) = (Identity::from(a), Identity::from(b));
            assert_eq!(SessionKey::derive(&a, &b), SessionKey::derive(&b, &a));
        }
    }

    #[test]
    fn test_key_orders_participants() {
        let key = SessionKey::derive(&"bob".into(), &"alice".into());
        assert_eq!(key.to_string(), "private:alice:bob");
        assert_eq!(key, SessionKey::derive(&"alice".into(), &"bob".into()));
    }

    #[tokio::test]
    async fn test_self_session_rejected() {
        let (router, _) = router();
        let alice = Identity::from("alice");
        assert!(matches!(
            router.join(&alice, &alice).await,
            Err(ChatError::MalformedPayload(_))
        ));
        assert!(matches!(
            router.send(&alice, &alice, "hi").await,
            Err(ChatError::MalformedPayload(_))
        ));
    }

    #[tokio::test]
    async fn test_only_subscribers_receive() {
        let (router, registry) = router();
        let (alice, bob) = (Identity::from("alice"), Identity::from("bob"));
        let (tx_a, mut rx_a) = outbox();
        let (tx_b, mut rx_b) = outbox();
        registry.bind(&"c1".into(), &alice, tx_a).unwrap();
        registry.bind(&"c2".into(), &bob, tx_b).unwrap();

        let key = router.join(&alice, &bob).await.unwrap();
        assert!(router.is_subscribed(&alice, &key));
        assert!(!router.is_subscribed(&bob, &key));

        assert_eq!(router.send(&alice, &bob, "psst").await.unwrap(), 1);
        assert!(rx_a.try_recv().is_ok());
        assert!(rx_b.try_recv().is_err());

        router.join(&bob, &alice).await.unwrap();
        assert_eq!(router.send(&bob, &alice, "hey").await.unwrap(), 2);
        assert!(rx_a.try_recv().is_ok());
        assert!(matches!(&*rx_b.try_recv().unwrap(), Event::PrivateMessage(m) if m.text == "hey"));
    }

    #[tokio::test]
    async fn test_join_is_idempotent() {
        let (router, registry) = router();
        let (alice, bob) = (Identity::from("alice"), Identity::from("bob"));
        let (tx, mut rx) = outbox();
        registry.bind(&"c1".into(), &alice, tx).unwrap();

        router.join(&alice, &bob).await.unwrap();
        router.join(&alice, &bob).await.unwrap();
        router.send(&bob, &alice, "once").await.unwrap();

        assert!(rx.try_recv().is_ok());
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_unsubscribe_all_retires_sessions() {
        let (router, _) = router();
        let (alice, bob) = (Identity::from("alice"), Identity::from("bob"));

        router.join(&alice, &bob).await.unwrap();
        assert_eq!(router.session_count(), 1);

        router.unsubscribe_all(&alice).await;
        assert_eq!(router.session_count(), 0);
        assert!(!router.is_subscribed(&alice, &SessionKey::derive(&alice, &bob)));
    }

    #[tokio::test]
    async fn test_history_survives_absent_recipient() {
        let (router, _) = router();
        let (alice, bob) = (Identity::from("alice"), Identity::from("bob"));

        router.send(&alice, &bob, "while you were out").await.unwrap();
        assert_eq!(router.session_count(), 0);

        let history = router.history(&bob, &alice).await.unwrap();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].from, alice);
    }

    #[tokio::test]
    async fn test_failed_persist_delivers_nothing() {
        let registry = Arc::new(ConnectionRegistry::new());
        let router = PrivateRouter::new(Arc::clone(&registry), Arc::new(BrokenStore), 4096);
        let (alice, bob) = (Identity::from("alice"), Identity::from("bob"));
        let (tx_a, mut rx_a) = outbox();
        let (tx_b, mut rx_b) = outbox();
        registry.bind(&"c1".into(), &alice, tx_a).unwrap();
        registry.bind(&"c2".into(), &bob, tx_b).unwrap();

        router.join(&alice, &bob).await.unwrap();
        router.join(&bob, &alice).await.unwrap();

        assert!(matches!(
            router.send(&alice, &bob, "lost").await,
            Err(ChatError::PersistenceFailure(_))
        ));
        assert!(rx_a.try_recv().is_err());
        assert!(rx_b.try_recv().is_err());
        assert_eq!(router.session_count(), 1);
    }

    #[tokio::test]
    async fn test_reconnect_during_teardown_keeps_subscription() {
        let (router, registry) = router();
        let (alice, bob) = (Identity::from("alice"), Identity::from("bob"));
        let key = router.join(&alice, &bob).await.unwrap();

        // Hold the session so teardown stalls after taking the index entry.
        let guard = router.lock(&key).await;
        let teardown = router.unsubscribe_all(&alice);
        tokio::pin!(teardown);
        assert!(futures_util::poll!(teardown.as_mut()).is_pending());
        assert!(!router.is_subscribed(&alice, &key));

        // Alice comes back while teardown is parked.
        let (tx, mut rx) = outbox();
        registry.bind(&"c2".into(), &alice, tx).unwrap();
        drop(guard);
        teardown.await;

        assert!(router.is_subscribed(&alice, &key));
        router.send(&bob, &alice, "welcome back").await.unwrap();
        assert!(matches!(&*rx.try_recv().unwrap(), Event::PrivateMessage(m) if m.text == "welcome back"));
    }

    #[tokio::test]
    async fn test_join_rerecords_subscription_while_subscribed() {
        let (router, registry) = router();
        let (alice, bob) = (Identity::from("alice"), Identity::from("bob"));
        let (tx, _rx) = outbox();
        registry.bind(&"c1".into(), &alice, tx).unwrap();
        let key = router.join(&alice, &bob).await.unwrap();

        // Index entry gone, session membership still present.
        router.subscriptions.remove(&alice);
        router.join(&alice, &bob).await.unwrap();
        assert!(router.is_subscribed(&alice, &key));

        router.unsubscribe_all(&alice).await;
        assert!(router.is_subscribed(&alice, &key));
        assert_eq!(router.session_count(), 1);
    }
}
