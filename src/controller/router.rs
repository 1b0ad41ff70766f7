//! # Event Router
//!
//! Translates raw watch and poll signals into work-queue enqueues.
//!
//! Three kinds of signal arrive on one channel:
//! 1. `SecretIntent` events - the intent's own identity is enqueued.
//! 2. Managed `Secret` events - the controller owner reference is resolved
//!    and the *owner's* identity is enqueued. Deletions arrive with the
//!    last-known object (a tombstone); an unrecoverable tombstone is logged
//!    and dropped, since deletions of unrelated objects are expected.
//! 3. Keychain change signals - fanned out to every known intent whose tier
//!    flag matches the changed keychain.
//!
//! Producers push over an unbounded channel and never wait on reconcile
//! progress; the router is the sole consumer. Re-deliveries whose
//! `resourceVersion` is unchanged from the last routed one are filtered out
//! before enqueueing (resource versions are compared, never content).

use std::collections::HashMap;
use std::sync::Arc;

use k8s_openapi::api::core::v1::Secret;
use kube::Resource;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use super::cache::ClusterCache;
use super::queue::WorkQueue;
use crate::crd::{SecretIntent, API_GROUP, INTENT_KIND};

/// A cache change for one object of kind `K`.
#[derive(Debug, Clone)]
pub enum ResourceEvent<K> {
    /// The object was added or updated.
    Applied(K),
    /// The object was deleted. Carries the last-known state when the watch
    /// could recover it; `None` is an unrecoverable tombstone.
    Deleted(Option<K>),
}

/// Everything the router can receive.
#[derive(Debug, Clone)]
pub enum Signal {
    Intent(ResourceEvent<SecretIntent>),
    Managed(ResourceEvent<Secret>),
    /// A keychain advanced to a new revision; `elevated` is its tier flag.
    KeychainChanged { elevated: bool },
}

/// Consumes [`Signal`]s and enqueues affected intent identities.
pub struct EventRouter {
    queue: Arc<WorkQueue>,
    cache: Arc<dyn ClusterCache>,
    rx: mpsc::UnboundedReceiver<Signal>,
    /// Last routed resourceVersion per intent identity.
    intent_versions: HashMap<String, String>,
    /// Last routed resourceVersion per secret identity.
    secret_versions: HashMap<String, String>,
}

impl std::fmt::Debug for EventRouter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventRouter").finish_non_exhaustive()
    }
}

impl EventRouter {
    #[must_use]
    pub fn new(
        queue: Arc<WorkQueue>,
        cache: Arc<dyn ClusterCache>,
        rx: mpsc::UnboundedReceiver<Signal>,
    ) -> Self {
        Self {
            queue,
            cache,
            rx,
            intent_versions: HashMap::new(),
            secret_versions: HashMap::new(),
        }
    }

    /// Route signals until every sender is gone.
    pub async fn run(mut self) {
        while let Some(signal) = self.rx.recv().await {
            self.route(signal);
        }
        debug!("event router stopped");
    }

    fn route(&mut self, signal: Signal) {
        match signal {
            Signal::Intent(event) => self.route_intent(event),
            Signal::Managed(event) => self.route_managed(event),
            Signal::KeychainChanged { elevated } => self.fan_out(elevated),
        }
    }

    fn route_intent(&mut self, event: ResourceEvent<SecretIntent>) {
        match event {
            ResourceEvent::Applied(intent) => {
                let Some(key) = intent.identity() else {
                    warn!("ignoring SecretIntent without namespace/name");
                    return;
                };
                if self.is_stale_redelivery(&key, intent.meta().resource_version.as_deref(), true) {
                    return;
                }
                self.queue.add(&key);
            }
            ResourceEvent::Deleted(last_known) => {
                // Nothing to reconcile; just drop the version memory so a
                // recreation at the same identity routes cleanly.
                if let Some(key) = last_known.as_ref().and_then(SecretIntent::identity) {
                    self.intent_versions.remove(&key);
                }
            }
        }
    }

    fn route_managed(&mut self, event: ResourceEvent<Secret>) {
        let secret = match event {
            ResourceEvent::Applied(secret) => {
                let key = secret_identity(&secret);
                if let Some(key) = &key {
                    if self.is_stale_redelivery(
                        key,
                        secret.metadata.resource_version.as_deref(),
                        false,
                    ) {
                        return;
                    }
                }
                secret
            }
            ResourceEvent::Deleted(Some(secret)) => {
                if let Some(key) = secret_identity(&secret) {
                    self.secret_versions.remove(&key);
                }
                debug!(
                    secret = secret.metadata.name.as_deref().unwrap_or("unknown"),
                    "recovered secret from tombstone"
                );
                secret
            }
            ResourceEvent::Deleted(None) => {
                // Best effort: nothing recoverable to resolve an owner from.
                warn!("dropping secret tombstone with no recoverable state");
                return;
            }
        };

        let Some(owner) = controlling_intent_name(&secret) else {
            // Foreign secret; none of our business.
            return;
        };
        let Some(namespace) = secret.metadata.namespace.as_deref() else {
            return;
        };
        self.queue.add(&format!("{namespace}/{owner}"));
    }

    /// The only many-to-one fan-out: enqueue every intent whose tier flag
    /// matches the changed keychain.
    fn fan_out(&self, elevated: bool) {
        let mut enqueued = 0usize;
        for intent in self.cache.intents() {
            if intent.spec.elevated != elevated {
                continue;
            }
            if let Some(key) = intent.identity() {
                self.queue.add(&key);
                enqueued += 1;
            }
        }
        debug!(elevated, enqueued, "fanned out keychain change");
    }

    /// Record the resource version for `key` and report whether this delivery
    /// repeats the previous one. Watches re-deliver unchanged objects
    /// periodically; re-running reconciliation for those is pure waste.
    fn is_stale_redelivery(&mut self, key: &str, version: Option<&str>, intent: bool) -> bool {
        let Some(version) = version else {
            return false;
        };
        let versions = if intent {
            &mut self.intent_versions
        } else {
            &mut self.secret_versions
        };
        match versions.insert(key.to_owned(), version.to_owned()) {
            Some(previous) => previous == version,
            None => false,
        }
    }
}

fn secret_identity(secret: &Secret) -> Option<String> {
    let name = secret.metadata.name.as_deref()?;
    let namespace = secret.metadata.namespace.as_deref()?;
    Some(format!("{namespace}/{name}"))
}

/// Name of the `SecretIntent` controlling this secret, if any.
fn controlling_intent_name(secret: &Secret) -> Option<&str> {
    secret
        .metadata
        .owner_references
        .as_ref()?
        .iter()
        .find(|or| or.controller == Some(true))
        .filter(|or| {
            or.kind == INTENT_KIND
                && or
                    .api_version
                    .split('/')
                    .next()
                    .is_some_and(|group| group == API_GROUP)
        })
        .map(|or| or.name.as_str())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::controller::testutil::{intent, secret, spec, FakeCache};
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference;

    fn router_parts() -> (
        Arc<WorkQueue>,
        Arc<FakeCache>,
        EventRouter,
        mpsc::UnboundedSender<Signal>,
    ) {
        let queue = WorkQueue::new();
        let cache = Arc::new(FakeCache::default());
        let (tx, rx) = mpsc::unbounded_channel();
        let router = EventRouter::new(
            Arc::clone(&queue),
            Arc::clone(&cache) as Arc<dyn ClusterCache>,
            rx,
        );
        (queue, cache, router, tx)
    }

    async fn drain(queue: &Arc<WorkQueue>) -> Vec<String> {
        let mut keys = Vec::new();
        while let Some(key) = {
            if queue.is_empty() {
                None
            } else {
                queue.next().await
            }
        } {
            queue.mark_done(&key);
            keys.push(key);
        }
        keys.sort();
        keys
    }

    #[tokio::test]
    async fn intent_events_enqueue_their_own_identity() {
        let (queue, _cache, router, tx) = router_parts();
        tx.send(Signal::Intent(ResourceEvent::Applied(intent(
            "a",
            "s1",
            spec("foo", "prod"),
        ))))
        .unwrap();
        drop(tx);
        router.run().await;

        assert_eq!(drain(&queue).await, vec!["a/s1"]);
    }

    #[tokio::test]
    async fn unchanged_resource_version_is_filtered() {
        let (queue, _cache, mut router, _tx) = router_parts();
        let obj = intent("a", "s1", spec("foo", "prod"));

        router.route(Signal::Intent(ResourceEvent::Applied(obj.clone())));
        assert_eq!(queue.next().await.as_deref(), Some("a/s1"));
        queue.mark_done("a/s1");

        // Same resourceVersion again: a no-op re-delivery, not enqueued.
        router.route(Signal::Intent(ResourceEvent::Applied(obj.clone())));
        assert!(queue.is_empty());

        // A real update routes as usual.
        let mut bumped = obj;
        bumped.metadata.resource_version = Some("2".to_owned());
        router.route(Signal::Intent(ResourceEvent::Applied(bumped)));
        assert_eq!(queue.len(), 1);
    }

    #[tokio::test]
    async fn unchanged_secret_version_is_filtered() {
        let (queue, _cache, mut router, _tx) = router_parts();
        let owner = intent("a", "s1", spec("foo", "prod"));
        let owned = secret("a", "s1", Some(&owner), &[("K", b"v")]);

        router.route(Signal::Managed(ResourceEvent::Applied(owned.clone())));
        assert_eq!(queue.next().await.as_deref(), Some("a/s1"));
        queue.mark_done("a/s1");

        router.route(Signal::Managed(ResourceEvent::Applied(owned)));
        assert!(queue.is_empty());
    }

    #[tokio::test]
    async fn secret_events_enqueue_the_owning_intent() {
        let (queue, _cache, router, tx) = router_parts();
        let owner = intent("a", "s1", spec("foo", "prod"));
        let owned = secret("a", "s1", Some(&owner), &[("K", b"v")]);
        tx.send(Signal::Managed(ResourceEvent::Applied(owned)))
            .unwrap();
        drop(tx);
        router.run().await;

        assert_eq!(drain(&queue).await, vec!["a/s1"]);
    }

    #[tokio::test]
    async fn foreign_secrets_are_ignored() {
        let (queue, _cache, router, tx) = router_parts();
        // No owner reference at all.
        tx.send(Signal::Managed(ResourceEvent::Applied(secret(
            "a",
            "plain",
            None,
            &[],
        ))))
        .unwrap();
        // Controller owner of a different kind.
        let mut deploy_owned = secret("a", "app-tls", None, &[]);
        deploy_owned.metadata.owner_references = Some(vec![OwnerReference {
            api_version: "apps/v1".to_owned(),
            kind: "Deployment".to_owned(),
            name: "app".to_owned(),
            uid: "u1".to_owned(),
            controller: Some(true),
            block_owner_deletion: None,
        }]);
        tx.send(Signal::Managed(ResourceEvent::Applied(deploy_owned)))
            .unwrap();
        drop(tx);
        router.run().await;

        assert!(queue.is_empty());
    }

    #[tokio::test]
    async fn tombstone_resolves_to_the_owning_intent() {
        let (queue, _cache, router, tx) = router_parts();
        let owner = intent("a", "s1", spec("foo", "prod"));
        let deleted = secret("a", "s1", Some(&owner), &[("K", b"v")]);
        tx.send(Signal::Managed(ResourceEvent::Deleted(Some(deleted))))
            .unwrap();
        drop(tx);
        router.run().await;

        assert_eq!(drain(&queue).await, vec!["a/s1"]);
    }

    #[tokio::test]
    async fn unrecoverable_tombstone_is_dropped() {
        let (queue, _cache, router, tx) = router_parts();
        tx.send(Signal::Managed(ResourceEvent::Deleted(None)))
            .unwrap();
        drop(tx);
        router.run().await;

        assert!(queue.is_empty());
    }

    #[tokio::test]
    async fn keychain_fan_out_matches_tier_flag() {
        let (queue, cache, router, tx) = router_parts();
        let mut pro = spec("foo", "prod");
        pro.elevated = true;
        cache.insert_intent(intent("a", "standard-1", spec("foo", "prod")));
        cache.insert_intent(intent("a", "standard-2", spec("bar", "prod")));
        cache.insert_intent(intent("b", "pro-1", pro));

        tx.send(Signal::KeychainChanged { elevated: true }).unwrap();
        drop(tx);
        router.run().await;

        assert_eq!(drain(&queue).await, vec!["b/pro-1"]);
    }

    #[tokio::test]
    async fn keychain_fan_out_standard_tier() {
        let (queue, cache, router, tx) = router_parts();
        let mut pro = spec("foo", "prod");
        pro.elevated = true;
        cache.insert_intent(intent("a", "standard-1", spec("foo", "prod")));
        cache.insert_intent(intent("b", "pro-1", pro));

        tx.send(Signal::KeychainChanged { elevated: false })
            .unwrap();
        drop(tx);
        router.run().await;

        assert_eq!(drain(&queue).await, vec!["a/standard-1"]);
    }

    #[tokio::test]
    async fn intent_delete_clears_version_memory() {
        let (queue, _cache, mut router, _tx) = router_parts();
        let obj = intent("a", "s1", spec("foo", "prod"));

        router.route(Signal::Intent(ResourceEvent::Applied(obj.clone())));
        assert_eq!(queue.next().await.as_deref(), Some("a/s1"));
        queue.mark_done("a/s1");

        router.route(Signal::Intent(ResourceEvent::Deleted(Some(obj.clone()))));
        assert!(queue.is_empty());

        // Recreated with the same resourceVersion must route again.
        router.route(Signal::Intent(ResourceEvent::Applied(obj)));
        assert_eq!(queue.len(), 1);
    }
}
