//! # Controller Engine
//!
//! The event-driven reconciliation engine: watch pumps feeding the event
//! router, the deduplicating work queue, and the worker pool that drives the
//! per-item reconciler.
//!
//! Layout mirrors the data flow: resource events and keychain signals ->
//! [`router::EventRouter`] -> [`queue::WorkQueue`] -> [`reconciler::Reconciler`]
//! -> cluster API writes.

pub mod backoff;
pub mod cache;
pub mod events;
pub mod queue;
pub mod reconciler;
pub mod router;

#[cfg(test)]
pub(crate) mod testutil;

use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Context as _;
use futures::StreamExt;
use k8s_openapi::api::core::v1::Secret;
use kube::{Api, Client};
use kube_runtime::reflector::{self, Store};
use kube_runtime::{watcher, WatchStreamExt};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::crd::SecretIntent;
use crate::observability::metrics;
use cache::{ClusterCache, StoreCache};
use queue::WorkQueue;
use reconciler::Reconciler;
use router::{EventRouter, ResourceEvent, Signal};

/// Component name used for event reporting.
pub const CONTROLLER_NAME: &str = "keychain-secrets-controller";

/// Start the watch/reflector pumps for both kinds, feeding the signal
/// channel, and return the cache facade over their stores.
pub fn spawn_watch_pumps(
    client: &Client,
    tx: &mpsc::UnboundedSender<Signal>,
) -> (StoreCache, Vec<JoinHandle<()>>) {
    let intents: Api<SecretIntent> = Api::all(client.clone());
    let secrets: Api<Secret> = Api::all(client.clone());

    let (intent_store, intent_pump) = spawn_pump(intents, tx.clone(), Signal::Intent);
    let (secret_store, secret_pump) = spawn_pump(secrets, tx.clone(), Signal::Managed);

    (
        StoreCache::new(intent_store, secret_store),
        vec![intent_pump, secret_pump],
    )
}

/// Watch one kind into a reflector store, forwarding each change to the
/// router. Deletions forward the last-known object the watch delivered.
fn spawn_pump<K>(
    api: Api<K>,
    tx: mpsc::UnboundedSender<Signal>,
    wrap: fn(ResourceEvent<K>) -> Signal,
) -> (Store<K>, JoinHandle<()>)
where
    K: kube::Resource + Clone + std::fmt::Debug + serde::de::DeserializeOwned + Send + Sync + 'static,
    K::DynamicType: Default + Eq + std::hash::Hash + Clone,
{
    let (reader, writer) = reflector::store();
    let stream = watcher(api, watcher::Config::default()).default_backoff();
    let rf = reflector::reflector(writer, stream);
    let handle = tokio::spawn(async move {
        futures::pin_mut!(rf);
        while let Some(event) = rf.next().await {
            let forwarded = match event {
                Ok(watcher::Event::Apply(obj) | watcher::Event::InitApply(obj)) => {
                    tx.send(wrap(ResourceEvent::Applied(obj)))
                }
                Ok(watcher::Event::Delete(obj)) => tx.send(wrap(ResourceEvent::Deleted(Some(obj)))),
                Ok(watcher::Event::Init | watcher::Event::InitDone) => Ok(()),
                Err(e) => {
                    // The watcher restarts itself; nothing to forward.
                    warn!("watch stream error: {e}");
                    Ok(())
                }
            };
            if forwarded.is_err() {
                // Router gone; we are shutting down.
                break;
            }
        }
        debug!("watch pump stopped");
    });
    (reader, handle)
}

/// The assembled engine: queue, cache facade, and reconciler.
pub struct Controller {
    pub queue: Arc<WorkQueue>,
    pub cache: Arc<dyn ClusterCache>,
    pub reconciler: Arc<Reconciler>,
}

impl std::fmt::Debug for Controller {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Controller").finish_non_exhaustive()
    }
}

impl Controller {
    /// Run the engine: gate on cache sync, then serve the queue with a
    /// fixed-size worker pool until [`WorkQueue::shut_down`] drains it.
    ///
    /// Failing to reach cache sync within `startup_deadline` is the one
    /// fatal error in the system.
    pub async fn run(
        &self,
        workers: usize,
        router: EventRouter,
        startup_deadline: Duration,
    ) -> anyhow::Result<()> {
        info!("waiting for caches to sync");
        tokio::time::timeout(startup_deadline, self.cache.wait_synced())
            .await
            .context("timed out waiting for caches to sync")??;

        let router_task = tokio::spawn(router.run());

        info!(count = workers, "starting workers");
        let mut worker_tasks = Vec::with_capacity(workers);
        for worker in 0..workers {
            let queue = Arc::clone(&self.queue);
            let reconciler = Arc::clone(&self.reconciler);
            worker_tasks.push(tokio::spawn(worker_loop(worker, queue, reconciler)));
        }

        for task in worker_tasks {
            let _ = task.await;
        }
        info!("workers stopped");
        router_task.abort();
        Ok(())
    }
}

/// Pull identities off the queue until shutdown. Success clears the item's
/// backoff; an API error sends it down the delayed-retry path. `mark_done`
/// runs either way so dirty items get their redelivery.
async fn worker_loop(worker: usize, queue: Arc<WorkQueue>, reconciler: Arc<Reconciler>) {
    while let Some(key) = queue.next().await {
        metrics::increment_reconciliations();
        let start = Instant::now();
        match reconciler.reconcile(&key).await {
            Ok(outcome) => {
                queue.forget(&key);
                debug!(worker, key, ?outcome, "processed item");
            }
            Err(e) => {
                metrics::increment_reconciliation_errors();
                error!(worker, key, "could not process item: {e}");
                queue.add_after_failure(&key);
            }
        }
        metrics::observe_reconciliation_duration(start.elapsed().as_secs_f64());
        queue.mark_done(&key);
    }
    debug!(worker, "worker stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::controller::events::test_support::MemoryEventSink;
    use crate::controller::events::EventSink;
    use crate::controller::reconciler::SecretWriter;
    use crate::controller::testutil::{intent, spec, FakeCache};
    use crate::generator::{GeneratedValues, SecretGenerator};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct EmptyGenerator;

    #[async_trait]
    impl SecretGenerator for EmptyGenerator {
        async fn generate(
            &self,
            _spec: &crate::crd::SecretIntentSpec,
        ) -> anyhow::Result<GeneratedValues> {
            Ok(GeneratedValues::new())
        }
    }

    #[derive(Default)]
    struct CountingWriter {
        creates: AtomicUsize,
    }

    #[async_trait]
    impl SecretWriter for CountingWriter {
        async fn create(&self, secret: &Secret) -> kube::Result<Secret> {
            self.creates.fetch_add(1, Ordering::Relaxed);
            Ok(secret.clone())
        }

        async fn replace(&self, secret: &Secret) -> kube::Result<Secret> {
            Ok(secret.clone())
        }
    }

    #[tokio::test]
    async fn workers_drain_the_queue_and_stop_at_shutdown() {
        let queue = WorkQueue::new();
        let cache = Arc::new(FakeCache::default());
        cache.insert_intent(intent("a", "s1", spec("foo", "prod")));
        cache.insert_intent(intent("a", "s2", spec("bar", "prod")));
        let writer = Arc::new(CountingWriter::default());
        let reconciler = Arc::new(Reconciler::new(
            Arc::clone(&cache) as Arc<dyn ClusterCache>,
            Arc::clone(&writer) as Arc<dyn SecretWriter>,
            Arc::new(EmptyGenerator),
            Arc::new(MemoryEventSink::default()) as Arc<dyn EventSink>,
        ));

        queue.add("a/s1");
        queue.add("a/s2");

        let worker = tokio::spawn(worker_loop(
            0,
            Arc::clone(&queue),
            Arc::clone(&reconciler),
        ));

        // Give the worker a chance to drain, then stop delivery.
        while !queue.is_empty() {
            tokio::task::yield_now().await;
        }
        tokio::task::yield_now().await;
        queue.shut_down();
        worker.await.unwrap();

        assert_eq!(writer.creates.load(Ordering::Relaxed), 2);
    }
}
