//! # Cache Facade
//!
//! Read-only, eventually-consistent view over the two watched kinds:
//! `SecretIntent` resources and managed `Secret` objects.
//!
//! The engine only ever reads through this facade; mutations go to the API
//! server and come back through watch delivery. The production implementation
//! wraps the reflector stores fed by the watch streams; tests substitute an
//! in-memory fake.

use std::sync::Arc;

use anyhow::Context;
use async_trait::async_trait;
use k8s_openapi::api::core::v1::Secret;
use kube_runtime::reflector::{ObjectRef, Store};

use crate::crd::SecretIntent;

/// Read access to the local caches of both watched kinds.
#[async_trait]
pub trait ClusterCache: Send + Sync {
    /// Look up a `SecretIntent` by identity. `None` when the cache has no
    /// such object (deleted, or never existed).
    fn intent(&self, namespace: &str, name: &str) -> Option<Arc<SecretIntent>>;

    /// Look up a managed `Secret` by identity.
    fn managed_secret(&self, namespace: &str, name: &str) -> Option<Arc<Secret>>;

    /// All currently-known intents, across namespaces.
    fn intents(&self) -> Vec<Arc<SecretIntent>>;

    /// Resolve once both underlying caches have completed their initial list.
    async fn wait_synced(&self) -> anyhow::Result<()>;
}

/// Cache facade backed by the reflector stores the watch pumps feed.
pub struct StoreCache {
    intents: Store<SecretIntent>,
    secrets: Store<Secret>,
}

impl std::fmt::Debug for StoreCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StoreCache").finish_non_exhaustive()
    }
}

impl StoreCache {
    #[must_use]
    pub fn new(intents: Store<SecretIntent>, secrets: Store<Secret>) -> Self {
        Self { intents, secrets }
    }
}

#[async_trait]
impl ClusterCache for StoreCache {
    fn intent(&self, namespace: &str, name: &str) -> Option<Arc<SecretIntent>> {
        self.intents
            .get(&ObjectRef::new(name).within(namespace))
    }

    fn managed_secret(&self, namespace: &str, name: &str) -> Option<Arc<Secret>> {
        self.secrets
            .get(&ObjectRef::new(name).within(namespace))
    }

    fn intents(&self) -> Vec<Arc<SecretIntent>> {
        self.intents.state()
    }

    async fn wait_synced(&self) -> anyhow::Result<()> {
        self.intents
            .wait_until_ready()
            .await
            .context("SecretIntent cache never became ready")?;
        self.secrets
            .wait_until_ready()
            .await
            .context("Secret cache never became ready")?;
        Ok(())
    }
}
