//! # Reconciler
//!
//! Per-work-item reconcile algorithm for `SecretIntent` resources.
//!
//! For a popped `namespace/name` identity:
//! 1. Look up the intent in the cache; a missing intent was deleted between
//!    enqueue and processing and counts as handled.
//! 2. Generate the desired key/value mapping.
//! 3. Ensure a managed `Secret` with the same identity exists, is owned by
//!    the intent, and carries exactly the generated data.
//!
//! Only cluster API errors from the create/update calls bubble out as
//! [`ReconcileError`] - those are transient infrastructure faults and take
//! the queue's backoff path. Everything else (malformed key, deleted intent,
//! generator failure, ownership conflict) resolves the pass: retrying
//! blindly cannot fix bad or unready input, and those conditions re-trigger
//! themselves through the next relevant change event anyway.
//!
//! All collaborators are injected as trait objects; the reconciler holds no
//! global state and every attempt is idempotent, so concurrent controller
//! instances at worst duplicate reads.

use std::sync::Arc;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::Secret;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{ObjectMeta, OwnerReference};
use k8s_openapi::ByteString;
use kube::api::PostParams;
use kube::runtime::events::EventType;
use kube::{Api, Client};
use thiserror::Error;
use tracing::{debug, error, info, warn};

use super::cache::ClusterCache;
use super::events::{EventSink, REASON_CONFLICT, REASON_CREATED, REASON_UPDATED};
use crate::crd::{SecretIntent, API_GROUP, API_VERSION, INTENT_KIND};
use crate::generator::{GeneratedValues, SecretGenerator};
use crate::observability::metrics;

/// Errors that warrant the queue's backoff-retry path.
#[derive(Debug, Error)]
pub enum ReconcileError {
    #[error("cluster api error: {0}")]
    Api(#[from] kube::Error),
}

/// How a reconcile attempt resolved. Every variant is a success as far as
/// the queue is concerned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// The identity cannot be split into namespace/name; it can never become
    /// valid, so it is treated as handled.
    InvalidKey,
    /// The intent no longer exists; handled.
    IntentGone,
    /// The generator failed; logged and surfaced, resolves on the next
    /// intent or keychain change.
    GenerationFailed,
    /// A managed Secret was created.
    Created,
    /// The managed Secret was rewritten with fresh values.
    Updated,
    /// The managed Secret already matches; no write issued.
    UpToDate,
    /// A Secret exists at the identity but is not owned by the intent;
    /// reported, never mutated, needs an operator.
    Conflict,
}

/// Write access to managed Secrets. Separated from the reconciler so tests
/// can count and fail writes.
#[async_trait]
pub trait SecretWriter: Send + Sync {
    async fn create(&self, secret: &Secret) -> kube::Result<Secret>;
    async fn replace(&self, secret: &Secret) -> kube::Result<Secret>;
}

/// Writer backed by the cluster API.
#[derive(Clone)]
pub struct ApiSecretWriter {
    client: Client,
}

impl std::fmt::Debug for ApiSecretWriter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ApiSecretWriter").finish_non_exhaustive()
    }
}

impl ApiSecretWriter {
    #[must_use]
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    fn api_for(&self, secret: &Secret) -> Api<Secret> {
        let namespace = secret.metadata.namespace.as_deref().unwrap_or_default();
        Api::namespaced(self.client.clone(), namespace)
    }
}

#[async_trait]
impl SecretWriter for ApiSecretWriter {
    async fn create(&self, secret: &Secret) -> kube::Result<Secret> {
        self.api_for(secret)
            .create(&PostParams::default(), secret)
            .await
    }

    async fn replace(&self, secret: &Secret) -> kube::Result<Secret> {
        let name = secret.metadata.name.as_deref().unwrap_or_default();
        self.api_for(secret)
            .replace(name, &PostParams::default(), secret)
            .await
    }
}

/// Drives the per-item algorithm. Constructed once, shared by all workers.
pub struct Reconciler {
    cache: Arc<dyn ClusterCache>,
    writer: Arc<dyn SecretWriter>,
    generator: Arc<dyn SecretGenerator>,
    events: Arc<dyn EventSink>,
}

impl std::fmt::Debug for Reconciler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Reconciler").finish_non_exhaustive()
    }
}

impl Reconciler {
    #[must_use]
    pub fn new(
        cache: Arc<dyn ClusterCache>,
        writer: Arc<dyn SecretWriter>,
        generator: Arc<dyn SecretGenerator>,
        events: Arc<dyn EventSink>,
    ) -> Self {
        Self {
            cache,
            writer,
            generator,
            events,
        }
    }

    /// Reconcile one identity popped from the queue.
    pub async fn reconcile(&self, key: &str) -> Result<Outcome, ReconcileError> {
        let Some((namespace, name)) = split_identity(key) else {
            // A malformed key can never become valid; do not requeue.
            error!(key, "invalid resource key");
            return Ok(Outcome::InvalidKey);
        };

        let Some(intent) = self.cache.intent(namespace, name) else {
            // Deleted between enqueue and processing; not an error.
            debug!(key, "intent no longer exists");
            return Ok(Outcome::IntentGone);
        };

        info!(
            key,
            app = %intent.spec.app,
            env = %intent.spec.environment,
            "checking secret"
        );

        let desired = match self.generator.generate(&intent.spec).await {
            Ok(values) => values,
            Err(e) => {
                // Bad or unready input, not an infrastructure fault: surface
                // it and let the next intent/keychain change retrigger us.
                metrics::increment_generation_failures();
                error!(key, "could not generate secret data: {e:#}");
                return Ok(Outcome::GenerationFailed);
            }
        };
        debug!(key, keys = desired.len(), "generated secret data");

        let Some(existing) = self.cache.managed_secret(namespace, name) else {
            let secret = managed_secret_for(&intent, desired);
            self.writer.create(&secret).await?;
            metrics::increment_secrets_created();
            info!(key, "created secret");
            self.events
                .publish(
                    &intent,
                    EventType::Normal,
                    REASON_CREATED,
                    format!("Created secret: {name}"),
                )
                .await;
            return Ok(Outcome::Created);
        };

        if !controlled_by(&existing, &intent) {
            metrics::increment_ownership_conflicts();
            warn!(key, "secret exists but is not managed by this intent");
            self.events
                .publish(
                    &intent,
                    EventType::Warning,
                    REASON_CONFLICT,
                    format!("Secret {name} already exists and is not managed by a SecretIntent"),
                )
                .await;
            return Ok(Outcome::Conflict);
        }

        if secret_data_equal(existing.data.as_ref(), &desired) {
            debug!(key, "secret is already up-to-date");
            return Ok(Outcome::UpToDate);
        }

        // Preserve the live metadata (resourceVersion, uid, owner reference)
        // and swap in the fresh data.
        let mut updated = (*existing).clone();
        updated.data = Some(desired);
        self.writer.replace(&updated).await?;
        metrics::increment_secrets_updated();
        info!(key, "updated secret");
        self.events
            .publish(
                &intent,
                EventType::Normal,
                REASON_UPDATED,
                format!("Updated secret: {name}"),
            )
            .await;
        Ok(Outcome::Updated)
    }
}

/// Split a `namespace/name` identity. Both halves must be non-empty.
fn split_identity(key: &str) -> Option<(&str, &str)> {
    let (namespace, name) = key.split_once('/')?;
    if namespace.is_empty() || name.is_empty() || name.contains('/') {
        return None;
    }
    Some((namespace, name))
}

/// Build the managed Secret an intent wants, owned by that intent.
fn managed_secret_for(intent: &SecretIntent, data: GeneratedValues) -> Secret {
    Secret {
        metadata: ObjectMeta {
            name: intent.metadata.name.clone(),
            namespace: intent.metadata.namespace.clone(),
            owner_references: Some(vec![OwnerReference {
                api_version: format!("{API_GROUP}/{API_VERSION}"),
                kind: INTENT_KIND.to_owned(),
                name: intent.metadata.name.clone().unwrap_or_default(),
                uid: intent.metadata.uid.clone().unwrap_or_default(),
                controller: Some(true),
                block_owner_deletion: Some(true),
            }]),
            ..ObjectMeta::default()
        },
        data: Some(data),
        ..Secret::default()
    }
}

/// Whether `secret`'s controller owner reference resolves to `intent`.
/// Compares uids when both sides carry one, otherwise kind plus name.
fn controlled_by(secret: &Secret, intent: &SecretIntent) -> bool {
    let Some(owner) = secret
        .metadata
        .owner_references
        .as_ref()
        .and_then(|refs| refs.iter().find(|or| or.controller == Some(true)))
    else {
        return false;
    };
    if let Some(uid) = intent.metadata.uid.as_deref() {
        if !owner.uid.is_empty() {
            return owner.uid == uid;
        }
    }
    owner.kind == INTENT_KIND && Some(owner.name.as_str()) == intent.metadata.name.as_deref()
}

/// Order-independent data comparison: same key set, same bytes per key.
fn secret_data_equal(
    current: Option<&std::collections::BTreeMap<String, ByteString>>,
    desired: &GeneratedValues,
) -> bool {
    let Some(current) = current else {
        return desired.is_empty();
    };
    if current.len() != desired.len() {
        return false;
    }
    desired
        .iter()
        .all(|(key, value)| current.get(key).is_some_and(|c| c.0 == value.0))
}
