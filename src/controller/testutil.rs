//! Shared fakes and object builders for controller tests.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use k8s_openapi::api::core::v1::Secret;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference;
use k8s_openapi::ByteString;

use super::cache::ClusterCache;
use crate::crd::{SecretIntent, SecretIntentSpec, API_GROUP, API_VERSION, INTENT_KIND};

/// In-memory cache facade keyed by `namespace/name`.
#[derive(Default)]
pub(crate) struct FakeCache {
    intents: Mutex<HashMap<String, Arc<SecretIntent>>>,
    secrets: Mutex<HashMap<String, Arc<Secret>>>,
}

impl FakeCache {
    pub fn insert_intent(&self, intent: SecretIntent) {
        let key = intent.identity().expect("test intent needs ns/name");
        self.intents.lock().unwrap().insert(key, Arc::new(intent));
    }

    pub fn insert_secret(&self, secret: Secret) {
        let key = format!(
            "{}/{}",
            secret.metadata.namespace.as_deref().unwrap_or_default(),
            secret.metadata.name.as_deref().unwrap_or_default()
        );
        self.secrets.lock().unwrap().insert(key, Arc::new(secret));
    }
}

#[async_trait]
impl ClusterCache for FakeCache {
    fn intent(&self, namespace: &str, name: &str) -> Option<Arc<SecretIntent>> {
        self.intents
            .lock()
            .unwrap()
            .get(&format!("{namespace}/{name}"))
            .cloned()
    }

    fn managed_secret(&self, namespace: &str, name: &str) -> Option<Arc<Secret>> {
        self.secrets
            .lock()
            .unwrap()
            .get(&format!("{namespace}/{name}"))
            .cloned()
    }

    fn intents(&self) -> Vec<Arc<SecretIntent>> {
        self.intents.lock().unwrap().values().cloned().collect()
    }

    async fn wait_synced(&self) -> anyhow::Result<()> {
        Ok(())
    }
}

/// Build an intent with identity, uid, and resource version filled in.
pub(crate) fn intent(namespace: &str, name: &str, spec: SecretIntentSpec) -> SecretIntent {
    let mut intent = SecretIntent::new(name, spec);
    intent.metadata.namespace = Some(namespace.to_owned());
    intent.metadata.uid = Some(format!("uid-{namespace}-{name}"));
    intent.metadata.resource_version = Some("1".to_owned());
    intent
}

pub(crate) fn spec(app: &str, env: &str) -> SecretIntentSpec {
    SecretIntentSpec {
        app: app.to_owned(),
        environment: env.to_owned(),
        ..SecretIntentSpec::default()
    }
}

/// Build a Secret at the given identity, optionally owned by an intent.
pub(crate) fn secret(
    namespace: &str,
    name: &str,
    owner: Option<&SecretIntent>,
    data: &[(&str, &[u8])],
) -> Secret {
    let mut secret = Secret::default();
    secret.metadata.namespace = Some(namespace.to_owned());
    secret.metadata.name = Some(name.to_owned());
    secret.metadata.resource_version = Some("41".to_owned());
    if let Some(owner) = owner {
        secret.metadata.owner_references = Some(vec![OwnerReference {
            api_version: format!("{API_GROUP}/{API_VERSION}"),
            kind: INTENT_KIND.to_owned(),
            name: owner.metadata.name.clone().unwrap_or_default(),
            uid: owner.metadata.uid.clone().unwrap_or_default(),
            controller: Some(true),
            block_owner_deletion: None,
        }]);
    }
    secret.data = Some(
        data.iter()
            .map(|(k, v)| ((*k).to_owned(), ByteString(v.to_vec())))
            .collect(),
    );
    secret
}
