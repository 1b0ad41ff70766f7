//! # SecretIntent CRD
//!
//! Custom resource describing the desired content of a managed `Secret`.
//!
//! A `SecretIntent` names an application/environment pair that the generator
//! tool knows how to produce values for, plus a handful of knobs controlling
//! how those values land in the managed Secret:
//!
//! ```yaml
//! apiVersion: secrets.keychain.io/v1
//! kind: SecretIntent
//! metadata:
//!   name: worker-env
//!   namespace: build
//! spec:
//!   app: worker
//!   env: production
//!   prefix: WORKER
//!   elevated: true
//! ```
//!
//! The controller creates a `Secret` with the same namespace/name, owned by
//! the intent via a controller owner reference.

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// API group the `SecretIntent` CRD is registered under.
pub const API_GROUP: &str = "secrets.keychain.io";

/// API version of the `SecretIntent` CRD.
pub const API_VERSION: &str = "v1";

/// Kind name of the custom resource.
pub const INTENT_KIND: &str = "SecretIntent";

/// Spec of a `SecretIntent` resource.
///
/// `app`/`env` select the generator configuration; `elevated` selects which
/// keychain tier backs the values (and which keychain's changes re-trigger
/// reconciliation). `file` switches to raw-file mode: instead of running the
/// generator, the controller reads that path from the tier-matching keychain
/// and stores the bytes under `key`. Setting `key` without `file` stores the
/// generator's raw output under that single key instead of parsing it.
#[derive(CustomResource, Debug, Clone, Default, Deserialize, Serialize, JsonSchema)]
#[kube(
    kind = "SecretIntent",
    group = "secrets.keychain.io",
    version = "v1",
    namespaced,
    printcolumn = r#"{"name":"App", "type":"string", "jsonPath":".spec.app"}"#,
    printcolumn = r#"{"name":"Env", "type":"string", "jsonPath":".spec.env"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct SecretIntentSpec {
    /// Application name passed to the generator tool.
    pub app: String,
    /// Environment name passed to the generator tool.
    #[serde(rename = "env")]
    pub environment: String,
    /// Optional prefix prepended (with an underscore) to every generated key.
    /// Keys are uppercased after prefixing.
    #[serde(default)]
    pub prefix: Option<String>,
    /// Tier flag: `true` selects the elevated keychain, `false` the standard
    /// one. Controls keychain fan-out scope as well as generation.
    #[serde(default)]
    pub elevated: bool,
    /// Raw-file mode: keychain-relative path to read instead of invoking the
    /// generator. Requires `key`.
    #[serde(default)]
    pub file: Option<String>,
    /// Single output key. With `file`, names the key the file contents are
    /// stored under; without it, captures the generator's raw output under
    /// this one key.
    #[serde(default)]
    pub key: Option<String>,
}

impl SecretIntent {
    /// `namespace/name` identity used as the work-queue key.
    pub fn identity(&self) -> Option<String> {
        let name = self.metadata.name.as_deref()?;
        let namespace = self.metadata.namespace.as_deref()?;
        Some(format!("{namespace}/{name}"))
    }
}
