//! # Secret-Value Generator
//!
//! Produces the key/value mapping a `SecretIntent` asks for.
//!
//! The real implementation shells out to the generator tool that lives in
//! its own git repository (cloned at startup, see [`crate::keychain`]):
//!
//! ```text
//! <tool> generate-config -n -f json -a <app> -e <env> [--pro]
//! ```
//!
//! Three modes, selected by the intent spec:
//! - **raw-file**: `file` set - read that path from the tier-matching
//!   keychain and store the bytes under `key`, untransformed
//! - **single-key**: `key` set without `file` - store the tool's raw stdout
//!   under `key`, untransformed
//! - **normal**: parse the tool's JSON output and transform every key
//!   (prefix with `<prefix>_` when set, then uppercase)
//!
//! Generator failures are input errors: the reconciler logs them and moves
//! on, they never take the queue's infrastructure-retry path.

use std::collections::BTreeMap;
use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use k8s_openapi::ByteString;
use tokio::process::Command;
use tracing::debug;

use crate::crd::SecretIntentSpec;
use crate::keychain::Keychains;

/// Key/value mapping for one reconcile attempt. Never persisted on its own;
/// compared against the live Secret's data to decide whether to write.
pub type GeneratedValues = BTreeMap<String, ByteString>;

/// Produces secret values for an intent spec.
#[async_trait]
pub trait SecretGenerator: Send + Sync {
    async fn generate(&self, spec: &SecretIntentSpec) -> Result<GeneratedValues>;
}

/// Generator backed by the external tool executable plus the keychain pair.
pub struct CommandGenerator {
    exe: PathBuf,
    keychains: Keychains,
}

impl std::fmt::Debug for CommandGenerator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CommandGenerator")
            .field("exe", &self.exe)
            .finish_non_exhaustive()
    }
}

impl CommandGenerator {
    #[must_use]
    pub fn new(exe: PathBuf, keychains: Keychains) -> Self {
        Self { exe, keychains }
    }

    async fn run_tool(&self, spec: &SecretIntentSpec) -> Result<Vec<u8>> {
        let mut cmd = Command::new(&self.exe);
        cmd.args(["generate-config", "-n", "-f", "json"])
            .args(["-a", &spec.app])
            .args(["-e", &spec.environment]);
        if spec.elevated {
            cmd.arg("--pro");
        }

        debug!(app = %spec.app, env = %spec.environment, "invoking generator tool");
        let output = cmd
            .output()
            .await
            .with_context(|| format!("could not run generator tool {}", self.exe.display()))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            bail!(
                "generator tool exited with {} for app={} env={}: {}",
                output.status,
                spec.app,
                spec.environment,
                stderr.trim()
            );
        }

        Ok(output.stdout)
    }
}

#[async_trait]
impl SecretGenerator for CommandGenerator {
    async fn generate(&self, spec: &SecretIntentSpec) -> Result<GeneratedValues> {
        if let Some(file) = &spec.file {
            let key = spec
                .key
                .as_deref()
                .filter(|k| !k.is_empty())
                .context("raw-file mode requires an output key")?;
            let contents = self
                .keychains
                .for_tier(spec.elevated)
                .read_file(file)
                .await?;
            return Ok(BTreeMap::from([(key.to_owned(), ByteString(contents))]));
        }

        let stdout = self.run_tool(spec).await?;

        if let Some(key) = spec.key.as_deref().filter(|k| !k.is_empty()) {
            return Ok(BTreeMap::from([(key.to_owned(), ByteString(stdout))]));
        }

        let values: BTreeMap<String, serde_json::Value> = serde_json::from_slice(&stdout)
            .context("generator tool produced output that is not a JSON object")?;
        Ok(transform_values(spec, values))
    }
}

/// Apply the output-key transformation: prefix (if any) joined with an
/// underscore, then uppercase. Values keep their raw string bytes; non-string
/// JSON scalars are rendered as text.
pub(crate) fn transform_values(
    spec: &SecretIntentSpec,
    values: BTreeMap<String, serde_json::Value>,
) -> GeneratedValues {
    values
        .into_iter()
        .map(|(key, value)| {
            let key = match spec.prefix.as_deref().filter(|p| !p.is_empty()) {
                Some(prefix) => format!("{prefix}_{key}"),
                None => key,
            }
            .to_uppercase();

            let bytes = match value {
                serde_json::Value::String(s) => s.into_bytes(),
                other => other.to_string().into_bytes(),
            };
            (key, ByteString(bytes))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spec(prefix: Option<&str>) -> SecretIntentSpec {
        SecretIntentSpec {
            app: "foo".into(),
            environment: "prod".into(),
            prefix: prefix.map(str::to_owned),
            ..SecretIntentSpec::default()
        }
    }

    fn json(pairs: &[(&str, serde_json::Value)]) -> BTreeMap<String, serde_json::Value> {
        pairs
            .iter()
            .map(|(k, v)| ((*k).to_owned(), v.clone()))
            .collect()
    }

    #[test]
    fn transform_prefixes_and_uppercases() {
        let values = json(&[("db_pass", serde_json::Value::String("x".into()))]);
        let out = transform_values(&spec(Some("APP")), values);

        assert_eq!(out.len(), 1);
        assert_eq!(out["APP_DB_PASS"].0, b"x");
    }

    #[test]
    fn transform_without_prefix_only_uppercases() {
        let values = json(&[("token", serde_json::Value::String("abc".into()))]);
        let out = transform_values(&spec(None), values);

        assert_eq!(out["TOKEN"].0, b"abc");
    }

    #[test]
    fn transform_ignores_empty_prefix() {
        let values = json(&[("token", serde_json::Value::String("abc".into()))]);
        let out = transform_values(&spec(Some("")), values);

        assert_eq!(out["TOKEN"].0, b"abc");
    }

    #[test]
    fn transform_renders_non_string_values_as_text() {
        let values = json(&[
            ("port", serde_json::json!(5432)),
            ("tls", serde_json::json!(true)),
        ]);
        let out = transform_values(&spec(None), values);

        assert_eq!(out["PORT"].0, b"5432");
        assert_eq!(out["TLS"].0, b"true");
    }
}
