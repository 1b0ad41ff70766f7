//! # Keychain Repositories
//!
//! Git-hosted key repositories polled on a fixed cadence, plus the generator
//! tool's own repository.
//!
//! Two keychains are watched: a standard-tier one and an elevated-tier one.
//! Each runs as an independent background task that pulls the repository
//! every tick and emits a [`Signal::KeychainChanged`] when the remote moved;
//! the event router fans that signal out to every intent whose tier flag
//! matches. Sync errors are logged and retried next tick - a broken keychain
//! remote must never take the controller down.
//!
//! Git runs through the `git` CLI with `GIT_SSH_COMMAND` pointing at a
//! deploy key, avoiding a libgit2/OpenSSL dependency.

use std::path::{Component, Path, PathBuf};
use std::process::Output;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use tokio::process::Command;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use crate::controller::router::Signal;
use crate::observability::metrics;

/// A local clone of a remote git repository, driven through the `git` CLI.
#[derive(Debug, Clone)]
struct GitRepo {
    url: String,
    path: PathBuf,
    ssh_key: Option<PathBuf>,
}

impl GitRepo {
    async fn git(&self, args: &[&str]) -> Result<Output> {
        let mut cmd = Command::new("git");
        cmd.args(args);
        if let Some(key) = &self.ssh_key {
            cmd.env(
                "GIT_SSH_COMMAND",
                format!(
                    "ssh -i {} -o IdentitiesOnly=yes -o StrictHostKeyChecking=accept-new",
                    key.display()
                ),
            );
        }
        let output = cmd.output().await.context("could not run git")?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            bail!("git {} failed: {}", args.first().unwrap_or(&""), stderr.trim());
        }
        Ok(output)
    }

    fn path_arg(&self) -> &str {
        self.path.to_str().unwrap_or(".")
    }

    async fn head(&self) -> Result<String> {
        let output = self.git(&["-C", self.path_arg(), "rev-parse", "HEAD"]).await?;
        Ok(String::from_utf8_lossy(&output.stdout).trim().to_owned())
    }

    /// Clone the repository if the local path holds no clone yet.
    async fn ensure_cloned(&self) -> Result<()> {
        if self.path.join(".git").exists() {
            return Ok(());
        }
        if self.url.is_empty() {
            bail!(
                "no repository url configured and {} holds no existing clone",
                self.path.display()
            );
        }
        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .with_context(|| format!("could not create {}", parent.display()))?;
        }
        info!(url = %self.url, path = %self.path.display(), "cloning repository");
        self.git(&["clone", &self.url, self.path_arg()]).await?;
        Ok(())
    }

    /// Fast-forward to the remote. Returns whether `HEAD` moved.
    async fn pull(&self) -> Result<bool> {
        let before = self.head().await?;
        self.git(&["-C", self.path_arg(), "pull", "--ff-only", "origin"])
            .await?;
        let after = self.head().await?;
        Ok(before != after)
    }
}

/// One watched key repository.
pub struct Keychain {
    name: String,
    repo: GitRepo,
    elevated: bool,
}

impl std::fmt::Debug for Keychain {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Keychain")
            .field("name", &self.name)
            .field("elevated", &self.elevated)
            .finish_non_exhaustive()
    }
}

impl Keychain {
    /// Open the local clone, cloning it first if absent, then perform the
    /// initial sync. Runs before anything reads the working tree, so readers
    /// never see a partially-initialized checkout.
    pub async fn open_or_clone(
        name: &str,
        url: &str,
        root: &Path,
        ssh_key: Option<PathBuf>,
        elevated: bool,
    ) -> Result<Arc<Self>> {
        let repo = GitRepo {
            url: url.to_owned(),
            path: root.join(name),
            ssh_key,
        };
        repo.ensure_cloned()
            .await
            .with_context(|| format!("could not initialize keychain {name}"))?;
        let keychain = Self {
            name: name.to_owned(),
            repo,
            elevated,
        };
        keychain
            .sync()
            .await
            .with_context(|| format!("initial sync of keychain {name} failed"))?;
        Ok(Arc::new(keychain))
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Tier flag of the data this keychain serves.
    #[must_use]
    pub fn is_elevated(&self) -> bool {
        self.elevated
    }

    /// Advance the clone to the latest remote revision. `Ok(true)` means the
    /// content changed since the last sync.
    pub async fn sync(&self) -> Result<bool> {
        self.repo.pull().await
    }

    /// Read a repository-relative file from the working tree.
    pub async fn read_file(&self, relative: &str) -> Result<Vec<u8>> {
        let rel = Path::new(relative);
        if rel.is_absolute()
            || rel
                .components()
                .any(|c| matches!(c, Component::ParentDir | Component::Prefix(_)))
        {
            bail!("keychain file path {relative:?} must stay inside the repository");
        }
        let full = self.repo.path.join(rel);
        tokio::fs::read(&full)
            .await
            .with_context(|| format!("could not read {} from keychain {}", relative, self.name))
    }

    /// Poll the repository every `period`, sending a change signal whenever a
    /// tick advanced the revision. Stops when the shutdown flag flips or the
    /// router goes away. Sync errors are logged and retried next tick.
    pub fn watch(
        self: &Arc<Self>,
        period: Duration,
        tx: mpsc::UnboundedSender<Signal>,
        mut shutdown: watch::Receiver<bool>,
    ) -> JoinHandle<()> {
        let keychain = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            // interval fires immediately; the initial sync already ran.
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = ticker.tick() => match keychain.sync().await {
                        Ok(true) => {
                            info!(keychain = %keychain.name, "keychain content changed");
                            metrics::increment_repo_syncs(&keychain.name, "changed");
                            let signal = Signal::KeychainChanged {
                                elevated: keychain.elevated,
                            };
                            if tx.send(signal).is_err() {
                                break;
                            }
                        }
                        Ok(false) => {
                            metrics::increment_repo_syncs(&keychain.name, "unchanged");
                        }
                        Err(e) => {
                            // Never fatal; the next tick tries again.
                            metrics::increment_repo_syncs(&keychain.name, "error");
                            warn!(keychain = %keychain.name, "keychain sync failed: {e:#}");
                        }
                    },
                    _ = shutdown.changed() => break,
                }
            }
            debug!(keychain = %keychain.name, "keychain watcher stopped");
        })
    }

    #[cfg(test)]
    pub(crate) fn for_tests(path: PathBuf, elevated: bool) -> Arc<Self> {
        Arc::new(Self {
            name: if elevated { "elevated" } else { "standard" }.to_owned(),
            repo: GitRepo {
                url: String::new(),
                path,
                ssh_key: None,
            },
            elevated,
        })
    }
}

/// The standard/elevated keychain pair.
#[derive(Debug, Clone)]
pub struct Keychains {
    pub standard: Arc<Keychain>,
    pub elevated: Arc<Keychain>,
}

impl Keychains {
    /// Keychain serving the given tier flag.
    #[must_use]
    pub fn for_tier(&self, elevated: bool) -> &Arc<Keychain> {
        if elevated {
            &self.elevated
        } else {
            &self.standard
        }
    }

    /// Start one watcher task per keychain.
    pub fn watch_all(
        &self,
        period: Duration,
        tx: &mpsc::UnboundedSender<Signal>,
        shutdown: &watch::Receiver<bool>,
    ) -> Vec<JoinHandle<()>> {
        vec![
            self.standard.watch(period, tx.clone(), shutdown.clone()),
            self.elevated.watch(period, tx.clone(), shutdown.clone()),
        ]
    }
}

/// The generator tool's own repository: cloned and updated with the same
/// plumbing as the keychains, with an optional post-clone setup command for
/// the tool's runtime dependencies.
#[derive(Debug)]
pub struct GeneratorRepo {
    repo: GitRepo,
}

impl GeneratorRepo {
    /// Clone/update the tool repository and run the setup command, if any.
    /// `setup` is a whitespace-split command line executed inside the clone.
    pub async fn open_or_clone(
        url: &str,
        path: &Path,
        ssh_key: Option<PathBuf>,
        setup: Option<&str>,
    ) -> Result<Self> {
        let repo = GitRepo {
            url: url.to_owned(),
            path: path.to_owned(),
            ssh_key,
        };
        repo.ensure_cloned()
            .await
            .context("could not initialize generator tool repository")?;
        repo.pull()
            .await
            .context("could not update generator tool repository")?;

        if let Some(setup) = setup.filter(|s| !s.trim().is_empty()) {
            let mut parts = setup.split_whitespace();
            let program = parts.next().context("empty generator setup command")?;
            info!(command = setup, "running generator setup command");
            let status = Command::new(program)
                .args(parts)
                .current_dir(&repo.path)
                .status()
                .await
                .with_context(|| format!("could not run generator setup command {setup:?}"))?;
            if !status.success() {
                bail!("generator setup command {setup:?} exited with {status}");
            }
        }

        Ok(Self { repo })
    }

    /// Absolute path of the tool executable, given its repo-relative path.
    #[must_use]
    pub fn executable(&self, relative: &str) -> PathBuf {
        self.repo.path.join(relative)
    }
}
