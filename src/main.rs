//! # Keychain Secrets Controller
//!
//! A Kubernetes controller that reconciles declarative `SecretIntent`
//! resources into managed `Secret` objects.
//!
//! ## Overview
//!
//! The controller:
//!
//! 1. **Watches `SecretIntent` resources** across all namespaces, plus the
//!    `Secret` objects it manages through owner references
//! 2. **Polls keychain repositories** - periodic `git pull` of the standard
//!    and elevated key repositories, re-reconciling dependent intents when
//!    their content changes
//! 3. **Generates secret values** - shells out to the generator tool cloned
//!    from its own repository, with raw-file and single-key modes
//! 4. **Writes managed Secrets** - create/update with controller owner
//!    references, refusing to touch secrets owned by anything else
//!
//! ## Usage
//!
//! See the [README.md](../README.md) for flags and deployment notes.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use kube::Client;
use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::{mpsc, watch};
use tracing::{error, info};

use keychain_secrets_controller::controller::cache::ClusterCache;
use keychain_secrets_controller::controller::events::{ClusterEventSink, EventSink};
use keychain_secrets_controller::controller::queue::WorkQueue;
use keychain_secrets_controller::controller::reconciler::{
    ApiSecretWriter, Reconciler, SecretWriter,
};
use keychain_secrets_controller::controller::router::EventRouter;
use keychain_secrets_controller::controller::{spawn_watch_pumps, Controller, CONTROLLER_NAME};
use keychain_secrets_controller::generator::{CommandGenerator, SecretGenerator};
use keychain_secrets_controller::keychain::{GeneratorRepo, Keychain, Keychains};
use keychain_secrets_controller::observability::metrics;
use keychain_secrets_controller::server::{start_server, ServerState};

#[derive(Parser, Debug)]
#[command(name = CONTROLLER_NAME, about, version)]
struct Args {
    /// URL of the generator tool repository
    #[arg(long, env = "GENERATOR_REPO_URL")]
    generator_repo: String,

    /// Repo-relative path of the generator executable
    #[arg(long, env = "GENERATOR_EXE", default_value = "bin/generate")]
    generator_exe: String,

    /// Command run inside the generator clone after cloning (dependency install)
    #[arg(long, env = "GENERATOR_SETUP")]
    generator_setup: Option<String>,

    /// Deploy key for the generator repository
    #[arg(long, env = "GENERATOR_KEY_FILE", default_value = "/etc/secrets/generator.key")]
    generator_key: PathBuf,

    /// Local path of the generator clone
    #[arg(long, env = "GENERATOR_DIR", default_value = "/generator")]
    generator_dir: PathBuf,

    /// URL of the standard-tier keychain repository
    #[arg(long, env = "STANDARD_KEYCHAIN_URL")]
    standard_keychain: String,

    /// URL of the elevated-tier keychain repository
    #[arg(long, env = "ELEVATED_KEYCHAIN_URL")]
    elevated_keychain: String,

    /// Directory holding the keychain clones; deploy keys are looked up at
    /// /etc/secrets/<name>.key
    #[arg(long, env = "KEYCHAIN_DIR", default_value = "/keychains")]
    keychain_dir: PathBuf,

    /// How frequently to sync the keychain git repositories
    #[arg(long, env = "GIT_SYNC_PERIOD_SECS", default_value_t = 60)]
    git_sync_period_secs: u64,

    /// Number of reconcile workers
    #[arg(long, env = "WORKERS", default_value_t = 2)]
    workers: usize,

    /// Port for the metrics/probe HTTP server
    #[arg(long, env = "METRICS_PORT", default_value_t = 8080)]
    metrics_port: u16,

    /// Seconds to wait for the watch caches before giving up
    #[arg(long, env = "STARTUP_TIMEOUT_SECS", default_value_t = 120)]
    startup_timeout_secs: u64,
}

const KEY_DIR: &str = "/etc/secrets";

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "keychain_secrets_controller=info".into()),
        )
        .init();

    info!("Starting keychain secrets controller");

    metrics::register_metrics()?;

    let server_state = Arc::new(ServerState {
        is_ready: Arc::new(AtomicBool::new(false)),
    });
    let server_state_clone = server_state.clone();
    let metrics_port = args.metrics_port;
    tokio::spawn(async move {
        if let Err(e) = start_server(metrics_port, server_state_clone).await {
            error!("HTTP server error: {}", e);
        }
    });

    // Clone and sync the key repositories and the generator tool before
    // touching the cluster, so the first reconcile pass has values to read.
    let standard = Keychain::open_or_clone(
        "keychain",
        &args.standard_keychain,
        &args.keychain_dir,
        Some(PathBuf::from(KEY_DIR).join("keychain.key")),
        false,
    )
    .await?;
    let elevated = Keychain::open_or_clone(
        "elevated-keychain",
        &args.elevated_keychain,
        &args.keychain_dir,
        Some(PathBuf::from(KEY_DIR).join("elevated-keychain.key")),
        true,
    )
    .await?;
    let keychains = Keychains { standard, elevated };

    let generator_repo = GeneratorRepo::open_or_clone(
        &args.generator_repo,
        &args.generator_dir,
        Some(args.generator_key.clone()),
        args.generator_setup.as_deref(),
    )
    .await?;
    let generator: Arc<dyn SecretGenerator> = Arc::new(CommandGenerator::new(
        generator_repo.executable(&args.generator_exe),
        keychains.clone(),
    ));

    let client = Client::try_default()
        .await
        .context("could not create kubernetes client")?;

    let (tx, rx) = mpsc::unbounded_channel();
    let (cache, _pumps) = spawn_watch_pumps(&client, &tx);
    let cache: Arc<dyn ClusterCache> = Arc::new(cache);

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let _watchers = keychains.watch_all(
        Duration::from_secs(args.git_sync_period_secs),
        &tx,
        &shutdown_rx,
    );

    let queue = WorkQueue::new();
    let events: Arc<dyn EventSink> =
        Arc::new(ClusterEventSink::new(client.clone(), CONTROLLER_NAME));
    let writer: Arc<dyn SecretWriter> = Arc::new(ApiSecretWriter::new(client.clone()));
    let reconciler = Arc::new(Reconciler::new(
        Arc::clone(&cache),
        writer,
        generator,
        events,
    ));
    let router = EventRouter::new(Arc::clone(&queue), Arc::clone(&cache), rx);

    // SIGTERM/ctrl-c stops the pollers and drains the queue; a second signal
    // is left to the supervisor.
    {
        let queue = Arc::clone(&queue);
        tokio::spawn(async move {
            let mut sigterm = match signal(SignalKind::terminate()) {
                Ok(s) => s,
                Err(e) => {
                    error!("could not install SIGTERM handler: {}", e);
                    return;
                }
            };
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {}
                _ = sigterm.recv() => {}
            }
            info!("shutdown signal received");
            let _ = shutdown_tx.send(true);
            queue.shut_down();
        });
    }

    let controller = Controller {
        queue,
        cache,
        reconciler,
    };

    // Readiness follows cache sync. run() re-checks the same condition, which
    // is immediate once the stores are populated.
    let startup_deadline = Duration::from_secs(args.startup_timeout_secs);
    tokio::time::timeout(startup_deadline, controller.cache.wait_synced())
        .await
        .context("timed out waiting for caches to sync")??;
    server_state.is_ready.store(true, Ordering::Relaxed);

    controller.run(args.workers, router, startup_deadline).await?;

    info!("Controller stopped");
    Ok(())
}
