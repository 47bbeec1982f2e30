#![forbid(unsafe_code)]
#![deny(missing_docs)]

//! **tessera-runtime** – Composition root and background scheduling.
//!
//! The runtime builds the stores, telemetry buffer, broadcaster and engine
//! from a [`RuntimeConfig`], then runs the three cooperative background
//! loops the engine depends on:
//!
//! - the zombie sweeper (stalled ACTIVE tokens are reclaimed to Tau),
//! - memory decay (stale role memory is pruned),
//! - the telemetry drainer (buffered entries land in the interaction log).
//!
//! Loops tick on fixed periods with a little jitter, log-and-continue on
//! per-tick errors, and exit cleanly on the shared shutdown signal.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use rand::Rng;
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use tessera_bus::{EventBroadcaster, FileBroadcaster, MemoryBroadcaster, TelemetryBuffer};
use tessera_engine::{Engine, EngineConfig};
use tessera_guard::ModelRouter;
use tessera_store::{BlueprintStore, InstanceStore};

//─────────────────────────────
//  Configuration
//─────────────────────────────

/// Storage backend selection for the two tiers.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum StorageConfig {
    /// In-memory SQLite (tests, ephemeral runs).
    Memory,
    /// On-disk SQLite files, one per tier.
    Sqlite {
        /// Blueprint-tier database path.
        blueprint_path: String,
        /// Instance-tier database path.
        instance_path: String,
    },
}

/// Broadcaster backend selection.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum BroadcasterConfig {
    /// Tokio-broadcast fan-out (tests, embedded dashboards).
    Memory,
    /// Append-only JSON-lines event log.
    File {
        /// Event log path.
        path: String,
    },
}

/// Everything needed to stand the service up.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuntimeConfig {
    /// Storage backend for both tiers.
    pub storage: StorageConfig,
    /// Broadcaster backend.
    pub broadcaster: BroadcasterConfig,

    /// Zombie sweeper period, seconds.
    pub zombie_sweep_seconds: u64,
    /// Heartbeat staleness threshold, seconds.
    pub heartbeat_threshold_seconds: u64,
    /// Memory-decay period, seconds.
    pub memory_decay_seconds: u64,
    /// Memory retention window, days.
    pub memory_retention_days: u64,
    /// Telemetry drain period, milliseconds.
    pub telemetry_drain_millis: u64,
    /// Entries drained per tick.
    pub telemetry_batch: usize,
    /// Telemetry buffer bound.
    pub telemetry_capacity: usize,

    /// Pilot consultation timeout, seconds.
    pub pilot_timeout_seconds: u64,
    /// Interaction budget stamped onto new base UOWs.
    pub default_max_interactions: Option<i64>,

    /// Model whitelist as `(model, provider)` pairs; empty uses the built-in
    /// registry.
    #[serde(default)]
    pub model_whitelist: Vec<(String, String)>,
    /// Safe failover model for rejected overrides.
    pub failover_model: Option<String>,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            storage: StorageConfig::Sqlite {
                blueprint_path: "blueprint.db".into(),
                instance_path: "instance.db".into(),
            },
            broadcaster: BroadcasterConfig::File {
                path: "events.jsonl".into(),
            },
            zombie_sweep_seconds: 60,
            heartbeat_threshold_seconds: 300,
            memory_decay_seconds: 86_400,
            memory_retention_days: 90,
            telemetry_drain_millis: 1_000,
            telemetry_batch: 100,
            telemetry_capacity: 10_000,
            pilot_timeout_seconds: 300,
            default_max_interactions: None,
            model_whitelist: Vec::new(),
            failover_model: None,
        }
    }
}

impl RuntimeConfig {
    /// Load configuration by layering an optional TOML file under
    /// `TESSERA_*` environment overrides on top of the defaults.
    pub fn load(path: Option<&str>) -> Result<Self> {
        let defaults = config::Config::try_from(&Self::default())
            .context("failed to encode default configuration")?;
        let mut builder = config::Config::builder().add_source(defaults);
        if let Some(path) = path {
            builder = builder.add_source(config::File::with_name(path));
        }
        builder = builder.add_source(
            config::Environment::with_prefix("TESSERA").separator("__"),
        );
        builder
            .build()
            .context("failed to assemble configuration")?
            .try_deserialize()
            .context("invalid configuration")
    }

    /// Configuration suitable for tests: in-memory everything, fast ticks.
    pub fn for_testing() -> Self {
        Self {
            storage: StorageConfig::Memory,
            broadcaster: BroadcasterConfig::Memory,
            zombie_sweep_seconds: 1,
            heartbeat_threshold_seconds: 1,
            memory_decay_seconds: 3600,
            telemetry_drain_millis: 20,
            telemetry_batch: 16,
            telemetry_capacity: 256,
            pilot_timeout_seconds: 1,
            ..Self::default()
        }
    }

    fn heartbeat_threshold(&self) -> Duration {
        Duration::from_secs(self.heartbeat_threshold_seconds)
    }

    fn memory_retention(&self) -> Duration {
        Duration::from_secs(self.memory_retention_days * 24 * 3600)
    }
}

//─────────────────────────────
//  Runtime
//─────────────────────────────

/// A running Tessera service: the engine plus its background loops.
pub struct Runtime {
    engine: Arc<Engine>,
    blueprints: Arc<BlueprintStore>,
    store: Arc<InstanceStore>,
    telemetry: Arc<TelemetryBuffer>,
    shutdown_tx: watch::Sender<bool>,
    workers: Vec<JoinHandle<()>>,
}

impl Runtime {
    /// Build and start a runtime from configuration.
    pub async fn new(config: RuntimeConfig) -> Result<Self> {
        info!("starting tessera runtime");

        let (blueprints, store) = match &config.storage {
            StorageConfig::Memory => (
                Arc::new(BlueprintStore::in_memory().await?),
                Arc::new(InstanceStore::in_memory().await?),
            ),
            StorageConfig::Sqlite {
                blueprint_path,
                instance_path,
            } => (
                Arc::new(BlueprintStore::open(blueprint_path).await?),
                Arc::new(InstanceStore::open(instance_path).await?),
            ),
        };
        debug!("stores ready");

        let broadcaster: Arc<dyn EventBroadcaster> = match &config.broadcaster {
            BroadcasterConfig::Memory => Arc::new(MemoryBroadcaster::default()),
            BroadcasterConfig::File { path } => Arc::new(
                FileBroadcaster::new(path).context("failed to open event log")?,
            ),
        };

        let telemetry = Arc::new(TelemetryBuffer::new(config.telemetry_capacity));

        let router = if config.model_whitelist.is_empty() {
            ModelRouter::default()
        } else {
            ModelRouter::new(
                config.model_whitelist.clone(),
                config
                    .failover_model
                    .clone()
                    .unwrap_or_else(|| "gemini-flash".to_string()),
            )
        };

        let engine = Arc::new(Engine::new(
            blueprints.clone(),
            store.clone(),
            telemetry.clone(),
            broadcaster,
            router,
            EngineConfig {
                pilot_timeout: Duration::from_secs(config.pilot_timeout_seconds),
                default_max_interactions: config.default_max_interactions,
            },
        ));

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let workers = vec![
            spawn_zombie_sweeper(
                engine.clone(),
                Duration::from_secs(config.zombie_sweep_seconds),
                config.heartbeat_threshold(),
                shutdown_rx.clone(),
            ),
            spawn_memory_decay(
                engine.clone(),
                Duration::from_secs(config.memory_decay_seconds),
                config.memory_retention(),
                shutdown_rx.clone(),
            ),
            spawn_telemetry_drainer(
                telemetry.clone(),
                store.clone(),
                Duration::from_millis(config.telemetry_drain_millis),
                config.telemetry_batch,
                shutdown_rx,
            ),
        ];

        info!("tessera runtime started");
        Ok(Self {
            engine,
            blueprints,
            store,
            telemetry,
            shutdown_tx,
            workers,
        })
    }

    /// The engine controller.
    pub fn engine(&self) -> &Arc<Engine> {
        &self.engine
    }

    /// The blueprint store (importer target).
    pub fn blueprints(&self) -> &Arc<BlueprintStore> {
        &self.blueprints
    }

    /// The instance store.
    pub fn store(&self) -> &Arc<InstanceStore> {
        &self.store
    }

    /// Stop the background loops and drain the remaining telemetry. The
    /// store pools close when their last handle drops.
    pub async fn shutdown(self) -> Result<()> {
        info!("shutting down tessera runtime");
        let _ = self.shutdown_tx.send(true);
        for worker in self.workers {
            if let Err(error) = worker.await {
                warn!(%error, "background worker exited uncleanly");
            }
        }

        // One final drain so nothing buffered is lost.
        loop {
            let entries = self.telemetry.drain(256);
            if entries.is_empty() {
                break;
            }
            let records: Vec<_> = entries
                .into_iter()
                .map(|entry| entry.into_log_record())
                .collect();
            self.store.insert_interaction_logs(&records).await?;
        }

        info!("tessera runtime shutdown complete");
        Ok(())
    }
}

//─────────────────────────────
//  Background loops
//─────────────────────────────

/// Sleep one period plus up to 10% jitter, or return early on shutdown.
/// Returns `false` when the loop should exit.
async fn sleep_or_shutdown(period: Duration, shutdown: &mut watch::Receiver<bool>) -> bool {
    let jitter_cap = (period.as_millis() / 10).max(1) as u64;
    let jitter = rand::thread_rng().gen_range(0..jitter_cap);
    let tick = period + Duration::from_millis(jitter);

    tokio::select! {
        _ = tokio::time::sleep(tick) => true,
        changed = shutdown.changed() => match changed {
            Ok(()) => !*shutdown.borrow(),
            // Sender gone: the runtime was dropped, stop the loop.
            Err(_) => false,
        },
    }
}

fn spawn_zombie_sweeper(
    engine: Arc<Engine>,
    period: Duration,
    threshold: Duration,
    mut shutdown: watch::Receiver<bool>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        debug!("zombie sweeper running");
        loop {
            if !sleep_or_shutdown(period, &mut shutdown).await {
                break;
            }
            match engine.run_zombie_protocol(threshold).await {
                Ok(0) => {}
                Ok(reclaimed) => info!(reclaimed, "zombie sweeper reclaimed tokens"),
                Err(error) => error!(%error, "zombie sweep tick failed"),
            }
        }
        debug!("zombie sweeper stopped");
    })
}

fn spawn_memory_decay(
    engine: Arc<Engine>,
    period: Duration,
    retention: Duration,
    mut shutdown: watch::Receiver<bool>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        debug!("memory decay running");
        loop {
            if !sleep_or_shutdown(period, &mut shutdown).await {
                break;
            }
            match engine.run_memory_decay(retention).await {
                Ok(0) => {}
                Ok(deleted) => info!(deleted, "memory decay pruned records"),
                Err(error) => error!(%error, "memory decay tick failed"),
            }
        }
        debug!("memory decay stopped");
    })
}

fn spawn_telemetry_drainer(
    telemetry: Arc<TelemetryBuffer>,
    store: Arc<InstanceStore>,
    period: Duration,
    batch: usize,
    mut shutdown: watch::Receiver<bool>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        debug!("telemetry drainer running");
        loop {
            if !sleep_or_shutdown(period, &mut shutdown).await {
                break;
            }
            let entries = telemetry.drain(batch);
            if entries.is_empty() {
                continue;
            }
            let records: Vec<_> = entries
                .into_iter()
                .map(|entry| entry.into_log_record())
                .collect();
            if let Err(error) = store.insert_interaction_logs(&records).await {
                error!(%error, "telemetry drain tick failed");
            }
        }
        debug!("telemetry drainer stopped");
    })
}
