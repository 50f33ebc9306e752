//! Composition root and the periodic collection loop.

// ============================================================================
// ENGINE
// ============================================================================
// Composition root. `EngineBuilder` owns the registries until `build()`;
// nothing registers itself at import time. `Engine::run` drives discovery,
// the periodic collection loop and the HTTP surface until cancelled.
// ============================================================================

use std::sync::Arc;
use std::time::Duration;

use prometheus::Registry;
use serde::Serialize;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::cache::ResourceCache;
use crate::canonical::MetricRegistry;
use crate::collector::{Collector, Provider, ProviderRegistry};
use crate::config::{AccountStore, ConfigManager, ExporterConfig};
use crate::discovery::{Discoverer, DiscovererRegistry, DiscoveryManager};
use crate::error::{ExporterError, ExporterResult, ServerError};
use crate::fanout::{CloudProvider, MonitoringApi, ProviderDeps, ProviderOptions};
use crate::server::{self, AppState};
use crate::shard::{resolve_cluster, ShardSpec};
use crate::telemetry::ApiTelemetry;
use crate::types::{AccountSet, Timestamp};

// ----------------------------------------------------------------------------
// Builder
// ----------------------------------------------------------------------------

/// Collects providers, discoverers and the account source before `build`.
pub struct EngineBuilder {
    config: Arc<ConfigManager>,
    metrics: Arc<MetricRegistry>,
    telemetry: ApiTelemetry,
    cache: Arc<ResourceCache>,
    providers: ProviderRegistry,
    discoverers: DiscovererRegistry,
    accounts: Option<Arc<AccountStore>>,
    shard: Option<ShardSpec>,
}

impl std::fmt::Debug for EngineBuilder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EngineBuilder")
            .field("providers", &self.providers)
            .field("discoverers", &self.discoverers)
            .field("shard", &self.shard)
            .finish()
    }
}

impl EngineBuilder {
    /// Validates the config and creates the metric registry with telemetry.
    pub fn new(config: ExporterConfig) -> ExporterResult<Self> {
        config.validate()?;
        let metrics = Arc::new(MetricRegistry::new(Registry::new()));
        let telemetry = ApiTelemetry::new(metrics.prometheus())?;
        Ok(Self {
            config: Arc::new(ConfigManager::new(config)),
            metrics,
            telemetry,
            cache: Arc::new(ResourceCache::new()),
            providers: ProviderRegistry::new(),
            discoverers: DiscovererRegistry::new(),
            accounts: None,
            shard: None,
        })
    }

    pub fn config(&self) -> Arc<ExporterConfig> {
        self.config.get()
    }

    pub fn metrics(&self) -> Arc<MetricRegistry> {
        Arc::clone(&self.metrics)
    }

    /// Collaborators for providers built outside the builder
    pub fn provider_deps(&self) -> ProviderDeps {
        ProviderDeps {
            cache: Arc::clone(&self.cache),
            metrics: Arc::clone(&self.metrics),
            telemetry: self.telemetry.clone(),
            config: Arc::clone(&self.config),
        }
    }

    /// Later registrations replace earlier ones under the same name
    pub fn register_provider(&mut self, provider: Arc<dyn Provider>) -> &mut Self {
        info!(target: "exporter::engine", provider = provider.name(), "Registered provider");
        self.providers.register(provider);
        self
    }

    pub fn register_discoverer(&mut self, discoverer: Arc<dyn Discoverer>) -> &mut Self {
        debug!(target: "exporter::engine", provider = discoverer.provider(), "Registered discoverer");
        self.discoverers.register(discoverer);
        self
    }

    /// Register a vendor API as both provider and catalog discoverer.
    pub fn register_cloud<A: MonitoringApi>(&mut self, api: A, options: ProviderOptions) -> &mut Self {
        let provider = CloudProvider::new(api, self.provider_deps(), options);
        self.register_discoverer(Arc::new(provider.catalog_discoverer()));
        self.register_provider(Arc::new(provider))
    }

    /// Use an existing account store instead of loading the configured file
    pub fn with_accounts(mut self, accounts: Arc<AccountStore>) -> Self {
        self.accounts = Some(accounts);
        self
    }

    /// Skip cluster resolution
    pub fn with_shard(mut self, shard: ShardSpec) -> Self {
        self.shard = Some(shard);
        self
    }

    /// Load accounts and resolve cluster membership, then wire everything.
    pub async fn build(self) -> ExporterResult<Engine> {
        let config = self.config.get();

        let accounts = match self.accounts {
            Some(accounts) => accounts,
            None => match config.accounts.resolved_path() {
                Some(path) => Arc::new(AccountStore::from_file(&path)?),
                None => {
                    warn!(target: "exporter::engine", "No account file configured; nothing will be collected");
                    Arc::new(AccountStore::new(AccountSet::default()))
                }
            },
        };

        let shard = match self.shard {
            Some(shard) => shard,
            None => resolve_cluster(&config.cluster).await,
        };

        if self.providers.is_empty() {
            warn!(target: "exporter::engine", "No providers registered; passes will skip every account");
        }

        let discovery = Arc::new(DiscoveryManager::new(self.discoverers, Arc::clone(&accounts), Arc::clone(&self.config)));
        let collector = Arc::new(Collector::new(
            self.providers,
            Arc::clone(&accounts),
            Arc::clone(&discovery),
            Arc::clone(&self.config),
            self.telemetry.clone(),
            shard,
        ));

        info!(
            target: "exporter::engine",
            accounts = accounts.snapshot().len(),
            shard_total = shard.total,
            shard_index = shard.index,
            "Engine built"
        );

        Ok(Engine {
            config: self.config,
            metrics: self.metrics,
            telemetry: self.telemetry,
            cache: self.cache,
            accounts,
            discovery,
            collector,
            start_time: Timestamp::now(),
        })
    }
}

// ----------------------------------------------------------------------------
// Engine
// ----------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize)]
pub struct EngineStats {
    pub uptime_secs: u64,
    pub shard: ShardSpec,
    pub discovery_version: u64,
    pub accounts: usize,
    pub cached_enumerations: usize,
    pub gauges: usize,
}

/// Wired exporter: discovery, collector and metric registry sharing one config.
pub struct Engine {
    config: Arc<ConfigManager>,
    metrics: Arc<MetricRegistry>,
    telemetry: ApiTelemetry,
    cache: Arc<ResourceCache>,
    accounts: Arc<AccountStore>,
    discovery: Arc<DiscoveryManager>,
    collector: Arc<Collector>,
    start_time: Timestamp,
}

impl std::fmt::Debug for Engine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Engine")
            .field("discovery", &self.discovery)
            .field("collector", &self.collector)
            .finish()
    }
}

impl Engine {
    pub fn builder(config: ExporterConfig) -> ExporterResult<EngineBuilder> {
        EngineBuilder::new(config)
    }

    pub fn config(&self) -> Arc<ExporterConfig> {
        self.config.get()
    }

    pub fn discovery(&self) -> &Arc<DiscoveryManager> {
        &self.discovery
    }

    pub fn collector(&self) -> &Arc<Collector> {
        &self.collector
    }

    pub fn metrics(&self) -> &Arc<MetricRegistry> {
        &self.metrics
    }

    /// Time since the engine was built
    pub fn uptime(&self) -> Duration {
        Timestamp::now().duration_since(self.start_time)
    }

    pub fn stats(&self) -> EngineStats {
        EngineStats {
            uptime_secs: self.uptime().as_secs(),
            shard: self.collector.shard(),
            discovery_version: self.discovery.version(),
            accounts: self.accounts.snapshot().len(),
            cached_enumerations: self.cache.len(),
            gauges: self.metrics.gauge_count(),
        }
    }

    /// Handler state for `server::router`
    pub fn app_state(&self, cancel: CancellationToken) -> AppState {
        AppState {
            discovery: Arc::clone(&self.discovery),
            collector: Arc::clone(&self.collector),
            metrics: Arc::clone(&self.metrics),
            telemetry: self.telemetry.clone(),
            config: Arc::clone(&self.config),
            cancel,
        }
    }

    /// Stale series from the previous product set are dropped.
    fn apply_discovery_change(&self) {
        let version = self.discovery.version();
        self.metrics.reset();
        self.telemetry.set_discovery_version(version);
        info!(target: "exporter::engine", version, "Discovery changed, canonical gauges reset");
    }

    /// Run until `cancel` fires or the HTTP server fails.
    pub async fn run(&self, cancel: CancellationToken) -> ExporterResult<()> {
        let config = self.config.get();
        info!(
            target: "exporter::engine",
            version = crate::EXPORTER_VERSION,
            listen = %config.server.listen_addr,
            interval = ?config.collection.interval,
            "Starting exporter"
        );

        let mut changes = self.discovery.subscribe()?;
        let watcher = self.discovery.start(cancel.child_token()).await;
        if changes.try_changed() {
            self.telemetry.set_discovery_version(self.discovery.version());
        }

        let mut server: JoinHandle<Result<(), ServerError>> =
            tokio::spawn(server::serve(self.app_state(cancel.clone()), cancel.child_token()));
        let mut server_running = true;

        let mut ticker = tokio::time::interval(config.collection.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        let mut outcome: ExporterResult<()> = Ok(());
        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    info!(target: "exporter::engine", "Shutdown requested");
                    break;
                }
                joined = &mut server, if server_running => {
                    server_running = false;
                    outcome = match joined {
                        Ok(Ok(())) => Ok(()),
                        Ok(Err(e)) => Err(e.into()),
                        Err(e) => Err(ExporterError::Internal(format!("server task failed: {e}"))),
                    };
                    if let Err(e) = &outcome {
                        error!(target: "exporter::engine", error = %e, "HTTP server stopped unexpectedly");
                    }
                    break;
                }
                Some(()) = changes.changed() => {
                    self.apply_discovery_change();
                }
                _ = ticker.tick() => {
                    // A started pass runs to completion; cancellation is seen on the next turn
                    let summary = self.collector.collect().await;
                    debug!(target: "exporter::engine", samples = summary.samples, failed = summary.failed, "Pass complete");
                }
            }
        }

        cancel.cancel();
        if let Err(e) = watcher.await {
            warn!(target: "exporter::engine", error = %e, "Discovery watcher ended abnormally");
        }
        if server_running {
            match server.await {
                Ok(Err(e)) => warn!(target: "exporter::engine", error = %e, "HTTP server shutdown error"),
                Err(e) => warn!(target: "exporter::engine", error = %e, "HTTP server task ended abnormally"),
                Ok(Ok(())) => {}
            }
        }
        info!(target: "exporter::engine", uptime_secs = self.uptime().as_secs(), "Exporter stopped");
        outcome
    }
}

// ============================================================================
// TESTS
// ============================================================================
