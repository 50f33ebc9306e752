//! Collection scheduler: one pass over every configured account.

// ============================================================================
// COLLECTION SCHEDULER
// ============================================================================
// One pass = every configured account collected concurrently through its
// provider. Accounts are never sharded here: providers shard internally at the
// product level, and sharding twice would silently drop work.
// ============================================================================

use std::collections::{BTreeMap, BTreeSet};
use std::fmt::{self, Debug, Formatter};
use std::ops::AddAssign;
use std::sync::atomic::{AtomicU64, Ordering as AtomicOrdering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex as AsyncMutex;
use tokio::task::{JoinHandle, JoinSet};
use tracing::{debug, error, info, warn};

use crate::config::{AccountStore, ConfigManager, ExporterConfig};
use crate::discovery::DiscoveryManager;
use crate::error::{CollectorError, CollectorResult};
use crate::logging::PerfTimer;
use crate::shard::ShardSpec;
use crate::telemetry::ApiTelemetry;
use crate::types::{Account, Product, Timestamp};

// ----------------------------------------------------------------------------
// Provider Seam
// ----------------------------------------------------------------------------

/// What a provider gets for one account sweep.
#[derive(Debug, Clone)]
pub struct CollectContext {
    /// Discovery snapshot for this provider, taken once per pass
    pub products: Arc<Vec<Product>>,
    pub shard: ShardSpec,
    pub config: Arc<ExporterConfig>,
}

/// Totals from one account sweep.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CollectReport {
    pub samples: u64,
    pub errors: u64,
}

impl AddAssign for CollectReport {
    fn add_assign(&mut self, rhs: Self) {
        self.samples += rhs.samples;
        self.errors += rhs.errors;
    }
}

/// One cloud's collection logic.
#[async_trait]
pub trait Provider: Send + Sync {
    fn name(&self) -> &str;

    /// Resource types polled when an account declares none or a wildcard
    fn default_resources(&self) -> Vec<String>;

    /// Full sweep of one account. Failures below the account level are
    /// contained and counted in the report.
    async fn collect(&self, ctx: &CollectContext, account: &Account) -> CollectorResult<CollectReport>;
}

/// Explicitly populated set of providers, keyed by name.
#[derive(Default, Clone)]
pub struct ProviderRegistry {
    providers: BTreeMap<String, Arc<dyn Provider>>,
}

impl Debug for ProviderRegistry {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_list().entries(self.providers.keys()).finish()
    }
}

impl ProviderRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, provider: Arc<dyn Provider>) {
        self.providers.insert(provider.name().to_string(), provider);
    }

    pub fn get(&self, name: &str) -> Option<&Arc<dyn Provider>> {
        self.providers.get(name)
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.providers.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.providers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.providers.is_empty()
    }
}

// ----------------------------------------------------------------------------
// Status
// ----------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunState {
    Running,
    Completed,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AccountStatus {
    pub state: RunState,
    pub timestamp: String,
    pub samples: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl AccountStatus {
    fn new(state: RunState) -> Self {
        Self {
            state,
            timestamp: Timestamp::now().to_rfc3339(),
            samples: 0,
            error: None,
        }
    }
}

/// Last pass timing and per-(provider|account) state.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct CollectStatus {
    pub running: bool,
    pub last_start: Option<String>,
    pub last_end: Option<String>,
    pub duration_ms: Option<u64>,
    pub samples: u64,
    pub accounts: BTreeMap<String, AccountStatus>,
}

/// Restricts a pass to one provider and/or one resource type.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct CollectFilter {
    pub provider: Option<String>,
    pub resource: Option<String>,
}

impl CollectFilter {
    pub fn provider(name: impl Into<String>) -> Self {
        Self {
            provider: Some(name.into()),
            resource: None,
        }
    }

    pub fn with_resource(mut self, resource: impl Into<String>) -> Self {
        self.resource = Some(resource.into());
        self
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct PassSummary {
    pub accounts: usize,
    pub completed: usize,
    pub failed: usize,
    pub samples: u64,
    pub errors: u64,
}

// ----------------------------------------------------------------------------
// Collector
// ----------------------------------------------------------------------------

pub struct Collector {
    providers: ProviderRegistry,
    accounts: Arc<AccountStore>,
    discovery: Arc<DiscoveryManager>,
    config: Arc<ConfigManager>,
    telemetry: ApiTelemetry,
    shard: ShardSpec,
    status: RwLock<CollectStatus>,
    /// Samples written by the pass in progress
    samples: AtomicU64,
    /// One pass at a time
    pass_lock: Arc<AsyncMutex<()>>,
}

impl Debug for Collector {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("Collector")
            .field("providers", &self.providers)
            .field("shard", &self.shard)
            .finish()
    }
}

impl Collector {
    pub fn new(
        providers: ProviderRegistry,
        accounts: Arc<AccountStore>,
        discovery: Arc<DiscoveryManager>,
        config: Arc<ConfigManager>,
        telemetry: ApiTelemetry,
        shard: ShardSpec,
    ) -> Self {
        Self {
            providers,
            accounts,
            discovery,
            config,
            telemetry,
            shard,
            status: RwLock::new(CollectStatus::default()),
            samples: AtomicU64::new(0),
            pass_lock: Arc::new(AsyncMutex::new(())),
        }
    }

    pub fn shard(&self) -> ShardSpec {
        self.shard
    }

    pub fn provider(&self, name: &str) -> CollectorResult<Arc<dyn Provider>> {
        self.providers
            .get(name)
            .cloned()
            .ok_or_else(|| CollectorError::ProviderNotFound { provider: name.to_string() })
    }

    /// Deep copy, safe to take while a pass runs
    pub fn status(&self) -> CollectStatus {
        self.status.read().clone()
    }

    pub async fn collect(&self) -> PassSummary {
        self.collect_filtered(&CollectFilter::default()).await
    }

    /// Select accounts for this pass. With a resource filter, an account
    /// is kept only if it would poll that resource, and then polls only it.
    fn select_accounts(&self, filter: &CollectFilter) -> Vec<(Arc<dyn Provider>, Account)> {
        let accounts = self.accounts.snapshot();
        let resource = filter.resource.as_ref().map(|r| r.trim().to_lowercase());

        accounts
            .iter()
            .filter(|a| filter.provider.as_deref().map_or(true, |p| a.provider == p))
            .filter_map(|account| {
                let Some(provider) = self.providers.get(&account.provider) else {
                    warn!(target: "exporter::collector", provider = %account.provider, account = %account.account_id, "No provider registered for account");
                    return None;
                };
                let mut account = account.clone();
                if let Some(resource) = &resource {
                    if !account.effective_resources(&provider.default_resources()).contains(resource) {
                        return None;
                    }
                    account.resources = vec![resource.clone()];
                }
                Some((Arc::clone(provider), account))
            })
            .collect()
    }

    /// Run one pass over the selected accounts, waiting for any pass in progress.
    pub async fn collect_filtered(&self, filter: &CollectFilter) -> PassSummary {
        let _pass = self.pass_lock.lock().await;
        self.run_pass(filter).await
    }

    /// Start a pass in the background unless one is already running.
    /// Requests for an unregistered provider are rejected up front.
    pub fn try_collect_filtered(self: &Arc<Self>, filter: CollectFilter) -> CollectorResult<JoinHandle<PassSummary>> {
        if let Some(provider) = &filter.provider {
            self.provider(provider)?;
        }
        let guard = Arc::clone(&self.pass_lock)
            .try_lock_owned()
            .map_err(|_| CollectorError::PassInProgress)?;
        let collector = Arc::clone(self);
        Ok(tokio::spawn(async move {
            let _pass = guard;
            collector.run_pass(&filter).await
        }))
    }

    async fn run_pass(&self, filter: &CollectFilter) -> PassSummary {
        let timer = PerfTimer::with_threshold("collection_pass", self.config.get().collection.interval);
        let selected = self.select_accounts(filter);
        self.samples.store(0, AtomicOrdering::Relaxed);

        let config = self.config.get();
        let products = self.discovery.get();
        let mut contexts: BTreeMap<String, CollectContext> = BTreeMap::new();

        {
            let mut status = self.status.write();
            status.running = true;
            status.last_start = Some(Timestamp::now().to_rfc3339());
            for (_, account) in &selected {
                status.accounts.insert(account.status_key(), AccountStatus::new(RunState::Running));
            }
        }
        info!(
            target: "exporter::collector",
            accounts = selected.len(),
            provider = ?filter.provider,
            resource = ?filter.resource,
            "Collection pass started"
        );

        let mut pending: BTreeSet<String> = BTreeSet::new();
        let mut last_panic: Option<String> = None;
        let mut tasks = JoinSet::new();
        for (provider, account) in selected {
            let ctx = contexts
                .entry(account.provider.clone())
                .or_insert_with(|| CollectContext {
                    products: Arc::new(products.get(&account.provider).cloned().unwrap_or_default()),
                    shard: self.shard,
                    config: Arc::clone(&config),
                })
                .clone();
            let key = account.status_key();
            pending.insert(key.clone());
            tasks.spawn(async move {
                let result = provider.collect(&ctx, &account).await;
                (key, result)
            });
        }

        let mut summary = PassSummary {
            accounts: pending.len(),
            ..PassSummary::default()
        };
        while let Some(joined) = tasks.join_next().await {
            let (key, result) = match joined {
                Ok(done) => done,
                Err(e) => {
                    error!(target: "exporter::collector", error = %e, "Account task panicked");
                    last_panic = Some(e.to_string());
                    continue;
                }
            };
            pending.remove(&key);
            let mut status = self.status.write();
            match result {
                Ok(report) => {
                    self.samples.fetch_add(report.samples, AtomicOrdering::Relaxed);
                    summary.completed += 1;
                    summary.errors += report.errors;
                    debug!(target: "exporter::collector", account = %key, samples = report.samples, errors = report.errors, "Account completed");
                    status.accounts.insert(
                        key,
                        AccountStatus {
                            samples: report.samples,
                            ..AccountStatus::new(RunState::Completed)
                        },
                    );
                }
                Err(e) => {
                    summary.failed += 1;
                    warn!(target: "exporter::collector", account = %key, class = %e.class(), error = %e, "Account collection failed");
                    status.accounts.insert(
                        key,
                        AccountStatus {
                            error: Some(e.to_string()),
                            ..AccountStatus::new(RunState::Failed)
                        },
                    );
                }
            }
        }

        let duration: Duration = timer.stop();
        summary.samples = self.samples.load(AtomicOrdering::Relaxed);
        {
            let mut status = self.status.write();
            for key in pending {
                summary.failed += 1;
                let aborted = CollectorError::TaskAborted {
                    account: key.clone(),
                    message: last_panic.clone().unwrap_or_else(|| "task ended without a result".to_string()),
                };
                status.accounts.insert(
                    key,
                    AccountStatus {
                        error: Some(aborted.to_string()),
                        ..AccountStatus::new(RunState::Failed)
                    },
                );
            }
            // Accounts dropped by an account file reload leave the status map
            let live: BTreeSet<String> = self
                .accounts
                .snapshot()
                .iter()
                .filter(|a| self.providers.get(&a.provider).is_some())
                .map(Account::status_key)
                .collect();
            status.accounts.retain(|key, _| live.contains(key));
            status.running = false;
            status.last_end = Some(Timestamp::now().to_rfc3339());
            status.duration_ms = Some(duration.as_millis() as u64);
            status.samples = summary.samples;
        }
        self.telemetry.record_pass(duration, summary.samples);

        info!(
            target: "exporter::collector",
            accounts = summary.accounts,
            completed = summary.completed,
            failed = summary.failed,
            samples = summary.samples,
            duration_ms = duration.as_millis() as u64,
            "Collection pass finished"
        );
        summary
    }
}
