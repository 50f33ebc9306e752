//! Discovery: which products (namespace + metrics) each provider should poll.
//!
//! The manager owns one versioned discovery state. A refresh asks every
//! registered [`Discoverer`] for its products and swaps the state in only when
//! the result differs semantically from what is already held; only then does
//! the version move and subscribers get signalled. A background watcher
//! refreshes periodically and whenever the account file changes in a way that
//! affects discovery.

// ============================================================================
// DISCOVERY MANAGER
// ============================================================================

use std::collections::{BTreeMap, HashMap};
use std::fmt::{self, Debug, Formatter};
use std::sync::atomic::{AtomicU64, Ordering as AtomicOrdering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use futures::future::join_all;
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::{AccountStore, ConfigManager, ExporterConfig};
use crate::error::{DiscoveryError, ExporterResult};
use crate::logging::PerfTimer;
use crate::types::{normalize_products, products_equal, AccountSet, Product, ProductMap, Timestamp};

// ============================================================================
// DISCOVERER SEAM
// ============================================================================

/// Inputs handed to every discoverer on a refresh.
#[derive(Debug, Clone)]
pub struct DiscoveryContext {
    pub accounts: Arc<AccountSet>,
    pub config: Arc<ExporterConfig>,
    pub cancel: CancellationToken,
}

/// Per-provider source of products. Must not touch shared state and must
/// return promptly once `ctx.cancel` fires.
#[async_trait]
pub trait Discoverer: Send + Sync {
    fn provider(&self) -> &str;

    async fn discover(&self, ctx: &DiscoveryContext) -> ExporterResult<Vec<Product>>;
}

/// Explicitly populated set of discoverers, one per provider.
#[derive(Default, Clone)]
pub struct DiscovererRegistry {
    discoverers: BTreeMap<String, Arc<dyn Discoverer>>,
}

impl Debug for DiscovererRegistry {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_list().entries(self.discoverers.keys()).finish()
    }
}

impl DiscovererRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers under the discoverer's provider name, replacing any previous one.
    pub fn register(&mut self, discoverer: Arc<dyn Discoverer>) {
        self.discoverers.insert(discoverer.provider().to_string(), discoverer);
    }

    pub fn get(&self, provider: &str) -> Option<&Arc<dyn Discoverer>> {
        self.discoverers.get(provider)
    }

    pub fn providers(&self) -> impl Iterator<Item = &str> {
        self.discoverers.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.discoverers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.discoverers.is_empty()
    }
}

// ============================================================================
// STATE
// ============================================================================

#[derive(Debug, Clone, Default)]
struct DiscoveryState {
    products: ProductMap,
    version: u64,
    updated_at: Option<Timestamp>,
    accounts_signature: String,
}

/// Serializable copy of the current discovery result.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DiscoverySnapshot {
    pub version: u64,
    pub updated_at: Option<String>,
    pub products: ProductMap,
}

/// Outcome of one discoverer call during the last refresh.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ProviderTiming {
    pub duration_ms: u64,
    pub products: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, Default)]
struct RefreshTimings {
    last_refresh: Option<Timestamp>,
    duration: Duration,
    refreshes: u64,
    per_provider: BTreeMap<String, ProviderTiming>,
}

#[derive(Debug, Clone, Serialize)]
pub struct DiscoveryStatus {
    pub version: u64,
    pub updated_at: Option<String>,
    pub accounts_signature: String,
    /// Provider -> number of products
    pub providers: BTreeMap<String, usize>,
    pub refreshes: u64,
    pub last_refresh: Option<String>,
    pub last_refresh_duration_ms: u64,
    pub timings: BTreeMap<String, ProviderTiming>,
    pub subscribers: usize,
}

// ============================================================================
// SUBSCRIPTIONS
// ============================================================================

#[derive(Debug, Default)]
struct SubscriberHub {
    senders: Mutex<HashMap<u64, mpsc::Sender<()>>>,
    next_id: AtomicU64,
}

impl SubscriberHub {
    fn subscribe(self: &Arc<Self>, limit: usize) -> Result<Subscription, DiscoveryError> {
        let mut senders = self.senders.lock();
        if senders.len() >= limit {
            return Err(DiscoveryError::SubscriberLimit { limit });
        }
        let id = self.next_id.fetch_add(1, AtomicOrdering::Relaxed);
        let (tx, rx) = mpsc::channel(1);
        senders.insert(id, tx);
        Ok(Subscription {
            id,
            rx,
            hub: Arc::downgrade(self),
        })
    }

    fn unsubscribe(&self, id: u64) {
        self.senders.lock().remove(&id);
    }

    /// Non-blocking; a subscriber with a pending signal keeps just that one.
    fn broadcast(&self) {
        for sender in self.senders.lock().values() {
            let _ = sender.try_send(());
        }
    }

    fn len(&self) -> usize {
        self.senders.lock().len()
    }
}

/// Single-slot change signal. Dropping it unsubscribes.
#[derive(Debug)]
pub struct Subscription {
    id: u64,
    rx: mpsc::Receiver<()>,
    hub: Weak<SubscriberHub>,
}

impl Subscription {
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Wait for the next change. `None` once the manager is gone.
    pub async fn changed(&mut self) -> Option<()> {
        self.rx.recv().await
    }

    /// Consume a pending change signal, if any
    pub fn try_changed(&mut self) -> bool {
        self.rx.try_recv().is_ok()
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(hub) = self.hub.upgrade() {
            hub.unsubscribe(self.id);
        }
    }
}

// ============================================================================
// DISCOVERY MANAGER
// ============================================================================

pub struct DiscoveryManager {
    discoverers: DiscovererRegistry,
    accounts: Arc<AccountStore>,
    config: Arc<ConfigManager>,
    state: RwLock<DiscoveryState>,
    timings: RwLock<RefreshTimings>,
    hub: Arc<SubscriberHub>,
    /// Serializes refreshes so versions are assigned in order
    refresh_lock: tokio::sync::Mutex<()>,
}

impl Debug for DiscoveryManager {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("DiscoveryManager")
            .field("discoverers", &self.discoverers)
            .field("version", &self.version())
            .finish()
    }
}

impl DiscoveryManager {
    pub fn new(discoverers: DiscovererRegistry, accounts: Arc<AccountStore>, config: Arc<ConfigManager>) -> Self {
        Self {
            discoverers,
            accounts,
            config,
            state: RwLock::new(DiscoveryState::default()),
            timings: RwLock::new(RefreshTimings::default()),
            hub: Arc::new(SubscriberHub::default()),
            refresh_lock: tokio::sync::Mutex::new(()),
        }
    }

    /// Record the initial signature, refresh once, then watch in the background
    /// until `cancel` fires.
    pub async fn start(self: &Arc<Self>, cancel: CancellationToken) -> JoinHandle<()> {
        self.state.write().accounts_signature = self.accounts.signature();
        self.refresh(&cancel).await;

        let manager = Arc::clone(self);
        tokio::spawn(async move { manager.watch(cancel).await })
    }

    async fn watch(self: Arc<Self>, cancel: CancellationToken) {
        let config = self.config.get();
        let mut account_tick = tokio::time::interval(config.discovery.account_watch_interval);
        account_tick.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let refresh_every = config.discovery.refresh_interval;
        let mut refresh_tick = tokio::time::interval_at(tokio::time::Instant::now() + refresh_every, refresh_every);
        refresh_tick.set_missed_tick_behavior(MissedTickBehavior::Skip);

        info!(
            target: "exporter::discovery",
            watch_ms = config.discovery.account_watch_interval.as_millis() as u64,
            refresh_secs = refresh_every.as_secs(),
            "Discovery watcher started"
        );

        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                _ = account_tick.tick() => self.check_accounts(&cancel).await,
                _ = refresh_tick.tick() => {
                    self.refresh(&cancel).await;
                }
            }
        }
        info!(target: "exporter::discovery", "Discovery watcher stopped");
    }

    /// Reload the account file on mtime change; refresh only if the
    /// signature moved.
    async fn check_accounts(&self, cancel: &CancellationToken) {
        match self.accounts.reload_if_modified() {
            Ok(false) => {}
            Ok(true) => {
                let signature = self.accounts.signature();
                let previous = std::mem::replace(&mut self.state.write().accounts_signature, signature.clone());
                if previous == signature {
                    debug!(target: "exporter::discovery", "Account file changed without affecting discovery");
                } else {
                    info!(target: "exporter::discovery", %previous, current = %signature, "Account signature changed, rediscovering");
                    self.refresh(cancel).await;
                }
            }
            Err(e) => warn!(target: "exporter::discovery", error = %e, "Failed to reload account file"),
        }
    }

    /// Run every discoverer and swap the state in if it changed semantically.
    /// Returns whether the version moved.
    pub async fn refresh(&self, cancel: &CancellationToken) -> bool {
        let _guard = self.refresh_lock.lock().await;
        if cancel.is_cancelled() {
            return false;
        }
        let timer = PerfTimer::with_threshold("discovery_refresh", Duration::from_secs(30));

        let ctx = DiscoveryContext {
            accounts: self.accounts.snapshot(),
            config: self.config.get(),
            cancel: cancel.child_token(),
        };

        let calls = self.discoverers.discoverers.iter().map(|(provider, discoverer)| {
            let ctx = &ctx;
            async move {
                let started = Instant::now();
                let result = discoverer.discover(ctx).await;
                (provider.clone(), result, started.elapsed())
            }
        });
        let results = join_all(calls).await;

        let mut products = ProductMap::new();
        let mut per_provider = BTreeMap::new();
        for (provider, result, elapsed) in results {
            let timing = match result {
                Ok(found) => {
                    let timing = ProviderTiming {
                        duration_ms: elapsed.as_millis() as u64,
                        products: found.len(),
                        error: None,
                    };
                    if found.is_empty() {
                        debug!(target: "exporter::discovery", provider = %provider, "Discoverer returned no products");
                    } else {
                        products.insert(provider.clone(), found);
                    }
                    timing
                }
                Err(e) => {
                    warn!(target: "exporter::discovery", provider = %provider, error = %e, "Discoverer failed");
                    ProviderTiming {
                        duration_ms: elapsed.as_millis() as u64,
                        products: 0,
                        error: Some(e.to_string()),
                    }
                }
            };
            per_provider.insert(provider, timing);
        }

        let products = normalize_products(&products);
        let changed = {
            let mut state = self.state.write();
            if products_equal(&state.products, &products) {
                false
            } else {
                state.products = products;
                state.version += 1;
                state.updated_at = Some(Timestamp::now());
                info!(
                    target: "exporter::discovery",
                    version = state.version,
                    providers = state.products.len(),
                    metrics = state.products.values().flatten().map(Product::metric_count).sum::<usize>(),
                    "Discovery changed"
                );
                true
            }
        };
        if changed {
            self.hub.broadcast();
        }

        let duration = timer.stop();
        let mut timings = self.timings.write();
        timings.last_refresh = Some(Timestamp::now());
        timings.duration = duration;
        timings.refreshes += 1;
        timings.per_provider = per_provider;
        changed
    }

    // ---- Subscriptions ----

    /// Single-slot change signal, bounded by `server.max_subscribers`
    pub fn subscribe(&self) -> Result<Subscription, DiscoveryError> {
        let limit = self.config.get().server.max_subscribers;
        self.hub.subscribe(limit)
    }

    pub fn unsubscribe(&self, id: u64) {
        self.hub.unsubscribe(id);
    }

    pub fn subscriber_count(&self) -> usize {
        self.hub.len()
    }

    // ---- Read-only snapshots ----

    /// Deep copy of the current product map
    pub fn get(&self) -> ProductMap {
        self.state.read().products.clone()
    }

    pub fn products_for(&self, provider: &str) -> Vec<Product> {
        self.state.read().products.get(provider).cloned().unwrap_or_default()
    }

    pub fn version(&self) -> u64 {
        self.state.read().version
    }

    pub fn updated_at(&self) -> Option<Timestamp> {
        self.state.read().updated_at
    }

    pub fn accounts_signature(&self) -> String {
        self.state.read().accounts_signature.clone()
    }

    pub fn snapshot(&self) -> DiscoverySnapshot {
        let state = self.state.read();
        DiscoverySnapshot {
            version: state.version,
            updated_at: state.updated_at.map(|t| t.to_rfc3339()),
            products: state.products.clone(),
        }
    }

    pub fn status(&self) -> DiscoveryStatus {
        let state = self.state.read();
        let timings = self.timings.read();
        DiscoveryStatus {
            version: state.version,
            updated_at: state.updated_at.map(|t| t.to_rfc3339()),
            accounts_signature: state.accounts_signature.clone(),
            providers: state.products.iter().map(|(p, list)| (p.clone(), list.len())).collect(),
            refreshes: timings.refreshes,
            last_refresh: timings.last_refresh.map(|t| t.to_rfc3339()),
            last_refresh_duration_ms: timings.duration.as_millis() as u64,
            timings: timings.per_provider.clone(),
            subscribers: self.hub.len(),
        }
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ExporterError;
    use crate::types::{Account, MetricGroup};
    use proptest::prelude::*;
    use std::io::Write;
    use std::sync::atomic::AtomicUsize;
    use std::time::SystemTime;

    /// Discoverer whose answer can be swapped between refreshes.
    struct ScriptedDiscoverer {
        provider: String,
        products: Mutex<Result<Vec<Product>, String>>,
        calls: AtomicUsize,
    }

    impl ScriptedDiscoverer {
        fn new(provider: &str, products: Vec<Product>) -> Arc<Self> {
            Arc::new(Self {
                provider: provider.to_string(),
                products: Mutex::new(Ok(products)),
                calls: AtomicUsize::new(0),
            })
        }

        fn set(&self, products: Result<Vec<Product>, String>) {
            *self.products.lock() = products;
        }
    }

    #[async_trait]
    impl Discoverer for ScriptedDiscoverer {
        fn provider(&self) -> &str {
            &self.provider
        }

        async fn discover(&self, _ctx: &DiscoveryContext) -> ExporterResult<Vec<Product>> {
            self.calls.fetch_add(1, AtomicOrdering::SeqCst);
            self.products
                .lock()
                .clone()
                .map_err(|e| ExporterError::Discovery(DiscoveryError::failed(self.provider.clone(), e)))
        }
    }

    /// One product per resource type declared by the provider's accounts.
    struct ResourceDiscoverer {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl Discoverer for ResourceDiscoverer {
        fn provider(&self) -> &str {
            "aws"
        }

        async fn discover(&self, ctx: &DiscoveryContext) -> ExporterResult<Vec<Product>> {
            self.calls.fetch_add(1, AtomicOrdering::SeqCst);
            Ok(ctx
                .accounts
                .for_provider("aws")
                .flat_map(|a| a.resources.clone())
                .map(|r| Product::new(format!("AWS/{r}")).with_group(MetricGroup::new(["Count"])))
                .collect())
        }
    }

    fn ecs_product(metrics: &[&str]) -> Product {
        Product::new("acs_ecs_dashboard").with_group(MetricGroup::new(metrics.iter().copied()))
    }

    fn manager_with(discoverers: &[Arc<ScriptedDiscoverer>], config: ExporterConfig) -> Arc<DiscoveryManager> {
        let mut registry = DiscovererRegistry::new();
        for d in discoverers {
            registry.register(d.clone());
        }
        let accounts = Arc::new(AccountStore::new(AccountSet::new(vec![Account::new("aliyun", "1")])));
        Arc::new(DiscoveryManager::new(registry, accounts, Arc::new(ConfigManager::new(config))))
    }

    #[tokio::test]
    async fn test_signal_only_on_semantic_change() {
        let discoverer = ScriptedDiscoverer::new("aliyun", vec![ecs_product(&["CPUUtilization"])]);
        let manager = manager_with(&[discoverer.clone()], ExporterConfig::default());
        let mut sub = manager.subscribe().unwrap();
        let cancel = CancellationToken::new();

        assert!(manager.refresh(&cancel).await);
        assert!(sub.try_changed());
        assert!(!sub.try_changed());
        assert_eq!(manager.version(), 1);
        assert!(manager.updated_at().is_some());

        assert!(!manager.refresh(&cancel).await);
        assert!(!sub.try_changed());
        assert_eq!(manager.version(), 1);
        assert_eq!(manager.status().refreshes, 2);
    }

    #[tokio::test]
    async fn test_reordering_does_not_bump_version() {
        let a = ecs_product(&["CPUUtilization", "memory_usedutilization"]);
        let b = Product::new("acs_slb_dashboard").with_group(MetricGroup::new(["Qps"]));
        let discoverer = ScriptedDiscoverer::new("aliyun", vec![a.clone(), b.clone()]);
        let manager = manager_with(&[discoverer.clone()], ExporterConfig::default());
        let cancel = CancellationToken::new();
        manager.refresh(&cancel).await;

        discoverer.set(Ok(vec![b, ecs_product(&["memory_usedutilization", "CPUUtilization"])]));
        assert!(!manager.refresh(&cancel).await);
        assert_eq!(manager.version(), 1);

        let mut changed = a;
        changed.metric_info[0].period = Some(60);
        discoverer.set(Ok(vec![changed]));
        assert!(manager.refresh(&cancel).await);
        assert_eq!(manager.version(), 2);
    }

    #[tokio::test]
    async fn test_failing_discoverer_contributes_nothing() {
        let good = ScriptedDiscoverer::new("aliyun", vec![ecs_product(&["CPUUtilization"])]);
        let bad = ScriptedDiscoverer::new("aws", vec![]);
        bad.set(Err("AccessDenied".into()));
        let manager = manager_with(&[good, bad], ExporterConfig::default());

        manager.refresh(&CancellationToken::new()).await;
        let products = manager.get();
        assert_eq!(products.len(), 1);
        assert!(products.contains_key("aliyun"));

        let status = manager.status();
        assert!(status.timings["aws"].error.is_some());
        assert_eq!(status.timings["aliyun"].products, 1);
    }

    #[tokio::test]
    async fn test_pending_signal_is_coalesced() {
        let discoverer = ScriptedDiscoverer::new("aliyun", vec![ecs_product(&["a"])]);
        let manager = manager_with(&[discoverer.clone()], ExporterConfig::default());
        let mut sub = manager.subscribe().unwrap();
        let cancel = CancellationToken::new();

        manager.refresh(&cancel).await;
        discoverer.set(Ok(vec![ecs_product(&["b"])]));
        manager.refresh(&cancel).await;

        assert_eq!(manager.version(), 2);
        assert!(sub.try_changed());
        assert!(!sub.try_changed());
    }

    #[tokio::test]
    async fn test_subscriber_cap_and_drop() {
        let mut config = ExporterConfig::default();
        config.server.max_subscribers = 2;
        let manager = manager_with(&[], config);

        let first = manager.subscribe().unwrap();
        let _second = manager.subscribe().unwrap();
        assert!(matches!(manager.subscribe(), Err(DiscoveryError::SubscriberLimit { limit: 2 })));

        drop(first);
        assert_eq!(manager.subscriber_count(), 1);
        assert!(manager.subscribe().is_ok());
    }

    #[tokio::test]
    async fn test_get_returns_independent_copy() {
        let discoverer = ScriptedDiscoverer::new("aliyun", vec![ecs_product(&["CPUUtilization"])]);
        let manager = manager_with(&[discoverer], ExporterConfig::default());
        manager.refresh(&CancellationToken::new()).await;

        let mut copy = manager.get();
        copy.get_mut("aliyun").unwrap().clear();
        assert_eq!(manager.products_for("aliyun").len(), 1);
    }

    #[tokio::test]
    async fn test_cancelled_refresh_does_nothing() {
        let discoverer = ScriptedDiscoverer::new("aliyun", vec![ecs_product(&["CPUUtilization"])]);
        let manager = manager_with(&[discoverer.clone()], ExporterConfig::default());
        let cancel = CancellationToken::new();
        cancel.cancel();

        assert!(!manager.refresh(&cancel).await);
        assert_eq!(discoverer.calls.load(AtomicOrdering::SeqCst), 0);
    }

    async fn wait_for(mut condition: impl FnMut() -> bool) -> bool {
        for _ in 0..200 {
            if condition() {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        condition()
    }

    fn rewrite(path: &std::path::Path, contents: &str, offset_secs: u64) {
        std::fs::write(path, contents).unwrap();
        let mtime = SystemTime::now() + Duration::from_secs(offset_secs);
        std::fs::File::options().write(true).open(path).unwrap().set_modified(mtime).unwrap();
    }

    #[tokio::test]
    async fn test_watcher_refreshes_only_on_signature_change() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, "accounts:\n  aws:\n    - account_id: \"1\"\n      resources: [\"ELB\"]\n").unwrap();
        let accounts = Arc::new(AccountStore::from_file(file.path()).unwrap());

        let mut config = ExporterConfig::default();
        config.discovery.account_watch_interval = Duration::from_millis(10);
        let discoverer = Arc::new(ResourceDiscoverer { calls: AtomicUsize::new(0) });
        let mut registry = DiscovererRegistry::new();
        registry.register(discoverer.clone());
        let manager = Arc::new(DiscoveryManager::new(registry, accounts, Arc::new(ConfigManager::new(config))));

        let cancel = CancellationToken::new();
        let handle = manager.start(cancel.clone()).await;
        assert_eq!(discoverer.calls.load(AtomicOrdering::SeqCst), 1);
        assert_eq!(manager.version(), 1);

        // Credentials and regions do not participate in the signature.
        rewrite(
            file.path(),
            "accounts:\n  aws:\n    - account_id: \"1\"\n      access_key_id: \"rotated\"\n      regions: [\"us-east-1\"]\n      resources: [\"ELB\"]\n",
            5,
        );
        tokio::time::sleep(Duration::from_millis(150)).await;
        assert_eq!(discoverer.calls.load(AtomicOrdering::SeqCst), 1);

        rewrite(
            file.path(),
            "accounts:\n  aws:\n    - account_id: \"1\"\n      resources: [\"ELB\", \"S3\"]\n",
            10,
        );
        assert!(wait_for(|| manager.version() == 2).await);
        assert_eq!(discoverer.calls.load(AtomicOrdering::SeqCst), 2);
        assert_eq!(manager.products_for("aws").len(), 2);

        cancel.cancel();
        tokio::time::timeout(Duration::from_secs(1), handle).await.unwrap().unwrap();
    }

    proptest! {
        #[test]
        fn prop_permutation_is_not_a_change(
            metrics in prop::collection::btree_set("[a-z]{1,8}", 1..8),
            seed in any::<u64>(),
        ) {
            let ordered: Vec<String> = metrics.iter().cloned().collect();
            let mut shuffled = ordered.clone();
            let len = shuffled.len();
            shuffled.rotate_left((seed as usize) % len);
            shuffled.reverse();

            let mut a = ProductMap::new();
            a.insert("aws".into(), vec![Product::new("AWS/EC2").with_group(MetricGroup::new(ordered))]);
            let mut b = ProductMap::new();
            b.insert("aws".into(), vec![Product::new("AWS/EC2").with_group(MetricGroup::new(shuffled))]);
            prop_assert_eq!(normalize_products(&a), normalize_products(&b));
        }
    }
}
