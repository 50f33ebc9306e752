//! Region, product and metric fan-out over a vendor monitoring API.

// ============================================================================
// PROVIDER FAN-OUT
// ============================================================================
// Vendor adapters implement `MonitoringApi` (list regions, list resources,
// query one metric page). `CloudProvider` turns that seam into a full
// `Provider`:
//
//   account ─► region pool ─► product pool ─► metric pool ─► batches ─► pages
//
// Each pool is bounded by its own semaphore. Sharding is owned by the product
// level (work key `account|region|namespace`). Failures are contained to the
// level they happen at.
// ============================================================================

use std::collections::{BTreeMap, BTreeSet};
use std::fmt::{self, Debug, Formatter};
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering as AtomicOrdering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, error, warn};

use crate::cache::ResourceCache;
use crate::canonical::{MetricRegistry, NamespaceGauge, BASE_LABELS};
use crate::collector::{CollectContext, CollectReport, Provider};
use crate::config::{ConfigManager, ExporterConfig};
use crate::discovery::{DiscoveryContext, Discoverer};
use crate::error::{CollectorError, CollectorResult, DiscoveryError, ErrorClass, ExporterResult, VendorError, VendorResult};
use crate::retry::{classify_error, retry_vendor, RetryOn, RetryPolicy};
use crate::shard::{work_key, ShardSpec};
use crate::telemetry::ApiTelemetry;
use crate::types::{Account, MetricGroup, MetricSample, Product, ResourceKey, ResourceList};

// ----------------------------------------------------------------------------
// Vendor Seam
// ----------------------------------------------------------------------------

/// What to do when a metric batch returns no data points at all.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EmptyDataPolicy {
    /// Emit a zero for every requested resource
    #[default]
    ZeroFill,
    /// Emit nothing
    Suppress,
}

/// A monitoring namespace the vendor adapter supports.
#[derive(Debug, Clone, PartialEq)]
pub struct NamespaceSpec {
    pub namespace: String,
    /// Resource-type tag accounts select this namespace with
    pub resource_type: String,
    /// Short gauge-name prefix, e.g. `slb` for `acs_slb_dashboard`
    pub prefix: Option<String>,
    /// Dimension labels beyond the base set
    pub extra_labels: Vec<String>,
    pub statistics: Vec<String>,
    /// Used by catalog discovery when the vendor catalog is empty
    pub default_metrics: Vec<String>,
    /// Overrides the provider-wide policy
    pub empty_data: Option<EmptyDataPolicy>,
}

impl NamespaceSpec {
    pub fn new(namespace: impl Into<String>, resource_type: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            resource_type: resource_type.into().to_lowercase(),
            prefix: None,
            extra_labels: Vec::new(),
            statistics: Vec::new(),
            default_metrics: Vec::new(),
            empty_data: None,
        }
    }

    pub fn with_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.prefix = Some(prefix.into());
        self
    }

    pub fn with_extra_labels<I: IntoIterator<Item = S>, S: Into<String>>(mut self, labels: I) -> Self {
        self.extra_labels = labels.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_statistics<I: IntoIterator<Item = S>, S: Into<String>>(mut self, statistics: I) -> Self {
        self.statistics = statistics.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_default_metrics<I: IntoIterator<Item = S>, S: Into<String>>(mut self, metrics: I) -> Self {
        self.default_metrics = metrics.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_empty_data(mut self, policy: EmptyDataPolicy) -> Self {
        self.empty_data = Some(policy);
        self
    }
}

/// One metric query: a batch of resource IDs, optionally continuing a page.
#[derive(Debug, Clone, PartialEq)]
pub struct MetricQuery {
    pub region: String,
    pub namespace: String,
    pub metric: String,
    pub resource_ids: Vec<String>,
    pub period: Option<u64>,
    pub statistics: Vec<String>,
    pub page_token: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct DataPoint {
    pub resource_id: String,
    pub value: f64,
    /// Free-form tag, usually the statistic
    pub tag: String,
    /// Values for the namespace's extra labels, in order
    pub dimensions: Vec<String>,
}

impl DataPoint {
    pub fn new(resource_id: impl Into<String>, value: f64) -> Self {
        Self {
            resource_id: resource_id.into(),
            value,
            tag: String::new(),
            dimensions: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct MetricPage {
    pub points: Vec<DataPoint>,
    pub next_token: Option<String>,
}

/// Vendor SDK plumbing. Errors are opaque; [`MonitoringApi::classify`]
/// maps them onto the taxonomy.
#[async_trait]
pub trait MonitoringApi: Send + Sync + 'static {
    fn provider(&self) -> &str;

    /// Namespaces this adapter knows how to poll
    fn namespaces(&self) -> Vec<NamespaceSpec>;

    async fn list_regions(&self, account: &Account) -> VendorResult<Vec<String>>;

    async fn list_resources(&self, account: &Account, region: &str, spec: &NamespaceSpec) -> VendorResult<ResourceList>;

    async fn query_metric(&self, account: &Account, query: &MetricQuery) -> VendorResult<MetricPage>;

    /// Metric catalog for a namespace; empty when the vendor has none
    async fn describe_metrics(&self, _account: &Account, _region: &str, _namespace: &str) -> VendorResult<Vec<String>> {
        Ok(Vec::new())
    }

    fn classify(&self, err: &VendorError) -> ErrorClass {
        classify_error(err)
    }
}

// ----------------------------------------------------------------------------
// Cloud Provider
// ----------------------------------------------------------------------------

/// Shared collaborators every provider writes through.
#[derive(Debug, Clone)]
pub struct ProviderDeps {
    pub cache: Arc<ResourceCache>,
    pub metrics: Arc<MetricRegistry>,
    pub telemetry: ApiTelemetry,
    pub config: Arc<ConfigManager>,
}

#[derive(Debug, Clone, Default)]
pub struct ProviderOptions {
    pub empty_data: EmptyDataPolicy,
    /// Overrides the resource types derived from the namespace list
    pub default_resources: Option<Vec<String>>,
}

type WorkItem = (Product, NamespaceSpec);

/// Per-region state shared by the product and metric tasks beneath it.
#[derive(Clone)]
struct RegionScope {
    account: Arc<Account>,
    region: Arc<str>,
    config: Arc<ExporterConfig>,
}

struct Inner<A> {
    name: String,
    api: Arc<A>,
    deps: ProviderDeps,
    specs: BTreeMap<String, NamespaceSpec>,
    default_resources: Vec<String>,
    empty_data: EmptyDataPolicy,
}

/// Generic [`Provider`] over a [`MonitoringApi`].
pub struct CloudProvider<A> {
    inner: Arc<Inner<A>>,
}

impl<A> Clone for CloudProvider<A> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<A> Debug for CloudProvider<A> {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("CloudProvider")
            .field("name", &self.inner.name)
            .field("namespaces", &self.inner.specs.keys().collect::<Vec<_>>())
            .field("empty_data", &self.inner.empty_data)
            .finish()
    }
}

fn derived_resources(specs: &BTreeMap<String, NamespaceSpec>) -> Vec<String> {
    let types: BTreeSet<String> = specs.values().map(|s| s.resource_type.clone()).collect();
    types.into_iter().collect()
}

impl<A: MonitoringApi> CloudProvider<A> {
    pub fn new(api: A, deps: ProviderDeps, options: ProviderOptions) -> Self {
        Self::from_arc(Arc::new(api), deps, options)
    }

    /// Registers each namespace's gauge prefix with the metric registry.
    pub fn from_arc(api: Arc<A>, deps: ProviderDeps, options: ProviderOptions) -> Self {
        let specs: BTreeMap<String, NamespaceSpec> = api.namespaces().into_iter().map(|s| (s.namespace.clone(), s)).collect();
        for spec in specs.values() {
            if let Some(prefix) = &spec.prefix {
                deps.metrics.register_prefix(&spec.namespace, prefix);
            }
        }
        let default_resources = options.default_resources.unwrap_or_else(|| derived_resources(&specs));
        Self {
            inner: Arc::new(Inner {
                name: api.provider().to_string(),
                api,
                deps,
                specs,
                default_resources,
                empty_data: options.empty_data,
            }),
        }
    }

    pub fn empty_data_policy(&self) -> EmptyDataPolicy {
        self.inner.empty_data
    }

    /// Effective policy for one namespace
    pub fn policy_for(&self, namespace: &str) -> EmptyDataPolicy {
        self.inner.policy_for(namespace)
    }

    /// Discoverer backed by the same vendor API
    pub fn catalog_discoverer(&self) -> CatalogDiscoverer<A> {
        CatalogDiscoverer {
            api: Arc::clone(&self.inner.api),
            specs: self.inner.specs.values().cloned().collect(),
            default_resources: self.inner.default_resources.clone(),
        }
    }
}

#[async_trait]
impl<A: MonitoringApi> Provider for CloudProvider<A> {
    fn name(&self) -> &str {
        &self.inner.name
    }

    fn default_resources(&self) -> Vec<String> {
        self.inner.default_resources.clone()
    }

    async fn collect(&self, ctx: &CollectContext, account: &Account) -> CollectorResult<CollectReport> {
        let inner = &self.inner;
        let resources: BTreeSet<String> = account.effective_resources(&inner.default_resources).into_iter().collect();
        let work: Vec<WorkItem> = ctx
            .products
            .iter()
            .filter_map(|product| {
                let spec = inner.specs.get(&product.namespace)?;
                resources.contains(&spec.resource_type).then(|| (product.clone(), spec.clone()))
            })
            .collect();
        if work.is_empty() {
            debug!(target: "exporter::fanout", provider = %inner.name, account = %account.account_id, "No products apply to account");
            return Ok(CollectReport::default());
        }

        let regions = inner.regions(account, &ctx.config).await?;
        let account = Arc::new(account.clone());
        let work = Arc::new(work);
        let semaphore = Arc::new(Semaphore::new(ctx.config.collection.region_concurrency.max(1)));
        let mut tasks = JoinSet::new();

        for region in regions {
            let Ok(permit) = Arc::clone(&semaphore).acquire_owned().await else {
                break;
            };
            let inner = Arc::clone(inner);
            let scope = RegionScope {
                account: Arc::clone(&account),
                region: Arc::from(region.as_str()),
                config: Arc::clone(&ctx.config),
            };
            let work = Arc::clone(&work);
            let shard = ctx.shard;
            tasks.spawn(async move {
                let _permit = permit;
                inner.collect_region(scope, work, shard).await
            });
        }

        let mut report = CollectReport::default();
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok(region_report) => report += region_report,
                Err(e) => {
                    report.errors += 1;
                    error!(target: "exporter::fanout", provider = %inner.name, account = %account.account_id, error = %e, "Region task panicked");
                }
            }
        }
        Ok(report)
    }
}

impl<A: MonitoringApi> Inner<A> {
    fn policy_for(&self, namespace: &str) -> EmptyDataPolicy {
        self.specs
            .get(namespace)
            .and_then(|s| s.empty_data)
            .unwrap_or(self.empty_data)
    }

    /// One vendor call with retry; every attempt is recorded in telemetry.
    async fn call<T, F, Fut>(&self, api: &'static str, retry_on: RetryOn, policy: &RetryPolicy, mut op: F) -> VendorResult<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = VendorResult<T>>,
    {
        let telemetry = &self.deps.telemetry;
        let provider = self.name.as_str();
        let classify = |e: &VendorError| self.api.classify(e);
        retry_vendor(policy, retry_on, classify, || {
            let started = Instant::now();
            let attempt = op();
            async move {
                let result = attempt.await;
                telemetry.record_request(provider, api, result.as_ref().err().map(classify), started.elapsed());
                result
            }
        })
        .await
    }

    fn log_failure(&self, class: ErrorClass, stage: &str, scope: &RegionScope, namespace: &str, metric: Option<&str>, err: &VendorError) {
        let account = scope.account.account_id.as_str();
        let region = &*scope.region;
        let metric = metric.unwrap_or("");
        match class {
            ErrorClass::RegionSkip => {
                debug!(target: "exporter::fanout", provider = %self.name, account, region, namespace, metric, stage, "Region skipped")
            }
            _ => {
                warn!(target: "exporter::fanout", provider = %self.name, account, region, namespace, metric, stage, class = %class, error = %err, "Vendor call failed")
            }
        }
    }

    async fn pause(&self, delay: Duration) {
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
    }

    /// Explicit regions plus, for wildcard accounts, whatever the vendor lists.
    async fn regions(&self, account: &Account, config: &ExporterConfig) -> CollectorResult<Vec<String>> {
        let mut regions: BTreeSet<String> = account.explicit_regions().into_iter().collect();
        if account.discovers_all_regions() {
            let listed = self
                .call("ListRegions", RetryOn::LimitOrNetwork, &config.collection.retry, || self.api.list_regions(account))
                .await;
            match listed {
                Ok(found) => regions.extend(found),
                Err(e) => {
                    let class = self.api.classify(&e);
                    if regions.is_empty() {
                        return Err(CollectorError::collection_failed(account.status_key(), class, e.message));
                    }
                    warn!(target: "exporter::fanout", provider = %self.name, account = %account.account_id, class = %class, error = %e, "Region listing failed, using explicit regions");
                }
            }
        }
        Ok(regions.into_iter().collect())
    }

    async fn collect_region(self: Arc<Self>, scope: RegionScope, work: Arc<Vec<WorkItem>>, shard: ShardSpec) -> CollectReport {
        let semaphore = Arc::new(Semaphore::new(scope.config.collection.product_concurrency.max(1)));
        let blocked = Arc::new(AtomicBool::new(false));
        let mut tasks = JoinSet::new();

        for (product, spec) in work.iter() {
            if !shard.owns(&work_key(&[scope.account.account_id.as_str(), &*scope.region, product.namespace.as_str()])) {
                continue;
            }
            let Ok(permit) = Arc::clone(&semaphore).acquire_owned().await else {
                break;
            };
            if blocked.load(AtomicOrdering::Acquire) {
                debug!(target: "exporter::fanout", provider = %self.name, region = %scope.region, "Skipping remaining products in region");
                break;
            }
            let inner = Arc::clone(&self);
            let scope = scope.clone();
            let (product, spec) = (product.clone(), spec.clone());
            let blocked = Arc::clone(&blocked);
            tasks.spawn(async move {
                let _permit = permit;
                let (report, failure) = inner.collect_product(scope, product, spec).await;
                if failure.map_or(false, |class| class.is_permanent()) {
                    blocked.store(true, AtomicOrdering::Release);
                }
                report
            });
        }

        let mut report = CollectReport::default();
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok(product_report) => report += product_report,
                Err(e) => {
                    report.errors += 1;
                    error!(target: "exporter::fanout", provider = %self.name, region = %scope.region, error = %e, "Product task panicked");
                }
            }
        }
        report
    }

    /// Resource IDs for the namespace, from cache or a live enumeration.
    async fn resources(&self, scope: &RegionScope, spec: &NamespaceSpec) -> Result<Vec<String>, ErrorClass> {
        let key = ResourceKey::new(&*scope.account.account_id, &*scope.region, &*spec.namespace, &*spec.resource_type);
        if let Some(hit) = self.deps.cache.get(&key, scope.config.cache.resource_ttl) {
            return Ok(hit.ids);
        }
        let listed = self
            .call("ListResources", RetryOn::LimitOrNetwork, &scope.config.collection.retry, || {
                self.api.list_resources(&scope.account, &scope.region, spec)
            })
            .await;
        match listed {
            Ok(list) => {
                let ids = list.ids.clone();
                self.deps.cache.set(key, list);
                Ok(ids)
            }
            Err(e) => {
                let class = self.api.classify(&e);
                self.log_failure(class, "list_resources", scope, &spec.namespace, None, &e);
                Err(class)
            }
        }
    }

    async fn collect_product(self: Arc<Self>, scope: RegionScope, product: Product, spec: NamespaceSpec) -> (CollectReport, Option<ErrorClass>) {
        let ids = match self.resources(&scope, &spec).await {
            Ok(ids) => ids,
            Err(class) => return (CollectReport { samples: 0, errors: 1 }, Some(class)),
        };
        if ids.is_empty() {
            debug!(target: "exporter::fanout", provider = %self.name, region = %scope.region, namespace = %spec.namespace, "No resources");
            return (CollectReport::default(), None);
        }

        let ids = Arc::new(ids);
        let spec = Arc::new(spec);
        let semaphore = Arc::new(Semaphore::new(scope.config.collection.metric_concurrency.max(1)));
        let mut tasks = JoinSet::new();

        for group in &product.metric_info {
            for metric in &group.metric_list {
                let Ok(permit) = Arc::clone(&semaphore).acquire_owned().await else {
                    break;
                };
                let inner = Arc::clone(&self);
                let (scope, spec, ids) = (scope.clone(), Arc::clone(&spec), Arc::clone(&ids));
                let (metric, group) = (metric.clone(), group.clone());
                tasks.spawn(async move {
                    let _permit = permit;
                    inner.collect_metric(&scope, &spec, &metric, &group, &ids).await
                });
            }
        }

        let mut report = CollectReport::default();
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok(metric_report) => report += metric_report,
                Err(e) => {
                    report.errors += 1;
                    error!(target: "exporter::fanout", provider = %self.name, namespace = %spec.namespace, error = %e, "Metric task panicked");
                }
            }
        }
        (report, None)
    }

    async fn collect_metric(&self, scope: &RegionScope, spec: &NamespaceSpec, metric: &str, group: &MetricGroup, ids: &[String]) -> CollectReport {
        let mut report = CollectReport::default();
        let extra: Vec<&str> = spec.extra_labels.iter().map(String::as_str).collect();
        let gauge = match self.deps.metrics.namespace_gauge(&spec.namespace, metric, &extra) {
            Ok(gauge) => gauge,
            Err(e) => {
                error!(target: "exporter::fanout", namespace = %spec.namespace, metric, error = %e, "No gauge for metric");
                report.errors += 1;
                return report;
            }
        };
        let policy = self.policy_for(&spec.namespace);
        let collection = &scope.config.collection;
        let statistics = if group.statistics.is_empty() { &spec.statistics } else { &group.statistics };

        'batches: for (index, batch) in ids.chunks(collection.batch_size.max(1)).enumerate() {
            if index > 0 {
                self.pause(collection.page_delay).await;
            }
            let mut token: Option<String> = None;
            let mut points = 0usize;
            loop {
                let query = MetricQuery {
                    region: scope.region.to_string(),
                    namespace: spec.namespace.clone(),
                    metric: metric.to_string(),
                    resource_ids: batch.to_vec(),
                    period: group.period,
                    statistics: statistics.clone(),
                    page_token: token.take(),
                };
                let page = self
                    .call("QueryMetric", RetryOn::LimitOrNetwork, &collection.retry, || {
                        self.api.query_metric(&scope.account, &query)
                    })
                    .await;
                match page {
                    Ok(page) => {
                        points += page.points.len();
                        for point in &page.points {
                            if self.write(&gauge, scope, spec, metric, &point.resource_id, &point.tag, &point.dimensions, point.value) {
                                report.samples += 1;
                            } else {
                                report.errors += 1;
                            }
                        }
                        match page.next_token.filter(|t| !t.is_empty()) {
                            Some(next) => {
                                token = Some(next);
                                self.pause(collection.page_delay).await;
                            }
                            None => break,
                        }
                    }
                    Err(e) => {
                        let class = self.api.classify(&e);
                        self.log_failure(class, "query_metric", scope, &spec.namespace, Some(metric), &e);
                        report.errors += 1;
                        if class.is_permanent() {
                            break 'batches;
                        }
                        continue 'batches;
                    }
                }
            }

            if points == 0 && policy == EmptyDataPolicy::ZeroFill {
                let tag = statistics.first().map(String::as_str).unwrap_or("");
                for id in batch {
                    if self.write(&gauge, scope, spec, metric, id, tag, &[], 0.0) {
                        report.samples += 1;
                    }
                }
            }
        }
        report
    }

    #[allow(clippy::too_many_arguments)]
    fn write(
        &self,
        gauge: &NamespaceGauge,
        scope: &RegionScope,
        spec: &NamespaceSpec,
        metric: &str,
        resource_id: &str,
        tag: &str,
        dimensions: &[String],
        value: f64,
    ) -> bool {
        let sample = MetricSample {
            provider: &self.name,
            account_id: &scope.account.account_id,
            region: &scope.region,
            resource_type: &spec.resource_type,
            resource_id,
            namespace: &spec.namespace,
            metric,
            tag,
            value,
        };
        let mut labels: Vec<&str> = sample.label_values().to_vec();
        labels.extend(dimensions.iter().map(String::as_str));
        let expected = gauge.label_count();
        if labels.len() > expected {
            debug!(
                target: "exporter::fanout",
                gauge = gauge.name(),
                resource_id,
                expected = expected - BASE_LABELS.len(),
                actual = dimensions.len(),
                "Dimensions beyond the namespace's extra labels dropped"
            );
        }
        labels.resize(expected, "");

        match gauge.set(&labels, sample.value) {
            Ok(()) => true,
            Err(e) => {
                debug!(target: "exporter::fanout", gauge = gauge.name(), resource_id, error = %e, "Dropped sample");
                false
            }
        }
    }
}

// ----------------------------------------------------------------------------
// Catalog Discoverer
// ----------------------------------------------------------------------------

/// Builds one product per namespace that some account of the provider
/// polls, listing the metrics the vendor catalog reports for it.
pub struct CatalogDiscoverer<A> {
    api: Arc<A>,
    specs: Vec<NamespaceSpec>,
    default_resources: Vec<String>,
}

impl<A> Debug for CatalogDiscoverer<A> {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("CatalogDiscoverer").field("namespaces", &self.specs.len()).finish()
    }
}

#[async_trait]
impl<A: MonitoringApi> Discoverer for CatalogDiscoverer<A> {
    fn provider(&self) -> &str {
        self.api.provider()
    }

    async fn discover(&self, ctx: &DiscoveryContext) -> ExporterResult<Vec<Product>> {
        let provider = self.api.provider();
        let accounts: Vec<&Account> = ctx.accounts.for_provider(provider).collect();
        let Some(first_account) = accounts.first().copied() else {
            return Ok(Vec::new());
        };
        let wanted: BTreeSet<String> = accounts
            .iter()
            .flat_map(|a| a.effective_resources(&self.default_resources))
            .collect();
        let retry = &ctx.config.collection.retry;
        let classify = |e: &VendorError| self.api.classify(e);

        let region = match first_account.explicit_regions().into_iter().next() {
            Some(region) => region,
            None => {
                let regions = retry_vendor(retry, RetryOn::LimitOrNetwork, classify, || self.api.list_regions(first_account))
                    .await
                    .map_err(|e| DiscoveryError::failed(provider, e.message))?;
                match regions.into_iter().next() {
                    Some(region) => region,
                    None => return Ok(Vec::new()),
                }
            }
        };

        let mut products = Vec::new();
        for spec in self.specs.iter().filter(|s| wanted.contains(&s.resource_type)) {
            if ctx.cancel.is_cancelled() {
                return Err(DiscoveryError::Cancelled.into());
            }
            // Throttling is not retried here; any failure falls back to the defaults
            let described = retry_vendor(retry, RetryOn::NetworkOnly, classify, || {
                self.api.describe_metrics(first_account, &region, &spec.namespace)
            })
            .await;
            let mut metrics = match described {
                Ok(metrics) if !metrics.is_empty() => metrics,
                Ok(_) => spec.default_metrics.clone(),
                Err(e) => {
                    warn!(
                        target: "exporter::discovery",
                        provider,
                        namespace = %spec.namespace,
                        class = %classify(&e),
                        error = %e,
                        "Metric catalog unavailable, using default metrics"
                    );
                    spec.default_metrics.clone()
                }
            };
            metrics.sort();
            metrics.dedup();
            if metrics.is_empty() {
                continue;
            }
            products.push(Product {
                namespace: spec.namespace.clone(),
                auto_discover: true,
                metric_info: vec![MetricGroup {
                    period: None,
                    metric_list: metrics,
                    statistics: spec.statistics.clone(),
                }],
            });
        }
        Ok(products)
    }
}

// ============================================================================
// TESTS
// ============================================================================
