//! Core data model shared by discovery, collection and the admin surface.

// ============================================================================
// CORE DATA TYPES
// ============================================================================

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fmt::{self, Debug, Display, Formatter};
use std::hash::Hasher;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use chrono::{DateTime, Utc};
use fnv::FnvHasher;
use serde::{Deserialize, Serialize};

/// Region / resource-type wildcard meaning "discover all" or "provider defaults".
pub const WILDCARD: &str = "*";

// ============================================================================
// TIMESTAMPS
// ============================================================================

/// Wall-clock timestamp in nanoseconds since Unix epoch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[repr(transparent)]
pub struct Timestamp(i64);

impl Timestamp {
    /// Zero timestamp (Unix epoch)
    pub const EPOCH: Timestamp = Timestamp(0);

    #[inline]
    pub const fn from_nanos(nanos: i64) -> Self {
        Self(nanos)
    }

    #[inline]
    pub const fn from_millis(millis: i64) -> Self {
        Self(millis * 1_000_000)
    }

    #[inline]
    pub const fn from_secs(secs: i64) -> Self {
        Self(secs * 1_000_000_000)
    }

    /// Current wall-clock time
    #[inline]
    pub fn now() -> Self {
        Self::from(SystemTime::now())
    }

    #[inline]
    pub const fn as_nanos(&self) -> i64 {
        self.0
    }

    #[inline]
    pub const fn as_millis(&self) -> i64 {
        self.0 / 1_000_000
    }

    #[inline]
    pub const fn as_secs(&self) -> i64 {
        self.0 / 1_000_000_000
    }

    /// Duration between two timestamps, zero if `earlier` is in the future
    #[inline]
    pub fn duration_since(&self, earlier: Timestamp) -> Duration {
        let nanos = self.0.saturating_sub(earlier.0);
        Duration::from_nanos(nanos.max(0) as u64)
    }

    #[inline]
    pub fn add_duration(&self, duration: Duration) -> Self {
        Self(self.0.saturating_add(duration.as_nanos() as i64))
    }

    pub fn to_datetime(&self) -> DateTime<Utc> {
        let secs = self.0.div_euclid(1_000_000_000);
        let nanos = self.0.rem_euclid(1_000_000_000) as u32;
        DateTime::from_timestamp(secs, nanos).unwrap_or_default()
    }

    /// RFC 3339 rendering used by the JSON admin endpoints
    pub fn to_rfc3339(&self) -> String {
        self.to_datetime().to_rfc3339()
    }
}

impl Display for Timestamp {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_datetime().format("%Y-%m-%d %H:%M:%S%.3f UTC"))
    }
}

impl From<SystemTime> for Timestamp {
    fn from(st: SystemTime) -> Self {
        let duration = st.duration_since(UNIX_EPOCH).unwrap_or_default();
        Self(duration.as_nanos() as i64)
    }
}

// ============================================================================
// ACCOUNTS
// ============================================================================
// Accounts are loaded from the account file and replaced wholesale on change.
// Readers always hold an `Arc<AccountSet>` snapshot and never see a partial
// update.
// ============================================================================

// ----------------------------------------------------------------------------
// Credentials
// ----------------------------------------------------------------------------

/// Vendor credentials. The secret never appears in `Debug` output or JSON.
#[derive(Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Credentials {
    /// Access key identifier
    #[serde(default)]
    pub access_key_id: String,
    /// Never serialized back out
    #[serde(default, skip_serializing)]
    pub access_key_secret: String,
    /// STS token for temporary credentials
    #[serde(default, skip_serializing)]
    pub session_token: Option<String>,
    /// Optional role ARN for the account
    #[serde(default)]
    pub role_arn: Option<String>,
}

impl Debug for Credentials {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("access_key_id", &self.access_key_id)
            .field("access_key_secret", &"<redacted>")
            .field("role_arn", &self.role_arn)
            .finish()
    }
}

// ----------------------------------------------------------------------------
// Account
// ----------------------------------------------------------------------------

/// One cloud account to collect from.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Account {
    /// Provider name; filled from the account file's grouping key
    #[serde(default)]
    pub provider: String,
    /// Account identifier, unique within a provider
    pub account_id: String,
    #[serde(flatten)]
    pub credentials: Credentials,
    /// Explicit regions; empty or containing `*` means "discover all"
    #[serde(default)]
    pub regions: Vec<String>,
    /// Resource-type tags; empty or containing `*` means "provider defaults"
    #[serde(default)]
    pub resources: Vec<String>,
}

impl Account {
    pub fn new(provider: impl Into<String>, account_id: impl Into<String>) -> Self {
        Self {
            provider: provider.into(),
            account_id: account_id.into(),
            ..Self::default()
        }
    }

    pub fn with_regions<I, S>(mut self, regions: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.regions = regions.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_resources<I, S>(mut self, resources: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.resources = resources.into_iter().map(Into::into).collect();
        self
    }

    /// `provider|account_id`, the key used by the status map
    pub fn status_key(&self) -> String {
        format!("{}|{}", self.provider, self.account_id)
    }

    pub fn discovers_all_regions(&self) -> bool {
        self.regions.is_empty() || self.regions.iter().any(|r| r.trim() == WILDCARD)
    }

    /// Explicitly named regions, wildcard removed
    pub fn explicit_regions(&self) -> Vec<String> {
        self.regions
            .iter()
            .map(|r| r.trim())
            .filter(|r| !r.is_empty() && *r != WILDCARD)
            .map(str::to_string)
            .collect()
    }

    pub fn uses_default_resources(&self) -> bool {
        self.resources.is_empty() || self.resources.iter().any(|r| r.trim() == WILDCARD)
    }

    /// Resource types this account is polled for: the explicit list, or the
    /// provider defaults when the list is empty or a wildcard.
    pub fn effective_resources(&self, defaults: &[String]) -> Vec<String> {
        let source: Vec<&str> = if self.uses_default_resources() {
            defaults.iter().map(String::as_str).collect()
        } else {
            self.resources.iter().map(String::as_str).collect()
        };
        let unique: BTreeSet<String> = source
            .into_iter()
            .map(|r| r.trim().to_lowercase())
            .filter(|r| !r.is_empty() && r != WILDCARD)
            .collect();
        unique.into_iter().collect()
    }

    /// Sorted, deduplicated declared resource types (wildcard kept verbatim)
    fn signature_resources(&self) -> Vec<String> {
        let unique: BTreeSet<String> = self
            .resources
            .iter()
            .map(|r| r.trim().to_lowercase())
            .filter(|r| !r.is_empty())
            .collect();
        unique.into_iter().collect()
    }
}

// ----------------------------------------------------------------------------
// Account Set
// ----------------------------------------------------------------------------

/// Immutable collection of accounts, swapped as a whole on reload.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AccountSet {
    accounts: Vec<Account>,
}

impl AccountSet {
    pub fn new(accounts: Vec<Account>) -> Self {
        Self { accounts }
    }

    pub fn iter(&self) -> impl Iterator<Item = &Account> {
        self.accounts.iter()
    }

    pub fn len(&self) -> usize {
        self.accounts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.accounts.is_empty()
    }

    pub fn for_provider<'a>(&'a self, provider: &'a str) -> impl Iterator<Item = &'a Account> + 'a {
        self.accounts.iter().filter(move |a| a.provider == provider)
    }

    pub fn providers(&self) -> BTreeSet<String> {
        self.accounts.iter().map(|a| a.provider.clone()).collect()
    }

    /// Deterministic digest of (provider, sorted resource types) pairs.
    ///
    /// Credentials, regions and file layout do not participate, so touching
    /// the account file without changing what gets discovered leaves the
    /// signature unchanged.
    pub fn signature(&self) -> String {
        let mut tuples: Vec<String> = self
            .accounts
            .iter()
            .map(|a| format!("{}:{}", a.provider, a.signature_resources().join(",")))
            .collect();
        tuples.sort();
        tuples.dedup();

        let mut hasher = FnvHasher::default();
        hasher.write(tuples.join(";").as_bytes());
        format!("{:016x}", hasher.finish())
    }
}

impl FromIterator<Account> for AccountSet {
    fn from_iter<T: IntoIterator<Item = Account>>(iter: T) -> Self {
        Self::new(iter.into_iter().collect())
    }
}

// ============================================================================
// PRODUCTS
// ============================================================================

/// One group of metrics sharing a sampling period and statistic selection.
#[derive(Debug, Clone, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct MetricGroup {
    /// Sampling period override in seconds
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub period: Option<u64>,
    /// Metric names sharing this period
    #[serde(default)]
    pub metric_list: Vec<String>,
    /// Statistic suffixes; empty selects the provider default
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub statistics: Vec<String>,
}

impl MetricGroup {
    pub fn new<I, S>(metrics: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            period: None,
            metric_list: metrics.into_iter().map(Into::into).collect(),
            statistics: Vec::new(),
        }
    }

    fn normalized(&self) -> Self {
        let mut group = self.clone();
        group.metric_list.sort();
        group.statistics.sort();
        group
    }
}

/// A monitoring namespace plus the metrics to poll in it.
#[derive(Debug, Clone, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Product {
    /// Vendor monitoring namespace, e.g. `acs_ecs_dashboard`
    pub namespace: String,
    /// Metric list came from the vendor catalog
    #[serde(default)]
    pub auto_discover: bool,
    /// Metric groups collected for this namespace
    #[serde(default)]
    pub metric_info: Vec<MetricGroup>,
}

impl Product {
    pub fn new(namespace: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            ..Self::default()
        }
    }

    pub fn with_group(mut self, group: MetricGroup) -> Self {
        self.metric_info.push(group);
        self
    }

    /// Copy with every list sorted, so that equality ignores ordering.
    pub fn normalized(&self) -> Self {
        let mut groups: Vec<MetricGroup> = self.metric_info.iter().map(MetricGroup::normalized).collect();
        groups.sort();
        Self {
            namespace: self.namespace.clone(),
            auto_discover: self.auto_discover,
            metric_info: groups,
        }
    }

    pub fn metric_count(&self) -> usize {
        self.metric_info.iter().map(|g| g.metric_list.len()).sum()
    }
}

/// Provider name -> products to poll for that provider.
pub type ProductMap = BTreeMap<String, Vec<Product>>;

/// Order-insensitive canonical form of a product map. Providers that
/// contributed nothing are dropped.
pub fn normalize_products(map: &ProductMap) -> ProductMap {
    map.iter()
        .filter(|(_, products)| !products.is_empty())
        .map(|(provider, products)| {
            let mut normalized: Vec<Product> = products.iter().map(Product::normalized).collect();
            normalized.sort();
            (provider.clone(), normalized)
        })
        .collect()
}

/// Deep equality that ignores map/slice ordering but is sensitive to every field.
pub fn products_equal(a: &ProductMap, b: &ProductMap) -> bool {
    normalize_products(a) == normalize_products(b)
}

// ============================================================================
// RESOURCES
// ============================================================================

/// Cache key for one resource enumeration.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ResourceKey {
    pub account_id: String,
    pub region: String,
    pub namespace: String,
    pub resource_type: String,
}

impl ResourceKey {
    pub fn new(
        account_id: impl Into<String>,
        region: impl Into<String>,
        namespace: impl Into<String>,
        resource_type: impl Into<String>,
    ) -> Self {
        Self {
            account_id: account_id.into(),
            region: region.into(),
            namespace: namespace.into(),
            resource_type: resource_type.into(),
        }
    }
}

impl Display for ResourceKey {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}|{}|{}|{}", self.account_id, self.region, self.namespace, self.resource_type)
    }
}

/// Result of a resource enumeration: ordered IDs plus opaque per-ID metadata.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ResourceList {
    /// Resource IDs in enumeration order
    pub ids: Vec<String>,
    /// Per-resource attributes keyed by resource ID
    pub metadata: HashMap<String, BTreeMap<String, String>>,
}

impl ResourceList {
    pub fn from_ids<I, S>(ids: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            ids: ids.into_iter().map(Into::into).collect(),
            metadata: HashMap::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }
}

// ============================================================================
// SAMPLES
// ============================================================================

/// One current-value sample, prior to being written into its gauge sink.
#[derive(Debug, Clone, PartialEq)]
pub struct MetricSample<'a> {
    pub provider: &'a str,
    pub account_id: &'a str,
    pub region: &'a str,
    /// Resource-type tag the sample was collected under
    pub resource_type: &'a str,
    pub resource_id: &'a str,
    pub namespace: &'a str,
    pub metric: &'a str,
    /// Statistic suffix, e.g. `Average`
    pub tag: &'a str,
    /// Already scaled to the canonical unit
    pub value: f64,
}

impl<'a> MetricSample<'a> {
    /// Label values in the order of [`crate::canonical::BASE_LABELS`]
    pub fn label_values(&self) -> [&'a str; 8] {
        [
            self.provider,
            self.account_id,
            self.region,
            self.resource_type,
            self.resource_id,
            self.namespace,
            self.metric,
            self.tag,
        ]
    }
}

// ============================================================================
// TESTS
// ============================================================================
