//! Exporter configuration and the hot-reloaded account file.

// ============================================================================
// CONFIGURATION SYSTEM
// ============================================================================
// Exporter settings come from a TOML file merged with EXPORTER_-prefixed
// environment variables. Accounts live in a separate, externally managed YAML
// file that is watched for changes and swapped in as a whole.
// ============================================================================

use std::collections::BTreeMap;
use std::fmt::{self, Debug, Formatter};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use arc_swap::ArcSwap;
use figment::providers::{Env, Format, Toml};
use figment::Figment;
use once_cell::sync::Lazy;
use parking_lot::Mutex;
use regex::{Captures, Regex};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::error::{ConfigError, ConfigResult};
use crate::retry::RetryPolicy;
use crate::types::{Account, AccountSet};
use crate::{
    ACCOUNTS_FILE_ENV, DEFAULT_ACCOUNT_WATCH_INTERVAL_MS, DEFAULT_BATCH_SIZE, DEFAULT_COLLECTION_INTERVAL_SECS,
    DEFAULT_DISCOVERY_REFRESH_SECS, DEFAULT_LISTEN_ADDR, DEFAULT_MAX_SUBSCRIBERS, DEFAULT_METRICS_PATH,
    DEFAULT_METRIC_CONCURRENCY, DEFAULT_PAGE_DELAY_MS, DEFAULT_PRODUCT_CONCURRENCY, DEFAULT_REGION_CONCURRENCY,
    DEFAULT_RESOURCE_TTL_SECS, DEFAULT_STREAM_MAX_LIFETIME_SECS,
};

// ----------------------------------------------------------------------------
// Root Configuration
// ----------------------------------------------------------------------------

/// Root configuration structure
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExporterConfig {
    /// HTTP listener and admin API
    pub server: ServerSettings,
    /// Pass interval, fan-out concurrency and retry policy
    pub collection: CollectionSettings,
    /// Resource enumeration cache
    pub cache: CacheSettings,
    /// Rediscovery and account file polling
    pub discovery: DiscoverySettings,
    /// Account file location
    pub accounts: AccountsSettings,
    /// Replica sharding
    pub cluster: ClusterSettings,
    /// Log level and output format
    pub logging: LoggingSettings,
}

impl ExporterConfig {
    /// Load configuration from file with environment overrides
    pub fn load<P: AsRef<Path>>(path: P) -> ConfigResult<Self> {
        let path = path.as_ref();
        if !path.exists() {
            return Err(ConfigError::FileNotFound { path: path.to_path_buf() });
        }

        let config: Self = Figment::new()
            .merge(Toml::file(path))
            .merge(Env::prefixed("EXPORTER_").split("__"))
            .extract()
            .map_err(|e| ConfigError::parse(e.to_string()))?;

        config.validate()?;
        Ok(config)
    }

    /// Defaults merged with environment overrides, for running without a file
    pub fn from_env() -> ConfigResult<Self> {
        let config: Self = Figment::from(figment::providers::Serialized::defaults(Self::default()))
            .merge(Env::prefixed("EXPORTER_").split("__"))
            .extract()
            .map_err(|e| ConfigError::parse(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Load from string (for testing)
    pub fn from_str(toml_str: &str) -> ConfigResult<Self> {
        let config: Self = toml::from_str(toml_str).map_err(|e| ConfigError::parse(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> ConfigResult<()> {
        if self.server.listen_addr.trim().is_empty() {
            return Err(ConfigError::invalid_value("server.listen_addr", "listen address cannot be empty"));
        }
        let metrics_path = self.server.metrics_path.as_str();
        if !metrics_path.starts_with('/') {
            return Err(ConfigError::invalid_value("server.metrics_path", "path must start with '/'"));
        }
        if metrics_path == "/healthz" || metrics_path == "/api" || metrics_path.starts_with("/api/") {
            return Err(ConfigError::invalid_value(
                "server.metrics_path",
                format!("'{metrics_path}' collides with a built-in route"),
            ));
        }
        if self.server.max_subscribers == 0 {
            return Err(ConfigError::invalid_value("server.max_subscribers", "must be at least 1"));
        }

        let collection = &self.collection;
        for (field, value) in [
            ("collection.region_concurrency", collection.region_concurrency),
            ("collection.product_concurrency", collection.product_concurrency),
            ("collection.metric_concurrency", collection.metric_concurrency),
            ("collection.batch_size", collection.batch_size),
        ] {
            if value == 0 {
                return Err(ConfigError::invalid_value(field, "must be at least 1"));
            }
        }
        if collection.interval.is_zero() {
            return Err(ConfigError::invalid_value("collection.interval", "must be greater than zero"));
        }
        if collection.retry.backoff_factor < 1.0 {
            return Err(ConfigError::invalid_value("collection.retry.backoff_factor", "must be at least 1.0"));
        }
        if self.discovery.account_watch_interval.is_zero() || self.discovery.refresh_interval.is_zero() {
            return Err(ConfigError::invalid_value("discovery", "intervals must be greater than zero"));
        }
        Ok(())
    }

    /// Default config rendered as TOML
    pub fn generate_default_config() -> String {
        toml::to_string_pretty(&Self::default()).unwrap_or_default()
    }
}

// ----------------------------------------------------------------------------
// Sections
// ----------------------------------------------------------------------------

/// Metrics and admin HTTP surface
#[derive(Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerSettings {
    /// Socket address the HTTP server binds
    pub listen_addr: String,
    /// Scrape path; must not collide with `/healthz` or `/api`
    pub metrics_path: String,
    /// Basic auth for admin endpoints; disabled unless both are set
    pub admin_username: Option<String>,
    #[serde(skip_serializing)]
    pub admin_password: Option<String>,
    /// Hard lifetime of a discovery stream connection
    #[serde(with = "humantime_serde")]
    pub stream_max_lifetime: Duration,
    /// Concurrent discovery stream connections
    pub max_subscribers: usize,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            listen_addr: DEFAULT_LISTEN_ADDR.to_string(),
            metrics_path: DEFAULT_METRICS_PATH.to_string(),
            admin_username: None,
            admin_password: None,
            stream_max_lifetime: Duration::from_secs(DEFAULT_STREAM_MAX_LIFETIME_SECS),
            max_subscribers: DEFAULT_MAX_SUBSCRIBERS,
        }
    }
}

impl Debug for ServerSettings {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServerSettings")
            .field("listen_addr", &self.listen_addr)
            .field("metrics_path", &self.metrics_path)
            .field("admin_username", &self.admin_username)
            .field("admin_password", &self.admin_password.as_ref().map(|_| "<redacted>"))
            .field("stream_max_lifetime", &self.stream_max_lifetime)
            .field("max_subscribers", &self.max_subscribers)
            .finish()
    }
}

impl ServerSettings {
    /// Credentials when admin auth is enabled
    pub fn admin_credentials(&self) -> Option<(&str, &str)> {
        match (&self.admin_username, &self.admin_password) {
            (Some(user), Some(pass)) if !user.is_empty() => Some((user.as_str(), pass.as_str())),
            _ => None,
        }
    }
}

/// Fan-out widths, batching and retry
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CollectionSettings {
    /// Interval between collection passes
    #[serde(with = "humantime_serde")]
    pub interval: Duration,
    /// Regions collected in parallel per account
    pub region_concurrency: usize,
    /// Namespaces collected in parallel per region
    pub product_concurrency: usize,
    /// Metric queries in flight per namespace
    pub metric_concurrency: usize,
    /// Resource IDs per metric query
    pub batch_size: usize,
    /// Pause between pages and batches
    #[serde(with = "humantime_serde")]
    pub page_delay: Duration,
    pub retry: RetryPolicy,
}

impl Default for CollectionSettings {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(DEFAULT_COLLECTION_INTERVAL_SECS),
            region_concurrency: DEFAULT_REGION_CONCURRENCY,
            product_concurrency: DEFAULT_PRODUCT_CONCURRENCY,
            metric_concurrency: DEFAULT_METRIC_CONCURRENCY,
            batch_size: DEFAULT_BATCH_SIZE,
            page_delay: Duration::from_millis(DEFAULT_PAGE_DELAY_MS),
            retry: RetryPolicy::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheSettings {
    /// Lifetime of a cached resource enumeration
    #[serde(with = "humantime_serde")]
    pub resource_ttl: Duration,
}

impl Default for CacheSettings {
    fn default() -> Self {
        Self {
            resource_ttl: Duration::from_secs(DEFAULT_RESOURCE_TTL_SECS),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DiscoverySettings {
    /// Periodic rediscovery, independent of account file changes
    #[serde(with = "humantime_serde")]
    pub refresh_interval: Duration,
    /// Account file modification-time poll
    #[serde(with = "humantime_serde")]
    pub account_watch_interval: Duration,
}

impl Default for DiscoverySettings {
    fn default() -> Self {
        Self {
            refresh_interval: Duration::from_secs(DEFAULT_DISCOVERY_REFRESH_SECS),
            account_watch_interval: Duration::from_millis(DEFAULT_ACCOUNT_WATCH_INTERVAL_MS),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AccountsSettings {
    /// Account file; falls back to the `ACCOUNTS_FILE` environment variable
    pub path: Option<PathBuf>,
}

impl AccountsSettings {
    pub fn resolved_path(&self) -> Option<PathBuf> {
        self.path
            .clone()
            .or_else(|| std::env::var_os(ACCOUNTS_FILE_ENV).map(PathBuf::from))
            .filter(|p| !p.as_os_str().is_empty())
    }
}

/// Replica membership sources, tried in field order
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClusterSettings {
    /// Headless service whose A records are the replica IPs
    pub headless_service: Option<String>,
    /// Port paired with the headless service in DNS lookups
    pub port: u16,
    /// One pod name per line
    pub members_file: Option<PathBuf>,
    /// Defaults to `POD_NAME`, then `HOSTNAME`
    pub pod_name: Option<String>,
    /// Defaults to `POD_IP`
    pub pod_ip: Option<String>,
    /// Static shard count, used when no membership source is set
    pub total: usize,
    /// Static shard index
    pub index: usize,
}

impl Default for ClusterSettings {
    fn default() -> Self {
        Self {
            headless_service: None,
            port: 9101,
            members_file: None,
            pod_name: None,
            pod_ip: None,
            total: 1,
            index: 0,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    Json,
    #[default]
    Compact,
    Pretty,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingSettings {
    /// Default level; `RUST_LOG` directives refine it
    pub level: String,
    /// Json, compact or pretty output
    pub format: LogFormat,
    /// Colorize text output
    pub ansi: bool,
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: LogFormat::Compact,
            ansi: true,
        }
    }
}

// ----------------------------------------------------------------------------
// Configuration Manager
// ----------------------------------------------------------------------------

/// Shared configuration handle; readers hold an immutable snapshot.
pub struct ConfigManager {
    config: ArcSwap<ExporterConfig>,
}

impl ConfigManager {
    pub fn new(config: ExporterConfig) -> Self {
        Self {
            config: ArcSwap::from_pointee(config),
        }
    }

    pub fn get(&self) -> Arc<ExporterConfig> {
        self.config.load_full()
    }
}

impl Debug for ConfigManager {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConfigManager")
            .field("config", &*self.config.load())
            .finish()
    }
}

// ============================================================================
// ACCOUNT FILE
// ============================================================================

static ENV_VAR_REGEX: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"\$\{([A-Za-z_][A-Za-z0-9_]*)\}|\$([A-Za-z_][A-Za-z0-9_]*)").expect("Invalid env var regex")
});

/// Substitute `${VAR}` and `$VAR` with the environment; unset variables become empty.
pub fn expand_env(input: &str) -> String {
    ENV_VAR_REGEX
        .replace_all(input, |caps: &Captures<'_>| {
            let name = caps.get(1).or_else(|| caps.get(2)).map_or("", |m| m.as_str());
            std::env::var(name).unwrap_or_default()
        })
        .into_owned()
}

#[derive(Debug, Default, Deserialize)]
struct AccountFile {
    #[serde(default)]
    accounts: BTreeMap<String, Vec<Account>>,
}

/// Parse account file contents after environment expansion.
pub fn parse_accounts(text: &str) -> ConfigResult<AccountSet> {
    let expanded = expand_env(text);
    if expanded.trim().is_empty() {
        return Ok(AccountSet::default());
    }
    let file: AccountFile = serde_yaml::from_str(&expanded).map_err(|e| ConfigError::parse(e.to_string()))?;

    let mut accounts = Vec::new();
    for (provider, entries) in file.accounts {
        for mut account in entries {
            if account.account_id.trim().is_empty() {
                return Err(ConfigError::invalid_value(
                    format!("accounts.{provider}.account_id"),
                    "account_id cannot be empty",
                ));
            }
            account.provider = provider.clone();
            accounts.push(account);
        }
    }
    Ok(AccountSet::new(accounts))
}

fn modified_time(path: &Path) -> ConfigResult<SystemTime> {
    fs::metadata(path)
        .and_then(|m| m.modified())
        .map_err(|e| ConfigError::account_file(path, e.to_string()))
}

fn read_accounts(path: &Path) -> ConfigResult<AccountSet> {
    let text = fs::read_to_string(path).map_err(|e| ConfigError::account_file(path, e.to_string()))?;
    parse_accounts(&text)
}

/// Copy-on-write holder of the current account set.
pub struct AccountStore {
    accounts: ArcSwap<AccountSet>,
    path: Option<PathBuf>,
    last_modified: Mutex<Option<SystemTime>>,
}

impl AccountStore {
    /// In-memory store with no backing file
    pub fn new(accounts: AccountSet) -> Self {
        Self {
            accounts: ArcSwap::from_pointee(accounts),
            path: None,
            last_modified: Mutex::new(None),
        }
    }

    pub fn from_file<P: AsRef<Path>>(path: P) -> ConfigResult<Self> {
        let path = path.as_ref();
        let modified = modified_time(path)?;
        let accounts = read_accounts(path)?;
        info!(target: "exporter::config", path = %path.display(), accounts = accounts.len(), "Loaded account file");
        Ok(Self {
            accounts: ArcSwap::from_pointee(accounts),
            path: Some(path.to_path_buf()),
            last_modified: Mutex::new(Some(modified)),
        })
    }

    pub fn snapshot(&self) -> Arc<AccountSet> {
        self.accounts.load_full()
    }

    pub fn replace(&self, accounts: AccountSet) {
        self.accounts.store(Arc::new(accounts));
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    pub fn signature(&self) -> String {
        self.accounts.load().signature()
    }

    /// Re-read the file when its modification time moved. Returns whether
    /// the set was swapped. A parse failure keeps the previous set.
    pub fn reload_if_modified(&self) -> ConfigResult<bool> {
        let Some(path) = self.path.as_deref() else {
            return Ok(false);
        };
        let modified = modified_time(path)?;
        let mut last = self.last_modified.lock();
        if *last == Some(modified) {
            return Ok(false);
        }
        let accounts = read_accounts(path)?;
        *last = Some(modified);
        debug!(target: "exporter::config", path = %path.display(), accounts = accounts.len(), "Account file changed");
        self.replace(accounts);
        Ok(true)
    }
}

impl Debug for AccountStore {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("AccountStore")
            .field("accounts", &self.accounts.load().len())
            .field("path", &self.path)
            .finish()
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use rstest::rstest;
    use std::io::Write;

    const ACCOUNTS_YAML: &str = r#"
accounts:
  aliyun:
    - account_id: "1234"
      access_key_id: "${EXPORTER_TEST_AK}"
      access_key_secret: "$EXPORTER_TEST_SK"
      regions: ["cn-hangzhou", "*"]
      resources: ["ecs", "slb"]
  aws:
    - account_id: "9999"
      regions: ["*"]
      resources: []
"#;

    #[test]
    fn test_default_config_is_valid() {
        let config = ExporterConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.collection.region_concurrency, 4);
        assert_eq!(config.collection.product_concurrency, 2);
        assert_eq!(config.collection.metric_concurrency, 5);
        assert_eq!(config.collection.batch_size, 50);
        assert_eq!(config.server.max_subscribers, 100);
        assert_eq!(config.server.stream_max_lifetime, Duration::from_secs(1800));
    }

    #[test]
    fn test_generated_config_round_trips() {
        let text = ExporterConfig::generate_default_config();
        let parsed = ExporterConfig::from_str(&text).unwrap();
        assert_eq!(parsed, ExporterConfig::default());
    }

    #[test]
    fn test_from_str_with_humantime_durations() {
        let config = ExporterConfig::from_str(
            r#"
            [collection]
            interval = "30s"
            region_concurrency = 2

            [collection.retry]
            initial_delay = "50ms"

            [cache]
            resource_ttl = "10m"
            "#,
        )
        .unwrap();
        assert_eq!(config.collection.interval, Duration::from_secs(30));
        assert_eq!(config.collection.region_concurrency, 2);
        assert_eq!(config.collection.retry.initial_delay, Duration::from_millis(50));
        assert_eq!(config.collection.retry.max_attempts, 5);
        assert_eq!(config.cache.resource_ttl, Duration::from_secs(600));
    }

    #[test]
    fn test_zero_concurrency_rejected() {
        let err = ExporterConfig::from_str("[collection]\nmetric_concurrency = 0\n").unwrap_err();
        assert!(matches!(err, ConfigError::InvalidValue { ref field, .. } if field == "collection.metric_concurrency"));
    }

    #[rstest]
    #[case("/healthz")]
    #[case("/api")]
    #[case("/api/status")]
    #[case("metrics")]
    fn test_metrics_path_rejected(#[case] path: &str) {
        let mut config = ExporterConfig::default();
        config.server.metrics_path = path.to_string();
        let err = config.validate().unwrap_err();
        assert!(matches!(err, ConfigError::InvalidValue { ref field, .. } if field == "server.metrics_path"));
    }

    #[test]
    fn test_custom_metrics_path_accepted() {
        let config = ExporterConfig::from_str("[server]\nmetrics_path = \"/prometheus\"\n").unwrap();
        assert_eq!(config.server.metrics_path, "/prometheus");
    }

    #[test]
    fn test_parse_accounts_expands_env() {
        std::env::set_var("EXPORTER_TEST_AK", "ak-value");
        std::env::set_var("EXPORTER_TEST_SK", "sk-value");
        let set = parse_accounts(ACCOUNTS_YAML).unwrap();

        assert_eq!(set.len(), 2);
        let aliyun: Vec<&Account> = set.for_provider("aliyun").collect();
        assert_eq!(aliyun[0].account_id, "1234");
        assert_eq!(aliyun[0].credentials.access_key_id, "ak-value");
        assert_eq!(aliyun[0].credentials.access_key_secret, "sk-value");
        assert!(aliyun[0].discovers_all_regions());
        assert_eq!(set.for_provider("aws").next().unwrap().provider, "aws");
    }

    #[test]
    fn test_expand_env_unset_is_empty() {
        assert_eq!(expand_env("a=${EXPORTER_TEST_SURELY_UNSET_VAR}!"), "a=!");
        assert_eq!(expand_env("no vars here"), "no vars here");
    }

    #[test]
    fn test_empty_account_id_rejected() {
        let err = parse_accounts("accounts:\n  aws:\n    - account_id: \"\"\n").unwrap_err();
        assert!(matches!(err, ConfigError::InvalidValue { .. }));
    }

    #[test]
    fn test_store_reloads_on_mtime_change() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, "accounts:\n  aws:\n    - account_id: \"1\"\n      resources: [\"ec2\"]\n").unwrap();
        let store = AccountStore::from_file(file.path()).unwrap();
        let first_signature = store.signature();
        assert!(!store.reload_if_modified().unwrap());

        fs::write(
            file.path(),
            "accounts:\n  aws:\n    - account_id: \"1\"\n      resources: [\"ec2\", \"s3\"]\n",
        )
        .unwrap();
        let later = SystemTime::now() + Duration::from_secs(5);
        fs::File::options().write(true).open(file.path()).unwrap().set_modified(later).unwrap();

        assert!(store.reload_if_modified().unwrap());
        assert_ne!(store.signature(), first_signature);
        assert_eq!(store.snapshot().len(), 1);
    }

    #[test]
    fn test_store_keeps_previous_set_on_parse_error() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, "accounts:\n  aws:\n    - account_id: \"1\"\n").unwrap();
        let store = AccountStore::from_file(file.path()).unwrap();

        fs::write(file.path(), "accounts: [not: valid").unwrap();
        let later = SystemTime::now() + Duration::from_secs(5);
        fs::File::options().write(true).open(file.path()).unwrap().set_modified(later).unwrap();

        assert!(store.reload_if_modified().is_err());
        assert_eq!(store.snapshot().len(), 1);
    }
}
