//! # Multicloud Exporter
//!
//! Polls the monitoring APIs of several cloud providers on a schedule,
//! normalizes vendor metric names and units into one canonical schema, and
//! exposes the result over the Prometheus pull protocol.
//!
//! ## Architecture Overview
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────────────┐
//! │  DISCOVERY MANAGER ──► COLLECTOR ──► REGION ► PRODUCT ► METRIC POOLS    │
//! │        ▲                   │                 │              │            │
//! │  ACCOUNT FILE WATCH   SHARD RESOLVER   RESOURCE CACHE   METRIC REGISTRY  │
//! └──────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! - [`discovery`] decides *what* to poll and versions that decision.
//! - [`collector`] drives one pass over every configured account.
//! - [`fanout`] is the generic per-provider fan-out every vendor adapter uses.
//! - [`shard`] partitions work across replicas without coordination.
//! - [`canonical`] maps vendor metric names onto canonical gauge sinks.
//! - [`retry`] classifies vendor failures and retries the transient ones.

#![warn(rust_2018_idioms)]
#![warn(missing_debug_implementations)]

pub mod cache;
pub mod canonical;
pub mod collector;
pub mod config;
pub mod discovery;
pub mod engine;
pub mod error;
pub mod fanout;
pub mod logging;
pub mod retry;
pub mod server;
pub mod shard;
pub mod telemetry;
pub mod types;

pub use cache::ResourceCache;
pub use canonical::{MetricRegistry, NamespaceGauge};
pub use collector::{Collector, CollectStatus, Provider, ProviderRegistry};
pub use config::{AccountStore, ConfigManager, ExporterConfig};
pub use discovery::{Discoverer, DiscovererRegistry, DiscoveryManager};
pub use engine::{Engine, EngineBuilder};
pub use error::{ErrorClass, ExporterError, ExporterResult, VendorError};
pub use fanout::{CatalogDiscoverer, CloudProvider, EmptyDataPolicy, MonitoringApi};
pub use shard::ShardSpec;
pub use types::{Account, AccountSet, MetricGroup, Product, ProductMap, ResourceKey, Timestamp};

// ============================================================================
// CONSTANTS & VERSION INFORMATION
// ============================================================================
// Defaults that shape fan-out width, cache lifetime and the admin surface.
// Every one of these can be overridden through configuration.
// ============================================================================

/// Exporter version - follows semantic versioning
pub const EXPORTER_VERSION: &str = env!("CARGO_PKG_VERSION");
pub const EXPORTER_NAME: &str = "multicloud-exporter";
pub const EXPORTER_FULL_NAME: &str = "Multicloud Metrics Exporter";

// ----------------------------------------------------------------------------
// Fan-out & Batching
// ----------------------------------------------------------------------------

/// Concurrent region tasks per account
pub const DEFAULT_REGION_CONCURRENCY: usize = 4;

/// Concurrent (region, namespace) tasks per region
pub const DEFAULT_PRODUCT_CONCURRENCY: usize = 2;

/// Concurrent (namespace, metric) tasks per product
pub const DEFAULT_METRIC_CONCURRENCY: usize = 5;

/// Resource IDs per metric query (vendor payload limit)
pub const DEFAULT_BATCH_SIZE: usize = 50;

/// Pause between pages and batches to stay under vendor rate limits (milliseconds)
pub const DEFAULT_PAGE_DELAY_MS: u64 = 100;

/// Interval between collection passes (seconds)
pub const DEFAULT_COLLECTION_INTERVAL_SECS: u64 = 60;

// ----------------------------------------------------------------------------
// Retry Policy
// ----------------------------------------------------------------------------

/// Retries after the first attempt
pub const DEFAULT_RETRY_MAX_ATTEMPTS: u32 = 5;

/// First backoff delay (milliseconds)
pub const DEFAULT_RETRY_INITIAL_DELAY_MS: u64 = 200;

/// Backoff multiplier per attempt
pub const DEFAULT_RETRY_BACKOFF_FACTOR: f64 = 2.0;

/// Backoff ceiling (milliseconds)
pub const DEFAULT_RETRY_MAX_DELAY_MS: u64 = 5_000;

// ----------------------------------------------------------------------------
// Caching & Discovery
// ----------------------------------------------------------------------------

/// Resource enumeration cache lifetime (seconds)
pub const DEFAULT_RESOURCE_TTL_SECS: u64 = 3600;

/// Account file modification-time poll interval (milliseconds)
pub const DEFAULT_ACCOUNT_WATCH_INTERVAL_MS: u64 = 3_000;

/// Periodic rediscovery interval (seconds)
pub const DEFAULT_DISCOVERY_REFRESH_SECS: u64 = 300;

/// Environment variable naming the account definition file
pub const ACCOUNTS_FILE_ENV: &str = "ACCOUNTS_FILE";

// ----------------------------------------------------------------------------
// Admin Surface
// ----------------------------------------------------------------------------

/// Default listen address for metrics and admin endpoints
pub const DEFAULT_LISTEN_ADDR: &str = "0.0.0.0:9101";

/// Default exposition path
pub const DEFAULT_METRICS_PATH: &str = "/metrics";

/// Cap on concurrent discovery stream subscribers
pub const DEFAULT_MAX_SUBSCRIBERS: usize = 100;

/// Hard lifetime of a discovery stream connection (seconds)
pub const DEFAULT_STREAM_MAX_LIFETIME_SECS: u64 = 30 * 60;
