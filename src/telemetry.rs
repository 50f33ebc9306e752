//! Process-level telemetry for vendor API calls and collection passes.

// ============================================================================
// API TELEMETRY
// ============================================================================

use std::sync::atomic::{AtomicI64, AtomicU64, Ordering as AtomicOrdering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use prometheus::{Histogram, HistogramOpts, HistogramVec, IntCounterVec, IntGauge, Opts, Registry};
use serde::Serialize;

use crate::error::{ErrorClass, RegistryError};
use crate::types::Timestamp;

// ============================================================================
// ROLLING RATE CALCULATOR
// ============================================================================

/// Lock-free bucketed event counter over a sliding window.
#[derive(Debug)]
pub struct RateCalculator {
    buckets: Box<[RateBucket]>,
    bucket_duration_ns: i64,
    window: Duration,
}

#[derive(Debug)]
struct RateBucket {
    /// Start of the period this bucket currently counts
    timestamp: AtomicI64,
    count: AtomicU64,
}

impl RateCalculator {
    pub fn new(window: Duration, num_buckets: usize) -> Self {
        let num_buckets = num_buckets.max(2);
        let bucket_duration_ns = (window.as_nanos() as i64 / num_buckets as i64).max(1);
        let buckets: Vec<RateBucket> = (0..num_buckets)
            .map(|_| RateBucket {
                timestamp: AtomicI64::new(i64::MIN),
                count: AtomicU64::new(0),
            })
            .collect();
        Self {
            buckets: buckets.into_boxed_slice(),
            bucket_duration_ns,
            window,
        }
    }

    pub fn one_minute() -> Self {
        Self::new(Duration::from_secs(60), 60)
    }

    pub fn five_minutes() -> Self {
        Self::new(Duration::from_secs(300), 60)
    }

    #[inline]
    pub fn record(&self) {
        self.record_at(Timestamp::now());
    }

    pub fn record_at(&self, now: Timestamp) {
        let period = now.as_nanos().div_euclid(self.bucket_duration_ns);
        let bucket_start = period * self.bucket_duration_ns;
        let bucket = &self.buckets[period.rem_euclid(self.buckets.len() as i64) as usize];

        let stored = bucket.timestamp.load(AtomicOrdering::Relaxed);
        if stored != bucket_start
            && bucket
                .timestamp
                .compare_exchange(stored, bucket_start, AtomicOrdering::Relaxed, AtomicOrdering::Relaxed)
                .is_ok()
        {
            bucket.count.store(1, AtomicOrdering::Relaxed);
        } else {
            bucket.count.fetch_add(1, AtomicOrdering::Relaxed);
        }
    }

    /// Events inside the window ending at `now`
    pub fn total_at(&self, now: Timestamp) -> u64 {
        let window_start = now.as_nanos() - self.window.as_nanos() as i64;
        self.buckets
            .iter()
            .filter(|b| {
                let ts = b.timestamp.load(AtomicOrdering::Relaxed);
                ts > window_start && ts <= now.as_nanos()
            })
            .map(|b| b.count.load(AtomicOrdering::Relaxed))
            .sum()
    }

    /// Events per second averaged over the full window
    pub fn rate_at(&self, now: Timestamp) -> f64 {
        self.total_at(now) as f64 / self.window.as_secs_f64().max(f64::EPSILON)
    }

    pub fn rate(&self) -> f64 {
        self.rate_at(Timestamp::now())
    }
}

// ============================================================================
// API TELEMETRY
// ============================================================================

#[derive(Debug)]
struct ApiRates {
    one_minute: RateCalculator,
    five_minutes: RateCalculator,
    total: AtomicU64,
    errors: AtomicU64,
}

impl Default for ApiRates {
    fn default() -> Self {
        Self {
            one_minute: RateCalculator::one_minute(),
            five_minutes: RateCalculator::five_minutes(),
            total: AtomicU64::new(0),
            errors: AtomicU64::new(0),
        }
    }
}

/// Per-(provider, api) call statistics reported by the status endpoint.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ApiStats {
    /// Provider name
    pub provider: String,
    /// Vendor API operation
    pub api: String,
    /// Calls since start
    pub total: u64,
    /// Failed calls since start
    pub errors: u64,
    /// Calls per second over the last minute
    pub rate_1m: f64,
    /// Calls per second over the last five minutes
    pub rate_5m: f64,
}

/// Request counters, latency histograms and pass gauges.
#[derive(Clone)]
pub struct ApiTelemetry {
    requests_total: IntCounterVec,
    request_duration: HistogramVec,
    rate_limit_total: IntCounterVec,
    collection_duration: Histogram,
    collection_samples: IntGauge,
    discovery_version: IntGauge,
    rates: Arc<DashMap<(String, String), Arc<ApiRates>>>,
}

impl std::fmt::Debug for ApiTelemetry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ApiTelemetry").field("apis", &self.rates.len()).finish()
    }
}

impl ApiTelemetry {
    pub fn new(registry: &Registry) -> Result<Self, RegistryError> {
        let requests_total = IntCounterVec::new(
            Opts::new("exporter_api_requests_total", "Vendor API requests by outcome"),
            &["provider", "api", "status"],
        )?;
        let request_duration = HistogramVec::new(
            HistogramOpts::new("exporter_api_request_duration_seconds", "Vendor API request latency")
                .buckets(vec![0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0]),
            &["provider", "api"],
        )?;
        let rate_limit_total = IntCounterVec::new(
            Opts::new("exporter_api_rate_limit_total", "Vendor API calls rejected by throttling"),
            &["provider", "api"],
        )?;
        let collection_duration = Histogram::with_opts(
            HistogramOpts::new("exporter_collection_duration_seconds", "Duration of full collection passes")
                .buckets(vec![1.0, 5.0, 15.0, 30.0, 60.0, 120.0, 300.0, 600.0]),
        )?;
        let collection_samples = IntGauge::new("exporter_collection_samples", "Samples written by the last collection pass")?;
        let discovery_version = IntGauge::new("exporter_discovery_version", "Current discovery state version")?;

        registry.register(Box::new(requests_total.clone()))?;
        registry.register(Box::new(request_duration.clone()))?;
        registry.register(Box::new(rate_limit_total.clone()))?;
        registry.register(Box::new(collection_duration.clone()))?;
        registry.register(Box::new(collection_samples.clone()))?;
        registry.register(Box::new(discovery_version.clone()))?;

        Ok(Self {
            requests_total,
            request_duration,
            rate_limit_total,
            collection_duration,
            collection_samples,
            discovery_version,
            rates: Arc::new(DashMap::new()),
        })
    }

    fn rates_for(&self, provider: &str, api: &str) -> Arc<ApiRates> {
        self.rates
            .entry((provider.to_string(), api.to_string()))
            .or_default()
            .clone()
    }

    /// Record one vendor call. `failure` is `None` on success.
    pub fn record_request(&self, provider: &str, api: &str, failure: Option<ErrorClass>, elapsed: Duration) {
        let status = failure.map_or("success", |class| class.as_str());
        self.requests_total.with_label_values(&[provider, api, status]).inc();
        self.request_duration
            .with_label_values(&[provider, api])
            .observe(elapsed.as_secs_f64());
        if failure == Some(ErrorClass::Limit) {
            self.rate_limit_total.with_label_values(&[provider, api]).inc();
        }

        let rates = self.rates_for(provider, api);
        rates.one_minute.record();
        rates.five_minutes.record();
        rates.total.fetch_add(1, AtomicOrdering::Relaxed);
        if failure.is_some() {
            rates.errors.fetch_add(1, AtomicOrdering::Relaxed);
        }
    }

    pub fn record_pass(&self, elapsed: Duration, samples: u64) {
        self.collection_duration.observe(elapsed.as_secs_f64());
        self.collection_samples.set(samples.min(i64::MAX as u64) as i64);
    }

    pub fn set_discovery_version(&self, version: u64) {
        self.discovery_version.set(version.min(i64::MAX as u64) as i64);
    }

    pub fn request_count(&self, provider: &str, api: &str, status: &str) -> u64 {
        self.requests_total.with_label_values(&[provider, api, status]).get()
    }

    pub fn rate_limit_count(&self, provider: &str, api: &str) -> u64 {
        self.rate_limit_total.with_label_values(&[provider, api]).get()
    }

    /// Per-(provider, api) statistics, sorted by provider then api
    pub fn snapshot(&self) -> Vec<ApiStats> {
        let now = Timestamp::now();
        let mut stats: Vec<ApiStats> = self
            .rates
            .iter()
            .map(|entry| {
                let (provider, api) = entry.key();
                let rates = entry.value();
                ApiStats {
                    provider: provider.clone(),
                    api: api.clone(),
                    total: rates.total.load(AtomicOrdering::Relaxed),
                    errors: rates.errors.load(AtomicOrdering::Relaxed),
                    rate_1m: rates.one_minute.rate_at(now),
                    rate_5m: rates.five_minutes.rate_at(now),
                }
            })
            .collect();
        stats.sort_by(|a, b| (&a.provider, &a.api).cmp(&(&b.provider, &b.api)));
        stats
    }
}
