//! Metric canonicalization and lazily created gauge sinks.
//!
//! Vendors name the same measurement differently (`CPUUtilization`,
//! `cpu_total`, ...). Each provider registers, once at startup, how its
//! namespaces map onto canonical names: a short prefix per namespace, static
//! alias tables, an alias function for regular naming schemes, per-metric scale
//! factors and help text. Gauges are created on first use and live for the
//! process lifetime; `reset` clears their series without unregistering them.

// ============================================================================
// METRIC CANONICALIZATION
// ============================================================================

use std::collections::HashMap;
use std::fmt::{self, Debug, Formatter};
use std::sync::Arc;

use parking_lot::RwLock;
use prometheus::core::Collector as _;
use prometheus::{Encoder, GaugeVec, Opts, Registry, TextEncoder};
use tracing::debug;

use crate::error::RegistryError;

/// Labels every canonical gauge carries, in this order.
pub const BASE_LABELS: [&str; 8] = [
    "cloud_provider",
    "account_id",
    "region",
    "resource_type",
    "resource_id",
    "namespace",
    "metric_name",
    "code_name",
];

pub type AliasFn = Arc<dyn Fn(&str) -> Option<String> + Send + Sync>;
pub type ScaleFn = Arc<dyn Fn(&str) -> Option<f64> + Send + Sync>;
pub type HelpFn = Arc<dyn Fn(&str, &str) -> Option<String> + Send + Sync>;

// ----------------------------------------------------------------------------
// Name helpers
// ----------------------------------------------------------------------------

/// Replace characters outside `[a-zA-Z0-9_:]`, collapse repeats, lowercase.
pub fn sanitize_metric_name(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    for c in raw.chars() {
        let c = if c.is_ascii_alphanumeric() || c == ':' { c.to_ascii_lowercase() } else { '_' };
        if c == '_' && out.ends_with('_') {
            continue;
        }
        out.push(c);
    }
    let trimmed = out.trim_matches('_');
    match trimmed.chars().next() {
        Some(c) if c.is_ascii_digit() => format!("_{trimmed}"),
        Some(_) => trimmed.to_string(),
        None => "_".to_string(),
    }
}

/// `CPUUtilization` -> `cpu_utilization`, `InternetOutRate` -> `internet_out_rate`
pub fn camel_to_snake(name: &str) -> String {
    let chars: Vec<char> = name.chars().collect();
    let mut out = String::with_capacity(name.len() + 4);
    for (i, &c) in chars.iter().enumerate() {
        if c.is_ascii_uppercase() && i > 0 {
            let prev = chars[i - 1];
            let next_lower = chars.get(i + 1).map_or(false, |n| n.is_ascii_lowercase());
            if prev.is_ascii_lowercase() || prev.is_ascii_digit() || (prev.is_ascii_uppercase() && next_lower) {
                out.push('_');
            }
        }
        out.push(c.to_ascii_lowercase());
    }
    out
}

/// Alias function for vendors with camel-case metric names
pub fn snake_case_alias() -> AliasFn {
    Arc::new(|metric: &str| Some(camel_to_snake(metric)))
}

// ----------------------------------------------------------------------------
// Namespace Gauge
// ----------------------------------------------------------------------------

/// Handle to one canonical gauge sink, bound to the scale of the
/// (namespace, metric) it was requested for.
#[derive(Clone)]
pub struct NamespaceGauge {
    name: Arc<str>,
    vec: GaugeVec,
    label_names: Arc<[String]>,
    scale: f64,
}

impl Debug for NamespaceGauge {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("NamespaceGauge")
            .field("name", &self.name)
            .field("label_count", &self.label_names.len())
            .field("scale", &self.scale)
            .finish()
    }
}

impl NamespaceGauge {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn label_count(&self) -> usize {
        self.label_names.len()
    }

    pub fn scale(&self) -> f64 {
        self.scale
    }

    /// Write `value * scale` under `labels` (base labels first, then extras)
    pub fn set(&self, labels: &[&str], value: f64) -> Result<(), RegistryError> {
        if labels.len() != self.label_count() {
            return Err(RegistryError::LabelMismatch {
                name: self.name.to_string(),
                expected: self.label_count(),
                actual: labels.len(),
            });
        }
        self.vec.get_metric_with_label_values(labels)?.set(value * self.scale);
        Ok(())
    }

    /// Current value of a series, without creating it
    pub fn value(&self, labels: &[&str]) -> Option<f64> {
        let wanted: HashMap<&str, &str> = self
            .label_names
            .iter()
            .map(String::as_str)
            .zip(labels.iter().copied())
            .collect();
        self.vec
            .collect()
            .iter()
            .flat_map(|family| family.get_metric())
            .find(|m| {
                m.get_label().len() == wanted.len()
                    && m.get_label().iter().all(|pair| wanted.get(pair.get_name()) == Some(&pair.get_value()))
            })
            .map(|m| m.get_gauge().get_value())
    }

    /// Number of live label combinations
    pub fn series_count(&self) -> usize {
        self.vec.collect().iter().map(|family| family.get_metric().len()).sum()
    }

    pub fn reset(&self) {
        self.vec.reset();
    }

    pub fn same_sink(&self, other: &NamespaceGauge) -> bool {
        Arc::ptr_eq(&self.label_names, &other.label_names)
    }
}

// ----------------------------------------------------------------------------
// Metric Registry
// ----------------------------------------------------------------------------

#[derive(Default)]
struct Rules {
    prefixes: HashMap<String, String>,
    aliases: HashMap<String, HashMap<String, String>>,
    alias_fns: HashMap<String, AliasFn>,
    scales: HashMap<String, HashMap<String, f64>>,
    scale_fns: HashMap<String, ScaleFn>,
    help: Option<HelpFn>,
}

#[derive(Default)]
struct Sinks {
    /// (namespace, vendor metric) -> sink handle
    by_metric: HashMap<(String, String), NamespaceGauge>,
    /// canonical name -> sink handle, shared by aliases that collapse together
    by_name: HashMap<String, NamespaceGauge>,
}

/// Process-wide canonicalization rules plus the gauge sinks built from them.
pub struct MetricRegistry {
    registry: Registry,
    rules: RwLock<Rules>,
    sinks: RwLock<Sinks>,
}

impl Debug for MetricRegistry {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("MetricRegistry")
            .field("gauges", &self.sinks.read().by_name.len())
            .finish()
    }
}

impl Default for MetricRegistry {
    fn default() -> Self {
        Self::new(Registry::new())
    }
}

impl MetricRegistry {
    pub fn new(registry: Registry) -> Self {
        Self {
            registry,
            rules: RwLock::new(Rules::default()),
            sinks: RwLock::new(Sinks::default()),
        }
    }

    /// Underlying Prometheus registry, shared with process telemetry
    pub fn prometheus(&self) -> &Registry {
        &self.registry
    }

    // ---- Registration ----

    pub fn register_prefix(&self, namespace: &str, prefix: &str) {
        self.rules.write().prefixes.insert(namespace.to_string(), prefix.to_string());
    }

    pub fn register_aliases<I, K, V>(&self, namespace: &str, aliases: I)
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        let mut rules = self.rules.write();
        let table = rules.aliases.entry(namespace.to_string()).or_default();
        table.extend(aliases.into_iter().map(|(k, v)| (k.into(), v.into())));
    }

    pub fn register_alias_fn(&self, namespace: &str, alias: AliasFn) {
        self.rules.write().alias_fns.insert(namespace.to_string(), alias);
    }

    pub fn register_scales<I, K>(&self, namespace: &str, scales: I)
    where
        I: IntoIterator<Item = (K, f64)>,
        K: Into<String>,
    {
        let mut rules = self.rules.write();
        let table = rules.scales.entry(namespace.to_string()).or_default();
        table.extend(scales.into_iter().map(|(k, v)| (k.into(), v)));
    }

    pub fn register_scale_fn(&self, namespace: &str, scale: ScaleFn) {
        self.rules.write().scale_fns.insert(namespace.to_string(), scale);
    }

    pub fn set_help_resolver(&self, help: HelpFn) {
        self.rules.write().help = Some(help);
    }

    // ---- Lookup ----

    /// Canonical name for a vendor metric: static table, then alias function
    pub fn metric_alias(&self, namespace: &str, metric: &str) -> Option<String> {
        let rules = self.rules.read();
        if let Some(alias) = rules.aliases.get(namespace).and_then(|t| t.get(metric)) {
            return Some(alias.clone());
        }
        rules.alias_fns.get(namespace).and_then(|f| f(metric))
    }

    /// Unit scale for a vendor metric, default 1
    pub fn metric_scale(&self, namespace: &str, metric: &str) -> f64 {
        let rules = self.rules.read();
        if let Some(scale) = rules.scales.get(namespace).and_then(|t| t.get(metric)) {
            return *scale;
        }
        rules.scale_fns.get(namespace).and_then(|f| f(metric)).unwrap_or(1.0)
    }

    pub fn help_text(&self, namespace: &str, metric: &str) -> String {
        let rules = self.rules.read();
        rules
            .help
            .as_ref()
            .and_then(|f| f(namespace, metric))
            .unwrap_or_else(|| format!("{metric} reported by {namespace}"))
    }

    fn gauge_name(&self, namespace: &str, metric: &str) -> String {
        let prefix = self
            .rules
            .read()
            .prefixes
            .get(namespace)
            .cloned()
            .unwrap_or_else(|| namespace.to_string());
        let canonical = self.metric_alias(namespace, metric).unwrap_or_else(|| metric.to_string());
        sanitize_metric_name(&format!("{prefix}_{canonical}"))
    }

    // ---- Sinks ----

    /// The gauge for (namespace, metric), created and registered on first use.
    ///
    /// Repeated calls return the same sink; `extra_labels` only matter on the
    /// first call.
    pub fn namespace_gauge(&self, namespace: &str, metric: &str, extra_labels: &[&str]) -> Result<NamespaceGauge, RegistryError> {
        let key = (namespace.to_string(), metric.to_string());
        if let Some(gauge) = self.sinks.read().by_metric.get(&key) {
            return Ok(gauge.clone());
        }

        let name = self.gauge_name(namespace, metric);
        let scale = self.metric_scale(namespace, metric);
        let help = self.help_text(namespace, metric);

        let mut sinks = self.sinks.write();
        if let Some(gauge) = sinks.by_metric.get(&key) {
            return Ok(gauge.clone());
        }

        let label_count = BASE_LABELS.len() + extra_labels.len();
        let gauge = match sinks.by_name.get(&name) {
            Some(existing) if existing.label_count() != label_count => {
                return Err(RegistryError::LabelMismatch {
                    name,
                    expected: existing.label_count(),
                    actual: label_count,
                });
            }
            Some(existing) => NamespaceGauge {
                scale,
                ..existing.clone()
            },
            None => {
                let label_names: Vec<String> = BASE_LABELS
                    .iter()
                    .chain(extra_labels.iter())
                    .map(|l| l.to_string())
                    .collect();
                let label_refs: Vec<&str> = label_names.iter().map(String::as_str).collect();
                let vec = GaugeVec::new(Opts::new(name.clone(), help), &label_refs).map_err(|e| RegistryError::GaugeCreation {
                    name: name.clone(),
                    message: e.to_string(),
                })?;
                self.registry.register(Box::new(vec.clone()))?;
                debug!(target: "exporter::canonical", gauge = %name, namespace, metric, "Registered gauge");

                let gauge = NamespaceGauge {
                    name: Arc::from(name.as_str()),
                    vec,
                    label_names: Arc::from(label_names),
                    scale,
                };
                sinks.by_name.insert(name, gauge.clone());
                gauge
            }
        };
        sinks.by_metric.insert(key, gauge.clone());
        Ok(gauge)
    }

    /// Clear every series of every canonical gauge
    pub fn reset(&self) {
        let sinks = self.sinks.read();
        for gauge in sinks.by_name.values() {
            gauge.reset();
        }
        debug!(target: "exporter::canonical", gauges = sinks.by_name.len(), "Reset canonical gauges");
    }

    pub fn gauge_count(&self) -> usize {
        self.sinks.read().by_name.len()
    }

    /// Text exposition of everything registered, telemetry included
    pub fn encode_text(&self) -> Result<String, RegistryError> {
        let families = self.registry.gather();
        let mut buf = Vec::new();
        TextEncoder::new().encode(&families, &mut buf)?;
        String::from_utf8(buf).map_err(|e| RegistryError::Encode { message: e.to_string() })
    }
}
