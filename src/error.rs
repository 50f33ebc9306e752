//! Error types and the vendor failure taxonomy.

// ============================================================================
// ERROR HANDLING FRAMEWORK
// ============================================================================
// Error types for every subsystem of the exporter, plus the five-value
// taxonomy vendor failures are classified into.
// ============================================================================

use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use thiserror::Error;

// ----------------------------------------------------------------------------
// Root Error
// ----------------------------------------------------------------------------

/// The main error type for the exporter.
/// All subsystem errors convert into this type.
#[derive(Error, Debug)]
pub enum ExporterError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Discovery error: {0}")]
    Discovery(#[from] DiscoveryError),

    #[error("Collector error: {0}")]
    Collector(#[from] CollectorError),

    #[error("Cluster error: {0}")]
    Cluster(#[from] ClusterError),

    #[error("Metric registry error: {0}")]
    Registry(#[from] RegistryError),

    #[error("Server error: {0}")]
    Server(#[from] ServerError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl ExporterError {
    /// Check if this error is recoverable
    pub fn is_recoverable(&self) -> bool {
        match self {
            ExporterError::Config(_) => false,
            ExporterError::Discovery(e) => e.is_recoverable(),
            ExporterError::Collector(e) => e.is_recoverable(),
            ExporterError::Cluster(_) => true,
            ExporterError::Registry(_) => false,
            ExporterError::Server(_) => false,
            ExporterError::Io(_) => true,
            ExporterError::Internal(_) => false,
        }
    }

    /// Get the error category for metrics/logging
    pub fn category(&self) -> &'static str {
        match self {
            ExporterError::Config(_) => "config",
            ExporterError::Discovery(_) => "discovery",
            ExporterError::Collector(_) => "collector",
            ExporterError::Cluster(_) => "cluster",
            ExporterError::Registry(_) => "registry",
            ExporterError::Server(_) => "server",
            ExporterError::Io(_) => "io",
            ExporterError::Internal(_) => "internal",
        }
    }
}

// ----------------------------------------------------------------------------
// Configuration Errors
// ----------------------------------------------------------------------------

/// Errors related to configuration and account file loading
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Configuration file not found: {path}")]
    FileNotFound { path: PathBuf },

    #[error("Failed to parse configuration: {message}")]
    ParseError { message: String },

    #[error("Invalid configuration value for '{field}': {message}")]
    InvalidValue { field: String, message: String },

    #[error("Failed to read account file {path}: {message}")]
    AccountFile { path: PathBuf, message: String },
}

impl ConfigError {
    pub fn invalid_value(field: impl Into<String>, message: impl Into<String>) -> Self {
        ConfigError::InvalidValue {
            field: field.into(),
            message: message.into(),
        }
    }

    pub fn parse(message: impl Into<String>) -> Self {
        ConfigError::ParseError { message: message.into() }
    }

    pub fn account_file(path: impl Into<PathBuf>, message: impl Into<String>) -> Self {
        ConfigError::AccountFile {
            path: path.into(),
            message: message.into(),
        }
    }
}

// ----------------------------------------------------------------------------
// Discovery Errors
// ----------------------------------------------------------------------------

#[derive(Error, Debug)]
pub enum DiscoveryError {
    #[error("Discoverer for '{provider}' failed: {message}")]
    DiscovererFailed { provider: String, message: String },

    #[error("Discovery cancelled")]
    Cancelled,

    #[error("Subscriber limit of {limit} reached")]
    SubscriberLimit { limit: usize },
}

impl DiscoveryError {
    pub fn is_recoverable(&self) -> bool {
        !matches!(self, DiscoveryError::Cancelled)
    }

    pub fn failed(provider: impl Into<String>, message: impl Into<String>) -> Self {
        DiscoveryError::DiscovererFailed {
            provider: provider.into(),
            message: message.into(),
        }
    }
}

// ----------------------------------------------------------------------------
// Collector Errors
// ----------------------------------------------------------------------------

/// Errors from provider collection sweeps
#[derive(Error, Debug)]
pub enum CollectorError {
    #[error("Provider '{provider}' not registered")]
    ProviderNotFound { provider: String },

    #[error("Collection failed for '{target}' ({class}): {message}")]
    CollectionFailed {
        target: String,
        class: ErrorClass,
        message: String,
    },

    #[error("Account task for '{account}' aborted: {message}")]
    TaskAborted { account: String, message: String },

    #[error("A collection pass is already running")]
    PassInProgress,

    #[error("Metric sink error: {0}")]
    Registry(#[from] RegistryError),
}

impl CollectorError {
    pub fn is_recoverable(&self) -> bool {
        match self {
            CollectorError::ProviderNotFound { .. } => false,
            CollectorError::CollectionFailed { class, .. } => class.is_transient(),
            CollectorError::TaskAborted { .. } => true,
            CollectorError::PassInProgress => true,
            CollectorError::Registry(_) => false,
        }
    }

    pub fn collection_failed(target: impl Into<String>, class: ErrorClass, message: impl Into<String>) -> Self {
        CollectorError::CollectionFailed {
            target: target.into(),
            class,
            message: message.into(),
        }
    }

    /// Classification of the underlying vendor failure, if any
    pub fn class(&self) -> ErrorClass {
        match self {
            CollectorError::CollectionFailed { class, .. } => *class,
            _ => ErrorClass::Unknown,
        }
    }
}

// ----------------------------------------------------------------------------
// Cluster, Registry & Server Errors
// ----------------------------------------------------------------------------

#[derive(Error, Debug)]
pub enum ClusterError {
    #[error("DNS lookup of '{service}' failed: {message}")]
    DnsLookup { service: String, message: String },

    #[error("Member list '{path}' unreadable: {message}")]
    MemberFile { path: PathBuf, message: String },

    #[error("This replica ('{identity}') is not a cluster member")]
    NotAMember { identity: String },
}

#[derive(Error, Debug)]
pub enum RegistryError {
    #[error("Failed to create gauge '{name}': {message}")]
    GaugeCreation { name: String, message: String },

    #[error("Label count mismatch for '{name}': expected {expected}, got {actual}")]
    LabelMismatch {
        name: String,
        expected: usize,
        actual: usize,
    },

    #[error("Failed to encode metrics: {message}")]
    Encode { message: String },

    #[error("Prometheus error: {0}")]
    Prometheus(#[from] prometheus::Error),
}

#[derive(Error, Debug)]
pub enum ServerError {
    #[error("Failed to bind {addr}: {message}")]
    Bind { addr: String, message: String },

    #[error("Server terminated: {message}")]
    Serve { message: String },
}

// ----------------------------------------------------------------------------
// Vendor Error Taxonomy
// ----------------------------------------------------------------------------

/// Classification of a vendor API failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorClass {
    /// Bad or expired credentials
    #[serde(rename = "auth_error")]
    Auth,
    /// Vendor throttling
    #[serde(rename = "limit_error")]
    Limit,
    /// Region or feature not available to this account
    #[serde(rename = "region_skip")]
    RegionSkip,
    /// Transient connectivity failure
    #[serde(rename = "network_error")]
    Network,
    /// Unclassified
    #[serde(rename = "error")]
    Unknown,
}

impl ErrorClass {
    pub const ALL: [ErrorClass; 5] = [
        ErrorClass::Auth,
        ErrorClass::Limit,
        ErrorClass::RegionSkip,
        ErrorClass::Network,
        ErrorClass::Unknown,
    ];

    /// Label value used by request counters and log lines
    pub const fn as_str(&self) -> &'static str {
        match self {
            ErrorClass::Auth => "auth_error",
            ErrorClass::Limit => "limit_error",
            ErrorClass::RegionSkip => "region_skip",
            ErrorClass::Network => "network_error",
            ErrorClass::Unknown => "error",
        }
    }

    /// Auth failures and region skips hold for the rest of the pass
    pub const fn is_permanent(&self) -> bool {
        matches!(self, ErrorClass::Auth | ErrorClass::RegionSkip)
    }

    pub const fn is_transient(&self) -> bool {
        matches!(self, ErrorClass::Limit | ErrorClass::Network)
    }
}

impl std::fmt::Display for ErrorClass {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Opaque vendor SDK failure. Only the message is inspected.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{message}")]
pub struct VendorError {
    pub message: String,
    /// Vendor error code, when the SDK exposes one
    pub code: Option<String>,
}

impl VendorError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            code: None,
        }
    }

    pub fn with_code(mut self, code: impl Into<String>) -> Self {
        self.code = Some(code.into());
        self
    }

    /// Message and code concatenated, which is what the classifier inspects
    pub fn text(&self) -> String {
        match &self.code {
            Some(code) => format!("{}: {}", code, self.message),
            None => self.message.clone(),
        }
    }
}

// ----------------------------------------------------------------------------
// Result Type Aliases
// ----------------------------------------------------------------------------

pub type ExporterResult<T> = Result<T, ExporterError>;
pub type ConfigResult<T> = Result<T, ConfigError>;
pub type CollectorResult<T> = Result<T, CollectorError>;
pub type VendorResult<T> = Result<T, VendorError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_class_labels() {
        let labels: Vec<&str> = ErrorClass::ALL.iter().map(ErrorClass::as_str).collect();
        assert_eq!(labels, vec!["auth_error", "limit_error", "region_skip", "network_error", "error"]);
        assert_eq!(serde_json::to_string(&ErrorClass::RegionSkip).unwrap(), "\"region_skip\"");
    }

    #[test]
    fn test_error_categories() {
        let err: ExporterError = ConfigError::invalid_value("collection.batch_size", "must be at least 1").into();
        assert_eq!(err.category(), "config");
        assert!(!err.is_recoverable());

        let err: ExporterError = CollectorError::collection_failed("aws|1", ErrorClass::Limit, "Throttling").into();
        assert_eq!(err.category(), "collector");
        assert!(err.is_recoverable());

        let err: ExporterError = CollectorError::collection_failed("aws|1", ErrorClass::Auth, "denied").into();
        assert!(!err.is_recoverable());
    }

    #[test]
    fn test_vendor_error_text_includes_code() {
        let err = VendorError::new("Request was denied due to request throttling").with_code("Throttling.User");
        assert_eq!(err.text(), "Throttling.User: Request was denied due to request throttling");
    }
}
