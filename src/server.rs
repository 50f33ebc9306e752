//! Prometheus scrape endpoint and admin HTTP API.

// ============================================================================
// HTTP CONTROL SURFACE
// ============================================================================
//
//   GET  /metrics                 text exposition (path configurable)
//   GET  /healthz
//   GET  /api/discovery           snapshot            (admin)
//   GET  /api/discovery/stream    SSE change stream   (admin)
//   GET  /api/status              pass + API stats    (admin)
//   POST /api/collect             on-demand pass      (admin)
// ============================================================================

use std::sync::Arc;

use axum::extract::{Query, Request, State};
use axum::http::{header, HeaderMap, StatusCode};
use axum::middleware::{self, Next};
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use serde::Serialize;
use serde_json::json;
use tokio::net::TcpListener;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;
use tracing::{debug, error, info, warn};

use crate::canonical::MetricRegistry;
use crate::collector::{CollectFilter, CollectStatus, Collector};
use crate::config::ConfigManager;
use crate::discovery::{DiscoveryManager, DiscoveryStatus, Subscription};
use crate::error::{CollectorError, ServerError};
use crate::shard::ShardSpec;
use crate::telemetry::{ApiStats, ApiTelemetry};

/// Everything the handlers read from.
#[derive(Debug, Clone)]
pub struct AppState {
    /// Current product catalog and its change feed
    pub discovery: Arc<DiscoveryManager>,
    /// Pass status and on-demand collection
    pub collector: Arc<Collector>,
    pub metrics: Arc<MetricRegistry>,
    pub telemetry: ApiTelemetry,
    pub config: Arc<ConfigManager>,
    /// Ends open streams on shutdown
    pub cancel: CancellationToken,
}

/// Scrape, health and admin routes. Basic auth wraps `/api` when credentials are set.
pub fn router(state: AppState) -> Router {
    let mut metrics_path = state.config.get().server.metrics_path.clone();
    if !metrics_path.starts_with('/') {
        metrics_path.insert(0, '/');
    }

    let admin = Router::new()
        .route("/api/discovery", get(discovery_snapshot))
        .route("/api/discovery/stream", get(discovery_stream))
        .route("/api/status", get(status))
        .route("/api/collect", post(trigger_collect))
        .route_layer(middleware::from_fn_with_state(state.clone(), require_admin));

    Router::new()
        .route(&metrics_path, get(metrics))
        .route("/healthz", get(healthz))
        .merge(admin)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Bind and serve until `cancel` fires.
pub async fn serve(state: AppState, cancel: CancellationToken) -> Result<(), ServerError> {
    let addr = state.config.get().server.listen_addr.clone();
    let listener = TcpListener::bind(&addr).await.map_err(|e| ServerError::Bind {
        addr: addr.clone(),
        message: e.to_string(),
    })?;
    info!(target: "exporter::server", addr = %addr, "HTTP server listening");

    axum::serve(listener, router(state))
        .with_graceful_shutdown(async move { cancel.cancelled().await })
        .await
        .map_err(|e| ServerError::Serve { message: e.to_string() })?;

    info!(target: "exporter::server", "HTTP server stopped");
    Ok(())
}

// ----------------------------------------------------------------------------
// Basic Auth
// ----------------------------------------------------------------------------

fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.iter().zip(b).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}

fn authorized(headers: &HeaderMap, username: &str, password: &str) -> bool {
    let Some(value) = headers.get(header::AUTHORIZATION).and_then(|v| v.to_str().ok()) else {
        return false;
    };
    let Some(encoded) = value.strip_prefix("Basic ") else {
        return false;
    };
    let Ok(decoded) = STANDARD.decode(encoded.trim()) else {
        return false;
    };
    let Ok(decoded) = String::from_utf8(decoded) else {
        return false;
    };
    let Some((user, pass)) = decoded.split_once(':') else {
        return false;
    };
    // Both halves are always compared
    let user_ok = constant_time_eq(user.as_bytes(), username.as_bytes());
    let pass_ok = constant_time_eq(pass.as_bytes(), password.as_bytes());
    user_ok & pass_ok
}

async fn require_admin(State(state): State<AppState>, request: Request, next: Next) -> Response {
    let config = state.config.get();
    let Some((username, password)) = config.server.admin_credentials() else {
        return next.run(request).await;
    };
    if authorized(request.headers(), username, password) {
        return next.run(request).await;
    }
    debug!(target: "exporter::server", path = %request.uri().path(), "Rejected unauthenticated admin request");
    (
        StatusCode::UNAUTHORIZED,
        [(header::WWW_AUTHENTICATE, "Basic realm=\"multicloud-exporter\"")],
        "unauthorized",
    )
        .into_response()
}

// ----------------------------------------------------------------------------
// Handlers
// ----------------------------------------------------------------------------

async fn healthz() -> &'static str {
    "ok"
}

async fn metrics(State(state): State<AppState>) -> Response {
    match state.metrics.encode_text() {
        Ok(body) => ([(header::CONTENT_TYPE, prometheus::TEXT_FORMAT)], body).into_response(),
        Err(e) => {
            error!(target: "exporter::server", error = %e, "Failed to encode metrics");
            (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response()
        }
    }
}

async fn discovery_snapshot(State(state): State<AppState>) -> Response {
    Json(state.discovery.snapshot()).into_response()
}

#[derive(Debug, Serialize)]
struct StatusResponse {
    exporter: &'static str,
    version: &'static str,
    shard: ShardSpec,
    collection: CollectStatus,
    discovery: DiscoveryStatus,
    api: Vec<ApiStats>,
}

async fn status(State(state): State<AppState>) -> Json<StatusResponse> {
    Json(StatusResponse {
        exporter: crate::EXPORTER_NAME,
        version: crate::EXPORTER_VERSION,
        shard: state.collector.shard(),
        collection: state.collector.status(),
        discovery: state.discovery.status(),
        api: state.telemetry.snapshot(),
    })
}

/// 202 when a pass starts, 409 while one is already running.
async fn trigger_collect(State(state): State<AppState>, Query(filter): Query<CollectFilter>) -> Response {
    let body = json!({
        "status": "accepted",
        "provider": filter.provider,
        "resource": filter.resource,
    });
    match state.collector.try_collect_filtered(filter) {
        Ok(_) => {
            info!(target: "exporter::server", provider = %body["provider"], resource = %body["resource"], "Manual collection started");
            (StatusCode::ACCEPTED, Json(body)).into_response()
        }
        Err(e @ CollectorError::ProviderNotFound { .. }) => {
            (StatusCode::NOT_FOUND, Json(json!({ "error": e.to_string() }))).into_response()
        }
        Err(e @ CollectorError::PassInProgress) => {
            debug!(target: "exporter::server", "Manual collection refused, pass in progress");
            (StatusCode::CONFLICT, Json(json!({ "error": e.to_string() }))).into_response()
        }
        Err(e) => (StatusCode::INTERNAL_SERVER_ERROR, Json(json!({ "error": e.to_string() }))).into_response(),
    }
}

// ----------------------------------------------------------------------------
// Discovery Stream
// ----------------------------------------------------------------------------

struct StreamState {
    discovery: Arc<DiscoveryManager>,
    subscription: Subscription,
    deadline: Instant,
    cancel: CancellationToken,
    sent_init: bool,
}

async fn next_event(mut stream: StreamState) -> Option<(Result<Event, axum::Error>, StreamState)> {
    if !stream.sent_init {
        stream.sent_init = true;
        let event = Event::default().event("init").json_data(stream.discovery.snapshot());
        return Some((event, stream));
    }
    tokio::select! {
        _ = stream.cancel.cancelled() => None,
        _ = tokio::time::sleep_until(stream.deadline) => {
            debug!(target: "exporter::server", subscriber = stream.subscription.id(), "Discovery stream reached max lifetime");
            None
        }
        changed = stream.subscription.changed() => {
            changed?;
            let event = Event::default()
                .event("update")
                .json_data(json!({ "version": stream.discovery.version() }));
            Some((event, stream))
        }
    }
}

async fn discovery_stream(State(state): State<AppState>) -> Response {
    let subscription = match state.discovery.subscribe() {
        Ok(subscription) => subscription,
        Err(e) => {
            warn!(target: "exporter::server", error = %e, "Refusing discovery stream");
            return (StatusCode::SERVICE_UNAVAILABLE, e.to_string()).into_response();
        }
    };
    let lifetime = state.config.get().server.stream_max_lifetime;
    let stream = StreamState {
        discovery: Arc::clone(&state.discovery),
        subscription,
        deadline: Instant::now() + lifetime,
        cancel: state.cancel.clone(),
        sent_init: false,
    };
    Sse::new(futures::stream::unfold(stream, next_event))
        .keep_alive(KeepAlive::default())
        .into_response()
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collector::{CollectContext, CollectReport, Provider, ProviderRegistry};
    use crate::config::{AccountStore, ExporterConfig};
    use crate::discovery::{DiscovererRegistry, DiscoveryContext, Discoverer};
    use crate::error::{CollectorResult, ExporterResult};
    use crate::types::{Account, AccountSet, MetricGroup, Product};
    use async_trait::async_trait;
    use axum::body::{to_bytes, Body};
    use axum::http::Request as HttpRequest;
    use prometheus::Registry;
    use std::time::Duration;
    use tokio::sync::Notify;
    use tower::ServiceExt;

    struct OneProduct;

    #[async_trait]
    impl Discoverer for OneProduct {
        fn provider(&self) -> &str {
            "aliyun"
        }

        async fn discover(&self, _ctx: &DiscoveryContext) -> ExporterResult<Vec<Product>> {
            Ok(vec![Product::new("acs_ecs_dashboard").with_group(MetricGroup::new(["CPUUtilization"]))])
        }
    }

    /// Holds every account sweep until released.
    struct GatedProvider {
        gate: Arc<Notify>,
    }

    #[async_trait]
    impl Provider for GatedProvider {
        fn name(&self) -> &str {
            "aliyun"
        }

        fn default_resources(&self) -> Vec<String> {
            vec!["ecs".into()]
        }

        async fn collect(&self, _ctx: &CollectContext, _account: &Account) -> CollectorResult<CollectReport> {
            self.gate.notified().await;
            Ok(CollectReport::default())
        }
    }

    fn state(config: ExporterConfig) -> AppState {
        state_with(config, ProviderRegistry::new(), AccountSet::default())
    }

    fn state_with(config: ExporterConfig, providers: ProviderRegistry, accounts: AccountSet) -> AppState {
        let config = Arc::new(ConfigManager::new(config));
        let metrics = Arc::new(MetricRegistry::new(Registry::new()));
        let telemetry = ApiTelemetry::new(metrics.prometheus()).unwrap();
        let accounts = Arc::new(AccountStore::new(accounts));
        let mut discoverers = DiscovererRegistry::new();
        discoverers.register(Arc::new(OneProduct));
        let discovery = Arc::new(DiscoveryManager::new(discoverers, Arc::clone(&accounts), Arc::clone(&config)));
        let collector = Arc::new(Collector::new(
            providers,
            accounts,
            Arc::clone(&discovery),
            Arc::clone(&config),
            telemetry.clone(),
            ShardSpec::single(),
        ));
        AppState {
            discovery,
            collector,
            metrics,
            telemetry,
            config,
            cancel: CancellationToken::new(),
        }
    }

    fn get_request(uri: &str) -> HttpRequest<Body> {
        HttpRequest::builder().uri(uri).body(Body::empty()).unwrap()
    }

    async fn body_text(response: Response) -> String {
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        String::from_utf8(bytes.to_vec()).unwrap()
    }

    #[test]
    fn test_constant_time_eq() {
        assert!(constant_time_eq(b"secret", b"secret"));
        assert!(!constant_time_eq(b"secret", b"secreT"));
        assert!(!constant_time_eq(b"secret", b"secret2"));
    }

    #[tokio::test]
    async fn test_metrics_and_health_are_public() {
        let mut config = ExporterConfig::default();
        config.server.admin_username = Some("admin".into());
        config.server.admin_password = Some("secret".into());
        let app = router(state(config));

        let response = app.clone().oneshot(get_request("/healthz")).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let response = app.oneshot(get_request("/metrics")).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert!(body_text(response).await.contains("exporter_discovery_version"));
    }

    #[tokio::test]
    async fn test_admin_requires_basic_auth_when_configured() {
        let mut config = ExporterConfig::default();
        config.server.admin_username = Some("admin".into());
        config.server.admin_password = Some("secret".into());
        let app = router(state(config));

        let response = app.clone().oneshot(get_request("/api/status")).await.unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

        let wrong = HttpRequest::builder()
            .uri("/api/status")
            .header(header::AUTHORIZATION, format!("Basic {}", STANDARD.encode("admin:nope")))
            .body(Body::empty())
            .unwrap();
        assert_eq!(app.clone().oneshot(wrong).await.unwrap().status(), StatusCode::UNAUTHORIZED);

        let right = HttpRequest::builder()
            .uri("/api/status")
            .header(header::AUTHORIZATION, format!("Basic {}", STANDARD.encode("admin:secret")))
            .body(Body::empty())
            .unwrap();
        let response = app.oneshot(right).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body: serde_json::Value = serde_json::from_str(&body_text(response).await).unwrap();
        assert_eq!(body["shard"]["total"], 1);
        assert_eq!(body["collection"]["running"], false);
    }

    #[tokio::test]
    async fn test_discovery_snapshot() {
        let state = state(ExporterConfig::default());
        state.discovery.refresh(&CancellationToken::new()).await;
        let response = router(state).oneshot(get_request("/api/discovery")).await.unwrap();

        let body: serde_json::Value = serde_json::from_str(&body_text(response).await).unwrap();
        assert_eq!(body["version"], 1);
        assert_eq!(body["products"]["aliyun"][0]["namespace"], "acs_ecs_dashboard");
    }

    #[tokio::test]
    async fn test_collect_trigger() {
        let app = router(state(ExporterConfig::default()));

        let unknown = HttpRequest::builder()
            .method("POST")
            .uri("/api/collect?provider=gcp")
            .body(Body::empty())
            .unwrap();
        assert_eq!(app.clone().oneshot(unknown).await.unwrap().status(), StatusCode::NOT_FOUND);

        let all = HttpRequest::builder().method("POST").uri("/api/collect").body(Body::empty()).unwrap();
        assert_eq!(app.oneshot(all).await.unwrap().status(), StatusCode::ACCEPTED);
    }

    #[tokio::test]
    async fn test_collect_trigger_conflicts_while_running() {
        let gate = Arc::new(Notify::new());
        let mut providers = ProviderRegistry::new();
        providers.register(Arc::new(GatedProvider { gate: gate.clone() }));
        let state = state_with(
            ExporterConfig::default(),
            providers,
            AccountSet::new(vec![Account::new("aliyun", "1234")]),
        );
        let collector = Arc::clone(&state.collector);
        let app = router(state);

        let post = || HttpRequest::builder().method("POST").uri("/api/collect").body(Body::empty()).unwrap();
        assert_eq!(app.clone().oneshot(post()).await.unwrap().status(), StatusCode::ACCEPTED);
        let response = app.clone().oneshot(post()).await.unwrap();
        assert_eq!(response.status(), StatusCode::CONFLICT);
        assert!(body_text(response).await.contains("already running"));

        gate.notify_one();
        let mut accepted = false;
        for _ in 0..100 {
            if app.clone().oneshot(post()).await.unwrap().status() == StatusCode::ACCEPTED {
                accepted = true;
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(accepted);
        assert!(collector.status().last_end.is_some());
        gate.notify_one();
    }

    #[tokio::test]
    async fn test_stream_sends_init_then_update() {
        let mut config = ExporterConfig::default();
        config.server.stream_max_lifetime = Duration::from_millis(300);
        let state = state(config);
        let discovery = Arc::clone(&state.discovery);

        let response = router(state).oneshot(get_request("/api/discovery/stream")).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(discovery.subscriber_count(), 1);

        discovery.refresh(&CancellationToken::new()).await;
        let body = body_text(response).await;
        assert!(body.contains("event: init"));
        assert!(body.contains("event: update"));
        assert!(body.contains("\"version\":1"));
        assert_eq!(discovery.subscriber_count(), 0);
    }

    #[tokio::test]
    async fn test_stream_rejected_at_capacity() {
        let mut config = ExporterConfig::default();
        config.server.max_subscribers = 0;
        let response = router(state(config)).oneshot(get_request("/api/discovery/stream")).await.unwrap();
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
    }
}
