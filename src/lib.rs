//! # relaygate: OpenAI/Anthropic-compatible reverse proxy dispatch engine
//!
//! `relaygate` fronts one or more upstream LLM backends behind a single API-key-authenticated
//! surface. It authenticates callers, enforces per-key daily quotas and per-backend
//! concurrency caps, selects an upstream via a waterfall fallback policy, rewrites model
//! identifiers and injects system prompts, then relays the request — streaming or unary — to
//! the chosen backend while preserving server-sent event semantics.
//!
//! ## Request Flow
//!
//! Every `POST /v1/*` request passes through the [`handler::dispatch`] pipeline:
//!
//! 1. **Auth** ([`store`]) — resolve the bearer token to a `KeyRecord`, reject expired keys.
//! 2. **Usage pre-check** ([`usage`]) — deny if the daily quota is already exhausted.
//! 3. **Source selection** ([`selector`]) — waterfall: pinned profile → default → backups →
//!    queued-default, with atomic concurrency accounting via [`concurrency`].
//! 4. **Transformation** ([`transform`]) — build the upstream URL, validate/swap the model
//!    name, inject the system prompt in the resolved format.
//! 5. **Relay** ([`relay`]) — forward to the upstream, relaying a unary body or an SSE stream
//!    back to the caller with heartbeats and model-name rewriting, releasing the concurrency
//!    slot and committing the deferred usage increment on every exit path.
//!
//! ## Quick Start
//!
//! ```no_run
//! use clap::Parser;
//! use relaygate::{Application, Config, config::Args};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let args = Args::parse();
//!     let config = Config::load(&args)?;
//!     relaygate::telemetry::init_telemetry(config.enable_otel_export)?;
//!
//!     let app = Application::new(config).await?;
//!     app.serve(async {
//!         tokio::signal::ctrl_c().await.expect("Failed to listen for Ctrl+C");
//!     })
//!     .await
//! }
//! ```
//!
//! ## Configuration
//!
//! See the [`config`] module for configuration options.

pub mod concurrency;
pub mod config;
pub mod errors;
pub mod handler;
mod metrics;
pub mod relay;
pub mod selector;
pub mod store;
pub mod telemetry;
pub mod transform;
pub mod usage;

#[cfg(any(test, feature = "test-utils"))]
pub mod test_utils;

use std::sync::Arc;

use axum::http::{Method, StatusCode};
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Router, extract::State};
use prometheus::{Encoder, Registry, TextEncoder};
use tokio::net::TcpListener;
use tower_http::cors::CorsLayer;
use tower_http::trace::{DefaultMakeSpan, DefaultOnRequest, DefaultOnResponse, TraceLayer};
use tracing::{Level, info, instrument};

pub use config::Config;
use metrics::DispatchMetrics;
use relay::Relay;
use store::RedisStore;

/// Shared state for the dispatch pipeline's handlers.
///
/// Cheap to `Clone`: the store's connection pool and caches, and the relay's HTTP client, are
/// all reference-counted internally.
#[derive(Clone)]
pub struct AppState {
    pub store: RedisStore,
    pub config: Config,
    pub relay: Relay,
    pub metrics: Option<Arc<DispatchMetrics>>,
}

/// Build the dispatch router: `POST /v1/*` to the Entry Handler, `OPTIONS *` to a permissive
/// preflight response (§6), and — when enabled — `/internal/metrics` in Prometheus text
/// format.
fn build_router(state: AppState) -> Router {
    let enable_metrics = state.config.enable_metrics;

    let mut router = Router::new()
        .route("/v1", post(handler::dispatch).options(handler::options_preflight))
        .route("/v1/{*rest}", post(handler::dispatch).options(handler::options_preflight))
        .route("/healthz", get(healthz));

    if enable_metrics {
        router = router.route("/internal/metrics", get(metrics_handler));
    }

    router
        .fallback(fallback)
        .with_state(state)
        .layer(CorsLayer::permissive())
        .layer(
            TraceLayer::new_for_http()
                .make_span_with(DefaultMakeSpan::new().level(Level::INFO))
                .on_request(DefaultOnRequest::new().level(Level::DEBUG))
                .on_response(DefaultOnResponse::new().level(Level::INFO)),
        )
}

/// Catch-all for paths outside `/v1/*`: `OPTIONS *` always returns a bare 200 (§6), everything
/// else a plain 404.
async fn fallback(method: Method) -> StatusCode {
    if method == Method::OPTIONS { StatusCode::OK } else { StatusCode::NOT_FOUND }
}

/// Unauthenticated liveness endpoint (SPEC_FULL §0.7): 200 if the store is reachable, 503
/// otherwise. Not part of the dispatch pipeline's auth/quota/relay contract.
async fn healthz(State(state): State<AppState>) -> StatusCode {
    use store::Store;
    match state.store.ping().await {
        Ok(()) => StatusCode::OK,
        Err(_) => StatusCode::SERVICE_UNAVAILABLE,
    }
}

async fn metrics_handler(State(state): State<AppState>) -> axum::response::Response {
    let Some(metrics) = &state.metrics else {
        return StatusCode::NOT_FOUND.into_response();
    };

    let families = metrics.registry().gather();
    let encoder = TextEncoder::new();
    let mut buffer = Vec::new();
    if let Err(e) = encoder.encode(&families, &mut buffer) {
        tracing::error!(error = %e, "failed to encode prometheus metrics");
        return StatusCode::INTERNAL_SERVER_ERROR.into_response();
    }

    ([(axum::http::header::CONTENT_TYPE, encoder.format_type().to_string())], buffer).into_response()
}

/// The running application: a bound router plus everything needed to serve it and shut it
/// down cleanly.
pub struct Application {
    router: Router,
    config: Config,
}

impl Application {
    /// Construct the application: connect the store, build the shared upstream HTTP client,
    /// wire up metrics if enabled, and assemble the router. Does not bind a socket yet.
    #[instrument(skip_all)]
    pub async fn new(config: Config) -> anyhow::Result<Self> {
        tracing::debug!("starting relaygate with configuration: {:#?}", config);

        let metrics = if config.enable_metrics {
            let registry = Registry::new();
            Some(Arc::new(DispatchMetrics::new(&registry)?))
        } else {
            None
        };

        let cache_ttls = store::redis_store::CacheTtls {
            settings: config.cache_ttls.settings,
            profiles: config.cache_ttls.profiles,
            backups: config.cache_ttls.backups,
            model_configs: config.cache_ttls.model_configs,
        };

        let mut store = RedisStore::connect(&config.store.url, config.store.pool_size as usize, cache_ttls, config.conversation_window_ms)?;
        if let Some(metrics) = &metrics {
            store = store.with_metrics(metrics.clone());
        }

        let relay = Relay::new(&config.upstream, config.client_identity.clone(), config.heartbeat_interval, config.brand_rewrite.clone())?;

        let state = AppState { store, config: config.clone(), relay, metrics };
        let router = build_router(state);

        Ok(Self { router, config })
    }

    /// Bind to the configured host/port and serve until `shutdown` resolves, then return.
    pub async fn serve<F>(self, shutdown: F) -> anyhow::Result<()>
    where
        F: std::future::Future<Output = ()> + Send + 'static,
    {
        let bind_addr = self.config.bind_address();
        let listener = TcpListener::bind(&bind_addr).await?;
        info!("relaygate listening on http://{}", bind_addr);

        axum::serve(listener, self.router.into_make_service()).with_graceful_shutdown(shutdown).await?;

        info!("shutting down telemetry...");
        telemetry::shutdown_telemetry();

        Ok(())
    }
}
