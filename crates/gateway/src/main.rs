//! FilingForge API Gateway
//!
//! The HTTP surface of the generation pipeline.
//! Handles:
//! - Reads of generated content and its provenance
//! - Job creation, status polling and cancellation
//! - Token usage reports
//! - Rate limiting and observability (logging, metrics)

mod handlers;
mod middleware;

use anyhow::Context;
use axum::{
    middleware::{from_fn, from_fn_with_state},
    routing::{get, post},
    Router,
};
use filingforge_common::{
    config::{AppConfig, ObservabilityConfig},
    llm::create_completion_client,
    metrics::{self, COMPLETION_BUCKETS, LATENCY_BUCKETS, METRICS_PREFIX},
    open_store, PipelineStore,
};
use filingforge_pipeline::{ConfigRegistry, Orchestrator};
use metrics_exporter_prometheus::{Matcher, PrometheusBuilder};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::signal;
use tower_http::{
    cors::{Any, CorsLayer},
    request_id::{MakeRequestUuid, PropagateRequestIdLayer, SetRequestIdLayer},
    timeout::TimeoutLayer,
    trace::TraceLayer,
};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use crate::middleware::rate_limit::{create_rate_limiter, rate_limit_middleware};

/// Application state shared across handlers
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<AppConfig>,
    pub store: Arc<dyn PipelineStore>,
    pub orchestrator: Orchestrator,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load environment variables
    dotenvy::dotenv().ok();

    // Load configuration
    let config = AppConfig::load().context("failed to load configuration")?;
    let config = Arc::new(config);

    init_tracing(&config.observability);
    info!("Starting FilingForge API Gateway v{}", filingforge_common::VERSION);

    // Initialize metrics
    install_metrics_exporter(&config)?;
    metrics::register_metrics();

    // Storage, registry and completion service
    let store = open_store(&config).await?;

    let mut registry = ConfigRegistry::with_defaults()?;
    if let Some(path) = &config.registry.path {
        registry.load_overrides(path)?;
        info!(path = %path, "Registry overrides loaded");
    }
    let client = create_completion_client(&config.completion)?;

    let orchestrator =
        Orchestrator::from_config(store.clone(), client, Arc::new(registry), &config.pipeline);

    // Jobs a previous process left RUNNING or PENDING
    let recovery = orchestrator.clone();
    tokio::spawn(async move {
        match recovery.recover_interrupted().await {
            Ok(jobs) if !jobs.is_empty() => info!(jobs = jobs.len(), "Recovered unfinished jobs"),
            Ok(_) => {}
            Err(e) => error!(error = %e, "Job recovery failed"),
        }
    });

    let state = AppState {
        config: config.clone(),
        store,
        orchestrator,
    };

    // Build the router
    let app = create_router(state);

    // Start the server
    let addr: SocketAddr = format!("{}:{}", config.server.host, config.server.port)
        .parse()
        .context("invalid server address")?;
    info!("Listening on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    info!("Server shutdown complete");
    Ok(())
}

fn init_tracing(config: &ObservabilityConfig) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_level));
    let subscriber = tracing_subscriber::fmt().with_env_filter(filter).with_target(true);

    if config.json_logging {
        subscriber.json().init();
    } else {
        subscriber.init();
    }
}

/// Serve Prometheus metrics on their own port (0 disables)
fn install_metrics_exporter(config: &AppConfig) -> anyhow::Result<()> {
    let port = config.observability.metrics_port;
    if port == 0 {
        warn!("Metrics exporter disabled");
        return Ok(());
    }

    let addr: SocketAddr = format!("{}:{}", config.server.host, port)
        .parse()
        .context("invalid metrics address")?;

    PrometheusBuilder::new()
        .with_http_listener(addr)
        .set_buckets_for_metric(
            Matcher::Full(format!("{}_request_duration_seconds", METRICS_PREFIX)),
            LATENCY_BUCKETS,
        )?
        .set_buckets_for_metric(
            Matcher::Full(format!("{}_completion_duration_seconds", METRICS_PREFIX)),
            COMPLETION_BUCKETS,
        )?
        .install()
        .context("failed to install metrics exporter")?;

    info!(addr = %addr, "Metrics exporter listening");
    Ok(())
}

/// Create the main application router
fn create_router(state: AppState) -> Router {
    // CORS configuration
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    // Request ID propagation
    let request_id = SetRequestIdLayer::x_request_id(MakeRequestUuid);
    let propagate_id = PropagateRequestIdLayer::x_request_id();

    // API routes
    let mut api_routes = Router::new()
        // Health endpoints
        .route("/health", get(handlers::health::health))
        .route("/ready", get(handlers::health::ready))

        // Content endpoints
        .route("/content/{id}", get(handlers::content::get_content))
        .route("/content/{id}/provenance", get(handlers::content::get_provenance))
        .route("/companies/{company}/content", get(handlers::content::list_company_content))
        .route("/documents/{id}/content", get(handlers::content::list_document_content))

        // Job endpoints
        .route("/jobs", post(handlers::jobs::create_job))
        .route("/jobs/{id}", get(handlers::jobs::get_job))
        .route("/jobs/{id}/cancel", post(handlers::jobs::cancel_job))
        .route("/jobs/{id}/usage", get(handlers::usage::job_usage))

        // Usage endpoints
        .route("/usage", get(handlers::usage::total_usage));

    if let Some(limiter) = create_rate_limiter(
        state.config.server.rate_limit_per_second,
        state.config.server.rate_limit_burst,
    ) {
        api_routes = api_routes.layer(from_fn_with_state(limiter, rate_limit_middleware));
    }

    // Compose the app
    Router::new()
        .nest("/v1", api_routes)
        .layer(from_fn(middleware::metrics::track_requests))
        .layer(TimeoutLayer::new(state.config.request_timeout()))
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .layer(request_id)
        .layer(propagate_id)
        .with_state(state)
}

/// Graceful shutdown signal handler
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            warn!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("Received Ctrl+C, starting shutdown..."),
        _ = terminate => info!("Received SIGTERM, starting shutdown..."),
    }
}
