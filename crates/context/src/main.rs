//! GraphForge answer service
//!
//! Serves `POST /v2/answer` over the Postgres-backed knowledge graph.

use graphforge_common::config::{AppConfig, ObservabilityConfig};
use graphforge_common::embeddings::create_embedder;
use graphforge_common::graph::{GraphDbPool, PgGraphStore};
use graphforge_common::llm::create_llm_client;
use graphforge_common::metrics::{self, LATENCY_BUCKETS, PROVIDER_BUCKETS, PROVIDER_HISTOGRAMS};
use graphforge_common::resilience::OutboundGuard;
use graphforge_common::VERSION;
use graphforge_context::{create_router, AnswerEngine, AppState, SessionRegistry};
use metrics_exporter_prometheus::{Matcher, PrometheusBuilder};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::signal;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    let config = AppConfig::load()?;
    init_tracing(&config.observability);
    config.validate().map_err(|e| {
        tracing::error!(error = %e, "Invalid configuration");
        e
    })?;
    let config = Arc::new(config);

    info!(version = VERSION, service = %config.observability.service_name, "Starting answer service");

    if config.observability.metrics_port != 0 {
        let addr = SocketAddr::from(([0, 0, 0, 0], config.observability.metrics_port));
        let mut exporter = PrometheusBuilder::new()
            .with_http_listener(addr)
            .set_buckets(LATENCY_BUCKETS)?;
        for suffix in PROVIDER_HISTOGRAMS {
            exporter = exporter.set_buckets_for_metric(Matcher::Suffix(suffix.to_string()), PROVIDER_BUCKETS)?;
        }
        exporter.install()?;
        info!(%addr, "Metrics exporter listening");
    }
    metrics::register_metrics();

    let graph_db = GraphDbPool::connect(&config.database).await?;
    let store = Arc::new(PgGraphStore::new(graph_db.clone()));

    let guard = OutboundGuard::new(&config.rate_limit);
    let llm = create_llm_client(&config.llm)?;
    let embedder = create_embedder(&config.embedding, guard.clone())?;
    info!(
        model = llm.model_name(),
        embedder = %config.embedding.provider,
        semantic_weight = config.retrieval.semantic_weight,
        "Providers ready"
    );

    let engine = AnswerEngine::from_config(&config, store, llm, embedder, guard);
    let state = AppState {
        config: config.clone(),
        engine: Arc::new(engine),
        sessions: Arc::new(SessionRegistry::from_config(&config.router)),
        graph_db: Some(graph_db),
    };

    let addr: SocketAddr = format!("{}:{}", config.server.host, config.server.port).parse()?;
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!(%addr, "Listening");

    axum::serve(listener, create_router(state))
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    info!("Server shutdown complete");
    Ok(())
}

fn init_tracing(config: &ObservabilityConfig) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_level));
    let builder = tracing_subscriber::fmt().with_env_filter(filter).with_target(true);
    if config.json_logging {
        builder.json().init();
    } else {
        builder.init();
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to listen for Ctrl+C");
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
                tracing::error!(error = %e, "Failed to install SIGTERM handler");
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
