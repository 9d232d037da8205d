//! GraphForge answer service
//!
//! Provides:
//! - Query routing with a session-scoped decision cache
//! - Multi-hop decomposition with bounded fan-out and a fan-in barrier
//! - Evidence-only synthesis with validated citations
//! - The request orchestrator and its HTTP surface

pub mod decomposition;
pub mod engine;
pub mod handlers;
pub mod router;
pub mod session;
pub mod synthesizer;

pub use decomposition::{Decomposer, MultiHopWorkflow, SubQuestion, WorkflowOutcome};
pub use engine::{AnswerEngine, RequestState, SynthesisResult};
pub use router::{DecisionSource, QueryRouter, RouteDecision};
pub use session::{SessionContext, SessionRegistry};
pub use synthesizer::{AnswerKind, Citation, Synthesizer, REFUSAL_TEXT};

use axum::routing::{get, post};
use axum::Router;
use graphforge_common::config::AppConfig;
use graphforge_common::graph::GraphDbPool;
use std::sync::Arc;
use tower::limit::ConcurrencyLimitLayer;
use tower_http::cors::{Any, CorsLayer};
use tower_http::request_id::{MakeRequestUuid, PropagateRequestIdLayer, SetRequestIdLayer};
use tower_http::trace::TraceLayer;

/// Application state shared across handlers
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<AppConfig>,
    pub engine: Arc<AnswerEngine>,
    pub sessions: Arc<SessionRegistry>,
    /// Present when the graph lives in Postgres
    pub graph_db: Option<GraphDbPool>,
}

/// HTTP routes with tracing, CORS and request-id layers
pub fn create_router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    let api_routes = Router::new()
        .route("/answer", post(handlers::answer))
        .layer(ConcurrencyLimitLayer::new(state.config.server.max_concurrent_requests));

    Router::new()
        .route("/health", get(handlers::health))
        .route("/ready", get(handlers::ready))
        .nest("/v2", api_routes)
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        // Set must wrap Propagate so the generated id reaches the response
        .layer(PropagateRequestIdLayer::x_request_id())
        .layer(SetRequestIdLayer::x_request_id(MakeRequestUuid))
        .with_state(state)
}
