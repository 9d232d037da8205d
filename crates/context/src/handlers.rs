//! HTTP handlers

use crate::engine::SynthesisResult;
use crate::session::SessionContext;
use crate::AppState;
use axum::extract::State;
use axum::http::HeaderMap;
use axum::response::{IntoResponse, Response};
use axum::Json;
use graphforge_common::errors::{AppError, RequestFailure};
use graphforge_common::models::{Query, Route, SamplingConfig, Verbosity};
use graphforge_common::metrics::StageTimer;
use graphforge_common::VERSION;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use uuid::Uuid;
use validator::Validate;

const SESSION_HEADER: &str = "x-session-id";

/// Body of `POST /v2/answer`
#[derive(Debug, Deserialize, Validate)]
pub struct AnswerRequest {
    #[validate(length(min = 1, max = 4000))]
    pub query: String,

    /// Skip routing and use this strategy
    #[serde(default)]
    pub route: Option<Route>,

    #[serde(default)]
    pub verbosity: Option<Verbosity>,

    #[validate(range(min = 0.0, max = 2.0))]
    #[serde(default)]
    pub temperature: Option<f32>,

    #[validate(range(min = 0.0, max = 1.0))]
    #[serde(default)]
    pub top_p: Option<f32>,

    /// Route decisions are cached per session; falls back to `x-session-id`
    #[validate(length(min = 1, max = 128))]
    #[serde(default)]
    pub session_id: Option<String>,

    #[validate(length(max = 256))]
    #[serde(default)]
    pub scope: Option<String>,
}

impl AnswerRequest {
    fn query(&self) -> Query {
        let defaults = SamplingConfig::default();
        let mut query = Query::new(self.query.clone())
            .with_verbosity(self.verbosity.unwrap_or_default())
            .with_sampling(SamplingConfig {
                temperature: self.temperature.unwrap_or(defaults.temperature),
                top_p: self.top_p.unwrap_or(defaults.top_p),
            });
        if let Some(route) = self.route {
            query = query.with_route(route);
        }
        if let Some(scope) = &self.scope {
            query = query.with_scope(scope.clone());
        }
        query
    }
}

/// Answer a question over the knowledge graph
pub async fn answer(State(state): State<AppState>, headers: HeaderMap, Json(request): Json<AnswerRequest>) -> Response {
    if let Err(e) = request.validate() {
        return AppError::Validation {
            message: e.to_string(),
            field: None,
        }
        .into_response();
    }

    let session_id = request.session_id.clone().or_else(|| {
        headers
            .get(SESSION_HEADER)
            .and_then(|v| v.to_str().ok())
            .filter(|v| !v.is_empty() && v.len() <= 128)
            .map(str::to_string)
    });
    let session = match session_id {
        Some(id) => state.sessions.get_or_create(&id),
        None => Arc::new(SessionContext::ephemeral()),
    };

    let deadline = state.config.request_timeout();
    match tokio::time::timeout(deadline, state.engine.answer(&session, request.query())).await {
        Ok(Ok(result)) => Json::<SynthesisResult>(result).into_response(),
        Ok(Err(failure)) => failure.into_response(),
        Err(_) => {
            let failure = RequestFailure::new(
                Uuid::now_v7(),
                AppError::RetrievalTimeout {
                    operation: "answer".to_string(),
                    timeout_ms: deadline.as_millis() as u64,
                },
            );
            tracing::warn!(correlation_id = %failure.correlation_id, "Request deadline exceeded");
            failure.into_response()
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
    pub sessions: usize,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ReadyResponse {
    pub status: String,
    pub graph_store: CheckResult,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct CheckResult {
    pub status: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub latency_ms: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Liveness probe
pub async fn health(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "healthy".to_string(),
        version: VERSION.to_string(),
        sessions: state.sessions.len(),
    })
}

/// Readiness probe; pings the graph database when there is one
pub async fn ready(State(state): State<AppState>) -> Json<ReadyResponse> {
    let timer = StageTimer::start();
    let graph_store = match &state.graph_db {
        None => CheckResult {
            status: "up".to_string(),
            latency_ms: None,
            error: None,
        },
        Some(pool) => match pool.ping().await {
            Ok(()) => CheckResult {
                status: "up".to_string(),
                latency_ms: Some(timer.elapsed_ms()),
                error: None,
            },
            Err(e) => CheckResult {
                status: "down".to_string(),
                latency_ms: None,
                error: Some(e.public_message()),
            },
        },
    };

    Json(ReadyResponse {
        status: if graph_store.status == "up" { "ready" } else { "not_ready" }.to_string(),
        graph_store,
    })
}
