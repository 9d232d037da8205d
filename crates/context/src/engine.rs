//! Answer orchestrator
//!
//! Drives one request through the state machine:
//!
//! ```text
//! Received -> Routed -> FastLookup ------------------------------+
//!                    -> EntityRetrieval ------------------------+-> Denoised -> Synthesized -> Returned
//!                    -> Decomposition -> FanOut -> FanIn
//!                       -> ConsolidatedRetrieval ---------------+
//! ```
//!
//! Any stage may end in `Failed`. The caller then sees a stable error kind
//! and the request's correlation id; details stay in the logs.

use crate::decomposition::{Decomposer, MultiHopWorkflow, SubQuestion};
use crate::router::{QueryRouter, RouteDecision};
use crate::session::SessionContext;
use crate::synthesizer::{AnswerKind, Citation, SynthesisTelemetry, Synthesizer};
use graphforge_common::config::AppConfig;
use graphforge_common::denoise::DenoisePipeline;
use graphforge_common::embeddings::Embedder;
use graphforge_common::errors::{AppError, RequestFailure, Result};
use graphforge_common::graph::GraphStore;
use graphforge_common::llm::{GuardedLlm, LlmClient};
use graphforge_common::metrics::{self, StageTimer};
use graphforge_common::models::{ContextStats, Query, Route};
use graphforge_common::resilience::OutboundGuard;
use graphforge_search::{GraphRetriever, RetrievalGap, RetrievalMode, RetrievalOutcome, RetrievalRequest};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::instrument;
use uuid::Uuid;

/// Request lifecycle states
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RequestState {
    Received,
    Routed,
    FastLookup,
    EntityRetrieval,
    Decomposition,
    FanOut,
    FanIn,
    ConsolidatedRetrieval,
    Denoised,
    Synthesized,
    Returned,
    Failed,
}

/// Wall time spent per stage
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct StageLatency {
    pub routing_ms: u64,
    pub retrieval_ms: u64,
    pub synthesis_ms: u64,
}

/// Successful answer, including "insufficient evidence" answers
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SynthesisResult {
    pub correlation_id: Uuid,
    pub route_used: Route,
    pub route_decision: RouteDecision,
    pub response_text: String,
    pub answer_kind: AnswerKind,
    pub citations: Vec<Citation>,
    pub context_stats: ContextStats,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub sub_questions: Vec<SubQuestion>,
    /// Graph reads that failed without failing the request
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub gaps: Vec<RetrievalGap>,
    pub latency_ms: u64,
    pub stages: StageLatency,
    pub telemetry: SynthesisTelemetry,
    pub states: Vec<RequestState>,
}

#[derive(Debug, Default)]
struct RequestTrace {
    states: Vec<RequestState>,
    route: Option<Route>,
}

impl RequestTrace {
    fn enter(&mut self, state: RequestState) {
        tracing::debug!(state = ?state, "Request state");
        self.states.push(state);
    }

    fn last(&self) -> Option<RequestState> {
        self.states.last().copied()
    }
}

/// Routes, retrieves and synthesizes one query at a time
pub struct AnswerEngine {
    router: QueryRouter,
    retriever: Arc<GraphRetriever>,
    workflow: MultiHopWorkflow,
    synthesizer: Synthesizer,
}

impl AnswerEngine {
    pub fn new(
        router: QueryRouter,
        retriever: Arc<GraphRetriever>,
        workflow: MultiHopWorkflow,
        synthesizer: Synthesizer,
    ) -> Self {
        Self {
            router,
            retriever,
            workflow,
            synthesizer,
        }
    }

    /// Wire every component from configuration. All LLM call kinds share
    /// one outbound guard.
    pub fn from_config(
        config: &AppConfig,
        store: Arc<dyn GraphStore>,
        llm: Arc<dyn LlmClient>,
        embedder: Option<Arc<dyn Embedder>>,
        guard: OutboundGuard,
    ) -> Self {
        let llm = GuardedLlm::new(llm, guard);

        let mut retriever = GraphRetriever::new(
            store,
            config.retrieval.clone(),
            DenoisePipeline::new(config.denoise.clone()),
        );
        if let Some(embedder) = embedder {
            retriever = retriever.with_embedder(embedder);
        }
        let retriever = Arc::new(retriever);

        let router = QueryRouter::new(config.router.clone())
            .with_classifier(llm.clone(), config.llm.classification.clone());
        let decomposer = Decomposer::new(
            llm.clone(),
            config.llm.decomposition.clone(),
            config.workflow.max_sub_questions,
        );
        let workflow = MultiHopWorkflow::new(retriever.clone(), decomposer, config.workflow.clone());
        let synthesizer = Synthesizer::new(llm, config.llm.synthesis.clone(), config.synthesis.clone());

        Self::new(router, retriever, workflow, synthesizer)
    }

    pub fn retriever(&self) -> &GraphRetriever {
        &self.retriever
    }

    /// Answer `query` within `session`
    #[instrument(skip_all, fields(session_id = session.id(), correlation_id = tracing::field::Empty))]
    pub async fn answer(&self, session: &SessionContext, query: Query) -> std::result::Result<SynthesisResult, RequestFailure> {
        let correlation_id = Uuid::now_v7();
        tracing::Span::current().record("correlation_id", tracing::field::display(correlation_id));

        let timer = StageTimer::start();
        let mut trace = RequestTrace::default();
        trace.enter(RequestState::Received);

        let outcome = self.run(session, &query, correlation_id, &mut trace).await;
        let route = trace.route.map_or("unrouted", |r| r.as_str());

        match outcome {
            Ok(mut result) => {
                trace.enter(RequestState::Returned);
                result.states = trace.states;
                result.latency_ms = timer.elapsed_ms();
                metrics::record_answer(timer.elapsed_secs(), route, result.answer_kind.as_str());
                tracing::info!(
                    %correlation_id,
                    route,
                    answer_kind = result.answer_kind.as_str(),
                    citations = result.citations.len(),
                    raw = result.context_stats.raw,
                    deduped = result.context_stats.deduped,
                    penalized = result.context_stats.penalized,
                    dropped = result.context_stats.dropped,
                    latency_ms = result.latency_ms,
                    "Answer returned"
                );
                Ok(result)
            }
            Err(error) => {
                let failed_in = trace.last();
                trace.enter(RequestState::Failed);
                metrics::record_answer(timer.elapsed_secs(), route, "failed");
                tracing::error!(
                    %correlation_id,
                    route,
                    stage = ?failed_in,
                    code = ?error.code(),
                    error = %error,
                    "Request failed"
                );
                Err(RequestFailure::new(correlation_id, error))
            }
        }
    }

    async fn run(
        &self,
        session: &SessionContext,
        query: &Query,
        correlation_id: Uuid,
        trace: &mut RequestTrace,
    ) -> Result<SynthesisResult> {
        if query.text.trim().is_empty() {
            return Err(AppError::Validation {
                message: "query text is empty".to_string(),
                field: Some("query".to_string()),
            });
        }

        let stage = StageTimer::start();
        let decision = self.router.route(session, query).await;
        trace.route = Some(decision.route);
        trace.enter(RequestState::Routed);
        let routing_ms = stage.elapsed_ms();

        let stage = StageTimer::start();
        let (retrieval, sub_questions) = self.retrieve(decision.route, query, trace).await?;
        trace.enter(RequestState::Denoised);
        let retrieval_ms = stage.elapsed_ms();

        let stage = StageTimer::start();
        let synthesis = self
            .synthesizer
            .synthesize(query, &retrieval.evidence, &sub_questions)
            .await?;
        trace.enter(RequestState::Synthesized);
        let synthesis_ms = stage.elapsed_ms();

        Ok(SynthesisResult {
            correlation_id,
            route_used: decision.route,
            route_decision: decision,
            response_text: synthesis.text,
            answer_kind: synthesis.answer_kind,
            citations: synthesis.citations,
            context_stats: retrieval.stats,
            sub_questions,
            gaps: retrieval.gaps,
            latency_ms: 0,
            stages: StageLatency {
                routing_ms,
                retrieval_ms,
                synthesis_ms,
            },
            telemetry: synthesis.telemetry,
            states: Vec::new(),
        })
    }

    async fn retrieve(
        &self,
        route: Route,
        query: &Query,
        trace: &mut RequestTrace,
    ) -> Result<(RetrievalOutcome, Vec<SubQuestion>)> {
        match route {
            Route::FastLookup => {
                trace.enter(RequestState::FastLookup);
                let request = RetrievalRequest::for_text(&query.text, RetrievalMode::Fast);
                Ok((self.retriever.retrieve(&request).await?, Vec::new()))
            }
            Route::EntityFocused => {
                trace.enter(RequestState::EntityRetrieval);
                let request = RetrievalRequest::for_text(&query.text, RetrievalMode::Full);
                Ok((self.retriever.retrieve(&request).await?, Vec::new()))
            }
            Route::MultiHop => {
                trace.enter(RequestState::Decomposition);
                let questions = self.workflow.decompose(&query.text).await;

                trace.enter(RequestState::FanOut);
                let fan_in = self.workflow.fan_out(questions).await;
                trace.enter(RequestState::FanIn);

                if fan_in.succeeded() > 0 {
                    trace.enter(RequestState::ConsolidatedRetrieval);
                }
                let outcome = self.workflow.consolidate(&query.text, fan_in).await?;
                Ok((outcome.consolidated, outcome.sub_questions))
            }
        }
    }
}
