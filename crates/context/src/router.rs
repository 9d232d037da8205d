//! Query Router - picks the retrieval strategy for a query
//!
//! Cheap heuristics run first (entity mentions, question-type keywords,
//! comparative language). Only when they are not confident enough does the
//! router pay for a classification call. Classifier failures never surface:
//! the router falls back to MultiHop, whose decompose-then-consolidate pass
//! covers what the other two routes would find.

use crate::session::SessionContext;
use graphforge_common::config::{CallPolicy, RouterConfig};
use graphforge_common::errors::{AppError, Result};
use graphforge_common::llm::{CompletionRequest, GuardedLlm};
use graphforge_common::metrics;
use graphforge_common::models::{Query, Route};
use graphforge_common::resilience::CallKind;
use graphforge_common::text;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::instrument;

/// Language that relates or contrasts several things
const RELATIONAL_SIGNALS: &[&str] = &[
    "compare",
    "comparison",
    " versus ",
    " vs ",
    " vs. ",
    "difference between",
    "differences between",
    " differ ",
    "relationship between",
    "connection between",
    "in common",
    " both ",
];

/// Openers of single-fact questions
const LOOKUP_PREFIXES: &[&str] = &[
    "who is", "who was", "what is", "what was", "what are", "when was", "when did", "when is",
    "where is", "where was", "define", "how many", "how much", "which year",
];

/// Capitalized openers that are instructions, not entities
const INSTRUCTION_WORDS: &[&str] = &[
    "explain", "describe", "compare", "list", "summarize", "summarise", "tell", "show", "give",
    "name", "outline", "discuss",
];

const CLASSIFIER_SYSTEM: &str = "You route questions over a document knowledge graph. \
Reply with exactly one label and nothing else.\n\
FAST_LOOKUP: a single fact about one directly named entity.\n\
ENTITY_FOCUSED: an explanation centred on one or two named entities.\n\
MULTI_HOP: comparisons, chains of reasoning, several entities, or vague scope.";

/// Where a route decision came from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DecisionSource {
    Forced,
    Heuristic,
    Classifier,
    /// Classifier failed or answered outside the taxonomy
    Fallback,
    /// Replayed from the session cache
    Cached,
}

impl DecisionSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            DecisionSource::Forced => "forced",
            DecisionSource::Heuristic => "heuristic",
            DecisionSource::Classifier => "classifier",
            DecisionSource::Fallback => "fallback",
            DecisionSource::Cached => "cached",
        }
    }
}

/// Route plus the trace explaining it
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RouteDecision {
    pub route: Route,
    /// 0.0 - 1.0
    pub confidence: f32,
    pub source: DecisionSource,
    pub explanation: String,
}

impl RouteDecision {
    fn new(route: Route, confidence: f32, source: DecisionSource, explanation: impl Into<String>) -> Self {
        Self {
            route,
            confidence,
            source,
            explanation: explanation.into(),
        }
    }

    fn fallback(reason: impl Into<String>) -> Self {
        Self::new(Route::MultiHop, 0.0, DecisionSource::Fallback, reason)
    }
}

/// Parse a classifier reply. Exactly one taxonomy label must appear.
pub fn parse_label(output: &str) -> Option<Route> {
    let upper = output.to_ascii_uppercase();
    let found: Vec<Route> = Route::ALL
        .into_iter()
        .filter(|route| upper.contains(route.label()))
        .collect();

    match found.as_slice() {
        [route] => Some(*route),
        [] => output
            .trim()
            .trim_matches(|c: char| !c.is_alphanumeric() && c != '_')
            .parse()
            .ok(),
        _ => None,
    }
}

/// Query router
pub struct QueryRouter {
    config: RouterConfig,
    classifier: Option<(GuardedLlm, CallPolicy)>,
}

impl QueryRouter {
    pub fn new(config: RouterConfig) -> Self {
        Self {
            config,
            classifier: None,
        }
    }

    /// Consult `llm` under `policy` when heuristics are not confident
    pub fn with_classifier(mut self, llm: GuardedLlm, policy: CallPolicy) -> Self {
        self.classifier = Some((llm, policy));
        self
    }

    pub fn config(&self) -> &RouterConfig {
        &self.config
    }

    /// Route for `query`, cached per session for identical (query, config)
    #[instrument(skip_all, fields(session_id = session.id()))]
    pub async fn route(&self, session: &SessionContext, query: &Query) -> RouteDecision {
        if let Some(route) = query.forced_route {
            metrics::record_route(route.as_str(), DecisionSource::Forced.as_str());
            return RouteDecision::new(route, 1.0, DecisionSource::Forced, "route forced by caller");
        }

        let key = self.cache_key(query);
        if let Some(cached) = session.cached_route(&key) {
            metrics::record_route_cache(true);
            metrics::record_route(cached.route.as_str(), DecisionSource::Cached.as_str());
            return RouteDecision {
                source: DecisionSource::Cached,
                ..cached
            };
        }
        metrics::record_route_cache(false);

        let decision = self.decide(&query.text).await;
        metrics::record_route(decision.route.as_str(), decision.source.as_str());
        tracing::info!(
            route = decision.route.as_str(),
            source = decision.source.as_str(),
            confidence = decision.confidence,
            explanation = %decision.explanation,
            "Query routed"
        );
        // A fallback reflects a failed classifier call, so the next request retries it
        if decision.source == DecisionSource::Fallback {
            return decision;
        }
        session.cache_route(key, decision)
    }

    /// Uncached decision: heuristics, then the classifier if needed
    pub async fn decide(&self, query_text: &str) -> RouteDecision {
        let heuristic = self.heuristic(query_text);
        if heuristic.confidence >= self.config.confidence_threshold {
            return heuristic;
        }

        let Some((llm, policy)) = self.classifier.as_ref().filter(|_| self.config.enable_classifier) else {
            return heuristic;
        };

        match self.classify(llm, policy, query_text).await {
            Ok(route) => RouteDecision::new(
                route,
                0.8,
                DecisionSource::Classifier,
                format!("classifier label {} (heuristic guess {})", route.label(), heuristic.route.label()),
            ),
            Err(e) => {
                tracing::warn!(error = %e, code = ?e.code(), "Route classification failed, using MULTI_HOP");
                RouteDecision::fallback(format!("classification failed: {}", e.code().as_code()))
            }
        }
    }

    /// Heuristic route with a confidence score
    pub fn heuristic(&self, query_text: &str) -> RouteDecision {
        let lower = format!(" {} ", text::normalize_text(query_text));
        let trimmed = lower.trim();
        let mut mentions = text::extract_mentions(query_text);
        mentions.retain(|m| !INSTRUCTION_WORDS.contains(&m.to_lowercase().as_str()));
        let words = query_text.split_whitespace().count();

        let relational = RELATIONAL_SIGNALS.iter().find(|s| lower.contains(*s));
        let lookup = LOOKUP_PREFIXES.iter().find(|p| trimmed.starts_with(*p));

        if let Some(signal) = relational {
            let confidence = if mentions.len() >= 2 { 0.9 } else { 0.8 };
            return RouteDecision::new(
                Route::MultiHop,
                confidence,
                DecisionSource::Heuristic,
                format!("relational language '{}' with {} mentions", signal.trim(), mentions.len()),
            );
        }

        match mentions.len() {
            n if n >= 3 => RouteDecision::new(
                Route::MultiHop,
                0.8,
                DecisionSource::Heuristic,
                format!("{} entity mentions", n),
            ),
            1 if lookup.is_some() && words <= self.config.fast_lookup_max_words => RouteDecision::new(
                Route::FastLookup,
                0.9,
                DecisionSource::Heuristic,
                format!("lookup question '{}' about one named entity", lookup.map_or("", |p| *p)),
            ),
            1 => RouteDecision::new(
                Route::EntityFocused,
                0.8,
                DecisionSource::Heuristic,
                "one named entity",
            ),
            2 => RouteDecision::new(
                Route::EntityFocused,
                0.6,
                DecisionSource::Heuristic,
                "two named entities without relational language",
            ),
            _ => RouteDecision::new(
                Route::MultiHop,
                0.4,
                DecisionSource::Heuristic,
                "no named entities",
            ),
        }
    }

    async fn classify(&self, llm: &GuardedLlm, policy: &CallPolicy, query_text: &str) -> Result<Route> {
        let request = CompletionRequest::new(
            CallKind::Classification,
            CLASSIFIER_SYSTEM,
            format!("Question: {}\nLabel:", query_text.trim()),
            policy.max_tokens,
        );
        let completion = llm
            .complete(policy, request)
            .await
            .map_err(|e| AppError::ClassificationFailure {
                message: e.to_string(),
            })?;

        parse_label(&completion.text).ok_or_else(|| AppError::ClassificationFailure {
            message: format!("unrecognised label '{}'", text::preview(&completion.text, 40)),
        })
    }

    /// Digest of everything the decision depends on
    fn cache_key(&self, query: &Query) -> String {
        let mut hasher = Sha256::new();
        hasher.update(text::normalize_text(&query.text).as_bytes());
        hasher.update([0u8]);
        hasher.update(query.scope.as_deref().unwrap_or_default().as_bytes());
        hasher.update([0u8]);
        hasher.update(serde_json::to_vec(&self.config).unwrap_or_default());
        if let Some((llm, _)) = &self.classifier {
            hasher.update(llm.model_name().as_bytes());
        }
        hex::encode(hasher.finalize())
    }
}
