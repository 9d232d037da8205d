//! End-to-end answer scenarios over an in-memory graph and a scripted model

use async_trait::async_trait;
use graphforge_common::config::AppConfig;
use graphforge_common::denoise::DenoisePipeline;
use graphforge_common::embeddings::{Embedder, HashingEmbedder};
use graphforge_common::errors::{AppError, ErrorCode, Result};
use graphforge_common::graph::{GraphStore, InMemoryGraph};
use graphforge_common::llm::{CompletionRequest, ScriptedLlm};
use graphforge_common::models::{Chunk, EdgeKind, Entity, EvidencePayload, GraphEdge, Query, Route, TextUnit};
use graphforge_common::resilience::{CallKind, OutboundGuard};
use graphforge_context::{AnswerEngine, AnswerKind, SessionContext, REFUSAL_TEXT};
use graphforge_search::{GraphRetriever, RetrievalMode, RetrievalRequest};
use std::collections::HashMap;
use std::sync::Arc;
use uuid::Uuid;

const NEIGHBORS: [&str; 9] = [
    "Polonium",
    "Radium",
    "Uranium",
    "Thorium",
    "Pitchblende",
    "Sorbonne",
    "Warsaw",
    "Paris",
    "Nobel Prize",
];

const PASSAGES: [&str; 10] = [
    "Marie Curie was a physicist and chemist who conducted pioneering research on radioactivity in Paris.",
    "Polonium was the first element the Curies discovered, naming it after Poland, the homeland of Marie.",
    "Radium was isolated from tonnes of pitchblende residue after years of painstaking chemical separation.",
    "Uranium rays studied by Henri Becquerel inspired the doctoral research that Curie began in 1897.",
    "Thorium was found to emit rays similar to uranium, which Curie reported independently in 1898.",
    "Pitchblende samples proved more active than their uranium content explained, hinting at new elements.",
    "The Sorbonne appointed Curie as its first woman professor after the death of Pierre Curie in 1906.",
    "Warsaw was the city where Maria Sklodowska was born in 1867 and attended a clandestine university.",
    "Paris hosted the Radium Institute, whose laboratories Curie directed from their opening in 1914.",
    "The Nobel Prize in Chemistry was awarded to Curie in 1911 for the discovery of radium and polonium.",
];

/// Topics no passage covers; the scripted model refuses questions about them
const ABSENT_TOPICS: [&str; 4] = ["atlantis", "vibranium", "moon", "el dorado"];

const QUERY: &str = "Explain the research of Marie Curie";

fn id(n: u128) -> Uuid {
    Uuid::from_u128(n)
}

/// Curie plus nine neighbors. Entity `j` links passages `j..j+4` (mod 10)
/// under fresh chunk ids, so 40 raw units hold 10 distinct texts.
fn curie_graph() -> InMemoryGraph {
    let mut b = InMemoryGraph::builder();
    let mut entities = vec![b.add_entity(Entity::new(id(1), "Marie Curie", "person").with_importance(0.9))];
    for (i, name) in NEIGHBORS.iter().enumerate() {
        let entity = b.add_entity(Entity::new(id(2 + i as u128), *name, "topic").with_importance(0.4));
        b.add_edge(entities[0], entity, EdgeKind::Semantic, 1.0).unwrap();
        entities.push(entity);
    }

    for (j, entity) in entities.iter().enumerate() {
        for k in 0..4 {
            let passage = (j + k) % PASSAGES.len();
            let chunk_id = 1_000 + (j * 10 + k) as u128;
            b.link(
                *entity,
                EvidencePayload::Chunk(Chunk::new(id(chunk_id), id(900 + passage as u128), "Curie Papers", PASSAGES[passage])),
            )
            .unwrap();
        }
    }
    b.build()
}

/// Entity that linked a chunk built by [`curie_graph`]
fn linking_entity(chunk_id: Uuid) -> Uuid {
    let j = (chunk_id.as_u128() - 1_000) / 10;
    id(1 + j)
}

fn question_of(prompt: &str) -> String {
    prompt
        .rsplit("Question: ")
        .next()
        .and_then(|rest| rest.lines().next())
        .unwrap_or_default()
        .trim()
        .to_string()
}

fn mentions_absent_topic(text: &str) -> bool {
    let lower = text.to_lowercase();
    ABSENT_TOPICS.iter().any(|topic| lower.contains(topic))
}

/// Model that answers only from evidence and refuses absent topics,
/// appending a stray marker to its refusals
fn faithful_model(request: &CompletionRequest) -> Result<String> {
    let question = question_of(&request.prompt);
    Ok(match request.kind {
        CallKind::Classification => "MULTI_HOP".to_string(),
        CallKind::Decomposition => {
            let topic = question.trim_end_matches('?');
            serde_json::to_string(&vec![question.clone(), format!("What is known about {}?", topic)])?
        }
        _ if mentions_absent_topic(&question) => format!("{} [1]", REFUSAL_TEXT),
        _ => "Curie studied radioactivity [1], isolated radium [2] and discovered polonium [3].".to_string(),
    })
}

fn engine_with(config: &AppConfig, store: Arc<dyn GraphStore>, llm: Arc<ScriptedLlm>) -> AnswerEngine {
    AnswerEngine::from_config(config, store, llm, None, OutboundGuard::unlimited())
}

fn curie_engine(llm: Arc<ScriptedLlm>) -> AnswerEngine {
    engine_with(&AppConfig::default(), Arc::new(curie_graph()), llm)
}

// =============================================================================
// Denoising through a full request
// =============================================================================

#[tokio::test]
async fn test_duplicate_heavy_pool_collapses_to_distinct_evidence() {
    let llm = Arc::new(ScriptedLlm::new(|_| {
        Ok("See [1] [2] [3] [4] [5] [6] [7] [8] [9] [10] and [11].".to_string())
    }));
    let engine = curie_engine(llm);

    let result = tokio_test::assert_ok!(engine.answer(&SessionContext::new("scenario-a"), Query::new(QUERY)).await);

    assert_eq!(result.route_used, Route::EntityFocused);
    let stats = result.context_stats;
    assert_eq!(stats.raw, 40);
    assert_eq!(stats.duplicates_removed, 30);
    assert_eq!(stats.deduped, 10);
    assert_eq!(stats.penalized, 0);
    assert_eq!(stats.dropped, 0);
    assert_eq!(stats.final_count, 10);
    assert!(stats.final_tokens < AppConfig::default().denoise.token_budget / 4);

    assert_eq!(result.citations.len(), 10);
    assert_eq!(result.telemetry.stripped_citations, 1);
    assert!(!result.response_text.contains("[11]"));
}

#[tokio::test]
async fn test_duplicates_keep_the_best_scored_copy() {
    let retriever = GraphRetriever::new(
        Arc::new(curie_graph()),
        AppConfig::default().retrieval,
        DenoisePipeline::default(),
    );
    let outcome = retriever
        .retrieve(&RetrievalRequest::for_text(QUERY, RetrievalMode::Full))
        .await
        .unwrap();

    let node_scores: HashMap<Uuid, f32> = outcome.nodes.iter().map(|n| (n.entity.id, n.score)).collect();
    let chunks = outcome.evidence.chunks();
    assert_eq!(chunks.len(), PASSAGES.len());

    for chunk in chunks {
        let passage = PASSAGES.iter().position(|p| *p == chunk.text).unwrap();
        // Entities j with (j + k) % 10 == passage for some k in 0..4
        let best = (0..4)
            .map(|k| (passage + PASSAGES.len() - k) % PASSAGES.len())
            .map(|j| node_scores[&id(1 + j as u128)])
            .fold(f32::MIN, f32::max);
        assert_eq!(chunk.score, best);
        assert_eq!(node_scores[&linking_entity(chunk.id)], best);
    }
    assert!(chunks.windows(2).all(|w| w[0].score >= w[1].score));
}

#[tokio::test]
async fn test_budget_keeps_a_prefix_of_the_ranked_pool() {
    let unbounded = {
        let mut config = AppConfig::default().denoise;
        config.enable_budget_guard = false;
        GraphRetriever::new(Arc::new(curie_graph()), AppConfig::default().retrieval, DenoisePipeline::new(config))
    };
    let bounded = {
        let mut config = AppConfig::default().denoise;
        config.token_budget = 80;
        GraphRetriever::new(Arc::new(curie_graph()), AppConfig::default().retrieval, DenoisePipeline::new(config))
    };
    let request = RetrievalRequest::for_text(QUERY, RetrievalMode::Full);

    let full = unbounded.retrieve(&request).await.unwrap();
    let cut = bounded.retrieve(&request).await.unwrap();

    assert_eq!(full.evidence.token_budget(), None);
    assert_eq!(full.stats.dropped, 0);
    assert!(cut.stats.dropped > 0);
    assert!(cut.evidence.total_tokens() <= 80);
    assert!(!cut.evidence.is_empty());

    let kept = cut.evidence.chunk_ids();
    assert_eq!(kept, full.evidence.chunk_ids()[..kept.len()].to_vec());
    assert_eq!(kept.len() + cut.stats.dropped, full.evidence.len());
}

#[tokio::test]
async fn test_budget_drops_are_reported_on_the_answer() {
    let mut config = AppConfig::default();
    config.denoise.token_budget = 80;
    let llm = Arc::new(ScriptedLlm::new(faithful_model));
    let engine = engine_with(&config, Arc::new(curie_graph()), llm);

    let result = engine
        .answer(&SessionContext::new("budget"), Query::new(QUERY))
        .await
        .unwrap();

    assert!(result.context_stats.dropped > 0);
    assert!(result.context_stats.final_tokens <= 80);
    assert!(result.telemetry.evidence_tokens <= 80);
}

// =============================================================================
// Refusals
// =============================================================================

const NEGATIVE_QUESTIONS: [&str; 4] = [
    "Who was the first king of Atlantis?",
    "What is the melting point of Vibranium?",
    "When did Marie Curie walk on the Moon?",
    "Compare Atlantis and El Dorado",
];

#[tokio::test]
async fn test_negative_questions_refuse_on_every_route() {
    let llm = Arc::new(ScriptedLlm::new(faithful_model));
    let engine = curie_engine(llm);
    let routes = [None, Some(Route::FastLookup), Some(Route::EntityFocused), Some(Route::MultiHop)];

    for question in NEGATIVE_QUESTIONS {
        for route in routes {
            let mut query = Query::new(question);
            if let Some(route) = route {
                query = query.with_route(route);
            }

            let result = match engine.answer(&SessionContext::ephemeral(), query).await {
                Ok(result) => result,
                Err(failure) => panic!("{question} via {route:?} failed: {failure}"),
            };

            assert_eq!(result.answer_kind, AnswerKind::InsufficientEvidence, "{question} via {route:?}");
            assert_eq!(result.response_text, REFUSAL_TEXT, "{question} via {route:?}");
            assert!(result.citations.is_empty(), "{question} via {route:?}");
        }
    }
}

#[tokio::test]
async fn test_no_evidence_skips_the_model() {
    let llm = Arc::new(ScriptedLlm::new(faithful_model));
    let engine = curie_engine(llm.clone());

    let result = engine
        .answer(
            &SessionContext::new("empty"),
            Query::new("Who was the first king of Atlantis?").with_route(Route::FastLookup),
        )
        .await
        .unwrap();

    assert_eq!(result.answer_kind, AnswerKind::InsufficientEvidence);
    assert_eq!(result.context_stats.final_count, 0);
    assert_eq!(llm.calls(CallKind::Synthesis), 0);
}

// =============================================================================
// Determinism
// =============================================================================

#[tokio::test]
async fn test_repeated_requests_cite_the_same_chunks() {
    let mut config = AppConfig::default();
    config.retrieval.semantic_weight = 0.3;
    let store: Arc<dyn GraphStore> = Arc::new(curie_graph());

    for route in [Route::EntityFocused, Route::MultiHop] {
        let mut runs = Vec::new();
        for _ in 0..3 {
            let embedder: Arc<dyn Embedder> = Arc::new(HashingEmbedder::new(64));
            let engine = AnswerEngine::from_config(
                &config,
                store.clone(),
                Arc::new(ScriptedLlm::new(faithful_model)),
                Some(embedder),
                OutboundGuard::unlimited(),
            );
            let result = engine
                .answer(&SessionContext::ephemeral(), Query::new(QUERY).with_route(route))
                .await
                .unwrap();
            let cited: Vec<Uuid> = result.citations.iter().map(|c| c.chunk_id).collect();
            runs.push((cited, result.context_stats));
        }

        assert_eq!(runs[0].0.len(), 3, "{route:?}");
        assert!(runs.iter().all(|run| *run == runs[0]), "{route:?}");
    }
}

// =============================================================================
// Partial fan-out failure
// =============================================================================

/// Graph whose name lookups fail for anything mentioning Atlantis
struct Outage {
    inner: InMemoryGraph,
}

#[async_trait]
impl GraphStore for Outage {
    async fn find_entities_by_name(&self, names: &[String]) -> Result<Vec<Entity>> {
        if names.iter().any(|n| n.contains("atlantis")) {
            return Err(AppError::GraphStore {
                message: "partition unavailable".to_string(),
            });
        }
        self.inner.find_entities_by_name(names).await
    }

    async fn get_entities(&self, ids: &[Uuid]) -> Result<Vec<Entity>> {
        self.inner.get_entities(ids).await
    }

    async fn neighbors(&self, frontier: &[Uuid], kinds: &[EdgeKind]) -> Result<Vec<GraphEdge>> {
        self.inner.neighbors(frontier, kinds).await
    }

    async fn text_units(&self, entity_ids: &[Uuid]) -> Result<Vec<TextUnit>> {
        self.inner.text_units(entity_ids).await
    }

    fn name(&self) -> &str {
        "outage"
    }
}

fn outage_model(request: &CompletionRequest) -> Result<String> {
    Ok(match request.kind {
        CallKind::Decomposition if request.prompt.contains("Radium") => {
            r#"["Who discovered Radium?", "Who ruled Atlantis?"]"#.to_string()
        }
        CallKind::Decomposition => r#"["Who ruled Atlantis?", "Where was Atlantis?"]"#.to_string(),
        _ => "Radium was isolated by the Curies [1].".to_string(),
    })
}

fn outage_engine() -> AnswerEngine {
    engine_with(
        &AppConfig::default(),
        Arc::new(Outage { inner: curie_graph() }),
        Arc::new(ScriptedLlm::new(outage_model)),
    )
}

#[tokio::test]
async fn test_answer_survives_failed_sub_questions() {
    let result = outage_engine()
        .answer(
            &SessionContext::new("k-of-n"),
            Query::new("Who discovered Radium, and who ruled Atlantis?").with_route(Route::MultiHop),
        )
        .await
        .unwrap();

    assert_eq!(result.sub_questions.len(), 2);
    let (ok, failed): (Vec<_>, Vec<_>) = result.sub_questions.iter().partition(|q| q.succeeded);
    assert_eq!(ok.len(), 1);
    assert_eq!(failed.len(), 1);
    assert_eq!(failed[0].text, "Who ruled Atlantis?");
    assert_eq!(failed[0].error, Some(ErrorCode::GraphStoreError));
    assert!(ok[0].discovered_entity_ids.contains(&id(3)));

    assert_eq!(result.answer_kind, AnswerKind::Answered);
    assert!(!result.citations.is_empty());
}

#[tokio::test]
async fn test_all_sub_questions_failing_fails_the_request() {
    let failure = outage_engine()
        .answer(
            &SessionContext::new("k-zero"),
            Query::new("Who ruled Atlantis?").with_route(Route::MultiHop),
        )
        .await
        .unwrap_err();

    assert_eq!(failure.code(), ErrorCode::DecompositionFailed);
    assert_eq!(failure.correlation_id.get_version_num(), 7);
    assert!(matches!(failure.error, AppError::DecompositionFailed { attempted: 2 }));
}

// =============================================================================
// Graph timeouts
// =============================================================================

/// Graph whose id lookups hang past the graph timeout
struct SlowAttributes {
    inner: InMemoryGraph,
}

#[async_trait]
impl GraphStore for SlowAttributes {
    async fn find_entities_by_name(&self, names: &[String]) -> Result<Vec<Entity>> {
        self.inner.find_entities_by_name(names).await
    }

    async fn get_entities(&self, _ids: &[Uuid]) -> Result<Vec<Entity>> {
        tokio::time::sleep(std::time::Duration::from_secs(5)).await;
        Ok(Vec::new())
    }

    async fn neighbors(&self, frontier: &[Uuid], kinds: &[EdgeKind]) -> Result<Vec<GraphEdge>> {
        self.inner.neighbors(frontier, kinds).await
    }

    async fn text_units(&self, entity_ids: &[Uuid]) -> Result<Vec<TextUnit>> {
        self.inner.text_units(entity_ids).await
    }

    fn name(&self) -> &str {
        "slow-attributes"
    }
}

#[tokio::test]
async fn test_consolidated_timeout_refuses_instead_of_failing() {
    let mut config = AppConfig::default();
    config.retrieval.graph_timeout_ms = 20;
    let llm = Arc::new(ScriptedLlm::new(faithful_model));
    let engine = engine_with(&config, Arc::new(SlowAttributes { inner: curie_graph() }), llm.clone());

    let result = tokio_test::assert_ok!(
        engine
            .answer(&SessionContext::new("slow"), Query::new(QUERY).with_route(Route::MultiHop))
            .await
    );

    assert_eq!(result.sub_questions.len(), 2);
    assert!(result.sub_questions.iter().all(|q| q.succeeded));
    assert_eq!(result.answer_kind, AnswerKind::InsufficientEvidence);
    assert_eq!(result.response_text, REFUSAL_TEXT);
    assert!(result.citations.is_empty());
    assert!(result
        .gaps
        .iter()
        .any(|gap| gap.stage == "seeds" && gap.code == ErrorCode::RetrievalTimeout));
    assert_eq!(llm.calls(CallKind::Synthesis), 0);
}
