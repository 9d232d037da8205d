//! Multi-Hop Decomposition Workflow
//!
//! Splits an ambiguous query into focused sub-questions, retrieves evidence
//! for each one concurrently, waits for every task to settle, then runs a
//! consolidated traversal seeded with the union of what the successful
//! sub-questions discovered.

use graphforge_common::config::{CallPolicy, WorkflowConfig};
use graphforge_common::errors::{AppError, ErrorCode, Result};
use graphforge_common::llm::{CompletionRequest, GuardedLlm};
use graphforge_common::metrics;
use graphforge_common::models::EvidenceSet;
use graphforge_common::resilience::CallKind;
use graphforge_common::text;
use graphforge_search::{GraphRetriever, RetrievalGap, RetrievalMode, RetrievalOutcome, RetrievalRequest};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashSet};
use std::sync::Arc;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::instrument;
use uuid::Uuid;

const DECOMPOSER_SYSTEM: &str = "Break the user's question into short, self-contained \
sub-questions that can each be answered from a document collection. Name entities \
explicitly in every sub-question. Reply with a JSON array of strings only.";

/// One sub-question and what its retrieval produced
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubQuestion {
    /// Position in the decomposition order
    pub index: usize,
    pub text: String,
    pub discovered_entity_ids: Vec<Uuid>,
    #[serde(skip)]
    pub partial_evidence: EvidenceSet,
    pub evidence_count: usize,
    pub succeeded: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorCode>,
    #[serde(skip_serializing_if = "Vec::is_empty", default)]
    pub gaps: Vec<RetrievalGap>,
}

impl SubQuestion {
    /// Positions (1-based) of the `evidence` passages this sub-question
    /// also retrieved, matched by content hash
    pub fn supporting_passages(&self, evidence: &EvidenceSet) -> Vec<usize> {
        let retrieved: HashSet<&str> = self
            .partial_evidence
            .chunks()
            .iter()
            .map(|chunk| chunk.content_hash.as_str())
            .collect();
        evidence
            .chunks()
            .iter()
            .enumerate()
            .filter(|(_, chunk)| retrieved.contains(chunk.content_hash.as_str()))
            .map(|(i, _)| i + 1)
            .collect()
    }

    /// A pass whose seed lookup timed out fails its sub-question only
    fn settle(index: usize, text: String, result: Result<RetrievalOutcome>) -> Self {
        match result {
            Ok(outcome) if outcome.seeds.is_empty() && outcome.gaps.iter().any(|g| g.stage == "seeds") => {
                tracing::warn!(index, "Sub-question seed lookup timed out");
                Self::failed(index, text, ErrorCode::RetrievalTimeout)
            }
            Ok(outcome) => Self {
                index,
                text,
                discovered_entity_ids: outcome.discovered_entity_ids(),
                evidence_count: outcome.evidence.len(),
                partial_evidence: outcome.evidence,
                succeeded: true,
                error: None,
                gaps: outcome.gaps,
            },
            Err(e) => {
                tracing::warn!(index, error = %e, code = ?e.code(), "Sub-question retrieval failed");
                Self::failed(index, text, e.code())
            }
        }
    }

    fn failed(index: usize, text: String, code: ErrorCode) -> Self {
        Self {
            index,
            text,
            discovered_entity_ids: Vec::new(),
            partial_evidence: EvidenceSet::empty(),
            evidence_count: 0,
            succeeded: false,
            error: Some(code),
            gaps: Vec::new(),
        }
    }
}

/// Parse the decomposer's reply: a JSON array, else question lines of a
/// list. Duplicates are dropped and the result is capped at `max`.
pub fn parse_sub_questions(output: &str, max: usize) -> Vec<String> {
    let candidates = json_array(output).unwrap_or_else(|| question_lines(output));

    let mut seen = HashSet::new();
    candidates
        .into_iter()
        .map(|q| q.trim().to_string())
        .filter(|q| !q.is_empty())
        .filter(|q| seen.insert(text::normalize_text(q)))
        .take(max)
        .collect()
}

fn json_array(output: &str) -> Option<Vec<String>> {
    let start = output.find('[')?;
    let end = output.rfind(']')?;
    if end <= start {
        return None;
    }
    serde_json::from_str(&output[start..=end]).ok()
}

fn question_lines(output: &str) -> Vec<String> {
    output
        .lines()
        .map(|line| {
            line.trim()
                .trim_start_matches(|c: char| c.is_ascii_digit())
                .trim_start_matches(['.', ')', '-', '*', '•'])
                .trim()
                .to_string()
        })
        .filter(|line| line.ends_with('?'))
        .collect()
}

/// Query decomposition through the LLM
pub struct Decomposer {
    llm: GuardedLlm,
    policy: CallPolicy,
    max_sub_questions: usize,
}

impl Decomposer {
    pub fn new(llm: GuardedLlm, policy: CallPolicy, max_sub_questions: usize) -> Self {
        Self {
            llm,
            policy,
            max_sub_questions: max_sub_questions.max(1),
        }
    }

    /// Ordered sub-questions. Falls back to the query itself when the call
    /// fails or yields nothing usable.
    #[instrument(skip_all)]
    pub async fn decompose(&self, query_text: &str) -> Vec<String> {
        let original = vec![query_text.trim().to_string()];
        let request = CompletionRequest::new(
            CallKind::Decomposition,
            DECOMPOSER_SYSTEM,
            format!(
                "Question: {}\nReturn at most {} sub-questions.",
                query_text.trim(),
                self.max_sub_questions
            ),
            self.policy.max_tokens,
        );

        match self.llm.complete(&self.policy, request).await {
            Ok(completion) => {
                let questions = parse_sub_questions(&completion.text, self.max_sub_questions);
                if questions.is_empty() {
                    tracing::warn!(
                        output = %text::preview(&completion.text, 80),
                        "Decomposition produced no sub-questions, using the query"
                    );
                    return original;
                }
                tracing::debug!(count = questions.len(), "Query decomposed");
                questions
            }
            Err(e) => {
                tracing::warn!(error = %e, code = ?e.code(), "Decomposition call failed, using the query");
                original
            }
        }
    }
}

/// Every sub-question after the barrier, in decomposition order
#[derive(Debug, Clone)]
pub struct FanIn {
    pub sub_questions: Vec<SubQuestion>,
    /// The global deadline fired and unfinished tasks were cancelled
    pub timed_out: bool,
}

impl FanIn {
    pub fn succeeded(&self) -> usize {
        self.sub_questions.iter().filter(|q| q.succeeded).count()
    }

    /// Sorted union of entities discovered by successful sub-questions
    pub fn union_seeds(&self) -> Vec<Uuid> {
        self.sub_questions
            .iter()
            .filter(|q| q.succeeded)
            .flat_map(|q| q.discovered_entity_ids.iter().copied())
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect()
    }
}

/// Result of a whole multi-hop run
#[derive(Debug, Clone)]
pub struct WorkflowOutcome {
    pub sub_questions: Vec<SubQuestion>,
    pub union_seeds: Vec<Uuid>,
    pub consolidated: RetrievalOutcome,
    pub timed_out: bool,
}

/// Decompose, fan out, fan in, consolidate
pub struct MultiHopWorkflow {
    retriever: Arc<GraphRetriever>,
    decomposer: Decomposer,
    config: WorkflowConfig,
}

impl MultiHopWorkflow {
    pub fn new(retriever: Arc<GraphRetriever>, decomposer: Decomposer, config: WorkflowConfig) -> Self {
        Self {
            retriever,
            decomposer,
            config,
        }
    }

    /// Decompose, fan out and consolidate in one call
    #[instrument(skip_all)]
    pub async fn run(&self, query_text: &str) -> Result<WorkflowOutcome> {
        let questions = self.decompose(query_text).await;
        let fan_in = self.fan_out(questions).await;
        self.consolidate(query_text, fan_in).await
    }

    pub async fn decompose(&self, query_text: &str) -> Vec<String> {
        self.decomposer.decompose(query_text).await
    }

    /// Full traversal over the union of successful seed sets. Fails with
    /// `DecompositionFailed` only when no sub-question succeeded.
    pub async fn consolidate(&self, query_text: &str, fan_in: FanIn) -> Result<WorkflowOutcome> {
        let attempted = fan_in.sub_questions.len();
        let succeeded = fan_in.succeeded();
        if succeeded == 0 {
            tracing::error!(attempted, timed_out = fan_in.timed_out, "Every sub-question failed");
            return Err(AppError::DecompositionFailed { attempted });
        }

        let union_seeds = fan_in.union_seeds();
        let consolidated = if union_seeds.is_empty() {
            RetrievalOutcome::empty(RetrievalMode::Full, Vec::new())
        } else {
            let request = RetrievalRequest::for_entities(query_text, union_seeds.clone(), RetrievalMode::Full);
            self.retriever.retrieve(&request).await?
        };

        tracing::info!(
            attempted,
            succeeded,
            union = union_seeds.len(),
            evidence = consolidated.evidence.len(),
            gaps = consolidated.gaps.len(),
            "Multi-hop consolidation complete"
        );

        Ok(WorkflowOutcome {
            sub_questions: fan_in.sub_questions,
            union_seeds,
            consolidated,
            timed_out: fan_in.timed_out,
        })
    }

    /// Retrieve every sub-question with at most `max_concurrency` in flight.
    ///
    /// Returns only after all tasks settled. A failing task never cancels
    /// its siblings; the global deadline cancels all unfinished ones.
    pub async fn fan_out(&self, questions: Vec<String>) -> FanIn {
        let semaphore = Arc::new(Semaphore::new(self.config.max_concurrency.max(1)));
        let mut tasks = JoinSet::new();

        for (index, text) in questions.iter().cloned().enumerate() {
            let retriever = Arc::clone(&self.retriever);
            let semaphore = Arc::clone(&semaphore);
            tasks.spawn(async move {
                let _permit = semaphore.acquire_owned().await.ok();
                let request = RetrievalRequest::for_text(text.clone(), RetrievalMode::Full);
                let result = retriever.retrieve(&request).await;
                SubQuestion::settle(index, text, result)
            });
        }

        let mut settled: Vec<Option<SubQuestion>> = vec![None; questions.len()];
        let deadline = tokio::time::sleep(self.config.global_timeout());
        tokio::pin!(deadline);
        let mut timed_out = false;

        loop {
            tokio::select! {
                joined = tasks.join_next() => match joined {
                    Some(Ok(sub_question)) => {
                        let index = sub_question.index;
                        settled[index] = Some(sub_question);
                    }
                    Some(Err(e)) if e.is_cancelled() => {}
                    Some(Err(e)) => tracing::error!(error = %e, "Sub-question task panicked"),
                    None => break,
                },
                _ = &mut deadline, if !timed_out => {
                    timed_out = true;
                    tracing::warn!(
                        timeout_ms = self.config.global_timeout_ms,
                        pending = tasks.len(),
                        "Fan-out deadline reached, cancelling pending sub-questions"
                    );
                    tasks.abort_all();
                }
            }
        }

        let unsettled_code = if timed_out {
            ErrorCode::RetrievalTimeout
        } else {
            ErrorCode::InternalError
        };
        let sub_questions: Vec<SubQuestion> = settled
            .into_iter()
            .zip(questions)
            .enumerate()
            .map(|(index, (slot, text))| slot.unwrap_or_else(|| SubQuestion::failed(index, text, unsettled_code)))
            .collect();

        for sub_question in &sub_questions {
            metrics::record_sub_question(sub_question.succeeded);
        }

        FanIn {
            sub_questions,
            timed_out,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use graphforge_common::config::RetrievalConfig;
    use graphforge_common::denoise::DenoisePipeline;
    use graphforge_common::graph::{GraphStore, InMemoryGraph};
    use graphforge_common::llm::ScriptedLlm;
    use graphforge_common::models::{Chunk, EdgeKind, Entity, EvidencePayload, GraphEdge, TextUnit};
    use graphforge_common::resilience::OutboundGuard;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    fn id(n: u128) -> Uuid {
        Uuid::from_u128(n)
    }

    fn graph() -> InMemoryGraph {
        let mut b = InMemoryGraph::builder();
        let curie = b.add_entity(Entity::new(id(1), "Marie Curie", "person").with_importance(0.9));
        let radium = b.add_entity(Entity::new(id(2), "Radium", "element").with_importance(0.4));
        let nobel = b.add_entity(Entity::new(id(3), "Nobel Prize", "award").with_importance(0.7));
        b.add_edge(curie, radium, EdgeKind::Semantic, 1.0).unwrap();
        for (n, entity, text) in [
            (1u128, curie, "Marie Curie was a physicist and chemist who conducted pioneering research on radioactivity."),
            (2, radium, "Radium was discovered by Marie and Pierre Curie in 1898 while studying pitchblende ore."),
            (3, nobel, "The Nobel Prize is awarded annually for outstanding contributions to physics and chemistry."),
        ] {
            b.link(entity, EvidencePayload::Chunk(Chunk::new(id(100 + n), id(900), "Notes", text)))
                .unwrap();
        }
        b.build()
    }

    /// Name lookups mentioning "atlantis" fail; all lookups are counted
    struct Flaky {
        inner: InMemoryGraph,
        delay: Duration,
        in_flight: AtomicUsize,
        peak: AtomicUsize,
    }

    impl Flaky {
        fn new(delay: Duration) -> Self {
            Self {
                inner: graph(),
                delay,
                in_flight: AtomicUsize::new(0),
                peak: AtomicUsize::new(0),
            }
        }
    }

    #[async_trait]
    impl GraphStore for Flaky {
        async fn find_entities_by_name(&self, names: &[String]) -> Result<Vec<Entity>> {
            let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);
            tokio::time::sleep(self.delay).await;
            self.in_flight.fetch_sub(1, Ordering::SeqCst);

            if names.iter().any(|n| n.contains("atlantis")) {
                return Err(AppError::GraphStore {
                    message: "index shard offline".to_string(),
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
            "flaky"
        }
    }

    fn workflow(store: Arc<dyn GraphStore>, reply: &'static str, config: WorkflowConfig) -> MultiHopWorkflow {
        let retriever = Arc::new(GraphRetriever::new(store, RetrievalConfig::default(), DenoisePipeline::default()));
        let llm = GuardedLlm::new(
            Arc::new(ScriptedLlm::new(move |_| Ok(reply.to_string()))),
            OutboundGuard::unlimited(),
        );
        let decomposer = Decomposer::new(llm, CallPolicy::new(1_000, 0, 512), config.max_sub_questions);
        MultiHopWorkflow::new(retriever, decomposer, config)
    }

    #[test]
    fn test_parse_json_array() {
        let output = "```json\n[\"Who is Marie Curie?\", \"What is Radium?\", \"who is  marie curie?\"]\n```";
        assert_eq!(
            parse_sub_questions(output, 5),
            vec!["Who is Marie Curie?".to_string(), "What is Radium?".to_string()]
        );
    }

    #[test]
    fn test_parse_numbered_list_and_cap() {
        let output = "Here are the sub-questions:\n1. Who discovered Radium?\n2) What did Marie Curie win?\n- Where was she born?";
        assert_eq!(
            parse_sub_questions(output, 2),
            vec!["Who discovered Radium?".to_string(), "What did Marie Curie win?".to_string()]
        );
        assert!(parse_sub_questions("no questions here", 5).is_empty());
    }

    #[tokio::test]
    async fn test_decomposer_falls_back_to_query() {
        let llm = GuardedLlm::new(
            Arc::new(ScriptedLlm::new(|_| {
                Err(AppError::Upstream {
                    status: 400,
                    message: "bad".to_string(),
                })
            })),
            OutboundGuard::unlimited(),
        );
        let decomposer = Decomposer::new(llm, CallPolicy::new(1_000, 0, 512), 5);

        assert_eq!(decomposer.decompose(" How did Radium matter? ").await, vec!["How did Radium matter?"]);
    }

    #[tokio::test]
    async fn test_union_covers_only_successful_sub_questions() {
        let store = Arc::new(Flaky::new(Duration::from_millis(1)));
        let flow = workflow(
            store,
            r#"["What did Marie Curie study?", "Who ruled Atlantis?", "What is the Nobel Prize?"]"#,
            WorkflowConfig::default(),
        );

        let outcome = flow.run("How are Marie Curie, Atlantis and the Nobel Prize connected?").await.unwrap();

        assert_eq!(outcome.sub_questions.len(), 3);
        assert!(outcome.sub_questions[0].succeeded);
        assert!(!outcome.sub_questions[1].succeeded);
        assert_eq!(outcome.sub_questions[1].error, Some(ErrorCode::GraphStoreError));
        assert!(outcome.sub_questions[2].succeeded);

        let expected: BTreeSet<Uuid> = [&outcome.sub_questions[0], &outcome.sub_questions[2]]
            .iter()
            .flat_map(|q| q.discovered_entity_ids.iter().copied())
            .collect();
        assert_eq!(outcome.union_seeds, expected.into_iter().collect::<Vec<_>>());

        let consolidated: BTreeSet<Uuid> = outcome.consolidated.seeds.iter().map(|e| e.id).collect();
        assert_eq!(consolidated, outcome.union_seeds.iter().copied().collect());
    }

    #[test]
    fn test_seed_timeout_fails_only_its_sub_question() {
        let mut timed_out = RetrievalOutcome::empty(RetrievalMode::Full, Vec::new());
        timed_out.gaps.push(RetrievalGap {
            stage: "seeds".to_string(),
            code: ErrorCode::RetrievalTimeout,
        });
        let settled = SubQuestion::settle(1, "Who ruled Atlantis?".to_string(), Ok(timed_out));
        assert!(!settled.succeeded);
        assert_eq!(settled.error, Some(ErrorCode::RetrievalTimeout));

        // No seeds without a gap is an ordinary empty success
        let empty = RetrievalOutcome::empty(RetrievalMode::Full, Vec::new());
        let settled = SubQuestion::settle(0, "Who is Marie Curie?".to_string(), Ok(empty));
        assert!(settled.succeeded);
        assert_eq!(settled.evidence_count, 0);
    }

    #[tokio::test]
    async fn test_zero_successes_is_a_typed_failure() {
        let flow = workflow(
            Arc::new(Flaky::new(Duration::from_millis(1))),
            r#"["Who ruled Atlantis?", "Where is Atlantis?"]"#,
            WorkflowConfig::default(),
        );

        let result = flow.run("Tell me about Atlantis").await;
        assert!(matches!(result, Err(AppError::DecompositionFailed { attempted: 2 })));
    }

    #[tokio::test]
    async fn test_worker_limit_bounds_concurrency() {
        let store = Arc::new(Flaky::new(Duration::from_millis(20)));
        let config = WorkflowConfig {
            max_concurrency: 2,
            ..WorkflowConfig::default()
        };
        let flow = workflow(store.clone(), "[]", config);
        let questions: Vec<String> = (0..6).map(|i| format!("What is Radium fact {}?", i)).collect();

        let fan_in = flow.fan_out(questions).await;

        assert_eq!(fan_in.succeeded(), 6);
        assert!(store.peak.load(Ordering::SeqCst) <= 2);
        let order: Vec<usize> = fan_in.sub_questions.iter().map(|q| q.index).collect();
        assert_eq!(order, vec![0, 1, 2, 3, 4, 5]);
    }

    #[tokio::test]
    async fn test_global_deadline_cancels_pending_tasks() {
        let store = Arc::new(Flaky::new(Duration::from_secs(3)));
        let config = WorkflowConfig {
            global_timeout_ms: 50,
            ..WorkflowConfig::default()
        };
        let flow = workflow(store, "[]", config);

        let fan_in = flow
            .fan_out(vec!["What is Radium?".to_string(), "Who is Marie Curie?".to_string()])
            .await;

        assert!(fan_in.timed_out);
        assert_eq!(fan_in.succeeded(), 0);
        assert!(fan_in
            .sub_questions
            .iter()
            .all(|q| q.error == Some(ErrorCode::RetrievalTimeout)));
    }
}
