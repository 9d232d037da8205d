//! Synthesis & Citation Engine
//!
//! Turns a final evidence set into an answer with bracketed citations:
//! - evidence is numbered `[1]..[n]` in the prompt, in evidence order
//! - markers outside `1..=n` are stripped from the text and counted
//! - an answer stating absence of information carries zero citations
//! - empty evidence never reaches the model

use crate::decomposition::SubQuestion;
use graphforge_common::config::{CallPolicy, SynthesisConfig};
use graphforge_common::errors::{AppError, Result};
use graphforge_common::llm::{CompletionRequest, GuardedLlm};
use graphforge_common::metrics::{self, StageTimer};
use graphforge_common::models::{Chunk, EvidenceSet, Query, Verbosity};
use graphforge_common::resilience::CallKind;
use graphforge_common::text;
use regex_lite::{Captures, Regex};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt::Write;
use std::sync::OnceLock;
use tracing::instrument;
use uuid::Uuid;

/// Canonical answer when the evidence does not cover the question
pub const REFUSAL_TEXT: &str = "The provided documents do not contain information to answer this question.";

/// Phrasings of "not in the evidence" that count as a refusal when uncited
const ABSENCE_PHRASES: &[&str] = &[
    "do not contain information",
    "does not contain information",
    "do not contain any information",
    "does not mention",
    "do not mention",
    "not mentioned in the provided",
    "not found in the provided",
    "no information about",
    "cannot be answered from the provided",
    "insufficient evidence",
];

fn marker_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"\[(\d+(?:\s*,\s*\d+)*)\]").expect("valid citation pattern"))
}

fn loose_space_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"[ \t]+([.,;:!?])|([ \t]){2,}").expect("valid spacing pattern"))
}

/// Whether the response answered or declined
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AnswerKind {
    Answered,
    /// A successful response stating the evidence lacks the answer
    InsufficientEvidence,
}

impl AnswerKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            AnswerKind::Answered => "answered",
            AnswerKind::InsufficientEvidence => "insufficient_evidence",
        }
    }
}

/// Source backing one `[index]` marker
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Citation {
    /// 1-based position of the chunk in the synthesis prompt
    pub index: usize,
    pub chunk_id: Uuid,
    pub document_id: Uuid,
    pub document_title: String,
    pub score: f32,
    pub preview: String,
}

impl Citation {
    fn from_chunk(index: usize, chunk: &Chunk, preview_chars: usize) -> Self {
        Self {
            index,
            chunk_id: chunk.id,
            document_id: chunk.document_id,
            document_title: chunk.document_title.clone(),
            score: chunk.score,
            preview: text::preview(&chunk.text, preview_chars),
        }
    }
}

/// Token and latency counts of one synthesis
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SynthesisTelemetry {
    pub model: String,
    pub evidence_chunks: usize,
    pub evidence_tokens: usize,
    pub prompt_tokens: usize,
    pub completion_tokens: usize,
    pub max_tokens: usize,
    /// Markers removed because they named no included chunk
    pub stripped_citations: usize,
    pub latency_ms: u64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SynthesisOutput {
    pub text: String,
    pub citations: Vec<Citation>,
    pub answer_kind: AnswerKind,
    pub telemetry: SynthesisTelemetry,
}

/// Citations resolved against the evidence
#[derive(Debug, Clone, PartialEq)]
pub struct ResolvedCitations {
    pub text: String,
    pub citations: Vec<Citation>,
    pub stripped: usize,
}

/// Keep markers that name an included chunk, drop the rest.
///
/// `[2, 9]` with three chunks becomes `[2]`; `[9]` disappears. Citations
/// come back ordered by index, one per distinct chunk.
pub fn resolve_citations(raw: &str, evidence: &EvidenceSet, preview_chars: usize) -> ResolvedCitations {
    let chunks = evidence.chunks();
    let mut cited = BTreeSet::new();
    let mut stripped = 0usize;

    let rewritten = marker_pattern().replace_all(raw, |caps: &Captures| {
        let mut kept: Vec<usize> = Vec::new();
        for part in caps[1].split(',') {
            match part.trim().parse::<usize>() {
                Ok(n) if (1..=chunks.len()).contains(&n) => {
                    if !kept.contains(&n) {
                        kept.push(n);
                    }
                    cited.insert(n);
                }
                _ => stripped += 1,
            }
        }
        if kept.is_empty() {
            String::new()
        } else {
            let joined: Vec<String> = kept.iter().map(|n| n.to_string()).collect();
            format!("[{}]", joined.join(", "))
        }
    });

    let text = if stripped > 0 {
        loose_space_pattern()
            .replace_all(&rewritten, |caps: &Captures| match caps.get(1) {
                Some(punct) => punct.as_str().to_string(),
                None => " ".to_string(),
            })
            .trim()
            .to_string()
    } else {
        rewritten.trim().to_string()
    };

    let citations = cited
        .into_iter()
        .map(|n| Citation::from_chunk(n, &chunks[n - 1], preview_chars))
        .collect();

    ResolvedCitations {
        text,
        citations,
        stripped,
    }
}

/// Whether `answer` declines to answer. Uncited absence phrasing counts;
/// a cited answer mentioning a gap in passing does not.
pub fn is_refusal(answer: &str, cited: usize) -> bool {
    let normalized = text::normalize_text(answer);
    let refusal = text::normalize_text(REFUSAL_TEXT);
    if normalized.starts_with(refusal.trim_end_matches('.')) {
        return true;
    }
    cited == 0 && ABSENCE_PHRASES.iter().any(|p| normalized.contains(p))
}

fn style_instruction(verbosity: Verbosity) -> &'static str {
    match verbosity {
        Verbosity::Concise => "Answer in one or two sentences.",
        Verbosity::Standard => "Answer in a short, focused paragraph.",
        Verbosity::Detailed => "Give a thorough, well-structured answer covering every relevant passage.",
    }
}

fn system_prompt(verbosity: Verbosity) -> String {
    format!(
        "You answer questions using only the numbered evidence passages you are given.\n\
         1. Use only facts stated in the evidence. Never add outside knowledge.\n\
         2. After every factual claim cite its passage as [n], or [n, m] for several.\n\
         3. If the evidence does not answer the question, reply exactly: {}\n\
         4. Never substitute related but different information for a missing answer.\n\
         {}",
        REFUSAL_TEXT,
        style_instruction(verbosity)
    )
}

fn build_prompt(query: &Query, evidence: &EvidenceSet, sub_questions: &[SubQuestion]) -> String {
    let mut prompt = String::from("Evidence:\n");
    for (i, chunk) in evidence.chunks().iter().enumerate() {
        let _ = write!(prompt, "[{}] {}", i + 1, chunk.document_title);
        if let Some(pages) = chunk.pages {
            let _ = write!(prompt, ", pp. {}-{}", pages.start, pages.end);
        }
        if let Some(section) = &chunk.section {
            let _ = write!(prompt, ", {}", section);
        }
        let _ = write!(prompt, "\n{}\n\n", chunk.text.trim());
    }

    if !sub_questions.is_empty() {
        prompt.push_str("Sub-questions explored:\n");
        for sub_question in sub_questions {
            let passages = sub_question.supporting_passages(evidence);
            let status = match (sub_question.succeeded, sub_question.evidence_count) {
                (false, _) => " (retrieval failed)".to_string(),
                (true, 0) => " (no evidence found)".to_string(),
                _ if passages.is_empty() => String::new(),
                _ => {
                    let markers: Vec<String> = passages.iter().map(|n| format!("[{}]", n)).collect();
                    format!(" (see {})", markers.join(", "))
                }
            };
            let _ = writeln!(prompt, "- {}{}", sub_question.text, status);
        }
        prompt.push('\n');
    }

    let _ = write!(prompt, "Question: {}\nAnswer:", query.text.trim());
    prompt
}

/// Answer generation over a final evidence set
pub struct Synthesizer {
    llm: GuardedLlm,
    policy: CallPolicy,
    config: SynthesisConfig,
}

impl Synthesizer {
    pub fn new(llm: GuardedLlm, policy: CallPolicy, config: SynthesisConfig) -> Self {
        Self { llm, policy, config }
    }

    pub fn max_tokens_for(&self, verbosity: Verbosity) -> usize {
        match verbosity {
            Verbosity::Concise => self.config.concise_max_tokens,
            Verbosity::Standard => self.config.standard_max_tokens,
            Verbosity::Detailed => self.config.detailed_max_tokens,
        }
    }

    #[instrument(skip_all, fields(evidence = evidence.len(), verbosity = ?query.verbosity))]
    pub async fn synthesize(
        &self,
        query: &Query,
        evidence: &EvidenceSet,
        sub_questions: &[SubQuestion],
    ) -> Result<SynthesisOutput> {
        let timer = StageTimer::start();
        let max_tokens = self.max_tokens_for(query.verbosity);
        let mut telemetry = SynthesisTelemetry {
            model: self.llm.model_name().to_string(),
            evidence_chunks: evidence.len(),
            evidence_tokens: evidence.total_tokens(),
            max_tokens,
            ..SynthesisTelemetry::default()
        };

        if evidence.is_empty() {
            tracing::info!("No evidence, answering with refusal");
            metrics::record_synthesis(timer.elapsed_secs(), AnswerKind::InsufficientEvidence.as_str(), 0);
            telemetry.latency_ms = timer.elapsed_ms();
            return Ok(SynthesisOutput {
                text: REFUSAL_TEXT.to_string(),
                citations: Vec::new(),
                answer_kind: AnswerKind::InsufficientEvidence,
                telemetry,
            });
        }

        let policy = CallPolicy {
            max_tokens,
            ..self.policy.clone()
        };
        let request = CompletionRequest::new(
            CallKind::Synthesis,
            system_prompt(query.verbosity),
            build_prompt(query, evidence, sub_questions),
            max_tokens,
        )
        .with_sampling(query.sampling.temperature, query.sampling.top_p);

        let completion = self.llm.complete(&policy, request).await.map_err(|e| {
            tracing::error!(error = %e, code = ?e.code(), "Synthesis call failed");
            if e.is_rate_limited() {
                e
            } else {
                AppError::SynthesisFailed {
                    message: e.to_string(),
                }
            }
        })?;

        let resolved = resolve_citations(&completion.text, evidence, self.config.preview_chars);
        let (text, citations, answer_kind) = if is_refusal(&resolved.text, resolved.citations.len()) {
            (REFUSAL_TEXT.to_string(), Vec::new(), AnswerKind::InsufficientEvidence)
        } else {
            (resolved.text, resolved.citations, AnswerKind::Answered)
        };

        telemetry.prompt_tokens = completion.prompt_tokens;
        telemetry.completion_tokens = completion.completion_tokens;
        telemetry.stripped_citations = resolved.stripped;
        telemetry.latency_ms = timer.elapsed_ms();
        metrics::record_synthesis(timer.elapsed_secs(), answer_kind.as_str(), resolved.stripped);

        if resolved.stripped > 0 {
            tracing::warn!(stripped = resolved.stripped, "Removed citations to evidence not in the prompt");
        }
        tracing::info!(
            answer_kind = answer_kind.as_str(),
            citations = citations.len(),
            prompt_tokens = telemetry.prompt_tokens,
            completion_tokens = telemetry.completion_tokens,
            latency_ms = telemetry.latency_ms,
            "Synthesis complete"
        );

        Ok(SynthesisOutput {
            text,
            citations,
            answer_kind,
            telemetry,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use graphforge_common::denoise::DenoisePipeline;
    use graphforge_common::llm::ScriptedLlm;
    use graphforge_common::resilience::OutboundGuard;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    fn evidence() -> EvidenceSet {
        let chunks = vec![
            Chunk::new(
                Uuid::from_u128(1),
                Uuid::from_u128(10),
                "Curie Biography",
                "Marie Curie was the first person to win two Nobel Prizes in different sciences.",
            )
            .with_score(0.9)
            .with_pages(3, 4),
            Chunk::new(
                Uuid::from_u128(2),
                Uuid::from_u128(11),
                "Radium Notes",
                "Radium was isolated as a pure metal by Marie Curie and André-Louis Debierne in 1910.",
            )
            .with_score(0.7),
        ];
        DenoisePipeline::default().run(chunks).evidence
    }

    fn fast_policy(retries: u32) -> CallPolicy {
        CallPolicy {
            timeout_ms: 1_000,
            max_retries: retries,
            max_rate_limit_retries: 1,
            initial_backoff_ms: 1,
            max_backoff_ms: 2,
            max_tokens: 900,
        }
    }

    fn synthesizer(scripted: Arc<ScriptedLlm>, retries: u32) -> Synthesizer {
        Synthesizer::new(
            GuardedLlm::new(scripted, OutboundGuard::unlimited()),
            fast_policy(retries),
            SynthesisConfig::default(),
        )
    }

    #[test]
    fn test_out_of_range_markers_are_stripped() {
        let resolved = resolve_citations(
            "Curie won two prizes [1]. Radium was isolated in 1910 [2, 7]. She also sailed [9] .",
            &evidence(),
            40,
        );

        assert_eq!(resolved.stripped, 2);
        assert_eq!(
            resolved.text,
            "Curie won two prizes [1]. Radium was isolated in 1910 [2]. She also sailed."
        );
        let indices: Vec<usize> = resolved.citations.iter().map(|c| c.index).collect();
        assert_eq!(indices, vec![1, 2]);
        assert_eq!(resolved.citations[1].chunk_id, Uuid::from_u128(2));
    }

    #[test]
    fn test_refusal_detection() {
        assert!(is_refusal(REFUSAL_TEXT, 0));
        assert!(is_refusal("the provided documents do not contain information to answer this question", 2));
        assert!(is_refusal("The passages do not mention her birthplace.", 0));
        assert!(!is_refusal("She won in 1911 [1]; the passages do not mention the ceremony.", 1));
        assert!(!is_refusal("Radium was isolated in 1910 [2].", 1));
    }

    #[tokio::test]
    async fn test_empty_evidence_skips_the_model() {
        let scripted = Arc::new(ScriptedLlm::new(|_| Ok("anything".to_string())));
        let output = synthesizer(scripted.clone(), 1)
            .synthesize(&Query::new("Who was Curie's tutor?"), &EvidenceSet::empty(), &[])
            .await
            .unwrap();

        assert_eq!(output.text, REFUSAL_TEXT);
        assert!(output.citations.is_empty());
        assert_eq!(output.answer_kind, AnswerKind::InsufficientEvidence);
        assert_eq!(scripted.calls(CallKind::Synthesis), 0);
    }

    #[tokio::test]
    async fn test_refusal_carries_no_citations() {
        let scripted = Arc::new(ScriptedLlm::new(|_| Ok(format!("{} [1]", REFUSAL_TEXT))));
        let output = synthesizer(scripted, 1)
            .synthesize(&Query::new("Where was Curie's tutor born?"), &evidence(), &[])
            .await
            .unwrap();

        assert_eq!(output.answer_kind, AnswerKind::InsufficientEvidence);
        assert_eq!(output.text, REFUSAL_TEXT);
        assert!(output.citations.is_empty());
    }

    #[tokio::test]
    async fn test_prompt_and_token_limit_follow_query() {
        let scripted = Arc::new(ScriptedLlm::new(|_| Ok("Two Nobel Prizes [1].".to_string())));
        let query = Query::new("What did Curie win?").with_verbosity(Verbosity::Detailed);

        let output = synthesizer(scripted.clone(), 1)
            .synthesize(&query, &evidence(), &[])
            .await
            .unwrap();

        assert_eq!(output.answer_kind, AnswerKind::Answered);
        assert_eq!(output.citations.len(), 1);
        let request = &scripted.requests()[0];
        assert_eq!(request.max_tokens, 1600);
        assert_eq!(request.temperature, 0.2);
        assert!(request.prompt.contains("[1] Curie Biography, pp. 3-4"));
        assert!(request.prompt.contains("[2] Radium Notes"));
        assert!(request.system.contains(REFUSAL_TEXT));
    }

    #[tokio::test]
    async fn test_prompt_points_sub_questions_at_their_passages() {
        let scripted = Arc::new(ScriptedLlm::new(|_| Ok("Radium was isolated in 1910 [2].".to_string())));
        let radium_copy = Chunk::new(
            Uuid::from_u128(7),
            Uuid::from_u128(11),
            "Radium Notes",
            "Radium was isolated as a pure metal by Marie Curie and André-Louis Debierne in 1910.",
        );
        let sub_questions = vec![
            SubQuestion {
                index: 0,
                text: "When was radium isolated?".to_string(),
                discovered_entity_ids: vec![Uuid::from_u128(2)],
                partial_evidence: DenoisePipeline::default().run(vec![radium_copy]).evidence,
                evidence_count: 1,
                succeeded: true,
                error: None,
                gaps: Vec::new(),
            },
            SubQuestion {
                index: 1,
                text: "Who funded the laboratory?".to_string(),
                discovered_entity_ids: Vec::new(),
                partial_evidence: EvidenceSet::empty(),
                evidence_count: 0,
                succeeded: false,
                error: Some(graphforge_common::errors::ErrorCode::GraphStoreError),
                gaps: Vec::new(),
            },
        ];

        synthesizer(scripted.clone(), 1)
            .synthesize(&Query::new("When was radium isolated and who paid?"), &evidence(), &sub_questions)
            .await
            .unwrap();

        let prompt = &scripted.requests()[0].prompt;
        assert!(prompt.contains("- When was radium isolated? (see [2])"));
        assert!(prompt.contains("- Who funded the laboratory? (retrieval failed)"));
    }

    #[tokio::test]
    async fn test_transient_failure_retries_once() {
        let attempts = Arc::new(AtomicUsize::new(0));
        let seen = attempts.clone();
        let scripted = Arc::new(ScriptedLlm::new(move |_| {
            if seen.fetch_add(1, Ordering::SeqCst) == 0 {
                Err(AppError::Upstream {
                    status: 503,
                    message: "overloaded".to_string(),
                })
            } else {
                Ok("Two prizes [1].".to_string())
            }
        }));

        let output = synthesizer(scripted, 1)
            .synthesize(&Query::new("What did Curie win?"), &evidence(), &[])
            .await
            .unwrap();

        assert_eq!(attempts.load(Ordering::SeqCst), 2);
        assert_eq!(output.answer_kind, AnswerKind::Answered);
    }

    #[tokio::test]
    async fn test_persistent_failure_is_typed() {
        let scripted = Arc::new(ScriptedLlm::new(|_| {
            Err(AppError::Upstream {
                status: 500,
                message: "boom at https://provider.internal".to_string(),
            })
        }));

        let err = synthesizer(scripted.clone(), 1)
            .synthesize(&Query::new("What did Curie win?"), &evidence(), &[])
            .await
            .unwrap_err();

        assert!(matches!(err, AppError::SynthesisFailed { .. }));
        assert!(!err.public_message().contains("provider.internal"));
        assert_eq!(scripted.calls(CallKind::Synthesis), 2);
    }

    #[tokio::test]
    async fn test_throttling_stays_rate_limited() {
        let scripted = Arc::new(ScriptedLlm::new(|_| {
            Err(AppError::Upstream {
                status: 429,
                message: "slow down".to_string(),
            })
        }));

        let err = synthesizer(scripted, 1)
            .synthesize(&Query::new("What did Curie win?"), &evidence(), &[])
            .await
            .unwrap_err();

        assert!(matches!(err, AppError::RateLimited { retries: 1 }));
    }
}
