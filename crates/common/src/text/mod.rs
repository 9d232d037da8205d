//! Text utilities shared by routing, retrieval and denoising
//!
//! Provides:
//! - Text normalization and stable content hashing
//! - Token estimation for budget accounting
//! - Entity mention and seed-term extraction

use sha2::{Digest, Sha256};

/// Words ignored when extracting seed terms
const STOP_WORDS: &[&str] = &[
    "a", "an", "the", "is", "are", "was", "were", "be", "been", "in", "on", "at", "to", "for",
    "of", "with", "by", "from", "and", "or", "but", "not", "this", "that", "these", "those",
    "it", "its", "as", "do", "does", "did", "has", "have", "had", "can", "could", "will",
    "would", "should", "may", "might", "what", "which", "who", "whom", "whose", "when",
    "where", "why", "how", "about", "tell", "me", "please", "there", "their", "they", "any",
    "between", "into", "than", "then", "also", "such", "many", "much", "some", "all",
];

/// Lowercase, trim and collapse runs of whitespace
pub fn normalize_text(text: &str) -> String {
    text.split_whitespace()
        .map(|w| w.to_lowercase())
        .collect::<Vec<_>>()
        .join(" ")
}

/// Normalize an entity name for index lookups (punctuation stripped)
pub fn normalize_name(name: &str) -> String {
    let cleaned: String = name
        .chars()
        .map(|c| {
            if c.is_alphanumeric() || c == '-' || c == '\'' {
                c
            } else {
                ' '
            }
        })
        .collect();
    normalize_text(&cleaned)
}

/// Stable digest of the normalized text, used for deduplication
pub fn content_hash(text: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(normalize_text(text).as_bytes());
    hex::encode(hasher.finalize())
}

/// Estimate token count (~4 characters per token, never zero for non-empty text)
pub fn estimate_tokens(text: &str) -> usize {
    text.len().div_ceil(4)
}

/// Character-safe prefix of `text`
pub fn preview(text: &str, max_chars: usize) -> String {
    let trimmed = text.trim();
    if trimmed.chars().count() <= max_chars {
        return trimmed.to_string();
    }
    let mut out: String = trimmed.chars().take(max_chars).collect();
    out.push('…');
    out
}

pub fn is_stop_word(word: &str) -> bool {
    STOP_WORDS.contains(&word.to_lowercase().as_str())
}

/// Explicit entity mentions: quoted phrases and runs of capitalized words.
///
/// The first word of the text is only counted when it is not a stop word,
/// so "What is Rust" yields `["Rust"]`.
pub fn extract_mentions(text: &str) -> Vec<String> {
    let mut mentions: Vec<String> = Vec::new();

    // Quoted phrases
    let mut rest = text;
    while let Some(start) = rest.find('"') {
        let after = &rest[start + 1..];
        match after.find('"') {
            Some(end) => {
                let phrase = after[..end].trim();
                if !phrase.is_empty() {
                    push_unique(&mut mentions, phrase.to_string());
                }
                rest = &after[end + 1..];
            }
            None => break,
        }
    }

    // Capitalized runs
    let mut current: Vec<String> = Vec::new();
    for (i, raw) in text.split_whitespace().enumerate() {
        let word: String = raw
            .trim_matches(|c: char| !c.is_alphanumeric() && c != '-')
            .to_string();
        let starts_upper = word.chars().next().is_some_and(|c| c.is_uppercase());
        let ends_clause = raw.ends_with(|c: char| matches!(c, ',' | '?' | '.' | '!' | ';' | ':'));

        if starts_upper && !(i == 0 && is_stop_word(&word)) && !word.is_empty() {
            current.push(word);
        } else if !current.is_empty() {
            push_unique(&mut mentions, current.join(" "));
            current.clear();
        }

        if ends_clause && !current.is_empty() {
            push_unique(&mut mentions, current.join(" "));
            current.clear();
        }
    }
    if !current.is_empty() {
        push_unique(&mut mentions, current.join(" "));
    }

    mentions
}

/// Candidate seed terms for entity resolution: mentions, content words and
/// bigrams of adjacent content words, normalized and capped at `max_terms`.
pub fn seed_terms(text: &str, max_terms: usize) -> Vec<String> {
    let mut terms: Vec<String> = Vec::new();

    for mention in extract_mentions(text) {
        push_unique(&mut terms, normalize_name(&mention));
    }

    let words: Vec<String> = text
        .split_whitespace()
        .map(normalize_name)
        .filter(|w| !w.is_empty())
        .collect();

    for pair in words.windows(2) {
        if !is_stop_word(&pair[0]) && !is_stop_word(&pair[1]) {
            push_unique(&mut terms, format!("{} {}", pair[0], pair[1]));
        }
    }

    for word in &words {
        if word.len() > 2 && !is_stop_word(word) {
            push_unique(&mut terms, word.clone());
        }
    }

    terms.retain(|t| !t.is_empty());
    terms.truncate(max_terms);
    terms
}

fn push_unique(items: &mut Vec<String>, item: String) {
    if !items.contains(&item) {
        items.push(item);
    }
}
