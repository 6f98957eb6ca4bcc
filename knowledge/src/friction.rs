//! Pairwise friction between two scored entries, metric `friction-v1`.
//!
//! ```text
//! friction = clamp01(max(contradiction, divergence))
//! contradiction = max over claim pairs of opposite polarity of
//!                 jaccard(core tokens) * min(confidence)
//! divergence = 0.5 * (1 - max(cos, 0)) * (1 - jaccard(all core tokens))
//! ```
//!
//! A claim's polarity is negative when it holds an odd number of negation
//! tokens. Core tokens are lowercase alphanumeric words minus negations and
//! a short stopword list. The result depends only on the two entries, so a
//! fixed neighbor set always scores the same.

use std::collections::BTreeSet;

use nb_core::{Claim, Entry};

pub const METRIC_VERSION: &str = "friction-v1";

const NEGATIONS: &[&str] = &[
    "not", "no", "never", "none", "nobody", "nothing", "neither", "nor", "cannot", "without",
];

const STOPWORDS: &[&str] = &[
    "a", "an", "the", "is", "are", "was", "were", "be", "been", "it", "its", "of", "to", "in",
    "on", "and", "or", "that", "this", "as", "at", "by", "for", "with",
];

fn is_negation(token: &str) -> bool {
    NEGATIONS.contains(&token) || token.ends_with("n't")
}

fn words(text: &str) -> impl Iterator<Item = String> + '_ {
    text.split(|c: char| !(c.is_alphanumeric() || c == '\'' || c == '\u{2019}'))
        .map(|w| w.trim_matches('\'').replace('\u{2019}', "'").to_lowercase())
        .filter(|w| !w.is_empty())
}

/// Content-bearing tokens of `text`.
pub fn core_tokens(text: &str) -> BTreeSet<String> {
    words(text)
        .filter(|w| !is_negation(w) && !STOPWORDS.contains(&w.as_str()))
        .collect()
}

/// `true` for an affirmative claim.
pub fn polarity(text: &str) -> bool {
    words(text).filter(|w| is_negation(w)).count() % 2 == 0
}

/// Empty sets are identical.
pub fn jaccard(a: &BTreeSet<String>, b: &BTreeSet<String>) -> f64 {
    if a.is_empty() && b.is_empty() {
        return 1.0;
    }
    let shared = a.intersection(b).count();
    let union = a.union(b).count();
    shared as f64 / union as f64
}

/// Cosine similarity, 0 for mismatched dimensions or zero vectors.
pub fn cosine(a: &[f32], b: &[f32]) -> f64 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }
    let (mut dot, mut norm_a, mut norm_b) = (0.0f64, 0.0f64, 0.0f64);
    for (x, y) in a.iter().zip(b) {
        let (x, y) = (f64::from(*x), f64::from(*y));
        dot += x * y;
        norm_a += x * x;
        norm_b += y * y;
    }
    if norm_a == 0.0 || norm_b == 0.0 {
        return 0.0;
    }
    (dot / (norm_a.sqrt() * norm_b.sqrt())).clamp(-1.0, 1.0)
}

pub fn contradiction(a: &[Claim], b: &[Claim]) -> f64 {
    let mut worst = 0.0f64;
    for ca in a {
        let (pa, ta) = (polarity(&ca.text), core_tokens(&ca.text));
        for cb in b {
            if pa == polarity(&cb.text) {
                continue;
            }
            let overlap = jaccard(&ta, &core_tokens(&cb.text));
            worst = worst.max(overlap * ca.confidence.min(cb.confidence));
        }
    }
    worst
}

fn claim_tokens(claims: &[Claim]) -> BTreeSet<String> {
    claims.iter().flat_map(|c| core_tokens(&c.text)).collect()
}

pub fn divergence(a: &Entry, b: &Entry) -> f64 {
    let similarity = match (&a.embedding, &b.embedding) {
        (Some(ea), Some(eb)) => cosine(ea, eb).max(0.0),
        _ => 0.0,
    };
    let overlap = jaccard(&claim_tokens(&a.claims), &claim_tokens(&b.claims));
    0.5 * (1.0 - similarity) * (1.0 - overlap)
}

pub fn friction(a: &Entry, b: &Entry) -> f64 {
    let value = contradiction(&a.claims, &b.claims).max(divergence(a, b));
    if value.is_nan() {
        return 0.0;
    }
    value.clamp(0.0, 1.0)
}
