//! Title normalization and fuzzy comparison
//!
//! Scores are on a 0-100 scale. The blended score takes the best of a plain
//! edit-distance ratio, a token-sort ratio (word order invariant) and a
//! token-set ratio (extra words on one side tolerated), with the token
//! variants weighted slightly below an exact ratio so that an exact title
//! always outranks a superset of it.

use std::collections::BTreeSet;

use rapidfuzz::distance::levenshtein;

/// Weight applied to the token based ratios
const TOKEN_WEIGHT: f64 = 0.95;

/// Normalize a title for matching: lowercase, punctuation removed,
/// `&` spelled out, whitespace collapsed.
pub fn normalize_title(title: &str) -> String {
    title
        .to_lowercase()
        .replace('&', " and ")
        .replace(['\'', '\u{2019}'], "")
        .chars()
        .map(|c| if c.is_alphanumeric() { c } else { ' ' })
        .collect::<String>()
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
}

/// Normalized Levenshtein similarity (0.0 to 1.0)
pub fn string_similarity(s1: &str, s2: &str) -> f64 {
    if s1.is_empty() && s2.is_empty() {
        return 1.0;
    }
    levenshtein::normalized_similarity(s1.chars(), s2.chars())
}

fn tokens(s: &str) -> BTreeSet<&str> {
    s.split_whitespace().collect()
}

fn join(parts: impl IntoIterator<Item = impl AsRef<str>>) -> String {
    parts
        .into_iter()
        .map(|p| p.as_ref().to_string())
        .collect::<Vec<_>>()
        .join(" ")
}

/// Similarity after sorting the words of both strings (0.0 to 1.0)
pub fn token_sort_similarity(s1: &str, s2: &str) -> f64 {
    let mut a: Vec<&str> = s1.split_whitespace().collect();
    let mut b: Vec<&str> = s2.split_whitespace().collect();
    a.sort_unstable();
    b.sort_unstable();
    string_similarity(&a.join(" "), &b.join(" "))
}

/// Token-set similarity (0.0 to 1.0)
///
/// Compares the shared words against each side's shared-plus-remaining
/// words. When every word of one side appears in the other the result is 1.0.
pub fn token_set_similarity(s1: &str, s2: &str) -> f64 {
    let a = tokens(s1);
    let b = tokens(s2);
    if a.is_empty() || b.is_empty() {
        return if a.is_empty() && b.is_empty() { 1.0 } else { 0.0 };
    }

    let common: Vec<&str> = a.intersection(&b).copied().collect();
    let only_a: Vec<&str> = a.difference(&b).copied().collect();
    let only_b: Vec<&str> = b.difference(&a).copied().collect();

    if !common.is_empty() && (only_a.is_empty() || only_b.is_empty()) {
        return 1.0;
    }

    let base = join(&common);
    let with_a = join(common.iter().chain(only_a.iter()));
    let with_b = join(common.iter().chain(only_b.iter()));

    string_similarity(&base, &with_a)
        .max(string_similarity(&base, &with_b))
        .max(string_similarity(&with_a, &with_b))
}

/// Blended title score on a 0-100 scale
pub fn title_similarity(query: &str, candidate: &str) -> f64 {
    let q = normalize_title(query);
    let c = normalize_title(candidate);
    if q.is_empty() || c.is_empty() {
        return 0.0;
    }
    if q == c {
        return 100.0;
    }

    let ratio = string_similarity(&q, &c);
    let sorted = token_sort_similarity(&q, &c) * TOKEN_WEIGHT;
    let set = token_set_similarity(&q, &c) * TOKEN_WEIGHT;

    (ratio.max(sorted).max(set) * 100.0).clamp(0.0, 100.0)
}
