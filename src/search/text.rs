//! Lexical scoring helpers for hybrid search.

use rustc_hash::FxHashSet;

/// Common English function words excluded from keyword matching.
const STOPWORDS: &[&str] = &[
    "a", "about", "an", "and", "are", "as", "at", "be", "been", "but", "by", "can", "do", "does",
    "for", "from", "had", "has", "have", "how", "if", "in", "into", "is", "it", "its", "of", "on",
    "or", "our", "over", "per", "so", "than", "that", "the", "their", "there", "these", "this",
    "to", "under", "was", "were", "what", "when", "which", "who", "will", "with",
];

fn is_stopword(token: &str) -> bool {
    STOPWORDS.contains(&token)
}

/// Lowercased alphanumeric tokens with stopwords removed, in text order.
pub(crate) fn clean_tokens(text: &str) -> Vec<String> {
    text.split(|c: char| !c.is_alphanumeric())
        .filter(|token| !token.is_empty())
        .map(str::to_lowercase)
        .filter(|token| !is_stopword(token))
        .collect()
}

/// Distinct query terms in first-occurrence order.
pub(crate) fn query_terms(query: &str) -> Vec<String> {
    let mut seen = FxHashSet::default();
    clean_tokens(query)
        .into_iter()
        .filter(|token| seen.insert(token.clone()))
        .collect()
}

/// Coverage-and-frequency keyword score for one document.
///
/// `coverage * (1 + ln(1 + tf))` where coverage is the fraction of query
/// terms found in the text and `tf` is the total occurrence count of the
/// matched terms. Returns the matched terms alongside the score; a text
/// matching no terms scores zero.
pub(crate) fn keyword_score(query_terms: &[String], text: &str) -> (f32, Vec<String>) {
    if query_terms.is_empty() {
        return (0.0, Vec::new());
    }
    let tokens = clean_tokens(text);
    let token_set: FxHashSet<&str> = tokens.iter().map(String::as_str).collect();

    let matched: Vec<String> = query_terms
        .iter()
        .filter(|term| token_set.contains(term.as_str()))
        .cloned()
        .collect();
    if matched.is_empty() {
        return (0.0, Vec::new());
    }

    let term_frequency = tokens
        .iter()
        .filter(|token| matched.iter().any(|term| term == *token))
        .count();
    let coverage = matched.len() as f32 / query_terms.len() as f32;
    let score = coverage * (1.0 + (1.0 + term_frequency as f32).ln());
    (score, matched)
}
