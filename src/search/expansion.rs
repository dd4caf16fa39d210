//! Query expansion with domain-aware lexical variants.
//!
//! A query is broken into key phrases (unigrams and bigrams), each phrase
//! spawns lexical variants from a domain synonym table plus context- and
//! scope-aware prefixed forms, and every variant is weighted by its
//! embedding-cosine similarity to the original query. Expansions are
//! cached by exact query string in a bounded LRU.

use std::sync::Arc;

use parking_lot::Mutex;
use rustc_hash::FxHashSet;

use crate::config::SearchSettings;
use crate::embed::{cosine_similarity, EmbedError, Embedder};
use crate::types::{Level, QueryContext, WeightedVariant};
use crate::util::LruCache;

/// Lexical alternatives for emissions-domain trigger phrases.
const DOMAIN_SYNONYMS: &[(&str, &[&str])] = &[
    ("emissions", &["greenhouse gas emissions", "carbon output"]),
    ("carbon", &["co2", "carbon dioxide"]),
    ("ghg", &["greenhouse gas"]),
    ("supply chain", &["value chain", "upstream activities"]),
    ("footprint", &["carbon footprint"]),
];

/// Prefixes applied to phrases that mention scope 3.
const SCOPE3_PREFIXES: &[&str] = &["scope 3", "scope three", "indirect emissions"];

/// One expanded query: the original plus weighted lexical variants.
///
/// Variant weights are normalized to sum to 1; the original query is
/// always the first variant.
#[derive(Clone, Debug)]
pub struct ExpandedQuery {
    pub original: String,
    pub variants: Vec<WeightedVariant>,
    pub key_phrases: Vec<String>,
}

impl ExpandedQuery {
    /// An expansion carrying only the original query at full weight.
    /// Used when variant generation or weighting is unavailable.
    #[must_use]
    pub fn single(query: &str) -> Self {
        Self {
            original: query.to_string(),
            variants: vec![WeightedVariant {
                text: query.to_string(),
                weight: 1.0,
            }],
            key_phrases: Vec::new(),
        }
    }
}

/// Generates and caches weighted query expansions.
pub struct QueryExpander {
    embedder: Arc<dyn Embedder>,
    cache: Mutex<LruCache<String, ExpandedQuery>>,
    max_expansions: usize,
}

impl QueryExpander {
    #[must_use]
    pub fn new(embedder: Arc<dyn Embedder>, settings: &SearchSettings) -> Self {
        Self {
            embedder,
            cache: Mutex::new(LruCache::new(settings.expansion_cache_capacity)),
            max_expansions: settings.max_expansions,
        }
    }

    /// Expands `query` into weighted variants, reusing a cached expansion
    /// when the exact query string was seen before.
    pub async fn expand(
        &self,
        query: &str,
        context: Option<&QueryContext>,
    ) -> Result<ExpandedQuery, EmbedError> {
        let key = query.to_string();
        if let Some(hit) = self.cache.lock().get(&key) {
            return Ok(hit.clone());
        }

        let key_phrases = key_phrases(query);
        let mut seen: FxHashSet<String> = FxHashSet::default();
        seen.insert(query.to_lowercase());
        let mut candidates: Vec<String> = Vec::new();
        for phrase in &key_phrases {
            for variant in phrase_variants(phrase, context) {
                if seen.insert(variant.to_lowercase()) {
                    candidates.push(variant);
                }
            }
        }
        candidates.truncate(self.max_expansions.saturating_sub(1));

        let mut variants = vec![WeightedVariant {
            text: query.to_string(),
            weight: 1.0,
        }];
        if !candidates.is_empty() {
            let mut batch = vec![query.to_string()];
            batch.extend(candidates.iter().cloned());
            let embedded = self.embedder.embed(&batch, Level::Chunk).await?;
            if embedded.len() != batch.len() {
                return Err(EmbedError::OutputMismatch {
                    expected: batch.len(),
                    got: embedded.len(),
                });
            }
            let original_embedding = &embedded[0];
            for (text, embedding) in candidates.into_iter().zip(&embedded[1..]) {
                let weight = cosine_similarity(original_embedding, embedding).max(0.0);
                variants.push(WeightedVariant { text, weight });
            }
        }

        let total: f32 = variants.iter().map(|variant| variant.weight).sum();
        if total > 0.0 {
            for variant in &mut variants {
                variant.weight /= total;
            }
        }

        let expanded = ExpandedQuery {
            original: query.to_string(),
            variants,
            key_phrases,
        };
        tracing::debug!(
            query,
            variants = expanded.variants.len(),
            "expanded query"
        );
        self.cache.lock().insert(key, expanded.clone());
        Ok(expanded)
    }

    /// Number of cached expansions.
    pub fn cache_len(&self) -> usize {
        self.cache.lock().len()
    }
}

/// Unigrams and bigrams of the query, lowercased with punctuation trimmed.
fn key_phrases(query: &str) -> Vec<String> {
    let words: Vec<String> = query
        .to_lowercase()
        .split_whitespace()
        .map(|word| {
            word.trim_matches(|c: char| !c.is_alphanumeric())
                .to_string()
        })
        .filter(|word| !word.is_empty())
        .collect();

    let mut phrases = words.clone();
    for pair in words.windows(2) {
        phrases.push(format!("{} {}", pair[0], pair[1]));
    }
    phrases
}

fn phrase_variants(phrase: &str, context: Option<&QueryContext>) -> Vec<String> {
    let mut variants = Vec::new();
    for (trigger, forms) in DOMAIN_SYNONYMS {
        if phrase.contains(trigger) {
            for form in *forms {
                variants.push(phrase.replace(trigger, form));
            }
        }
    }
    if let Some(category) = context.and_then(|ctx| ctx.category.as_deref()) {
        variants.push(format!("{} {phrase}", category.to_lowercase()));
    }
    if phrase.contains("scope 3") || phrase.contains("scope3") {
        for prefix in SCOPE3_PREFIXES {
            variants.push(format!("{prefix} {phrase}"));
        }
    }
    variants
}
