//! Expert execution seam and the four shipped experts.
//!
//! An expert is one specialized analysis step invoked by the router. All
//! experts consume the same [`ExpertContext`] and produce an
//! [`ExpertResponse`]; failures are absorbed by the router's fallback
//! chain and never abort a query.

use async_trait::async_trait;
use miette::Diagnostic;
use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use thiserror::Error;

use crate::types::{QueryContext, SearchHit};

// ============================================================================
// Seam
// ============================================================================

/// Errors from a single expert invocation.
///
/// The router substitutes fallback output for a failed slot; these never
/// propagate past `execute`.
#[derive(Debug, Error, Diagnostic)]
pub enum ExpertError {
    /// Expected input is missing from the execution context.
    #[error("missing expected input: {what}")]
    #[diagnostic(
        code(carbonloom::router::missing_input),
        help("Check that earlier stages produced the required data.")
    )]
    MissingInput { what: &'static str },

    /// The expert's backing service is down.
    #[error("expert backend unavailable ({expert_id}): {message}")]
    #[diagnostic(code(carbonloom::router::expert_unavailable))]
    Unavailable {
        expert_id: &'static str,
        message: String,
    },
}

/// What one expert produced for a query.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ExpertResponse {
    pub expert_id: String,
    /// Readable analysis text, consumed by synthesis.
    pub content: String,
    pub confidence: f32,
    /// Structured detail; the shape is owned by each expert.
    pub findings: Value,
    /// Set when this response came from a fallback path.
    pub degraded: bool,
}

/// Inputs shared by every expert during one request.
#[derive(Clone, Debug)]
pub struct ExpertContext {
    pub query: String,
    pub context: QueryContext,
    /// Ranked hits from hybrid search.
    pub hits: Vec<SearchHit>,
    /// Responses from earlier stages, keyed by slot id.
    pub responses: FxHashMap<String, ExpertResponse>,
}

impl ExpertContext {
    #[must_use]
    pub fn new(query: impl Into<String>, context: QueryContext, hits: Vec<SearchHit>) -> Self {
        Self {
            query: query.into(),
            context,
            hits,
            responses: FxHashMap::default(),
        }
    }
}

/// A single specialized analysis step.
#[async_trait]
pub trait Expert: Send + Sync {
    /// Stable identifier used for routing, dependencies, and metrics.
    fn id(&self) -> &'static str;

    async fn analyze(&self, ctx: &ExpertContext) -> Result<ExpertResponse, ExpertError>;
}

// ============================================================================
// Scope 3 domain expert
// ============================================================================

/// Calculation approaches per Scope 3 category. The first entry is the
/// default methodology recommended for the category.
const CATEGORY_METHODS: [(&str, &[&str]); 13] = [
    ("purchased_goods", &["spend-based", "supplier-specific", "hybrid"]),
    ("capital_goods", &["asset-lifetime", "depreciation"]),
    ("fuel_energy", &["upstream-emissions", "transmission-loss"]),
    ("transportation", &["distance-based", "fuel-based", "spend-based"]),
    ("waste", &["waste-type", "treatment-specific"]),
    ("business_travel", &["distance-based", "spend-based"]),
    ("employee_commuting", &["survey-based", "average-data"]),
    ("leased_assets", &["asset-specific", "average-data"]),
    ("processing", &["process-specific", "average-data"]),
    ("use_phase", &["lifetime-emissions", "energy-consumption"]),
    ("end_of_life", &["disposal-method", "material-specific"]),
    ("franchises", &["franchise-specific", "average-data"]),
    ("investments", &["investment-specific", "average-data"]),
];

/// `(strategy, description, applicable categories)`.
const REDUCTION_STRATEGIES: [(&str, &str, &[&str]); 3] = [
    (
        "supplier_engagement",
        "Work with suppliers to reduce upstream emissions",
        &["purchased_goods", "capital_goods"],
    ),
    (
        "material_substitution",
        "Switch to lower-emission materials",
        &["purchased_goods", "packaging"],
    ),
    (
        "process_optimization",
        "Optimize processes for energy efficiency",
        &["processing", "manufacturing"],
    ),
];

const REFERENCES: [&str; 2] = [
    "GHG Protocol Scope 3 Standard",
    "Technical Guidance for Calculating Scope 3 Emissions",
];

/// Primary domain expert: resolves the Scope 3 category, checks how well
/// the retrieved passages cover it, and recommends a calculation
/// methodology.
#[derive(Clone, Copy, Debug, Default)]
pub struct Scope3Expert;

impl Scope3Expert {
    fn extract_category(query: &str, context: &QueryContext) -> String {
        if let Some(category) = &context.category {
            return category.clone();
        }
        let lowered = query.to_lowercase();
        for (category, _) in CATEGORY_METHODS {
            if lowered.contains(&category.replace('_', " ")) {
                return category.to_string();
            }
        }
        "general".to_string()
    }

    fn methods_for(category: &str) -> Option<&'static [&'static str]> {
        CATEGORY_METHODS
            .iter()
            .find(|(name, _)| *name == category)
            .map(|(_, methods)| *methods)
    }
}

#[async_trait]
impl Expert for Scope3Expert {
    fn id(&self) -> &'static str {
        "scope3"
    }

    async fn analyze(&self, ctx: &ExpertContext) -> Result<ExpertResponse, ExpertError> {
        let category = Self::extract_category(&ctx.query, &ctx.context);
        let methods = Self::methods_for(&category);
        let methodology = methods.map_or("general", |methods| methods[0]);

        let matching = ctx
            .hits
            .iter()
            .filter(|hit| hit.metadata.category() == Some(category.as_str()))
            .count();
        let coverage = if ctx.hits.is_empty() {
            0.0
        } else {
            matching as f32 / ctx.hits.len() as f32
        };
        let methodology_documented = ctx.hits.iter().any(|hit| {
            hit.metadata.str_field("calculation_method").is_some()
                || hit.metadata.str_field("methodology").is_some()
        });

        let mut confidence: f32 = 0.0;
        if methods.is_some() {
            confidence += 0.3;
        }
        confidence += 0.4 * coverage;
        if methodology_documented {
            confidence += 0.3;
        }
        let confidence = confidence.min(1.0);

        let mut recommendations: Vec<String> = Vec::new();
        if methods.is_some_and(|methods| methods.contains(&"spend-based")) {
            recommendations
                .push("Collect activity data to improve on spend-based estimates".to_string());
        }
        for (strategy, description, applicable) in REDUCTION_STRATEGIES {
            if applicable.contains(&category.as_str()) {
                recommendations.push(format!("{strategy}: {description}"));
            }
        }
        if recommendations.is_empty() {
            recommendations.push("Collect more detailed category data".to_string());
        }

        let mut content = format!(
            "Scope 3 category '{category}': {matching} of {} retrieved passages match; \
             recommended methodology '{methodology}'.",
            ctx.hits.len()
        );
        if !methodology_documented {
            content.push_str(" No calculation methodology is documented in the retrieved material.");
        }

        Ok(ExpertResponse {
            expert_id: self.id().to_string(),
            content,
            confidence,
            findings: json!({
                "category": category,
                "methodology": methodology,
                "category_coverage": coverage,
                "methodology_documented": methodology_documented,
                "factors": methods.unwrap_or(&["general"]),
                "recommendations": recommendations,
                "references": REFERENCES,
            }),
            degraded: false,
        })
    }
}

// ============================================================================
// Data insight expert
// ============================================================================

/// Aggregates numeric figures found in the retrieved passages and, when
/// passages carry year metadata, reports the direction of change.
#[derive(Clone, Copy, Debug, Default)]
pub struct DataInsightExpert;

fn extract_numbers(text: &str) -> Vec<f64> {
    use regex::Regex;
    use std::sync::LazyLock;

    static NUMBER_RE: LazyLock<Regex> =
        LazyLock::new(|| Regex::new(r"-?\d+(?:\.\d+)?").unwrap());

    NUMBER_RE
        .find_iter(text)
        .filter_map(|m| m.as_str().parse().ok())
        .collect()
}

fn trend_direction(samples: &[(i64, f64)]) -> Option<&'static str> {
    let first_year = samples.iter().map(|(year, _)| *year).min()?;
    let last_year = samples.iter().map(|(year, _)| *year).max()?;
    if first_year == last_year {
        return None;
    }
    let mean_of = |year: i64| {
        let values: Vec<f64> = samples
            .iter()
            .filter(|(sample_year, _)| *sample_year == year)
            .map(|(_, value)| *value)
            .collect();
        values.iter().sum::<f64>() / values.len() as f64
    };
    let first = mean_of(first_year);
    let last = mean_of(last_year);
    if last > first * 1.05 {
        Some("increasing")
    } else if last < first * 0.95 {
        Some("decreasing")
    } else {
        Some("flat")
    }
}

#[async_trait]
impl Expert for DataInsightExpert {
    fn id(&self) -> &'static str {
        "data_insight"
    }

    async fn analyze(&self, ctx: &ExpertContext) -> Result<ExpertResponse, ExpertError> {
        if ctx.hits.is_empty() {
            return Err(ExpertError::MissingInput {
                what: "retrieved passages",
            });
        }

        let mut values: Vec<f64> = Vec::new();
        let mut by_year: Vec<(i64, f64)> = Vec::new();
        let mut hits_with_figures = 0usize;
        for hit in &ctx.hits {
            let numbers = extract_numbers(&hit.text);
            if numbers.is_empty() {
                continue;
            }
            hits_with_figures += 1;
            if let Some(year) = hit.metadata.year() {
                by_year.extend(numbers.iter().map(|value| (year, *value)));
            }
            values.extend(numbers);
        }

        if values.is_empty() {
            return Ok(ExpertResponse {
                expert_id: self.id().to_string(),
                content: "No numeric figures found in the retrieved passages.".to_string(),
                confidence: 0.4,
                findings: json!({ "figure_count": 0 }),
                degraded: false,
            });
        }

        let count = values.len();
        let min = values.iter().copied().fold(f64::INFINITY, f64::min);
        let max = values.iter().copied().fold(f64::NEG_INFINITY, f64::max);
        let mean = values.iter().sum::<f64>() / count as f64;
        let trend = trend_direction(&by_year);

        let coverage = hits_with_figures as f32 / ctx.hits.len() as f32;
        let confidence = 0.6 + 0.2 * coverage;

        let mut content = format!(
            "Found {count} numeric figures across {hits_with_figures} of {} passages \
             (min {min}, max {max}, mean {mean:.2}).",
            ctx.hits.len()
        );
        if let Some(direction) = trend {
            content.push_str(&format!(" Year-over-year figures are {direction}."));
        }

        Ok(ExpertResponse {
            expert_id: self.id().to_string(),
            content,
            confidence,
            findings: json!({
                "figure_count": count,
                "min": min,
                "max": max,
                "mean": mean,
                "trend": trend,
            }),
            degraded: false,
        })
    }
}

// ============================================================================
// Narrative expert
// ============================================================================

/// Composes a readable summary from the top passages and earlier expert
/// conclusions. Succeeds even with nothing to narrate.
#[derive(Clone, Copy, Debug, Default)]
pub struct NarrativeExpert;

fn first_sentence(text: &str) -> &str {
    match text.find(['.', '!', '?']) {
        Some(end) => &text[..=end],
        None => text,
    }
}

#[async_trait]
impl Expert for NarrativeExpert {
    fn id(&self) -> &'static str {
        "narrative"
    }

    async fn analyze(&self, ctx: &ExpertContext) -> Result<ExpertResponse, ExpertError> {
        let mut sections: Vec<String> = Vec::new();
        let mut referenced: Vec<&str> = Vec::new();

        if let Some(top) = ctx.hits.first() {
            sections.push(format!(
                "Based on the retrieved material: {}",
                first_sentence(&top.text)
            ));
        }
        for id in ["scope3", "data_insight"] {
            if let Some(response) = ctx.responses.get(id) {
                sections.push(response.content.clone());
                referenced.push(id);
            }
        }
        if sections.is_empty() {
            sections.push("No retrieved material or expert analysis is available to narrate.".to_string());
        }

        let confidence = if referenced.is_empty() {
            0.8
        } else {
            referenced
                .iter()
                .filter_map(|id| ctx.responses.get(*id))
                .map(|response| response.confidence)
                .sum::<f32>()
                / referenced.len() as f32
        };

        Ok(ExpertResponse {
            expert_id: self.id().to_string(),
            content: sections.join(" "),
            confidence,
            findings: json!({
                "sections": sections.len(),
                "experts_referenced": referenced,
            }),
            degraded: false,
        })
    }
}

// ============================================================================
// Reasoning expert
// ============================================================================

/// Chains earlier expert conclusions into an ordered line of reasoning,
/// strongest signal first. Requires at least one earlier response.
#[derive(Clone, Copy, Debug, Default)]
pub struct ReasoningExpert;

#[async_trait]
impl Expert for ReasoningExpert {
    fn id(&self) -> &'static str {
        "reasoning"
    }

    async fn analyze(&self, ctx: &ExpertContext) -> Result<ExpertResponse, ExpertError> {
        if ctx.responses.is_empty() {
            return Err(ExpertError::MissingInput {
                what: "earlier expert responses",
            });
        }

        let mut contributions: Vec<&ExpertResponse> = ctx.responses.values().collect();
        contributions.sort_by(|a, b| {
            b.confidence
                .total_cmp(&a.confidence)
                .then_with(|| a.expert_id.cmp(&b.expert_id))
        });

        let chain: Vec<String> = contributions
            .iter()
            .map(|response| {
                format!("{}: {}", response.expert_id, first_sentence(&response.content))
            })
            .collect();
        let strongest = contributions[0];
        let confidence = contributions
            .iter()
            .map(|response| response.confidence)
            .sum::<f32>()
            / contributions.len() as f32;

        Ok(ExpertResponse {
            expert_id: self.id().to_string(),
            content: format!(
                "Reasoning over {} expert conclusions; the strongest signal comes from '{}'.",
                contributions.len(),
                strongest.expert_id
            ),
            confidence,
            findings: json!({
                "chain": chain,
                "strongest": strongest.expert_id,
            }),
            degraded: false,
        })
    }
}
