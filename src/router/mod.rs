//! Mixture-of-experts routing.
//!
//! A query is analyzed into expertise requirements, mapped to
//! confidence-weighted expert assignments, packed into a staged plan that
//! honors dependencies and the concurrency limit, and executed with
//! per-slot fallback. Execution never fails because an expert did.

use std::sync::Arc;

use futures_util::future::join_all;
use parking_lot::Mutex;
use rustc_hash::{FxHashMap, FxHashSet};
use serde::{Deserialize, Serialize};
use serde_json::json;

use crate::config::RouterSettings;
use crate::types::QueryContext;
use crate::util::LruCache;

pub mod expert;

pub use expert::{
    DataInsightExpert, Expert, ExpertContext, ExpertError, ExpertResponse, NarrativeExpert,
    ReasoningExpert, Scope3Expert,
};

/// Keyword triggers per expertise area.
const EXPERTISE_KEYWORDS: [(&str, &[&str]); 3] = [
    ("scope3", &["emission", "scope 3", "scope3", "carbon", "ghg"]),
    ("data_insight", &["analyze", "compare", "trend", "calculate"]),
    ("narrative", &["explain", "describe", "summarize", "report"]),
];

/// Static dependency table. An expert lands in a stage strictly later
/// than every listed dependency that is part of the same plan.
const DEPENDENCIES: [(&str, &[&str]); 3] = [
    ("data_insight", &["scope3"]),
    ("reasoning", &["scope3"]),
    ("narrative", &["scope3", "data_insight"]),
];

// ============================================================================
// Routing Types
// ============================================================================

/// Number of distinct expertise areas a query touches.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Ord, PartialOrd, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Complexity {
    #[default]
    Low,
    Medium,
    High,
}

/// What a query needs, derived from keyword heuristics over its wording.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct Requirements {
    pub expertise_needed: Vec<String>,
    pub complexity: Complexity,
}

/// One expert chosen for a query. Ephemeral; recomputed per request.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct ExpertAssignment {
    pub expert_id: String,
    pub confidence: f32,
    /// Why this expert was selected.
    pub reasoning: String,
    /// Lower runs earlier.
    pub priority: u8,
}

/// Stages of expert ids; experts within a stage run concurrently.
#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct ExecutionPlan {
    pub stages: Vec<Vec<String>>,
}

impl ExecutionPlan {
    pub fn expert_count(&self) -> usize {
        self.stages.iter().map(Vec::len).sum()
    }
}

/// Outcome of `route` + `plan`, cached per `(query, category)`.
#[derive(Clone, Debug)]
pub struct RoutePlan {
    pub assignments: Vec<ExpertAssignment>,
    pub plan: ExecutionPlan,
}

/// Running per-expert averages. Diagnostics only, never a routing input.
#[derive(Clone, Debug, Serialize)]
pub struct ExpertMetrics {
    pub calls: u64,
    /// Share of calls answered without falling back.
    pub success_rate: f32,
    /// Running mean confidence of non-degraded responses.
    pub avg_confidence: f32,
}

impl Default for ExpertMetrics {
    fn default() -> Self {
        Self {
            calls: 0,
            success_rate: 1.0,
            avg_confidence: 1.0,
        }
    }
}

#[derive(Clone, Debug, Serialize)]
pub struct RouterStats {
    pub experts: FxHashMap<String, ExpertMetrics>,
    pub route_cache_len: usize,
}

// ============================================================================
// Router
// ============================================================================

/// Routes queries to experts and executes the staged plan.
pub struct ExpertRouter {
    experts: FxHashMap<&'static str, Arc<dyn Expert>>,
    settings: RouterSettings,
    metrics: Mutex<FxHashMap<String, ExpertMetrics>>,
    cache: Mutex<LruCache<(String, String), RoutePlan>>,
}

impl ExpertRouter {
    /// Builds a router with the four shipped experts registered.
    #[must_use]
    pub fn new(settings: &RouterSettings) -> Self {
        let mut router = Self {
            experts: FxHashMap::default(),
            settings: settings.clone(),
            metrics: Mutex::new(FxHashMap::default()),
            cache: Mutex::new(LruCache::new(settings.route_cache_capacity)),
        };
        router.register(Arc::new(Scope3Expert));
        router.register(Arc::new(DataInsightExpert));
        router.register(Arc::new(NarrativeExpert));
        router.register(Arc::new(ReasoningExpert));
        router
    }

    /// Registers or replaces the expert stored under its id.
    pub fn register(&mut self, expert: Arc<dyn Expert>) {
        self.experts.insert(expert.id(), expert);
    }

    #[must_use]
    pub fn with_expert(mut self, expert: Arc<dyn Expert>) -> Self {
        self.register(expert);
        self
    }

    /// Expertise areas triggered by the query's wording, and the derived
    /// complexity: one area or none is low, two medium, three or more high.
    pub fn requirements(&self, query: &str) -> Requirements {
        let lowered = query.to_lowercase();
        let mut expertise_needed = Vec::new();
        for (area, keywords) in EXPERTISE_KEYWORDS {
            if keywords.iter().any(|keyword| lowered.contains(keyword)) {
                expertise_needed.push(area.to_string());
            }
        }
        let complexity = match expertise_needed.len() {
            0 | 1 => Complexity::Low,
            2 => Complexity::Medium,
            _ => Complexity::High,
        };
        Requirements {
            expertise_needed,
            complexity,
        }
    }

    /// Assigns experts for a query.
    ///
    /// The scope3 expert is always assigned as the primary domain expert;
    /// data_insight joins when its keywords trigger, narrative at medium
    /// complexity and above, reasoning only at high complexity.
    /// Assignments below `min_confidence` are dropped.
    pub fn route(&self, query: &str) -> Vec<ExpertAssignment> {
        let requirements = self.requirements(query);

        let mut assignments = vec![ExpertAssignment {
            expert_id: "scope3".to_string(),
            confidence: 0.8,
            reasoning: "Primary domain expert for Scope 3 emissions".to_string(),
            priority: 1,
        }];
        if requirements
            .expertise_needed
            .iter()
            .any(|area| area == "data_insight")
        {
            assignments.push(ExpertAssignment {
                expert_id: "data_insight".to_string(),
                confidence: 0.7,
                reasoning: "Required for data analysis".to_string(),
                priority: 2,
            });
        }
        if requirements.complexity >= Complexity::Medium {
            assignments.push(ExpertAssignment {
                expert_id: "narrative".to_string(),
                confidence: 0.6,
                reasoning: "Required for comprehensive explanation".to_string(),
                priority: 3,
            });
        }
        if requirements.complexity == Complexity::High {
            assignments.push(ExpertAssignment {
                expert_id: "reasoning".to_string(),
                confidence: 0.7,
                reasoning: "Required for complex reasoning".to_string(),
                priority: 2,
            });
        }

        assignments.retain(|assignment| assignment.confidence >= self.settings.min_confidence);
        tracing::debug!(
            experts = assignments.len(),
            complexity = ?requirements.complexity,
            "routed query"
        );
        assignments
    }

    /// Packs assignments into sequential stages.
    ///
    /// Assignments are ordered by (priority, confidence desc) and placed
    /// into the earliest stage that is after all their in-plan
    /// dependencies and below the concurrency limit.
    pub fn plan(&self, assignments: &[ExpertAssignment]) -> ExecutionPlan {
        let capacity = self.settings.max_concurrent_experts.max(1);

        let mut ordered: Vec<&ExpertAssignment> = assignments.iter().collect();
        ordered.sort_by(|a, b| {
            a.priority
                .cmp(&b.priority)
                .then_with(|| b.confidence.total_cmp(&a.confidence))
        });

        let assigned: FxHashSet<&str> = ordered
            .iter()
            .map(|assignment| assignment.expert_id.as_str())
            .collect();
        let mut stage_of: FxHashMap<&str, usize> = FxHashMap::default();
        let mut stages: Vec<Vec<String>> = Vec::new();

        for assignment in ordered {
            let id = assignment.expert_id.as_str();
            let earliest = dependencies_of(id)
                .iter()
                .filter(|dep| assigned.contains(*dep))
                .filter_map(|dep| stage_of.get(*dep))
                .map(|stage| stage + 1)
                .max()
                .unwrap_or(0);

            let mut target = earliest;
            loop {
                if target == stages.len() {
                    stages.push(Vec::new());
                }
                if stages[target].len() < capacity {
                    break;
                }
                target += 1;
            }
            stages[target].push(assignment.expert_id.clone());
            stage_of.insert(id, target);
        }

        ExecutionPlan { stages }
    }

    /// Routes and plans, reusing the cached result for a repeated
    /// `(query, category)` key.
    pub fn prepare(&self, query: &str, context: &QueryContext) -> RoutePlan {
        let key = (
            query.to_string(),
            context.category.clone().unwrap_or_default(),
        );
        if let Some(cached) = self.cache.lock().get(&key) {
            return cached.clone();
        }
        let assignments = self.route(query);
        let plan = self.plan(&assignments);
        let route_plan = RoutePlan { assignments, plan };
        self.cache.lock().insert(key, route_plan.clone());
        route_plan
    }

    /// Runs the plan's stages in order; experts within a stage run
    /// concurrently and later stages see earlier responses through the
    /// context. Every planned slot gets an entry in the returned map: a
    /// failed expert is replaced by the first succeeding expert in the
    /// fallback chain, or by a minimal static response when the chain is
    /// exhausted.
    pub async fn execute(
        &self,
        plan: &ExecutionPlan,
        mut ctx: ExpertContext,
    ) -> FxHashMap<String, ExpertResponse> {
        for stage in &plan.stages {
            let invocations = stage.iter().map(|slot_id| {
                let ctx = &ctx;
                async move { (slot_id.clone(), self.invoke_slot(slot_id, ctx).await) }
            });
            let stage_responses = join_all(invocations).await;
            for (slot_id, response) in stage_responses {
                self.record_call(&slot_id, &response);
                ctx.responses.insert(slot_id, response);
            }
        }
        ctx.responses
    }

    pub fn stats(&self) -> RouterStats {
        RouterStats {
            experts: self.metrics.lock().clone(),
            route_cache_len: self.cache.lock().len(),
        }
    }

    async fn invoke_slot(&self, slot_id: &str, ctx: &ExpertContext) -> ExpertResponse {
        match self.experts.get(slot_id) {
            Some(expert) => match expert.analyze(ctx).await {
                Ok(response) => response,
                Err(err) => {
                    tracing::warn!(
                        expert_id = slot_id,
                        error = %err,
                        "expert failed, engaging fallback chain"
                    );
                    self.fallback_response(slot_id, ctx).await
                }
            },
            None => {
                tracing::warn!(expert_id = slot_id, "no expert registered for slot");
                self.fallback_response(slot_id, ctx).await
            }
        }
    }

    async fn fallback_response(&self, failed_id: &str, ctx: &ExpertContext) -> ExpertResponse {
        for candidate in &self.settings.fallback_chain {
            if candidate == failed_id {
                continue;
            }
            let Some(expert) = self.experts.get(candidate.as_str()) else {
                continue;
            };
            match expert.analyze(ctx).await {
                Ok(mut response) => {
                    response.degraded = true;
                    return response;
                }
                Err(err) => {
                    tracing::debug!(expert_id = %candidate, error = %err, "fallback candidate failed");
                }
            }
        }
        static_fallback(failed_id, ctx)
    }

    fn record_call(&self, slot_id: &str, response: &ExpertResponse) {
        let mut metrics = self.metrics.lock();
        let entry = metrics.entry(slot_id.to_string()).or_default();
        entry.calls += 1;
        let success = if response.degraded { 0.0 } else { 1.0 };
        entry.success_rate += (success - entry.success_rate) / entry.calls as f32;
        if !response.degraded {
            entry.avg_confidence +=
                (response.confidence - entry.avg_confidence) / entry.calls as f32;
        }
    }
}

fn dependencies_of(expert_id: &str) -> &'static [&'static str] {
    DEPENDENCIES
        .iter()
        .find(|(id, _)| *id == expert_id)
        .map_or(&[], |(_, deps)| *deps)
}

/// Minimal response used when the whole fallback chain is exhausted.
fn static_fallback(slot_id: &str, ctx: &ExpertContext) -> ExpertResponse {
    let category = ctx.context.category.as_deref().unwrap_or("general");
    ExpertResponse {
        expert_id: slot_id.to_string(),
        content: format!(
            "Fallback analysis for the '{category}' category: collect more detailed data \
             before drawing conclusions."
        ),
        confidence: 0.3,
        findings: json!({
            "category": category,
            "methodology": "general",
            "recommendations": ["Collect more detailed data for accurate analysis"],
        }),
        degraded: true,
    }
}
