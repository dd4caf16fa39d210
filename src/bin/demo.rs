//! Demo: End-to-End Ingest, Query, and Degraded Modes
//!
//! Walks the whole engine with the deterministic offline backends: ingest
//! a small Scope 3 corpus, show idempotent re-ingest and versioned
//! updates, answer scoped and unscoped queries through the expert router,
//! and finish with aggregated engine statistics.
//!
//! Running This Demo:
//! ```bash
//! cargo run --bin demo
//! ```

use std::sync::Arc;

use miette::Result;
use tracing::info;
use tracing_error::ErrorLayer;
use tracing_subscriber::fmt::format::FmtSpan;
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

use carbonloom::config::EngineConfig;
use carbonloom::embed::HashEmbedder;
use carbonloom::generate::TemplateGenerator;
use carbonloom::kb::{IngestDisposition, MemoryGraphStore};
use carbonloom::pipeline::Pipeline;
use carbonloom::types::{AgentResult, Level, Metadata, QueryContext};

fn init_tracing() {
    let fmt_layer = fmt::layer()
        .with_target(false)
        .with_file(false)
        .with_line_number(false)
        .with_span_events(FmtSpan::NONE);

    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new("info,carbonloom=info"))
        .unwrap();

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt_layer)
        .with(ErrorLayer::default())
        .init();
}

fn init_miette() {
    // Pretty panic reports
    miette::set_panic_hook();
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    init_miette();
    demo().await
}

async fn demo() -> Result<()> {
    info!("╔══════════════════════════════════════════════════════════╗");
    info!("║        Carbonloom: Scope 3 Emissions QA End to End       ║");
    info!("╚══════════════════════════════════════════════════════════╝");

    // ✅ STEP 1: Open the pipeline with the offline backends
    info!("📦 Step 1: Opening the pipeline");
    let config = EngineConfig::new();
    let embedder = Arc::new(HashEmbedder::from_levels(&config.levels));
    let pipeline = Pipeline::open(
        &config,
        embedder,
        Arc::new(TemplateGenerator),
        Arc::new(MemoryGraphStore::new()),
    )
    .await?;
    info!("   ✓ Pipeline ready (in-memory store unless CARBONLOOM_DB_PATH is set)");

    // ✅ STEP 2: Ingest a small corpus
    info!("📄 Step 2: Ingesting documents");
    let fleet = pipeline
        .process_document(
            "Scope 3 transportation emissions reached 1200 tonnes CO2e in 2023. \
             Road freight contributed 900 tonnes and rail freight 300 tonnes. \
             The fuel-based method was applied across the fleet.",
            &Metadata::new()
                .with("category", serde_json::json!("transportation"))
                .with("source", serde_json::json!("fleet report 2023"))
                .with("calculation_method", serde_json::json!("fuel_based")),
        )
        .await?;
    info!(
        "   ✓ {} created at version {} ({} semantic units indexed)",
        fleet.doc_id,
        fleet.version_id,
        fleet
            .units_indexed
            .get(&Level::Semantic)
            .copied()
            .unwrap_or_default()
    );

    let travel = pipeline
        .process_document(
            "Business travel emissions were 90 tonnes CO2e in 2022 and 140 tonnes in 2023. \
             Air travel drives the increase. Estimates use the distance-based method.",
            &Metadata::new()
                .with("category", serde_json::json!("business_travel"))
                .with("source", serde_json::json!("travel ledger")),
        )
        .await?;
    info!("   ✓ {} created at version {}", travel.doc_id, travel.version_id);

    // ✅ STEP 3: Idempotent re-ingest and a versioned update
    info!("🔁 Step 3: Re-ingest and update");
    let again = pipeline
        .process_document(
            "Business travel emissions were 90 tonnes CO2e in 2022 and 140 tonnes in 2023. \
             Air travel drives the increase. Estimates use the distance-based method.",
            &Metadata::new(),
        )
        .await?;
    assert_eq!(again.disposition, IngestDisposition::Unchanged);
    info!(
        "   ✓ Identical resubmission was a no-op (still {} v{})",
        again.doc_id, again.version_id
    );

    let revised = "Business travel emissions were revised to 150 tonnes CO2e in 2023 \
                   after late airline invoices arrived.";
    let updated = pipeline
        .kb()
        .update_document(
            &travel.doc_id,
            revised,
            &[revised.to_string()],
            &Metadata::new().with("category", serde_json::json!("business_travel")),
        )
        .await?;
    info!(
        "   ✓ {} updated to version {}",
        updated.doc_id, updated.version_id
    );
    let history = pipeline.kb().get_document(&updated.doc_id, None).await?;
    info!(
        "   ✓ Version history length: {}",
        history.version_history.len()
    );

    // ✅ STEP 4: Ask questions
    info!("❓ Step 4: Querying");
    let unscoped = pipeline
        .process_query(
            "analyze the trend in scope 3 transportation emissions",
            &QueryContext::new(),
        )
        .await?;
    describe("unscoped", &unscoped);

    let scoped = pipeline
        .process_query(
            "how are transportation emissions calculated",
            &QueryContext::new()
                .with_category("transportation")
                .with_year(2023),
        )
        .await?;
    describe("scoped to transportation/2023", &scoped);

    let nothing = pipeline
        .process_query("renewable electricity certificates", &QueryContext::new().with_category("investments"))
        .await?;
    if nothing.is_no_content() {
        info!("   ✓ Out-of-corpus query correctly reported no relevant content");
    }

    // ✅ STEP 5: Engine statistics
    info!("📊 Step 5: Engine statistics");
    let stats = pipeline.get_stats().await?;
    info!(
        "   ✓ KB: {} documents, {} versions, {} chunks",
        stats.kb.counts.documents, stats.kb.counts.versions, stats.kb.counts.chunks
    );
    info!(
        "   ✓ Index sizes: {:?}",
        stats.retriever.index_sizes
    );
    info!(
        "   ✓ Graph mirror reachable: {}",
        stats.kb.graph.reachable
    );
    for (expert_id, metrics) in &stats.router.experts {
        info!(
            "   ✓ Expert {expert_id}: {} calls, success rate {:.2}",
            metrics.calls, metrics.success_rate
        );
    }

    info!("╔══════════════════════════════════════════════════════════╗");
    info!("║                      Demo Complete                       ║");
    info!("╚══════════════════════════════════════════════════════════╝");
    Ok(())
}

fn describe(label: &str, result: &AgentResult) {
    match result {
        AgentResult::Answer(answer) => {
            info!(
                "   ✓ [{label}] answered with confidence {:.2} via {:?}",
                answer.confidence, answer.expert_ids
            );
            info!("     {}", truncated(&answer.content, 160));
        }
        AgentResult::Degraded { answer, reason } => {
            info!(
                "   ⚠ [{label}] degraded answer ({reason}), confidence {:.2}",
                answer.confidence
            );
            info!("     {}", truncated(&answer.content, 160));
        }
        AgentResult::NoContent => {
            info!("   ✓ [{label}] no relevant content found");
        }
    }
}

fn truncated(text: &str, limit: usize) -> String {
    if text.chars().count() <= limit {
        return text.to_string();
    }
    let cut: String = text.chars().take(limit).collect();
    format!("{cut}…")
}
