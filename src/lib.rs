//! # Carbonloom: Retrieval and Orchestration for Scope 3 Emissions QA
//!
//! Carbonloom answers questions over a corpus of Scope 3 (value-chain)
//! emissions documents. Documents are indexed at three granularity levels,
//! queried through a hybrid semantic/keyword/metadata ranking, analyzed by
//! a routed mixture of domain experts, and synthesized into one answer.
//!
//! ## Core Concepts
//!
//! - **Granularity levels**: every document is embedded as whole-document
//!   windows, paragraph-sized chunks, and sentence units, each in its own
//!   vector space
//! - **Fusion**: per-level rankings are combined by weighted or ensemble
//!   fusion into one stable document ranking
//! - **Knowledge base**: the authoritative store with content-hash
//!   deduplication, append-only version history, and a best-effort
//!   relationship mirror
//! - **Experts**: a router maps each query to confidence-weighted expert
//!   assignments and executes them in dependency-ordered stages
//! - **Degraded modes**: optional collaborators failing (generation, the
//!   graph mirror, a single expert) reduce the answer, never fail it
//!
//! ## Quick Start
//!
//! ### Ingest and ask
//!
//! The shipped [`embed::HashEmbedder`] and [`generate::TemplateGenerator`]
//! are deterministic and offline, so the whole engine runs hermetically:
//!
//! ```
//! use std::sync::Arc;
//!
//! use carbonloom::config::EngineConfig;
//! use carbonloom::embed::HashEmbedder;
//! use carbonloom::generate::TemplateGenerator;
//! use carbonloom::kb::MemoryGraphStore;
//! use carbonloom::pipeline::Pipeline;
//! use carbonloom::types::{Metadata, QueryContext};
//!
//! # tokio::runtime::Builder::new_current_thread().enable_all().build().unwrap().block_on(async {
//! let config = EngineConfig::new();
//! let embedder = Arc::new(HashEmbedder::from_levels(&config.levels));
//! let pipeline = Pipeline::open(
//!     &config,
//!     embedder,
//!     Arc::new(TemplateGenerator),
//!     Arc::new(MemoryGraphStore::new()),
//! )
//! .await
//! .unwrap();
//!
//! let metadata = Metadata::new().with("category", serde_json::json!("business_travel"));
//! let report = pipeline
//!     .process_document(
//!         "Scope 3 business travel emissions were 140 tonnes in 2023.",
//!         &metadata,
//!     )
//!     .await
//!     .unwrap();
//! assert!(!report.doc_id.is_empty());
//!
//! let result = pipeline
//!     .process_query("business travel emissions", &QueryContext::new())
//!     .await
//!     .unwrap();
//! assert!(!result.is_no_content());
//! # });
//! ```
//!
//! ### Scoping a query
//!
//! A [`types::QueryContext`] narrows retrieval to matching documents and
//! steers expert analysis:
//!
//! ```
//! use carbonloom::types::QueryContext;
//!
//! let context = QueryContext::new()
//!     .with_category("transportation")
//!     .with_year(2023);
//! assert!(!context.is_empty());
//! ```
//!
//! ### Injecting real backends
//!
//! Embedding, generation, and the graph mirror are trait objects injected
//! at construction ([`embed::Embedder`], [`generate::Generator`],
//! [`kb::GraphStore`]). Production callers implement those traits against
//! their model/graph services; everything else stays unchanged.
//!
//! ## Module Guide
//!
//! - [`pipeline`] - End-to-end composition: ingest, query, stats
//! - [`retriever`] - Multi-level vector retrieval and result fusion
//! - [`search`] - Hybrid ranking with query expansion
//! - [`index`] - Flat and clustered vector indexes with atomic snapshots
//! - [`kb`] - Versioned document store and relationship mirror
//! - [`router`] - Mixture-of-experts routing and staged execution
//! - [`embed`] / [`generate`] - Injected model seams, deterministic defaults
//! - [`config`] - Engine configuration and tuning knobs
//! - [`error`] - Aggregated diagnostics for whole-engine callers
//! - [`types`] - Shared domain types

pub mod config;
pub mod embed;
pub mod error;
pub mod generate;
pub mod index;
pub mod kb;
pub mod pipeline;
pub mod retriever;
pub mod router;
pub mod search;
pub mod types;
pub mod util;
