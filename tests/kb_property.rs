#[macro_use]
extern crate proptest;

use proptest::prelude::{Strategy, prop};

// Generators shared by knowledge-base versioning property tests

/// Generate lowercase word sequences usable as document bodies.
///
/// Constraints:
/// - At least one word, so validation never rejects the content
/// - Words only, so the whitespace tokenization is stable
fn content_strategy() -> impl Strategy<Value = String> {
    prop::string::string_regex("[a-z]{2,10}( [a-z]{2,10}){0,12}").unwrap()
}

// Minimal sanity property using the generator
proptest! {
    #[test]
    fn prop_generated_content_is_ingestible(content in content_strategy()) {
        prop_assert!(!content.trim().is_empty());
    }
}

mod common;
use common::*;

use carbonloom::kb::IngestDisposition;
use carbonloom::types::Metadata;

fn block_on<F: std::future::Future<Output = ()>>(fut: F) {
    let rt = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .unwrap();
    rt.block_on(fut);
}

proptest! {
    /// Property: version ids assigned across an ingest sequence strictly
    /// increase in insertion order, and every distinct body creates its
    /// own document.
    #[test]
    fn prop_version_ids_strictly_increase_across_ingests(doc_count in 1usize..8) {
        block_on(async move {
            let kb = memory_kb().await;
            let mut last_version = 0i64;
            for position in 0..doc_count {
                // Two tokens unique per document keep the word overlap far
                // below the near-duplicate threshold.
                let content = format!(
                    "ledger entry {position} for supplier batch{position} holds tonnes"
                );
                let receipt = kb
                    .add_document(&content, &sentence_chunks(&content), &Metadata::new())
                    .await
                    .expect("ingest");
                assert_eq!(receipt.disposition, IngestDisposition::Created);
                assert!(
                    receipt.version_id > last_version,
                    "version {} must exceed {}",
                    receipt.version_id,
                    last_version
                );
                last_version = receipt.version_id;
            }

            let listed = kb.list_documents().await.expect("list documents");
            assert_eq!(listed.len(), doc_count);
        });
    }
}

proptest! {
    /// Property: re-ingesting byte-identical content is idempotent for
    /// any body, leaving exactly one stored version.
    #[test]
    fn prop_identical_reingest_is_idempotent(content in content_strategy()) {
        block_on(async move {
            let kb = memory_kb().await;
            let chunks = sentence_chunks(&content);

            let first = kb
                .add_document(&content, &chunks, &Metadata::new())
                .await
                .expect("first ingest");
            assert_eq!(first.disposition, IngestDisposition::Created);

            let second = kb
                .add_document(&content, &chunks, &Metadata::new())
                .await
                .expect("re-ingest");
            assert_eq!(second.disposition, IngestDisposition::Unchanged);
            assert_eq!(second.doc_id, first.doc_id);
            assert_eq!(second.version_id, first.version_id);

            let document = kb
                .get_document(&first.doc_id, None)
                .await
                .expect("get document");
            assert_eq!(document.version_history.len(), 1);
            assert_eq!(document.content, content);
        });
    }
}

proptest! {
    /// Property: every update appends exactly one version; the history
    /// stays in ascending version order with the newest entry as the
    /// current view.
    #[test]
    fn prop_updates_append_versions_in_order(
        content in content_strategy(),
        updates in 1usize..5,
    ) {
        block_on(async move {
            let kb = memory_kb().await;
            let first = kb
                .add_document(&content, &sentence_chunks(&content), &Metadata::new())
                .await
                .expect("ingest");

            let mut expected = vec![first.version_id];
            for round in 0..updates {
                let revised = format!("{content} revision {round}");
                let receipt = kb
                    .update_document(
                        &first.doc_id,
                        &revised,
                        &sentence_chunks(&revised),
                        &Metadata::new(),
                    )
                    .await
                    .expect("update");
                assert_eq!(receipt.disposition, IngestDisposition::Updated);
                expected.push(receipt.version_id);
            }

            let document = kb
                .get_document(&first.doc_id, None)
                .await
                .expect("get document");
            assert_eq!(document.version_history.len(), updates + 1);

            let ids: Vec<i64> = document
                .version_history
                .iter()
                .map(|version| version.version_id)
                .collect();
            assert_eq!(ids, expected);
            assert!(ids.windows(2).all(|pair| pair[0] < pair[1]));
            assert_eq!(
                document.current_version.version_id,
                *expected.last().expect("at least the creation version")
            );
        });
    }
}
