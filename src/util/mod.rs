//! Small shared utilities with no domain knowledge of their own.

pub mod cache;

pub use cache::LruCache;

use uuid::Uuid;

/// Fresh short document id: `doc_` plus eight hex characters.
pub(crate) fn generate_doc_id() -> String {
    let hex = Uuid::new_v4().simple().to_string();
    format!("doc_{}", &hex[..8])
}
