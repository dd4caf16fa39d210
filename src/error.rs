//! Crate-level error aggregation.
//!
//! Each module owns its focused error enum; this one exists for callers
//! that drive the whole engine and want a single `?` type.

use miette::Diagnostic;
use thiserror::Error;

use crate::embed::EmbedError;
use crate::generate::GenerateError;
use crate::index::IndexError;
use crate::kb::KbError;
use crate::retriever::RetrieveError;
use crate::search::SearchError;

/// Any failure the engine surfaces to a caller.
#[derive(Debug, Error, Diagnostic)]
pub enum EngineError {
    #[error(transparent)]
    #[diagnostic(transparent)]
    Index(#[from] IndexError),

    #[error(transparent)]
    #[diagnostic(transparent)]
    Retrieve(#[from] RetrieveError),

    #[error(transparent)]
    #[diagnostic(transparent)]
    Search(#[from] SearchError),

    #[error(transparent)]
    #[diagnostic(transparent)]
    Kb(#[from] KbError),

    #[error(transparent)]
    #[diagnostic(transparent)]
    Embed(#[from] EmbedError),

    #[error(transparent)]
    #[diagnostic(transparent)]
    Generate(#[from] GenerateError),
}
