//! Text-generation seam.
//!
//! The engine never calls a model directly; it consumes a [`Generator`]
//! handle injected at construction. Both failure modes are recoverable:
//! the pipeline falls back to assembled expert output when generation is
//! unavailable or rate limited.

use async_trait::async_trait;
use miette::Diagnostic;
use thiserror::Error;

/// Errors from a generation backend. Callers treat both variants as
/// recoverable and degrade rather than abort.
#[derive(Debug, Error, Diagnostic)]
pub enum GenerateError {
    #[error("generation backend unavailable ({provider}): {message}")]
    #[diagnostic(
        code(carbonloom::generate::unavailable),
        help("The answer is assembled from expert output until the backend returns.")
    )]
    Unavailable {
        provider: &'static str,
        message: String,
    },

    #[error("generation backend rate limited ({provider})")]
    #[diagnostic(code(carbonloom::generate::rate_limited))]
    RateLimited {
        provider: &'static str,
        retry_after_ms: Option<u64>,
    },
}

/// Sampling parameters forwarded to the backend.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct GenerationParams {
    pub max_tokens: usize,
    pub temperature: f32,
}

impl Default for GenerationParams {
    fn default() -> Self {
        Self {
            max_tokens: 512,
            temperature: 0.2,
        }
    }
}

/// A text-generation call.
#[async_trait]
pub trait Generator: Send + Sync {
    async fn generate(
        &self,
        prompt: &str,
        params: &GenerationParams,
    ) -> Result<String, GenerateError>;
}

/// Deterministic offline generator.
///
/// Echoes the synthesis prompt into a compact answer without any model
/// call. Keeps demos and tests hermetic; production callers inject a real
/// client instead.
#[derive(Clone, Copy, Debug, Default)]
pub struct TemplateGenerator;

#[async_trait]
impl Generator for TemplateGenerator {
    async fn generate(
        &self,
        prompt: &str,
        params: &GenerationParams,
    ) -> Result<String, GenerateError> {
        let mut lines: Vec<&str> = prompt
            .lines()
            .map(str::trim)
            .filter(|line| !line.is_empty())
            .collect();
        lines.truncate(params.max_tokens.max(1));
        Ok(lines.join(" "))
    }
}
