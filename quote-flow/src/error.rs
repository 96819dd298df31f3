use thiserror::Error;

use crate::validation::ValidationErrors;

/// Errors surfaced by the quote-session core.
///
/// Two families of conditions are deliberately NOT errors: guard denials
/// (resolved by redirect) and stale pricing responses (silently discarded).
#[derive(Debug, Error)]
pub enum FlowError {
    /// Client-local validation failure. Blocks submission, never reaches
    /// the network.
    #[error("validation failed: {0}")]
    Validation(ValidationErrors),

    /// Transient failure talking to the quoting service. Retryable;
    /// previously cached state is preserved.
    #[error("quote service error: {0}")]
    Service(String),

    #[error("quote not found: {0}")]
    QuoteNotFound(String),

    #[error("wizard session not found: {0}")]
    SessionNotFound(String),

    /// A step was driven out of order (e.g. coverage submitted before a
    /// quote exists).
    #[error("invalid step transition: {0}")]
    InvalidTransition(String),
}

impl FlowError {
    /// Whether the caller may retry the same operation unchanged.
    pub fn is_retryable(&self) -> bool {
        matches!(self, FlowError::Service(_))
    }
}

pub type Result<T> = std::result::Result<T, FlowError>;
