//! Error types for the reconciler.

use thiserror::Error;

use cirrus_core::ConfigError;
use cirrus_state::StateError;

/// Result type alias for reconciler operations.
pub type ReconcileResult<T> = Result<T, ReconcileError>;

/// Errors that abort a tick. Nothing is committed when one is returned.
#[derive(Debug, Error)]
pub enum ReconcileError {
    #[error("state store error: {0}")]
    State(#[from] StateError),

    #[error("config error: {0}")]
    Config(#[from] ConfigError),

    #[error("invariant violated: {0}")]
    Invariant(String),

    #[error("failed to observe cluster: {0}")]
    Observe(String),
}
