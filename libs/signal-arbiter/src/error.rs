//! Arbiter Error Types

use signal_rules::RuleError;
use thiserror::Error;

/// Result type for arbiter operations
pub type Result<T> = std::result::Result<T, ArbiterError>;

/// Arbitration core errors
#[derive(Debug, Error)]
pub enum ArbiterError {
    /// Malformed request (unknown vehicle type, negative count, ...)
    #[error("Validation failed: {0}")]
    Validation(String),

    /// Unknown intersection, vehicle, phase or rule
    #[error("Not found: {resource}")]
    NotFound { resource: String },

    /// Exclusive control already held; only raised where no queue applies
    #[error("Conflict: {0}")]
    Conflict(String),

    /// State moved underneath an operation (e.g. timer fired during clear)
    #[error("Transient state change: {0}")]
    TransientState(String),

    /// Phase sequencing data is corrupt; the intersection holds its last safe phase
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// Rule data error
    #[error("Rule error: {0}")]
    Rule(#[from] RuleError),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl ArbiterError {
    pub fn validation(msg: impl Into<String>) -> Self {
        ArbiterError::Validation(msg.into())
    }

    pub fn not_found(resource: impl Into<String>) -> Self {
        ArbiterError::NotFound {
            resource: resource.into(),
        }
    }

    pub fn configuration(msg: impl Into<String>) -> Self {
        ArbiterError::Configuration(msg.into())
    }

    /// Errors the caller may fix and resubmit
    pub fn is_client_error(&self) -> bool {
        matches!(
            self,
            ArbiterError::Validation(_) | ArbiterError::NotFound { .. }
        )
    }
}
