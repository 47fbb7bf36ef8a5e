//! Rule Error Types

use thiserror::Error;

use crate::types::RuleId;

/// Result type for rule operations
pub type Result<T> = std::result::Result<T, RuleError>;

/// Rule store and selector errors
#[derive(Debug, Error)]
pub enum RuleError {
    /// Rule not found
    #[error("Rule not found: {0}")]
    NotFound(RuleId),

    /// Rule exists but is switched off
    #[error("Rule {0} is not active")]
    Inactive(RuleId),

    /// Rule data is malformed (bounds inverted, missing window edge, ...)
    #[error("Invalid rule {rule}: {reason}")]
    InvalidRule { rule: String, reason: String },

    /// Selector configuration is unusable
    #[error("Invalid selector configuration: {0}")]
    InvalidConfig(String),
}

impl RuleError {
    pub(crate) fn invalid(rule: &str, reason: impl Into<String>) -> Self {
        RuleError::InvalidRule {
            rule: rule.to_string(),
            reason: reason.into(),
        }
    }
}
