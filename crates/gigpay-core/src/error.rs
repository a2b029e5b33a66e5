use thiserror::Error;

/// Escrow engine errors.
#[derive(Debug, Error)]
pub enum EscrowError {
    #[error("Validation failed: {0}")]
    Validation(String),

    #[error("Invalid transition: cannot apply '{event}' while '{from}'")]
    InvalidTransition { from: String, event: String },

    #[error("Invalid state: {0}")]
    InvalidState(String),

    #[error("Not authorized: {0}")]
    NotAuthorized(String),

    #[error("Insufficient balance: required {required_minor} minor units, available {available_minor}")]
    InsufficientBalance {
        required_minor: u64,
        available_minor: u64,
    },

    #[error("Gateway error: {0}")]
    Gateway(String),

    #[error("Payment signature mismatch")]
    SignatureMismatch,

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Serialization error: {0}")]
    Serialization(String),
}

impl EscrowError {
    pub fn invalid_transition(from: impl Into<String>, event: impl Into<String>) -> Self {
        Self::InvalidTransition {
            from: from.into(),
            event: event.into(),
        }
    }

    /// Gateway errors are the only variant callers may retry: no local
    /// state has changed when one is returned.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Gateway(_))
    }
}
