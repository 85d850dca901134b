//! Domain error model.

use thiserror::Error;

/// Result type returned by controllers and other business code.
pub type DomainResult<T> = Result<T, DomainError>;

/// Business-level rejection.
///
/// Keep this focused on deterministic failures decided by controllers
/// (validation, invariants, unexpected payloads). Storage and transport
/// failures belong to the infrastructure error types.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DomainError {
    /// A value failed validation (e.g. malformed input).
    #[error("validation failed: {0}")]
    Validation(String),

    /// A domain invariant was violated.
    #[error("invariant violated: {0}")]
    InvariantViolation(String),

    /// A referenced entity does not exist (domain-level).
    #[error("not found: {0}")]
    NotFound(String),

    /// The command or event carried a payload the controller cannot use.
    #[error(transparent)]
    Payload(#[from] PayloadError),

    /// Authorization failure at the domain boundary.
    #[error("unauthorized")]
    Unauthorized,
}

impl DomainError {
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    pub fn invariant(msg: impl Into<String>) -> Self {
        Self::InvariantViolation(msg.into())
    }

    pub fn not_found(msg: impl Into<String>) -> Self {
        Self::NotFound(msg.into())
    }
}

/// Failure to turn a payload into (or out of) the shape a consumer expects.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum PayloadError {
    #[error("payload encode failed for {name}: {reason}")]
    Encode { name: String, reason: String },

    #[error("payload decode failed for {name}: {reason}")]
    Decode { name: String, reason: String },

    /// No handling is defined for this message name.
    #[error("unexpected payload for {name}")]
    Unexpected { name: String },
}

impl PayloadError {
    pub fn unexpected(name: impl Into<String>) -> Self {
        Self::Unexpected { name: name.into() }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn payload_errors_convert_into_domain_errors() {
        let err: DomainError = PayloadError::unexpected("placed").into();
        assert_eq!(err.to_string(), "unexpected payload for placed");
        assert!(matches!(err, DomainError::Payload(PayloadError::Unexpected { .. })));
    }
}
