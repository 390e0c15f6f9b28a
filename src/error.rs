//! Error taxonomy shared across the crate.

use thiserror::Error;

/// Crate-wide error type.
///
/// The REST layer maps `Validation` and `InvariantViolation` to 400,
/// `NotFound` to 404, and everything else to 500. The reconciler treats
/// `Storage` and `Kernel` failures as transient and retries on the next
/// tick; only startup failures abort the process.
#[derive(Debug, Error)]
pub enum Error {
    /// Malformed model input: bad IPv4 literal, reversed range, unknown
    /// protocol, out-of-range port.
    #[error("{0}")]
    Validation(String),

    /// A write was refused to preserve a referential or uniqueness
    /// invariant.
    #[error("{0}")]
    InvariantViolation(String),

    /// Unknown entity id.
    #[error("{0} not found")]
    NotFound(&'static str),

    /// Database failure.
    #[error("storage error: {0}")]
    Storage(#[from] rusqlite::Error),

    /// I/O failure.
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    /// Packet-filter transaction failure.
    #[error("kernel error: {0}")]
    Kernel(String),

    /// Background task failure.
    #[error("internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Validation error from any displayable message.
    pub fn validation(msg: impl Into<String>) -> Self {
        Error::Validation(msg.into())
    }

    /// Referential delete refusal naming the number of referring rules.
    pub fn in_use(entity: &str, rule_count: i64) -> Self {
        Error::InvariantViolation(format!(
            "cannot delete {}: it is used by {} rules",
            entity, rule_count
        ))
    }

    /// Whether this error should surface as a client error (HTTP 400).
    pub fn is_client_error(&self) -> bool {
        matches!(self, Error::Validation(_) | Error::InvariantViolation(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_in_use_message() {
        let err = Error::in_use("backend set", 1);
        assert_eq!(
            err.to_string(),
            "cannot delete backend set: it is used by 1 rules"
        );
    }

    #[test]
    fn test_not_found_message() {
        let err = Error::NotFound("rule");
        assert_eq!(err.to_string(), "rule not found");
    }

    #[test]
    fn test_client_error_classification() {
        assert!(Error::validation("bad input").is_client_error());
        assert!(Error::in_use("source definition", 3).is_client_error());
        assert!(!Error::NotFound("backend").is_client_error());
        assert!(!Error::Kernel("commit failed".to_string()).is_client_error());
    }
}
