//! Error types for the broker engine.
//!
//! Library-internal code returns [`BrokerError`] so callers can match on
//! failure kind; the binary entry point collapses everything into
//! `anyhow::Result` the way a daemon's top level usually does.

use thiserror::Error;

/// Errors surfaced by the broker's components.
#[derive(Debug, Error)]
pub enum BrokerError {
    /// The transport failed to complete a round (timeout, TLS, non-2xx, decode).
    #[error("transport failure: {0}")]
    Transport(String),

    /// Persisted state could not be parsed, even from the `.old` fallback.
    #[error("store corrupt: {0}")]
    StoreCorrupt(String),

    /// Underlying filesystem operation failed.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON (de)serialization failed.
    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),

    /// A lookup against a caller-supplied name found nothing.
    #[error("not found: {0}")]
    NotFound(String),

    /// An invariant the broker depends on was violated. Never expected in
    /// correct operation; the only variant `crash_if_fatal` escalates.
    #[error("invariant violated: {0}")]
    Fatal(String),
}

impl BrokerError {
    /// Crashes the process with a diagnostic if `self` is `Fatal`; every
    /// other variant passes through unchanged. The only panicking path in
    /// this crate, everywhere else propagates `Result`.
    pub fn crash_if_fatal(self) -> Self {
        match self {
            BrokerError::Fatal(msg) => panic!("invariant violated: {msg}"),
            other => other,
        }
    }
}

/// Convenience alias for fallible broker operations.
pub type Result<T> = std::result::Result<T, BrokerError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn crash_if_fatal_passes_through_non_fatal_variants() {
        let err = BrokerError::Transport("boom".into()).crash_if_fatal();
        assert!(matches!(err, BrokerError::Transport(_)));
    }

    #[test]
    #[should_panic(expected = "invariant violated: boom")]
    fn crash_if_fatal_panics_on_fatal() {
        let _ = BrokerError::Fatal("boom".into()).crash_if_fatal();
    }
}
