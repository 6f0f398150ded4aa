//! Error types for the dispatch core.
//!
//! Every failure that crosses a component boundary is one of these variants.
//! Callers receive the operator-readable code and message; full detail stays
//! in the logs and never crosses the boundary.

use thiserror::Error;

/// Errors surfaced by the dispatch pipeline and its components.
#[derive(Debug, Error)]
pub enum DispatchError {
    /// Caller is not authenticated. Never retried.
    #[error("unauthenticated: {0}")]
    Unauthenticated(String),

    /// Caller lacks permission for the operation. Never retried.
    #[error("permission denied: {0}")]
    PermissionDenied(String),

    /// Malformed or out-of-range input. Never retried.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// A required entity is missing (no drivers, missing profile).
    #[error("not found: {0}")]
    NotFound(String),

    /// An admission gauge rejected the request. Caller may retry later.
    #[error("resource exhausted: {resource} at {current}/{limit}, requested {requested}")]
    ResourceExhausted {
        resource: &'static str,
        current: u64,
        limit: u64,
        requested: u64,
    },

    /// The circuit for this operation is open; fail fast until the reset
    /// deadline passes.
    #[error("circuit open for operation '{operation}'")]
    CircuitOpen { operation: String },

    /// The operation exceeded its deadline.
    #[error("operation '{operation}' timed out after {timeout_ms} ms")]
    Timeout { operation: String, timeout_ms: u64 },

    /// External store read/write failure. Retried by the retry wrapper.
    #[error("transient failure: {0}")]
    Transient(String),

    /// Unexpected failure. The message shown to callers is generic; the
    /// detail field is for logs only.
    #[error("internal error")]
    Internal(String),
}

impl DispatchError {
    /// Stable operator-readable code for this error.
    pub fn code(&self) -> &'static str {
        match self {
            Self::Unauthenticated(_) => "UNAUTHENTICATED",
            Self::PermissionDenied(_) => "PERMISSION_DENIED",
            Self::InvalidArgument(_) => "INVALID_ARGUMENT",
            Self::NotFound(_) => "NOT_FOUND",
            Self::ResourceExhausted { .. } => "RESOURCE_EXHAUSTED",
            Self::CircuitOpen { .. } => "CIRCUIT_OPEN",
            Self::Timeout { .. } => "TIMEOUT",
            Self::Transient(_) => "TRANSIENT",
            Self::Internal(_) => "INTERNAL",
        }
    }

    /// Whether the retry wrapper may attempt this operation again.
    ///
    /// Auth, validation, not-found, and open-circuit failures are rethrown
    /// immediately; everything else counts against the attempt budget.
    pub fn is_retryable(&self) -> bool {
        !matches!(
            self,
            Self::Unauthenticated(_)
                | Self::PermissionDenied(_)
                | Self::InvalidArgument(_)
                | Self::NotFound(_)
                | Self::CircuitOpen { .. }
        )
    }

    /// Whether a failure of this class counts toward opening a circuit.
    ///
    /// Only transient and timeout failures indicate collaborator trouble;
    /// caller mistakes do not open circuits.
    pub fn trips_breaker(&self) -> bool {
        matches!(self, Self::Transient(_) | Self::Timeout { .. })
    }
}
