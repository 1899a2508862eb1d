// Scripted Gateway - Error Taxonomy
// Copyright 2026 Joseph Stone - All Rights Reserved
//
// One error type for every service behind the router.
// UntrustedToken and PathEscape never carry detail: the router renders
// them identically so a client cannot tell which check failed.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum GatewayError {
    /// Token unknown, revoked, or malformed.
    #[error("untrusted token")]
    UntrustedToken,

    /// Resolution would leave the project root.
    #[error("path escapes project root")]
    PathEscape,

    /// Resource absent or of a kind the operation does not handle.
    #[error("not found")]
    NotFound,

    /// Version marker supplied by the client no longer matches the disk.
    #[error("version marker conflict")]
    Conflict,

    /// None of the client's acceptable representations can be produced.
    #[error("not acceptable")]
    NotAcceptable,

    /// Command name not defined for the project.
    #[error("command undefined: {0}")]
    CommandUndefined(String),

    #[error("io: {0}")]
    Io(#[from] std::io::Error),

    #[error("internal: {0}")]
    Internal(String),
}

impl GatewayError {
    /// True for the failures that must render as the uniform forbidden outcome.
    pub fn is_forbidden(&self) -> bool {
        matches!(self, GatewayError::UntrustedToken | GatewayError::PathEscape)
    }
}

pub type GatewayResult<T> = Result<T, GatewayError>;

// ============================================================================
// TESTS
// ============================================================================
