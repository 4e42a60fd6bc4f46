//! Errors returned to participants by coordinator operations.
//!
//! The message of each variant is what the participant sees; the variant
//! decides the HTTP status.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum CoordinatorError {
    /// Unknown round or Alice.
    #[error("{0}")]
    NotFound(String),

    /// The call is not legal in the round's current phase.
    #[error("{0}")]
    WrongPhase(String),

    /// The same input, output or blinded output is already registered.
    #[error("{0}")]
    AlreadyRegistered(String),

    /// An input failed chain or referee checks.
    #[error("{0}")]
    RejectedInput(String),

    /// Malformed or inconsistent request.
    #[error("{0}")]
    ProtocolViolation(String),

    #[error("Internal error: {0}")]
    Internal(#[from] anyhow::Error),
}

impl CoordinatorError {
    pub fn round_not_found(id: u64) -> Self {
        CoordinatorError::NotFound(format!("Round not found: {}.", id))
    }

    pub fn alice_not_found(id: impl std::fmt::Display) -> Self {
        CoordinatorError::NotFound(format!("Alice not found: {}.", id))
    }

    pub fn rejected(msg: impl Into<String>) -> Self {
        CoordinatorError::RejectedInput(msg.into())
    }

    pub fn violation(msg: impl Into<String>) -> Self {
        CoordinatorError::ProtocolViolation(msg.into())
    }
}

pub type CoordinatorResult<T> = std::result::Result<T, CoordinatorError>;
