//! Error types for AppForge.
//!
//! Caller-facing failures carry the machine-readable code the platform API
//! exposes (e.g. `no_idle_vms`, `max_staged_builds`) as the message payload.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("resource unavailable: {0}")]
    ResourceUnavailable(String),

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("validation failed: {0}")]
    Validation(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("forbidden: {0}")]
    Forbidden(String),

    #[error("storage error: {0}")]
    Storage(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl Error {
    /// The machine-readable error code, when the variant carries one.
    pub fn code(&self) -> &str {
        match self {
            Error::ResourceUnavailable(c)
            | Error::Conflict(c)
            | Error::Validation(c)
            | Error::NotFound(c)
            | Error::Forbidden(c)
            | Error::Storage(c)
            | Error::Internal(c) => c,
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
