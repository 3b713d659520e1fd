//! Typed error taxonomy for the processing core.
//!
//! Four kinds, per the error handling design: transient I/O is logged and
//! dropped, config errors are fatal at startup, invariant violations retire
//! the offending track, shutdown is not an error at all.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum AnprError {
    #[error("transient I/O: {0}")]
    Transient(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("invariant violation: {0}")]
    Invariant(String),

    #[error("shutdown requested")]
    Shutdown,
}

impl AnprError {
    pub fn transient(msg: impl Into<String>) -> Self {
        Self::Transient(msg.into())
    }

    pub fn invariant(msg: impl Into<String>) -> Self {
        Self::Invariant(msg.into())
    }
}

pub type Result<T> = std::result::Result<T, AnprError>;
