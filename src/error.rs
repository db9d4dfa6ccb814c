//! Error types for device access and override bookkeeping

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    /// Handshake rejected, server signature mismatch, `/auth/me` false or
    /// an authenticated call attempted without a session.
    #[error("authentication error: {0}")]
    Authentication(String),

    /// Network failure, non-2xx status or a failing helper process.
    #[error("transport error: {0}")]
    Transport(String),

    /// Malformed or incomplete response.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// Out-of-range slot address or malformed day string.
    #[error("validation error: {0}")]
    Validation(String),

    /// Store file unwritable or not lockable.
    #[error("persistence error: {0}")]
    Persistence(String),
}

impl Error {
    pub fn authentication(msg: impl Into<String>) -> Self {
        Self::Authentication(msg.into())
    }

    pub fn transport(msg: impl Into<String>) -> Self {
        Self::Transport(msg.into())
    }

    pub fn protocol(msg: impl Into<String>) -> Self {
        Self::Protocol(msg.into())
    }

    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    pub fn persistence(msg: impl Into<String>) -> Self {
        Self::Persistence(msg.into())
    }
}

pub type Result<T> = std::result::Result<T, Error>;
