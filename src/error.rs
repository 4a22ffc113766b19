//! Error taxonomy for the sync engine
//!
//! Every failure the engine can surface is one of these `thiserror` enums.
//! `SyncError` is what managers record and hand to error subscribers, so it
//! is `Clone`: transport failures carry rendered messages instead of the
//! underlying `reqwest::Error`.

use thiserror::Error;

use crate::tree::Address;

/// Failures while applying patch actions or resolving addresses.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PatchError {
    #[error("component not found at address {address}")]
    NotFound { address: Address },

    #[error("index {index} out of bounds at address {address} (len {len})")]
    IndexOutOfBounds {
        address: Address,
        index: usize,
        len: usize,
    },

    #[error("'{kind}' action requires a non-empty address")]
    EmptyAddress { kind: &'static str },
}

/// Failures of the request/response round-trip.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    #[error("server responded {status} for {url}")]
    Status { status: u16, url: String },

    #[error("request failed: {0}")]
    Request(String),

    #[error("response body unreadable: {0}")]
    Body(String),

    #[error("response could not be decoded: {0}")]
    Decode(String),

    #[error("invalid url: {0}")]
    InvalidUrl(String),
}

impl From<reqwest::Error> for TransportError {
    fn from(error: reqwest::Error) -> Self {
        if error.is_decode() {
            TransportError::Decode(error.to_string())
        } else if error.is_body() {
            TransportError::Body(error.to_string())
        } else {
            TransportError::Request(error.to_string())
        }
    }
}

impl From<url::ParseError> for TransportError {
    fn from(error: url::ParseError) -> Self {
        TransportError::InvalidUrl(error.to_string())
    }
}

/// Errors recorded by a session manager and delivered to error subscribers.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SyncError {
    #[error("transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("patch error: {0}")]
    Patch(#[from] PatchError),

    #[error("interaction cancelled")]
    Cancelled,

    #[error("session terminated")]
    Terminated,

    #[error("invalid state: {0}")]
    InvalidState(String),
}

/// Configuration loading errors.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("missing configuration value: {0}")]
    Missing(&'static str),

    #[error("invalid value for {key}: {message}")]
    Invalid { key: &'static str, message: String },
}

pub type Result<T> = std::result::Result<T, SyncError>;
