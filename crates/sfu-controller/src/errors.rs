//! SFU controller error types.
//!
//! No error returned from an event handler ends the engine loop: the engine logs the
//! error, counts it, and moves on to the next message.

use thiserror::Error;

/// SFU controller error type.
#[derive(Debug, Error)]
pub enum SfuError {
    /// Configuration error.
    #[error("Configuration error: {0}")]
    Config(String),

    /// Admission key failed validation.
    #[error("Admission key error: {0}")]
    AdmissionKey(AdmissionKeyError),

    /// Inbound signaling frame could not be decoded.
    #[error("Decode error: {0}")]
    Decode(String),

    /// Outbound signaling event could not be encoded.
    #[error("Encode error: {0}")]
    Encode(String),

    /// No admitted session matches the event's admission key.
    #[error("No session for admission key")]
    UnknownAdmissionKey,

    /// Peer is neither admitted nor pending.
    #[error("Peer not found: {0}")]
    PeerNotFound(String),

    /// Conflicting state (e.g., admission key already registered).
    #[error("Conflict: {0}")]
    Conflict(String),

    /// Media endpoint creation or command failed.
    #[error("Endpoint error: {0}")]
    Endpoint(String),

    /// The engine is shutting down.
    #[error("SFU is draining")]
    Draining,

    /// Internal error (channel closed, task gone).
    #[error("Internal error: {0}")]
    Internal(String),
}

/// Admission key validation errors.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum AdmissionKeyError {
    /// Key is not `<nonce_hex>.<tag_hex>` with the expected lengths.
    #[error("Malformed admission key")]
    Malformed,

    /// HMAC verification failed.
    #[error("Invalid admission key signature")]
    InvalidSignature,
}

impl SfuError {
    /// Bounded label for metrics.
    #[must_use]
    pub const fn metric_label(&self) -> &'static str {
        match self {
            SfuError::Config(_) => "config",
            SfuError::AdmissionKey(_) => "admission_key",
            SfuError::Decode(_) => "decode",
            SfuError::Encode(_) => "encode",
            SfuError::UnknownAdmissionKey => "unknown_key",
            SfuError::PeerNotFound(_) => "peer_not_found",
            SfuError::Conflict(_) => "conflict",
            SfuError::Endpoint(_) => "endpoint",
            SfuError::Draining => "draining",
            SfuError::Internal(_) => "internal",
        }
    }
}

impl From<AdmissionKeyError> for SfuError {
    fn from(err: AdmissionKeyError) -> Self {
        SfuError::AdmissionKey(err)
    }
}

impl From<serde_json::Error> for SfuError {
    fn from(err: serde_json::Error) -> Self {
        SfuError::Decode(err.to_string())
    }
}
