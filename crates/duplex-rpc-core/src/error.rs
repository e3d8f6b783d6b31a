//! Error types for duplex-rpc.
//!
//! Caller-side failures (timeout, remote failure, mismatch, missing peer) surface
//! as `Err` at the `fire` call site. Responder-side failures never reach the
//! local caller: they are converted into a failure Response packet instead.

use std::time::Duration;
use thiserror::Error;

/// Main error type for duplex-rpc.
#[derive(Debug, Error)]
pub enum RpcError {
    // Call outcome errors
    #[error("Request timeout: no response for {event_name} after {after:?}")]
    Timeout { event_name: String, after: Duration },

    #[error("{message}")]
    Remote { message: String },

    #[error("Packet id mismatch: expected {expected}, got {actual}")]
    CorrelationMismatch { expected: String, actual: String },

    #[error("There is no {event_name} handler")]
    UnregisteredEvent { event_name: String },

    #[error("Peer not found: {peer}")]
    PeerNotFound { peer: String },

    #[error("Channel closed")]
    ChannelClosed,

    #[error("No peer produced a result for {event_name} ({peers} peers settled)")]
    NoDecisiveResult { event_name: String, peers: usize },

    // Protocol errors
    #[error("Malformed packet: {reason}")]
    MalformedPacket { reason: String },

    #[error("Malformed origin: expected {expected}, got {actual}")]
    MalformedOrigin { expected: String, actual: String },

    // Configuration errors
    #[error("Callback for {event_name} has already been registered.")]
    DuplicateRegistration { event_name: String },

    #[error("Validation error for {field}: {message}")]
    Validation { field: String, message: String },

    // Transport errors
    #[error("Transport error: {message}")]
    Transport { message: String },

    #[error("IO error: {message}")]
    Io {
        message: String,
        #[source]
        source: Option<std::io::Error>,
    },

    #[error("JSON error: {message}")]
    Json {
        message: String,
        #[source]
        source: Option<serde_json::Error>,
    },
}

/// Result type alias for duplex-rpc operations.
pub type Result<T> = std::result::Result<T, RpcError>;

impl From<std::io::Error> for RpcError {
    fn from(err: std::io::Error) -> Self {
        RpcError::Io {
            message: err.to_string(),
            source: Some(err),
        }
    }
}

impl From<serde_json::Error> for RpcError {
    fn from(err: serde_json::Error) -> Self {
        RpcError::Json {
            message: err.to_string(),
            source: Some(err),
        }
    }
}

impl RpcError {
    /// Whether this error is the per-call timeout.
    pub fn is_timeout(&self) -> bool {
        matches!(self, RpcError::Timeout { .. })
    }

    /// Whether the target peer disappeared before or during the call.
    pub fn is_peer_gone(&self) -> bool {
        matches!(self, RpcError::PeerNotFound { .. } | RpcError::ChannelClosed)
    }

    /// The string carried in the `error` field of a failure Response.
    ///
    /// Remote failures are forwarded verbatim, so a relayed error keeps
    /// the handler message it started with.
    pub fn wire_message(&self) -> String {
        match self {
            RpcError::Remote { message } => message.clone(),
            other => other.to_string(),
        }
    }
}
