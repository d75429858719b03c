//! Error types shared across the presence layer.
//!
//! None of these ever reach the hosting page as a fatal condition: the
//! session runtime logs and absorbs transport and protocol failures.

use thiserror::Error;

use crate::features::CollabFeature;

/// Wire-level failures: encoding, decoding and payload validation.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ProtocolError {
    #[error("serialization error: {0}")]
    Serialization(String),
    #[error("deserialization error: {0}")]
    Deserialization(String),
    #[error("malformed payload: {0}")]
    Malformed(String),
    #[error("invalid room id: {0:?}")]
    InvalidRoomId(String),
}

/// Failures reported by a [`Transport`](crate::transport::Transport).
#[derive(Debug, Clone, PartialEq, Error)]
pub enum TransportError {
    #[error("transport is disconnected")]
    Disconnected,
    #[error("connection closed")]
    ConnectionClosed,
    #[error("handshake rejected: {0}")]
    Rejected(String),
    #[error("i/o error: {0}")]
    Io(String),
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
}

/// Top-level error for session setup and configuration.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum CollabError {
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
    #[error("invalid configuration: {0}")]
    Config(String),
    #[error("feature {feature} requires {requires}")]
    MissingFeatureDependency {
        feature: CollabFeature,
        requires: CollabFeature,
    },
    #[error("collaboration session is closed")]
    SessionClosed,
}
