//! Error types for the SFU engine

use thiserror::Error;

/// Engine error types
#[derive(Debug, Error)]
pub enum Error {
    #[error("WebRTC error: {0}")]
    WebRtc(#[from] webrtc::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Store error: {0}")]
    Store(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Invalid signaling state: {0}")]
    InvalidState(String),

    #[error("Peer connection not initialized")]
    PeerNotReady,
}

/// Result type for engine operations
pub type Result<T> = std::result::Result<T, Error>;
