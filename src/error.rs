//! Error Types
//!
//! Failures the relay engine reports to its immediate caller. Duplicate
//! deliveries and incomplete reassemblies are normal outcomes and never
//! show up here.

use thiserror::Error;

/// Errors surfaced by the mesh relay engine
#[derive(Debug, Error)]
pub enum MeshError {
    /// A broadcast frame failed structural decoding
    #[error("malformed frame: {0}")]
    MalformedFrame(String),

    /// Radio disabled, socket refused, or relay not started
    #[error("transport unavailable: {0}")]
    TransportUnavailable(String),

    /// The radio cannot carry a frame header plus at least one payload byte
    #[error("payload capacity of {capacity} bytes cannot hold the {header}-byte frame header")]
    PayloadTooSmall { capacity: usize, header: usize },

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Json(#[from] serde_json::Error),
}

impl MeshError {
    pub fn unavailable(reason: impl Into<String>) -> Self {
        MeshError::TransportUnavailable(reason.into())
    }

    pub fn malformed(reason: impl Into<String>) -> Self {
        MeshError::MalformedFrame(reason.into())
    }
}

/// Result alias used across the library
pub type Result<T> = std::result::Result<T, MeshError>;
