//! Error types for the OSC layer.

use thiserror::Error;

/// Errors surfaced by the transport and bridge.
#[derive(Debug, Error)]
pub enum OscError {
    #[error("failed to bind UDP port {port}: {source}")]
    Bind {
        port: u16,
        source: std::io::Error,
    },

    #[error("OSC send failed: {source}")]
    Send { source: std::io::Error },

    #[error("OSC encode failed: {detail}")]
    Encode { detail: String },

    #[error("no reply on {addr} within {ms} ms")]
    Timeout { addr: String, ms: u64 },

    #[error("malformed reply on {addr}: {detail}")]
    Protocol { addr: String, detail: String },

    #[error("transport closed")]
    Closed,
}

impl OscError {
    /// True for errors that indicate the peer did not answer in time.
    pub fn is_timeout(&self) -> bool {
        matches!(self, OscError::Timeout { .. })
    }
}

pub type Result<T> = std::result::Result<T, OscError>;
