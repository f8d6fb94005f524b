//! Transport abstraction traits for Ferrobus.
//!
//! The bus speaks a byte-oriented protocol, so a transport only has to
//! produce bidirectional byte streams. Everything above that (handshake,
//! framing, routing) lives in the server.

use async_trait::async_trait;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite};

/// A bidirectional byte stream to one client.
pub trait ByteStream: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T: AsyncRead + AsyncWrite + Send + Unpin> ByteStream for T {}

/// Transport errors.
#[derive(Debug, Error)]
pub enum TransportError {
    /// Malformed listen or connect address.
    #[error("Invalid address '{address}': {reason}")]
    InvalidAddress { address: String, reason: String },

    /// Address family not available on this platform.
    #[error("Unsupported address family: {0}")]
    Unsupported(String),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl TransportError {
    pub(crate) fn invalid(address: &str, reason: impl Into<String>) -> Self {
        TransportError::InvalidAddress {
            address: address.to_string(),
            reason: reason.into(),
        }
    }
}

/// A freshly accepted client.
pub struct Accepted {
    /// The client's byte stream.
    pub stream: Box<dyn ByteStream>,
    /// Human-readable peer description for logs.
    pub peer: String,
}

impl std::fmt::Debug for Accepted {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Accepted").field("peer", &self.peer).finish_non_exhaustive()
    }
}

/// A listener that accepts client streams.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Accept a new client.
    ///
    /// This method blocks until a client connects or an error occurs.
    async fn accept(&self) -> Result<Accepted, TransportError>;

    /// Get the transport name (e.g., "tcp", "unix").
    fn name(&self) -> &'static str;

    /// The address clients should use to reach this listener,
    /// e.g. `tcp:127.0.0.1:7000`.
    fn connect_string(&self) -> String;

    /// Check if the transport is healthy.
    fn is_healthy(&self) -> bool {
        true
    }
}
