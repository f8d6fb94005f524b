//! TCP transport.

use async_trait::async_trait;
use std::net::SocketAddr;
use tokio::net::TcpListener;
use tracing::{debug, info, warn};

use crate::traits::{Accepted, Transport, TransportError};

/// TCP listener transport.
pub struct TcpTransport {
    listener: TcpListener,
    local_addr: SocketAddr,
}

impl TcpTransport {
    /// Bind a TCP listener.
    ///
    /// Port 0 picks a free port; see [`TcpTransport::local_addr`].
    ///
    /// # Errors
    ///
    /// Returns an error if binding to the address fails.
    pub async fn bind(addr: SocketAddr) -> Result<Self, TransportError> {
        let listener = TcpListener::bind(addr).await?;
        let local_addr = listener.local_addr()?;

        info!("TCP transport listening on {}", local_addr);

        Ok(Self {
            listener,
            local_addr,
        })
    }

    /// Get the local address this transport is bound to.
    #[must_use]
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }
}

#[async_trait]
impl Transport for TcpTransport {
    async fn accept(&self) -> Result<Accepted, TransportError> {
        let (stream, addr) = self.listener.accept().await?;

        // Bus messages are small and latency-sensitive
        if let Err(e) = stream.set_nodelay(true) {
            warn!("Failed to set TCP_NODELAY for {}: {}", addr, e);
        }
        debug!("Accepted TCP connection from {}", addr);

        Ok(Accepted {
            stream: Box::new(stream),
            peer: addr.to_string(),
        })
    }

    fn name(&self) -> &'static str {
        "tcp"
    }

    fn connect_string(&self) -> String {
        format!("tcp:{}", self.local_addr)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpStream;

    #[tokio::test]
    async fn test_accept_and_exchange_bytes() {
        let transport = TcpTransport::bind("127.0.0.1:0".parse().unwrap())
            .await
            .unwrap();
        let addr = transport.local_addr();
        assert_ne!(addr.port(), 0);
        assert_eq!(transport.connect_string(), format!("tcp:{addr}"));

        let client = tokio::spawn(async move {
            let mut stream = TcpStream::connect(addr).await.unwrap();
            stream.write_all(b"ping").await.unwrap();
            let mut buf = [0u8; 4];
            stream.read_exact(&mut buf).await.unwrap();
            buf
        });

        let mut accepted = transport.accept().await.unwrap();
        let mut buf = [0u8; 4];
        accepted.stream.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"ping");
        accepted.stream.write_all(b"pong").await.unwrap();

        assert_eq!(&client.await.unwrap(), b"pong");
    }
}
