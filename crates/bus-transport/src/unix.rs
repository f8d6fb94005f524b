//! Unix domain socket transport.

use async_trait::async_trait;
use std::path::{Path, PathBuf};
use tokio::net::UnixListener;
use tracing::{debug, info, warn};

use crate::traits::{Accepted, Transport, TransportError};

/// Unix domain socket listener transport.
///
/// The socket file is removed when the transport is dropped.
pub struct UnixTransport {
    listener: UnixListener,
    path: PathBuf,
}

impl UnixTransport {
    /// Bind a listener at `path`.
    ///
    /// # Errors
    ///
    /// Returns an error if the path is in use or cannot be created.
    pub fn bind(path: impl AsRef<Path>) -> Result<Self, TransportError> {
        let path = path.as_ref().to_path_buf();
        let listener = UnixListener::bind(&path)?;

        info!("Unix transport listening on {}", path.display());

        Ok(Self { listener, path })
    }

    /// Path of the socket file.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[async_trait]
impl Transport for UnixTransport {
    async fn accept(&self) -> Result<Accepted, TransportError> {
        let (stream, _) = self.listener.accept().await?;
        let peer = match stream.peer_cred() {
            Ok(cred) => format!("uid={} pid={:?}", cred.uid(), cred.pid()),
            Err(_) => "unix".to_string(),
        };
        debug!("Accepted Unix connection from {}", peer);

        Ok(Accepted {
            stream: Box::new(stream),
            peer,
        })
    }

    fn name(&self) -> &'static str {
        "unix"
    }

    fn connect_string(&self) -> String {
        format!("unix:{}", self.path.display())
    }

    /// Unhealthy once the socket file is gone, since new clients can no
    /// longer reach the listener.
    fn is_healthy(&self) -> bool {
        self.path.exists()
    }
}

impl Drop for UnixTransport {
    fn drop(&mut self) {
        if let Err(e) = std::fs::remove_file(&self.path) {
            warn!("Failed to remove socket {}: {}", self.path.display(), e);
        }
    }
}
