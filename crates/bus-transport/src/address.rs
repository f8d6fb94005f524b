//! Bus address parsing.
//!
//! Listen addresses use the `family:key=value,key=value` form:
//!
//! - `tcp:host=127.0.0.1,port=7000`
//! - `unix:path=/run/ferrobus.sock`
//!
//! Connect strings handed to clients are shorter: `tcp:127.0.0.1:7000` or
//! `unix:/run/ferrobus.sock`.

use std::fmt;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::str::FromStr;
use tokio::net::TcpStream;

use crate::tcp::TcpTransport;
use crate::traits::{ByteStream, Transport, TransportError};

/// Where the bus listens.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ListenAddress {
    /// TCP socket.
    Tcp { host: String, port: u16 },
    /// Unix domain socket.
    Unix { path: PathBuf },
}

impl ListenAddress {
    fn parse_pairs(address: &str, params: &str) -> Result<Vec<(String, String)>, TransportError> {
        params
            .split(',')
            .filter(|pair| !pair.is_empty())
            .map(|pair| {
                pair.split_once('=')
                    .map(|(k, v)| (k.trim().to_string(), v.trim().to_string()))
                    .ok_or_else(|| TransportError::invalid(address, format!("expected key=value, got '{pair}'")))
            })
            .collect()
    }
}

impl FromStr for ListenAddress {
    type Err = TransportError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (family, params) = s
            .split_once(':')
            .ok_or_else(|| TransportError::invalid(s, "missing address family"))?;
        let pairs = Self::parse_pairs(s, params)?;
        let get = |key: &str| {
            pairs
                .iter()
                .find(|(k, _)| k == key)
                .map(|(_, v)| v.as_str())
        };

        match family {
            "tcp" => {
                let host = get("host").unwrap_or("127.0.0.1").to_string();
                let port = get("port")
                    .ok_or_else(|| TransportError::invalid(s, "missing port"))?
                    .parse::<u16>()
                    .map_err(|e| TransportError::invalid(s, format!("bad port: {e}")))?;
                Ok(ListenAddress::Tcp { host, port })
            }
            "unix" => {
                let path = get("path").ok_or_else(|| TransportError::invalid(s, "missing path"))?;
                if path.is_empty() {
                    return Err(TransportError::invalid(s, "empty path"));
                }
                Ok(ListenAddress::Unix {
                    path: PathBuf::from(path),
                })
            }
            other => Err(TransportError::invalid(s, format!("unknown family '{other}'"))),
        }
    }
}

impl fmt::Display for ListenAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ListenAddress::Tcp { host, port } => write!(f, "tcp:host={host},port={port}"),
            ListenAddress::Unix { path } => write!(f, "unix:path={}", path.display()),
        }
    }
}

/// Bind a listener for `address`.
///
/// # Errors
///
/// Returns an error if the host does not resolve, binding fails, or the
/// address family is not available on this platform.
pub async fn bind(address: &ListenAddress) -> Result<Box<dyn Transport>, TransportError> {
    match address {
        ListenAddress::Tcp { host, port } => {
            let addr = tokio::net::lookup_host((host.as_str(), *port))
                .await?
                .next()
                .ok_or_else(|| TransportError::invalid(&address.to_string(), "host did not resolve"))?;
            Ok(Box::new(TcpTransport::bind(addr).await?))
        }
        #[cfg(unix)]
        ListenAddress::Unix { path } => Ok(Box::new(crate::unix::UnixTransport::bind(path)?)),
        #[cfg(not(unix))]
        ListenAddress::Unix { .. } => Err(TransportError::Unsupported("unix".to_string())),
    }
}

/// Open a client stream to a connect string such as `tcp:127.0.0.1:7000`.
///
/// # Errors
///
/// Returns an error if the string is malformed or the connection fails.
pub async fn connect(connect_string: &str) -> Result<Box<dyn ByteStream>, TransportError> {
    let (family, rest) = connect_string
        .split_once(':')
        .ok_or_else(|| TransportError::invalid(connect_string, "missing address family"))?;

    match family {
        "tcp" => {
            let addr: SocketAddr = rest
                .parse()
                .map_err(|e| TransportError::invalid(connect_string, format!("{e}")))?;
            let stream = TcpStream::connect(addr).await?;
            stream.set_nodelay(true)?;
            Ok(Box::new(stream))
        }
        #[cfg(unix)]
        "unix" => Ok(Box::new(tokio::net::UnixStream::connect(rest).await?)),
        other => Err(TransportError::Unsupported(other.to_string())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_tcp() {
        let addr: ListenAddress = "tcp:host=0.0.0.0,port=7000".parse().unwrap();
        assert_eq!(
            addr,
            ListenAddress::Tcp {
                host: "0.0.0.0".to_string(),
                port: 7000
            }
        );
        assert_eq!(addr.to_string(), "tcp:host=0.0.0.0,port=7000");

        // Host defaults to loopback
        let addr: ListenAddress = "tcp:port=0".parse().unwrap();
        assert!(matches!(addr, ListenAddress::Tcp { ref host, port: 0 } if host == "127.0.0.1"));
    }

    #[test]
    fn test_parse_unix() {
        let addr: ListenAddress = "unix:path=/tmp/bus.sock".parse().unwrap();
        assert_eq!(
            addr,
            ListenAddress::Unix {
                path: PathBuf::from("/tmp/bus.sock")
            }
        );
    }

    #[test]
    fn test_parse_errors() {
        for bad in [
            "nonsense",
            "tcp:host=localhost",
            "tcp:port=99999",
            "tcp:port",
            "unix:",
            "unix:path=",
            "udp:port=1",
        ] {
            assert!(
                matches!(bad.parse::<ListenAddress>(), Err(TransportError::InvalidAddress { .. })),
                "{bad} should not parse"
            );
        }
    }

    #[tokio::test]
    async fn test_bind_and_connect_tcp() {
        let transport = bind(&"tcp:host=127.0.0.1,port=0".parse().unwrap())
            .await
            .unwrap();
        assert_eq!(transport.name(), "tcp");

        let target = transport.connect_string();
        let client = tokio::spawn(async move { connect(&target).await.map(|_| ()) });

        let accepted = transport.accept().await.unwrap();
        assert!(accepted.peer.starts_with("127.0.0.1:"));
        client.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_connect_rejects_bad_strings() {
        assert!(connect("tcp:not-an-addr").await.is_err());
        assert!(matches!(
            connect("carrier-pigeon:coop").await,
            Err(TransportError::Unsupported(_))
        ));
    }
}
