//! # ferrobus-transport
//!
//! Stream transports for the Ferrobus message bus.
//!
//! This crate provides listeners that hand out raw byte streams:
//!
//! - **TCP** - `tcp:host=127.0.0.1,port=7000`
//! - **Unix** - `unix:path=/run/ferrobus.sock` (Unix platforms only)
//!
//! ## Transport Abstraction
//!
//! All listeners implement the `Transport` trait and yield boxed
//! `ByteStream`s, so the server never sees the socket type.
//!
//! ```rust,ignore
//! use ferrobus_transport::{bind, ListenAddress};
//!
//! let transport = bind(&"tcp:host=127.0.0.1,port=0".parse()?).await?;
//! println!("clients connect to {}", transport.connect_string());
//! let accepted = transport.accept().await?;
//! ```

pub mod address;
pub mod tcp;
pub mod traits;

#[cfg(unix)]
pub mod unix;

pub use address::{bind, connect, ListenAddress};
pub use tcp::TcpTransport;
pub use traits::{Accepted, ByteStream, Transport, TransportError};

#[cfg(unix)]
pub use unix::UnixTransport;
