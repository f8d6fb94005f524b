//! # ferrobus-core
//!
//! Connection state and message routing for the Ferrobus message bus.
//!
//! This crate provides the fundamental building blocks:
//!
//! - **Connection table** - Arena of admitted connections and their outbound queues
//! - **Registry** - Bus name to connection ownership
//! - **Correlation** - Forwarded call serials awaiting a reply
//! - **Tiers** - The ordered dispatch chain
//! - **Router** - Admission, routing and teardown
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────┐     ┌─────────────┐     ┌──────────────────────────────┐
//! │  Connection │────▶│   Router    │────▶│ local → server → bridge →    │
//! └─────────────┘     └─────────────┘     │ broadcast                    │
//!                            │            └──────────────────────────────┘
//!                            ▼
//!              ┌──────────────────────────┐
//!              │ Registry · Correlations  │
//!              └──────────────────────────┘
//! ```
//!
//! ## Example
//!
//! ```
//! use bus_protocol::Message;
//! use ferrobus_core::Router;
//!
//! let router = Router::new();
//! let mut alice = router.admit().unwrap();
//! let bob = router.admit().unwrap();
//!
//! let call = Message::method_call(bob.unique_name.as_str(), "/", "Ping").with_serial(1);
//! router.route(alice.id, &call);
//! assert_eq!(router.correlations().len(), 1);
//! # let _ = alice.outbound.try_recv();
//! ```

pub mod connection;
pub mod correlation;
pub mod ids;
pub mod registry;
pub mod router;
pub mod tiers;

pub use connection::{ConnectionTable, Outbound, OutboundReceiver};
pub use correlation::{CorrelationTable, PendingReply};
pub use ids::{ConnectionId, SerialCounter, UniqueNameCounter};
pub use registry::{Registry, RegistryError};
pub use router::{Admission, RouteContext, RouteOutcome, Router, RouterConfig, RouterError, RouterStats};
pub use tiers::{Claim, Disposition, DropReason, Tier};
