//! Message router for Ferrobus.
//!
//! The router owns the connection arena, the name registry and the reply
//! correlation table, and dispatches every inbound message through the
//! ordered tier chain.

use crate::connection::{ConnectionTable, OutboundReceiver};
use crate::correlation::CorrelationTable;
use crate::ids::{ConnectionId, SerialCounter, UniqueNameCounter};
use crate::registry::{Registry, RegistryError};
use crate::tiers::{default_tiers, Claim, Disposition, Tier};
use bus_protocol::Message;
use serde::Serialize;
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{debug, info, trace, warn};

/// Router errors.
#[derive(Debug, Error)]
pub enum RouterError {
    /// Connection limit reached.
    #[error("Maximum connections reached ({0})")]
    TooManyConnections(usize),

    /// Registry contract violation.
    #[error(transparent)]
    Registry(#[from] RegistryError),
}

/// Router configuration.
#[derive(Debug, Clone)]
pub struct RouterConfig {
    /// Maximum number of admitted connections (0 = unlimited).
    pub max_connections: usize,
    /// Answer calls to unknown destinations with a `ServiceUnknown` error
    /// instead of dropping them silently.
    pub reply_on_unknown_destination: bool,
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            max_connections: 100_000,
            reply_on_unknown_destination: false,
        }
    }
}

/// State shared by all tiers.
#[derive(Debug)]
pub struct RouteContext {
    /// Name → connection.
    pub registry: Registry,
    /// Forwarded serial → origin.
    pub correlations: CorrelationTable,
    /// Admitted connections.
    pub connections: ConnectionTable,
    serials: SerialCounter,
    unique_names: UniqueNameCounter,
    config: RouterConfig,
}

impl RouteContext {
    fn new(config: RouterConfig) -> Self {
        Self {
            registry: Registry::new(),
            correlations: CorrelationTable::new(),
            connections: ConnectionTable::new(),
            serials: SerialCounter::new(),
            unique_names: UniqueNameCounter::new(),
            config,
        }
    }

    /// Router configuration.
    #[must_use]
    pub fn config(&self) -> &RouterConfig {
        &self.config
    }

    /// Take the next outbound serial.
    pub fn next_serial(&self) -> u32 {
        self.serials.next()
    }

    /// Stamp `message` with a fresh serial and queue it for `target`.
    ///
    /// Returns the serial, or `None` if the target is gone.
    pub fn send_to(&self, target: ConnectionId, message: Message) -> Option<u32> {
        let serial = self.next_serial();
        self.connections
            .deliver(target, message.with_serial(serial))
            .then_some(serial)
    }
}

/// A newly admitted connection.
#[derive(Debug)]
pub struct Admission {
    /// Connection id.
    pub id: ConnectionId,
    /// Unique name registered for the connection.
    pub unique_name: String,
    /// Messages routed to this connection.
    pub outbound: OutboundReceiver,
}

/// Which tier claimed a message, and what it did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RouteOutcome {
    /// A tier handled the message.
    Claimed {
        tier: &'static str,
        disposition: Disposition,
    },
    /// No tier wanted the message.
    Unclaimed,
}

impl RouteOutcome {
    /// The disposition, if claimed.
    #[must_use]
    pub fn disposition(&self) -> Option<&Disposition> {
        match self {
            RouteOutcome::Claimed { disposition, .. } => Some(disposition),
            RouteOutcome::Unclaimed => None,
        }
    }

    /// Short label for metrics.
    #[must_use]
    pub fn label(&self) -> &'static str {
        match self {
            RouteOutcome::Claimed { tier, .. } => *tier,
            RouteOutcome::Unclaimed => "unclaimed",
        }
    }
}

/// The central message router.
///
/// Every method takes `&self`; the router is shared behind an `Arc` by all
/// connection tasks. Messages from one connection must be routed in arrival
/// order, one at a time, by that connection's task.
pub struct Router {
    context: RouteContext,
    tiers: Vec<Box<dyn Tier>>,
}

impl Router {
    /// Create a new router with default configuration.
    #[must_use]
    pub fn new() -> Self {
        Self::with_config(RouterConfig::default())
    }

    /// Create a new router with custom configuration.
    #[must_use]
    pub fn with_config(config: RouterConfig) -> Self {
        Self::with_tiers(config, default_tiers())
    }

    /// Create a router with an explicit tier chain.
    #[must_use]
    pub fn with_tiers(config: RouterConfig, tiers: Vec<Box<dyn Tier>>) -> Self {
        let names: Vec<&'static str> = tiers.iter().map(|t| t.name()).collect();
        info!(tiers = ?names, "Creating router with config: {:?}", config);
        Self {
            context: RouteContext::new(config),
            tiers,
        }
    }

    /// Admit a connection that completed its handshake.
    ///
    /// The connection gets an id, a unique name and an outbound queue.
    ///
    /// # Errors
    ///
    /// Returns an error if the connection limit is reached.
    pub fn admit(&self) -> Result<Admission, RouterError> {
        let ctx = &self.context;
        let max = ctx.config.max_connections;
        if max != 0 && ctx.connections.len() >= max {
            warn!(max, "Refusing connection: limit reached");
            return Err(RouterError::TooManyConnections(max));
        }

        let id = ctx.connections.allocate_id();
        let unique_name = ctx.unique_names.next();
        let (tx, rx) = mpsc::unbounded_channel();

        ctx.connections.insert(id, unique_name.clone(), tx);
        if let Err(e) = ctx.registry.register(&unique_name, id) {
            ctx.connections.remove(id);
            return Err(e.into());
        }

        info!(connection = %id, unique_name = %unique_name, "Connection admitted");
        Ok(Admission {
            id,
            unique_name,
            outbound: rx,
        })
    }

    /// Route one inbound message from `origin`.
    pub fn route(&self, origin: ConnectionId, message: &Message) -> RouteOutcome {
        trace!(
            connection = %origin,
            serial = message.serial,
            destination = ?message.destination(),
            member = %message.member,
            "Routing"
        );

        for tier in &self.tiers {
            if let Claim::Handled(disposition) = tier.try_claim(&self.context, origin, message) {
                return RouteOutcome::Claimed {
                    tier: tier.name(),
                    disposition,
                };
            }
        }

        debug!(connection = %origin, serial = message.serial, "Message not claimed by any tier");
        RouteOutcome::Unclaimed
    }

    /// Tear down a connection.
    ///
    /// Purges its names and pending replies, then removes it from the active
    /// set. Returns `false` if the connection was already gone, so calling
    /// this twice is harmless.
    pub fn disconnect(&self, id: ConnectionId) -> bool {
        let ctx = &self.context;
        if !ctx.connections.begin_close(id) {
            return false;
        }

        let names = ctx.registry.purge(id);
        let pending = ctx.correlations.purge(id);
        ctx.connections.remove(id);

        info!(
            connection = %id,
            names = ?names,
            pending_replies = pending,
            "Connection closed"
        );
        true
    }

    /// Look up the owner of a name.
    #[must_use]
    pub fn resolve(&self, name: &str) -> Option<ConnectionId> {
        self.context.registry.resolve(name)
    }

    /// The name registry.
    #[must_use]
    pub fn registry(&self) -> &Registry {
        &self.context.registry
    }

    /// The reply correlation table.
    #[must_use]
    pub fn correlations(&self) -> &CorrelationTable {
        &self.context.correlations
    }

    /// The connection arena.
    #[must_use]
    pub fn connections(&self) -> &ConnectionTable {
        &self.context.connections
    }

    /// Router configuration.
    #[must_use]
    pub fn config(&self) -> &RouterConfig {
        &self.context.config
    }

    /// Get router statistics.
    #[must_use]
    pub fn stats(&self) -> RouterStats {
        RouterStats {
            connection_count: self.context.connections.len(),
            name_count: self.context.registry.len(),
            pending_replies: self.context.correlations.len(),
        }
    }
}

impl Default for Router {
    fn default() -> Self {
        Self::new()
    }
}

/// Router statistics.
#[derive(Debug, Clone, Serialize)]
pub struct RouterStats {
    /// Number of admitted connections.
    pub connection_count: usize,
    /// Number of registered names, unique names included.
    pub name_count: usize,
    /// Number of proxied calls awaiting a reply.
    pub pending_replies: usize,
}
