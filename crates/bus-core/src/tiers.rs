//! Dispatch tiers.
//!
//! The router offers every inbound message to an ordered list of tiers. The
//! first tier that claims the message ends dispatch:
//!
//! 1. [`LocalTier`] - in-process notifications on the local path
//! 2. [`ServerTier`] - methods of the bus itself (`Hello`, `RequestName`, ...)
//! 3. [`BridgeTier`] - replies to proxied calls, and directed messages
//! 4. [`BroadcastTier`] - destination-less messages, fanned out to everyone

use crate::ids::ConnectionId;
use crate::router::RouteContext;
use bus_protocol::names::{self, errors, release_name, request_name};
use bus_protocol::{Message, MessageKind};
use tracing::{debug, warn};

/// What a tier did with a message it claimed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Disposition {
    /// Accepted with no routing.
    Acknowledged,
    /// Answered by the bus itself.
    Replied,
    /// Forwarded to another connection under a fresh serial.
    Forwarded { to: ConnectionId, serial: u32 },
    /// A reply handed back to the connection that made the call.
    ReplyDelivered { to: ConnectionId },
    /// Fanned out to every connection.
    Broadcast { recipients: usize },
    /// Claimed but not delivered.
    Dropped(DropReason),
}

/// Why a claimed message was not delivered.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DropReason {
    /// No connection owns the destination name.
    UnknownDestination(String),
    /// The target connection closed while the message was in flight.
    DestinationGone,
}

/// Result of offering a message to a tier.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Claim {
    /// Not for this tier; try the next one.
    Declined,
    /// Handled; stop dispatch.
    Handled(Disposition),
}

/// One stage of the dispatch chain.
pub trait Tier: Send + Sync {
    /// Short name used in logs and metrics.
    fn name(&self) -> &'static str;

    /// Handle `message` from `origin`, or decline it.
    fn try_claim(&self, ctx: &RouteContext, origin: ConnectionId, message: &Message) -> Claim;
}

/// The standard tier order.
#[must_use]
pub fn default_tiers() -> Vec<Box<dyn Tier>> {
    vec![
        Box::new(LocalTier),
        Box::new(ServerTier),
        Box::new(BridgeTier),
        Box::new(BroadcastTier),
    ]
}

/// Swallows local notifications such as "stream now closed".
///
/// The actual teardown happens when the transport reports the close.
#[derive(Debug, Default, Clone, Copy)]
pub struct LocalTier;

impl Tier for LocalTier {
    fn name(&self) -> &'static str {
        "local"
    }

    fn try_claim(&self, _ctx: &RouteContext, origin: ConnectionId, message: &Message) -> Claim {
        if message.path == names::LOCAL_PATH && message.member == names::LOCAL_DISCONNECTED {
            debug!(connection = %origin, "Local disconnect notification");
            return Claim::Handled(Disposition::Acknowledged);
        }
        Claim::Declined
    }
}

/// Methods the bus implements itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BusMethod {
    Hello,
    RequestName,
    ReleaseName,
    AddMatch,
}

impl BusMethod {
    /// Parse a member name.
    #[must_use]
    pub fn parse(member: &str) -> Option<Self> {
        match member {
            "Hello" => Some(BusMethod::Hello),
            "RequestName" => Some(BusMethod::RequestName),
            "ReleaseName" => Some(BusMethod::ReleaseName),
            "AddMatch" => Some(BusMethod::AddMatch),
            _ => None,
        }
    }
}

/// Answers calls addressed to the bus name and path.
#[derive(Debug, Default, Clone, Copy)]
pub struct ServerTier;

impl ServerTier {
    fn reply(ctx: &RouteContext, origin: ConnectionId, caller: &str, reply: Message) -> Claim {
        let reply = reply.with_sender(names::BUS_NAME).with_destination(caller);
        match ctx.send_to(origin, reply) {
            Some(_) => Claim::Handled(Disposition::Replied),
            None => Claim::Handled(Disposition::Dropped(DropReason::DestinationGone)),
        }
    }

    fn invalid_args(message: &Message, text: &str) -> Message {
        message.error_reply(errors::INVALID_ARGS, text)
    }

    fn request_name(ctx: &RouteContext, origin: ConnectionId, message: &Message) -> Message {
        let Some(name) = message.arg_str(0) else {
            return Self::invalid_args(message, "RequestName expects a name argument");
        };
        if name.is_empty() || names::is_unique_name(name) {
            return Self::invalid_args(message, &format!("Cannot request name '{name}'"));
        }

        debug!(connection = %origin, name = %name, "RequestName");
        if ctx.registry.resolve(name) == Some(origin) {
            return message
                .method_return()
                .with_arg(request_name::ALREADY_OWNER);
        }

        match ctx.registry.register(name, origin) {
            Ok(()) => message.method_return().with_arg(request_name::PRIMARY_OWNER),
            Err(e) => {
                warn!(connection = %origin, error = %e, "RequestName refused");
                message.error_reply(errors::NAME_HAS_OWNER, e.to_string())
            }
        }
    }

    fn release_name(ctx: &RouteContext, origin: ConnectionId, message: &Message) -> Message {
        let Some(name) = message.arg_str(0) else {
            return Self::invalid_args(message, "ReleaseName expects a name argument");
        };
        if names::is_unique_name(name) {
            return Self::invalid_args(message, &format!("Cannot release unique name '{name}'"));
        }

        debug!(connection = %origin, name = %name, "ReleaseName");
        match ctx.registry.unregister(name, origin) {
            Ok(()) => message.method_return().with_arg(release_name::RELEASED),
            Err(e) => {
                warn!(connection = %origin, error = %e, "ReleaseName refused");
                message.error_reply(errors::NAME_NOT_OWNED, e.to_string())
            }
        }
    }
}

impl Tier for ServerTier {
    fn name(&self) -> &'static str {
        "server"
    }

    fn try_claim(&self, ctx: &RouteContext, origin: ConnectionId, message: &Message) -> Claim {
        if message.destination() != Some(names::BUS_NAME) || message.path != names::BUS_PATH {
            return Claim::Declined;
        }
        // The interface is optional, but when present it must be the bus's own
        if message
            .interface
            .as_deref()
            .is_some_and(|interface| interface != names::BUS_INTERFACE)
        {
            return Claim::Declined;
        }
        let Some(method) = BusMethod::parse(&message.member) else {
            debug!(connection = %origin, member = %message.member, "Unrecognized bus method");
            return Claim::Declined;
        };
        let Some(caller) = ctx.connections.unique_name(origin) else {
            return Claim::Handled(Disposition::Dropped(DropReason::DestinationGone));
        };

        let reply = match method {
            BusMethod::Hello => {
                debug!(connection = %origin, unique_name = %caller, "Hello");
                message.method_return().with_arg(caller.as_str())
            }
            BusMethod::RequestName => Self::request_name(ctx, origin, message),
            BusMethod::ReleaseName => Self::release_name(ctx, origin, message),
            // Broadcasts are never filtered, so match rules are accepted and ignored
            BusMethod::AddMatch => message.method_return(),
        };

        Self::reply(ctx, origin, &caller, reply)
    }
}

/// Proxies directed messages and routes their replies back.
#[derive(Debug, Default, Clone, Copy)]
pub struct BridgeTier;

impl BridgeTier {
    fn deliver_reply(ctx: &RouteContext, reply_serial: u32, message: &Message) -> Claim {
        let Some(pending) = ctx.correlations.take(reply_serial) else {
            debug!(reply_serial, "Proxy reply: unknown serial");
            return Claim::Declined;
        };

        debug!(reply_serial, target = %pending.origin, "Proxy reply");
        let mut reply = message.clone();
        reply.reply_serial = Some(pending.origin_serial);

        match ctx.send_to(pending.origin, reply) {
            Some(_) => Claim::Handled(Disposition::ReplyDelivered { to: pending.origin }),
            None => Claim::Handled(Disposition::Dropped(DropReason::DestinationGone)),
        }
    }

    fn forward(ctx: &RouteContext, origin: ConnectionId, destination: &str, message: &Message) -> Claim {
        let Some(target) = ctx.registry.resolve(destination) else {
            warn!(connection = %origin, destination = %destination, "Proxy: no connection for destination");
            if ctx.config().reply_on_unknown_destination && message.kind == MessageKind::MethodCall {
                let error = message.error_reply(
                    errors::SERVICE_UNKNOWN,
                    format!("The name {destination} was not provided by any connection"),
                );
                if let Some(caller) = ctx.connections.unique_name(origin) {
                    let error = error.with_sender(names::BUS_NAME).with_destination(caller);
                    ctx.send_to(origin, error);
                }
            }
            return Claim::Handled(Disposition::Dropped(DropReason::UnknownDestination(
                destination.to_string(),
            )));
        };

        // The entry must exist before the target can possibly answer. After
        // the counter wraps, serials still awaiting a reply are skipped.
        let serial = loop {
            let serial = ctx.next_serial();
            if ctx.correlations.insert(serial, origin, message.serial) {
                break serial;
            }
        };

        let forwarded = message.clone().with_serial(serial);
        if ctx.connections.deliver(target, forwarded) {
            debug!(
                from = message.serial,
                serial,
                origin = %origin,
                target = %target,
                "Proxied"
            );
            Claim::Handled(Disposition::Forwarded { to: target, serial })
        } else {
            ctx.correlations.take(serial);
            warn!(destination = %destination, target = %target, "Proxy: target closed");
            Claim::Handled(Disposition::Dropped(DropReason::DestinationGone))
        }
    }
}

impl Tier for BridgeTier {
    fn name(&self) -> &'static str {
        "bridge"
    }

    fn try_claim(&self, ctx: &RouteContext, origin: ConnectionId, message: &Message) -> Claim {
        if let Some(reply_serial) = message.reply_serial {
            return Self::deliver_reply(ctx, reply_serial, message);
        }
        match message.destination() {
            Some(destination) => Self::forward(ctx, origin, destination, message),
            None => Claim::Declined,
        }
    }
}

/// Delivers destination-less messages to every connection, sender included.
///
/// A process may address listeners it registered itself, so the sender is
/// not skipped.
#[derive(Debug, Default, Clone, Copy)]
pub struct BroadcastTier;

impl Tier for BroadcastTier {
    fn name(&self) -> &'static str {
        "broadcast"
    }

    fn try_claim(&self, ctx: &RouteContext, origin: ConnectionId, message: &Message) -> Claim {
        // Unmatched replies end here with no effect
        if message.is_reply() || message.destination().is_some() {
            return Claim::Declined;
        }

        let mut recipients = 0;
        for (id, outbound) in ctx.connections.active() {
            let copy = message.clone().with_serial(ctx.next_serial());
            if outbound.send(copy).is_ok() {
                recipients += 1;
            } else {
                debug!(target = %id, "Broadcast target already closed");
            }
        }

        debug!(connection = %origin, serial = message.serial, recipients, "Broadcast");
        Claim::Handled(Disposition::Broadcast { recipients })
    }
}
