//! Well-known names, paths and reply codes of the bus itself.

/// Name the broker answers to.
pub const BUS_NAME: &str = "org.freedesktop.DBus";

/// Object path of the broker.
pub const BUS_PATH: &str = "/org/freedesktop/DBus";

/// Interface of the broker's methods.
pub const BUS_INTERFACE: &str = "org.freedesktop.DBus";

/// Path reserved for in-process notifications that are never routed.
pub const LOCAL_PATH: &str = "/org/freedesktop/DBus/Local";

/// Local notification sent when a stream closes.
pub const LOCAL_DISCONNECTED: &str = "Disconnected";

/// Prefix of every unique connection name.
pub const UNIQUE_NAME_PREFIX: char = ':';

/// `RequestName` reply codes.
pub mod request_name {
    /// Caller is now the primary owner.
    pub const PRIMARY_OWNER: u32 = 1;
    /// Caller already owned the name.
    pub const ALREADY_OWNER: u32 = 4;
}

/// `ReleaseName` reply codes.
pub mod release_name {
    /// The name was released.
    pub const RELEASED: u32 = 1;
}

/// Error names carried in `Error` replies.
pub mod errors {
    pub const INVALID_ARGS: &str = "org.freedesktop.DBus.Error.InvalidArgs";
    pub const NAME_HAS_OWNER: &str = "org.freedesktop.DBus.Error.NameHasOwner";
    pub const NAME_NOT_OWNED: &str = "org.freedesktop.DBus.Error.NameNotOwned";
    pub const SERVICE_UNKNOWN: &str = "org.freedesktop.DBus.Error.ServiceUnknown";
}

/// Whether `name` has the shape of a unique connection name.
#[must_use]
pub fn is_unique_name(name: &str) -> bool {
    name.starts_with(UNIQUE_NAME_PREFIX)
}
