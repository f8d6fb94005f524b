//! Message types for the Ferrobus protocol.
//!
//! A message is the unit routed by the broker. Each message is serialized
//! using MessagePack and carries the addressing fields the router needs
//! (destination, path, member, reply serial) plus an ordered argument list.

use serde::{Deserialize, Serialize};

/// Message kind identifiers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(into = "u8", try_from = "u8")]
#[repr(u8)]
pub enum MessageKind {
    MethodCall = 0x01,
    MethodReturn = 0x02,
    Error = 0x03,
    Signal = 0x04,
}

impl From<MessageKind> for u8 {
    fn from(kind: MessageKind) -> u8 {
        kind as u8
    }
}

impl TryFrom<u8> for MessageKind {
    type Error = &'static str;

    fn try_from(value: u8) -> Result<Self, <Self as TryFrom<u8>>::Error> {
        match value {
            0x01 => Ok(MessageKind::MethodCall),
            0x02 => Ok(MessageKind::MethodReturn),
            0x03 => Ok(MessageKind::Error),
            0x04 => Ok(MessageKind::Signal),
            _ => Err("Invalid message kind"),
        }
    }
}

/// A single message argument.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "t", content = "v")]
pub enum Arg {
    #[serde(rename = "s")]
    Str(String),
    #[serde(rename = "u")]
    U32(u32),
    #[serde(rename = "x")]
    I64(i64),
    #[serde(rename = "b")]
    Bool(bool),
    #[serde(rename = "ay")]
    Bytes(#[serde(with = "serde_bytes")] Vec<u8>),
}

impl Arg {
    /// Get the argument as a string, if it is one.
    #[must_use]
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Arg::Str(s) => Some(s),
            _ => None,
        }
    }

    /// Get the argument as a `u32`, if it is one.
    #[must_use]
    pub fn as_u32(&self) -> Option<u32> {
        match self {
            Arg::U32(v) => Some(*v),
            _ => None,
        }
    }
}

impl From<&str> for Arg {
    fn from(s: &str) -> Self {
        Arg::Str(s.to_string())
    }
}

impl From<String> for Arg {
    fn from(s: String) -> Self {
        Arg::Str(s)
    }
}

impl From<u32> for Arg {
    fn from(v: u32) -> Self {
        Arg::U32(v)
    }
}

impl From<i64> for Arg {
    fn from(v: i64) -> Self {
        Arg::I64(v)
    }
}

impl From<bool> for Arg {
    fn from(v: bool) -> Self {
        Arg::Bool(v)
    }
}

impl From<Vec<u8>> for Arg {
    fn from(v: Vec<u8>) -> Self {
        Arg::Bytes(v)
    }
}

/// A bus message.
///
/// Messages are immutable once routed: the broker only ever replaces the
/// serial (every outbound copy gets its own) and, for proxied replies, the
/// reply serial.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    /// Message kind.
    pub kind: MessageKind,
    /// Serial number assigned by whoever sent this copy.
    pub serial: u32,
    /// Sender name, if known.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sender: Option<String>,
    /// Destination name. `None` (or empty) means broadcast.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub destination: Option<String>,
    /// Object path.
    #[serde(default)]
    pub path: String,
    /// Optional interface name.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub interface: Option<String>,
    /// Member (method or signal) name.
    #[serde(default)]
    pub member: String,
    /// Serial of the message this one answers.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reply_serial: Option<u32>,
    /// Error name, for `Error` messages.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_name: Option<String>,
    /// Ordered argument list.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub args: Vec<Arg>,
}

impl Message {
    fn bare(kind: MessageKind) -> Self {
        Self {
            kind,
            serial: 0,
            sender: None,
            destination: None,
            path: String::new(),
            interface: None,
            member: String::new(),
            reply_serial: None,
            error_name: None,
            args: Vec::new(),
        }
    }

    /// Create a new method call.
    #[must_use]
    pub fn method_call(
        destination: impl Into<String>,
        path: impl Into<String>,
        member: impl Into<String>,
    ) -> Self {
        Self {
            destination: Some(destination.into()),
            path: path.into(),
            member: member.into(),
            ..Self::bare(MessageKind::MethodCall)
        }
    }

    /// Create a new signal with no destination.
    #[must_use]
    pub fn signal(
        path: impl Into<String>,
        interface: impl Into<String>,
        member: impl Into<String>,
    ) -> Self {
        Self {
            path: path.into(),
            interface: Some(interface.into()),
            member: member.into(),
            ..Self::bare(MessageKind::Signal)
        }
    }

    /// Create a method return answering this message.
    #[must_use]
    pub fn method_return(&self) -> Self {
        Self {
            destination: self.sender.clone(),
            reply_serial: Some(self.serial),
            ..Self::bare(MessageKind::MethodReturn)
        }
    }

    /// Create an error reply answering this message.
    #[must_use]
    pub fn error_reply(&self, error_name: impl Into<String>, text: impl Into<String>) -> Self {
        Self {
            destination: self.sender.clone(),
            reply_serial: Some(self.serial),
            error_name: Some(error_name.into()),
            args: vec![Arg::Str(text.into())],
            ..Self::bare(MessageKind::Error)
        }
    }

    /// Set the serial.
    #[must_use]
    pub fn with_serial(mut self, serial: u32) -> Self {
        self.serial = serial;
        self
    }

    /// Set the sender.
    #[must_use]
    pub fn with_sender(mut self, sender: impl Into<String>) -> Self {
        self.sender = Some(sender.into());
        self
    }

    /// Set the destination.
    #[must_use]
    pub fn with_destination(mut self, destination: impl Into<String>) -> Self {
        self.destination = Some(destination.into());
        self
    }

    /// Set the interface.
    #[must_use]
    pub fn with_interface(mut self, interface: impl Into<String>) -> Self {
        self.interface = Some(interface.into());
        self
    }

    /// Append an argument.
    #[must_use]
    pub fn with_arg(mut self, arg: impl Into<Arg>) -> Self {
        self.args.push(arg.into());
        self
    }

    /// Whether this message answers another one.
    #[must_use]
    pub fn is_reply(&self) -> bool {
        self.reply_serial.is_some()
    }

    /// The destination, treating an empty string as no destination.
    #[must_use]
    pub fn destination(&self) -> Option<&str> {
        self.destination.as_deref().filter(|d| !d.is_empty())
    }

    /// Get argument `index` as a string.
    #[must_use]
    pub fn arg_str(&self, index: usize) -> Option<&str> {
        self.args.get(index).and_then(Arg::as_str)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_message_kind_conversion() {
        assert_eq!(MessageKind::try_from(1), Ok(MessageKind::MethodCall));
        assert_eq!(MessageKind::try_from(4), Ok(MessageKind::Signal));
        assert!(MessageKind::try_from(0).is_err());
        assert!(MessageKind::try_from(5).is_err());
    }

    #[test]
    fn test_method_return_addresses_caller() {
        let call = Message::method_call("com.example.Foo", "/", "Ping")
            .with_sender(":1")
            .with_serial(7);

        let reply = call.method_return().with_arg("pong");
        assert_eq!(reply.kind, MessageKind::MethodReturn);
        assert_eq!(reply.reply_serial, Some(7));
        assert_eq!(reply.destination(), Some(":1"));
        assert_eq!(reply.arg_str(0), Some("pong"));
        assert!(reply.is_reply());
    }

    #[test]
    fn test_error_reply() {
        let call = Message::method_call("x.y", "/", "Z").with_serial(3);
        let err = call.error_reply("org.example.Error.Failed", "nope");
        assert_eq!(err.kind, MessageKind::Error);
        assert_eq!(err.error_name.as_deref(), Some("org.example.Error.Failed"));
        assert_eq!(err.reply_serial, Some(3));
        // Caller had no sender, so the reply has no destination either
        assert_eq!(err.destination(), None);
    }

    #[test]
    fn test_empty_destination_is_broadcast() {
        let msg = Message::signal("/a", "org.example.Iface", "Changed").with_destination("");
        assert_eq!(msg.destination(), None);
        assert!(!msg.is_reply());
    }
}
