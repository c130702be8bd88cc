//! Commands moving through the pipeline and the serial registry.
//!
//! A [`Command`] is opaque to the pipeline: a numeric serial plus payload
//! bytes. The [`CommandRegistry`] decides, once at decode time, whether a
//! command stays local to a logic worker or has to be linearized through the
//! cluster, producing a [`Routed`] value that later stages match on.

use std::collections::HashMap;

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::error::{FilterError, FilterErrorKind};

/// Well-known command serials.
pub mod serial {
    pub const PING: u16 = 0x01;
    pub const PONG: u16 = 0x02;
    pub const PUT: u16 = 0x20;
    pub const GET: u16 = 0x21;
    pub const VALUE: u16 = 0x22;
    /// Message replicated through the cluster and broadcast to every session.
    pub const ANNOUNCE: u16 = 0x23;
    pub const TOPOLOGY: u16 = 0x30;
    pub const TOPOLOGY_REPLY: u16 = 0x31;
    /// Committed result delivered to the origin session only.
    pub const RAFT_NOTIFY: u16 = 0x76;
    /// Committed result broadcast to every interested session.
    pub const RAFT_NOTIFY_ALL: u16 = 0x77;
    pub const REJECTED: u16 = 0x7F;
    /// MQTT control packets occupy `0x110 | packet_type`.
    pub const MQTT_BASE: u16 = 0x110;
}

/// Admission class. Lower sorts first and survives ring pressure longer; this
/// is not a transmission order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub enum Priority {
    NetworkControl,
    ClusterExchange,
    MetaCreate,
    MetaUpdate,
    #[default]
    Business,
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Command {
    serial: u16,
    priority: Priority,
    payload: Bytes,
}

impl Command {
    /// `[u16 serial][u32 length]`
    pub const HEADER_LEN: usize = 6;

    pub fn new(serial: u16, payload: impl Into<Bytes>) -> Self {
        Self {
            serial,
            priority: Priority::default(),
            payload: payload.into(),
        }
    }

    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    pub fn serial(&self) -> u16 {
        self.serial
    }

    pub fn priority(&self) -> Priority {
        self.priority
    }

    pub fn payload(&self) -> &Bytes {
        &self.payload
    }

    pub fn encoded_len(&self) -> usize {
        Self::HEADER_LEN + self.payload.len()
    }

    /// Appends the wire form and returns the number of bytes written.
    pub fn encode(&self, buf: &mut BytesMut) -> usize {
        buf.reserve(self.encoded_len());
        buf.put_u16(self.serial);
        buf.put_u32(self.payload.len() as u32);
        buf.put_slice(&self.payload);
        self.encoded_len()
    }

    /// Decodes one command from the front of `buf`.
    ///
    /// Returns the command and the bytes consumed, or `None` when `buf` does
    /// not yet hold a whole command.
    pub fn decode(buf: &[u8]) -> Option<(Self, usize)> {
        if buf.len() < Self::HEADER_LEN {
            return None;
        }
        let mut header = &buf[..Self::HEADER_LEN];
        let serial = header.get_u16();
        let len = header.get_u32() as usize;
        let total = Self::HEADER_LEN + len;
        if buf.len() < total {
            return None;
        }
        let payload = Bytes::copy_from_slice(&buf[Self::HEADER_LEN..total]);
        Some((Self::new(serial, payload), total))
    }
}

/// Where a decoded command must go.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Route {
    /// Handled by the session's logic worker.
    Local,
    /// Linearized through cluster consensus before it takes effect.
    Consensus,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CommandSpec {
    pub priority: Priority,
    pub route: Route,
}

/// A command whose route was resolved at decode time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Routed {
    Local(Command),
    Consensus(Command),
}

impl Routed {
    pub fn command(&self) -> &Command {
        match self {
            Routed::Local(command) | Routed::Consensus(command) => command,
        }
    }

    pub fn into_command(self) -> Command {
        match self {
            Routed::Local(command) | Routed::Consensus(command) => command,
        }
    }

    pub fn is_consensus(&self) -> bool {
        matches!(self, Routed::Consensus(_))
    }
}

/// Maps serials to their admission class and route.
#[derive(Debug, Clone, Default)]
pub struct CommandRegistry {
    specs: HashMap<u16, CommandSpec>,
}

impl CommandRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry preloaded with the serials served by [`crate::logic::KvLogic`]
    /// and the MQTT control packet range.
    pub fn with_builtin() -> Self {
        let mut registry = Self::new();
        registry.register(serial::PING, Priority::NetworkControl, Route::Local);
        registry.register(serial::GET, Priority::Business, Route::Local);
        registry.register(serial::PUT, Priority::MetaUpdate, Route::Consensus);
        registry.register(serial::ANNOUNCE, Priority::MetaCreate, Route::Consensus);
        registry.register(serial::TOPOLOGY, Priority::ClusterExchange, Route::Local);
        for packet_type in 1..=14u16 {
            let priority = match packet_type {
                // CONNECT, PINGREQ, DISCONNECT
                1 | 12 | 14 => Priority::NetworkControl,
                _ => Priority::Business,
            };
            registry.register(serial::MQTT_BASE | packet_type, priority, Route::Local);
        }
        registry
    }

    pub fn register(&mut self, serial: u16, priority: Priority, route: Route) {
        self.specs.insert(serial, CommandSpec { priority, route });
    }

    pub fn spec(&self, serial: u16) -> Option<CommandSpec> {
        self.specs.get(&serial).copied()
    }

    /// Stamps the registered priority on `command` and resolves its route.
    pub fn resolve(&self, command: Command) -> Result<Routed, FilterError> {
        let Some(spec) = self.spec(command.serial()) else {
            return Err(FilterError::new(
                FilterErrorKind::UnknownSerial,
                "codec",
                format!("serial {:#x}", command.serial()),
            ));
        };
        let command = command.with_priority(spec.priority);
        Ok(match spec.route {
            Route::Local => Routed::Local(command),
            Route::Consensus => Routed::Consensus(command),
        })
    }
}

/// Body of the `0x76`/`0x77` commit notifications.
///
/// Layout: `[u16 payload serial][u8 notify all][u64 origin][result bytes]`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RaftNotify {
    pub payload_serial: u16,
    pub notify_all: bool,
    pub origin: u64,
    pub result: Bytes,
}

impl RaftNotify {
    pub const MIN_LEN: usize = 11;

    pub fn to_command(&self) -> Command {
        let mut buf = BytesMut::with_capacity(Self::MIN_LEN + self.result.len());
        buf.put_u16(self.payload_serial);
        buf.put_u8(u8::from(self.notify_all));
        buf.put_u64(self.origin);
        buf.put_slice(&self.result);
        let serial = if self.notify_all {
            serial::RAFT_NOTIFY_ALL
        } else {
            serial::RAFT_NOTIFY
        };
        Command::new(serial, buf.freeze()).with_priority(Priority::ClusterExchange)
    }

    pub fn from_command(command: &Command) -> Result<Self, FilterError> {
        if !matches!(
            command.serial(),
            serial::RAFT_NOTIFY | serial::RAFT_NOTIFY_ALL
        ) {
            return Err(FilterError::new(
                FilterErrorKind::UnknownSerial,
                "raft-notify",
                format!("serial {:#x} is not a notify", command.serial()),
            ));
        }
        let mut body = command.payload().clone();
        if body.len() < Self::MIN_LEN {
            return Err(FilterError::new(
                FilterErrorKind::Malformed,
                "raft-notify",
                format!("{} bytes, need at least {}", body.len(), Self::MIN_LEN),
            ));
        }
        let payload_serial = body.get_u16();
        let notify_all = body.get_u8() != 0;
        let origin = body.get_u64();
        Ok(Self {
            payload_serial,
            notify_all,
            origin,
            result: body,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decode_waits_for_whole_command() {
        let mut buf = BytesMut::new();
        Command::new(serial::PING, &b"abc"[..]).encode(&mut buf);
        assert!(Command::decode(&buf[..4]).is_none());
        assert!(Command::decode(&buf[..8]).is_none());
        let (command, used) = Command::decode(&buf).unwrap();
        assert_eq!(used, 9);
        assert_eq!(command.serial(), serial::PING);
        assert_eq!(command.payload().as_ref(), b"abc");
    }

    #[test]
    fn encode_decode_is_identity_on_bytes() {
        let mut first = BytesMut::new();
        Command::new(0x4242, vec![9u8; 300]).encode(&mut first);
        let (command, _) = Command::decode(&first).unwrap();
        let mut second = BytesMut::new();
        command.encode(&mut second);
        assert_eq!(first, second);
    }

    #[test]
    fn registry_resolves_route_and_priority() {
        let registry = CommandRegistry::with_builtin();
        let put = registry.resolve(Command::new(serial::PUT, Bytes::new())).unwrap();
        assert!(put.is_consensus());
        assert_eq!(put.command().priority(), Priority::MetaUpdate);

        let ping = registry.resolve(Command::new(serial::PING, Bytes::new())).unwrap();
        assert!(matches!(ping, Routed::Local(_)));
        assert_eq!(ping.command().priority(), Priority::NetworkControl);

        let err = registry
            .resolve(Command::new(0x999, Bytes::new()))
            .unwrap_err();
        assert_eq!(err.kind, FilterErrorKind::UnknownSerial);
    }

    #[test]
    fn priority_orders_network_control_first() {
        assert!(Priority::NetworkControl < Priority::ClusterExchange);
        assert!(Priority::ClusterExchange < Priority::MetaCreate);
        assert!(Priority::MetaCreate < Priority::Business);
    }

    #[test]
    fn raft_notify_layout() {
        let notify = RaftNotify {
            payload_serial: serial::PUT,
            notify_all: true,
            origin: 0xAABB,
            result: Bytes::from_static(b"ok"),
        };
        let command = notify.to_command();
        assert_eq!(command.serial(), serial::RAFT_NOTIFY_ALL);
        assert_eq!(command.payload().len(), RaftNotify::MIN_LEN + 2);
        assert_eq!(RaftNotify::from_command(&command).unwrap(), notify);
    }

    #[test]
    fn short_raft_notify_is_malformed() {
        let command = Command::new(serial::RAFT_NOTIFY, vec![0u8; 10]);
        let err = RaftNotify::from_command(&command).unwrap_err();
        assert_eq!(err.kind, FilterErrorKind::Malformed);
    }
}
