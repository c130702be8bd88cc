//! Application logic run by the logic workers and the cluster stage.
//!
//! [`LogicHandler::handle`] serves local commands on the session's worker.
//! [`LogicHandler::apply_committed`] applies consensus commands once they are
//! committed, in log order, on every node.

use std::sync::Arc;

use bytes::{BufMut, Bytes, BytesMut};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::command::{serial, Command, Priority};
use crate::consistency::RejectReason;
use crate::session::{Protocol, Session};
use crate::store::Storage;

/// MQTT packet types answered by [`KvLogic`].
mod mqtt {
    pub const CONNECT: u16 = 1;
    pub const CONNACK: u16 = 2;
    pub const PINGREQ: u16 = 12;
    pub const PINGRESP: u16 = 13;
    pub const DISCONNECT: u16 = 14;
}

/// Replies produced while handling one event.
#[derive(Debug, Default)]
pub struct Outbox {
    replies: Vec<Command>,
    close: bool,
}

impl Outbox {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn reply(&mut self, command: Command) {
        self.replies.push(command);
    }

    /// Ask the worker to close the session after the replies are queued.
    pub fn close(&mut self) {
        self.close = true;
    }

    pub fn is_closing(&self) -> bool {
        self.close
    }

    pub fn drain(&mut self) -> std::vec::Drain<'_, Command> {
        self.replies.drain(..)
    }
}

/// Result of applying a committed command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Applied {
    pub result: Bytes,
    /// Deliver the result to every session instead of the origin only.
    pub notify_all: bool,
}

pub trait LogicHandler: Send + Sync {
    fn handle(&self, session: &Arc<Session>, command: Command, outbox: &mut Outbox);

    fn apply_committed(&self, command: &Command) -> Applied;

    /// A commit notification reached the session's worker.
    fn on_notify(&self, session: &Arc<Session>, notify: Command, outbox: &mut Outbox) {
        let _ = session;
        outbox.reply(notify);
    }

    fn session_closed(&self, _session: &Arc<Session>) {}
}

/// Body of a `PUT` command.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PutRequest {
    pub key: String,
    pub value: String,
}

impl PutRequest {
    pub fn to_command(&self) -> Result<Command, bincode::Error> {
        Ok(Command::new(serial::PUT, bincode::serialize(self)?))
    }
}

/// `REJECTED` reply: `[u16 rejected serial][u8 reason]`.
pub fn rejected(rejected_serial: u16, reason: RejectReason) -> Command {
    let mut body = BytesMut::with_capacity(3);
    body.put_u16(rejected_serial);
    body.put_u8(reason as u8);
    Command::new(serial::REJECTED, body.freeze()).with_priority(Priority::ClusterExchange)
}

/// Key-value demo service: ping, get, replicated put and announce, topology.
pub struct KvLogic {
    storage: Arc<dyn Storage>,
    gateways: Vec<String>,
}

impl KvLogic {
    pub fn new(storage: Arc<dyn Storage>, gateways: Vec<String>) -> Self {
        Self { storage, gateways }
    }

    fn handle_mqtt(&self, session: &Arc<Session>, packet_type: u16, outbox: &mut Outbox) {
        match packet_type {
            mqtt::CONNECT => outbox.reply(Command::new(
                serial::MQTT_BASE | mqtt::CONNACK,
                Bytes::from_static(&[0x00, 0x00, 0x00]),
            )),
            mqtt::PINGREQ => outbox.reply(Command::new(
                serial::MQTT_BASE | mqtt::PINGRESP,
                Bytes::from_static(&[0x00]),
            )),
            mqtt::DISCONNECT => outbox.close(),
            other => debug!(session = session.id(), packet_type = other, "mqtt packet ignored"),
        }
    }
}

impl LogicHandler for KvLogic {
    fn handle(&self, session: &Arc<Session>, command: Command, outbox: &mut Outbox) {
        match command.serial() {
            serial::PING => outbox.reply(Command::new(serial::PONG, command.payload().clone())),
            serial::GET => {
                let Ok(key) = std::str::from_utf8(command.payload()) else {
                    outbox.reply(rejected(serial::GET, RejectReason::Invalid));
                    return;
                };
                let value = self.storage.query(key);
                match bincode::serialize(&value) {
                    Ok(body) => outbox.reply(Command::new(serial::VALUE, body)),
                    Err(err) => {
                        warn!(session = session.id(), error = %err, "failed to encode value")
                    }
                }
            }
            serial::TOPOLOGY => match bincode::serialize(&self.gateways) {
                Ok(body) => outbox.reply(Command::new(serial::TOPOLOGY_REPLY, body)),
                Err(err) => {
                    warn!(session = session.id(), error = %err, "failed to encode gateways")
                }
            },
            mqtt_serial if mqtt_serial & 0xFFF0 == serial::MQTT_BASE => {
                self.handle_mqtt(session, mqtt_serial - serial::MQTT_BASE, outbox)
            }
            other => debug!(session = session.id(), serial = other, "no local handler"),
        }
    }

    fn apply_committed(&self, command: &Command) -> Applied {
        match command.serial() {
            serial::PUT => {
                let previous = match bincode::deserialize::<PutRequest>(command.payload()) {
                    Ok(put) => self.storage.upsert(put.key, put.value),
                    Err(err) => {
                        warn!(error = %err, "committed put is malformed");
                        None
                    }
                };
                Applied {
                    result: bincode::serialize(&previous).map(Bytes::from).unwrap_or_default(),
                    notify_all: false,
                }
            }
            serial::ANNOUNCE => Applied {
                result: command.payload().clone(),
                notify_all: true,
            },
            other => {
                warn!(serial = other, "no apply handler for committed command");
                Applied {
                    result: Bytes::new(),
                    notify_all: false,
                }
            }
        }
    }

    /// MQTT sessions have no encoding for commit notifications.
    fn on_notify(&self, session: &Arc<Session>, notify: Command, outbox: &mut Outbox) {
        if session.context().protocol == Protocol::Framed {
            outbox.reply(notify);
        }
    }

    fn session_closed(&self, session: &Arc<Session>) {
        debug!(session = session.id(), "logic released session");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStorage;
    use tokio::sync::mpsc::unbounded_channel;

    fn logic() -> (KvLogic, Arc<MemoryStorage>) {
        let storage = Arc::new(MemoryStorage::new());
        let logic = KvLogic::new(
            Arc::clone(&storage) as Arc<dyn Storage>,
            vec!["10.0.0.1:7400".to_string()],
        );
        (logic, storage)
    }

    fn session() -> Arc<Session> {
        let (tx, _rx) = unbounded_channel();
        Arc::new(Session::new(1, None, tx))
    }

    #[test]
    fn ping_echoes_payload_as_pong() {
        let (logic, _) = logic();
        let mut outbox = Outbox::new();
        logic.handle(&session(), Command::new(serial::PING, &b"x"[..]), &mut outbox);
        let replies: Vec<_> = outbox.drain().collect();
        assert_eq!(replies, vec![Command::new(serial::PONG, &b"x"[..])]);
    }

    #[test]
    fn committed_put_is_visible_to_get() {
        let (logic, storage) = logic();
        let put = PutRequest {
            key: "k".into(),
            value: "v".into(),
        }
        .to_command()
        .unwrap();
        let applied = logic.apply_committed(&put);
        assert!(!applied.notify_all);
        assert_eq!(bincode::deserialize::<Option<String>>(&applied.result).unwrap(), None);
        assert_eq!(storage.query("k").as_deref(), Some("v"));

        let mut outbox = Outbox::new();
        logic.handle(&session(), Command::new(serial::GET, &b"k"[..]), &mut outbox);
        let reply = outbox.drain().next().unwrap();
        assert_eq!(reply.serial(), serial::VALUE);
        let value: Option<String> = bincode::deserialize(reply.payload()).unwrap();
        assert_eq!(value.as_deref(), Some("v"));
    }

    #[test]
    fn announce_is_broadcast() {
        let (logic, _) = logic();
        let applied = logic.apply_committed(&Command::new(serial::ANNOUNCE, &b"hello"[..]));
        assert!(applied.notify_all);
        assert_eq!(applied.result.as_ref(), b"hello");
    }

    #[test]
    fn topology_lists_gateways() {
        let (logic, _) = logic();
        let mut outbox = Outbox::new();
        logic.handle(&session(), Command::new(serial::TOPOLOGY, Bytes::new()), &mut outbox);
        let reply = outbox.drain().next().unwrap();
        let gateways: Vec<String> = bincode::deserialize(reply.payload()).unwrap();
        assert_eq!(gateways, vec!["10.0.0.1:7400".to_string()]);
    }

    #[test]
    fn mqtt_disconnect_closes_and_pingreq_answers() {
        let (logic, _) = logic();
        let mut outbox = Outbox::new();
        logic.handle(&session(), Command::new(serial::MQTT_BASE | 12, &[0u8][..]), &mut outbox);
        assert_eq!(outbox.drain().next().map(|c| c.serial()), Some(serial::MQTT_BASE | 13));
        logic.handle(&session(), Command::new(serial::MQTT_BASE | 14, &[0u8][..]), &mut outbox);
        assert!(outbox.is_closing());
    }

    #[test]
    fn rejected_layout() {
        let command = rejected(serial::PUT, RejectReason::Timeout);
        assert_eq!(command.payload().as_ref(), &[0x00, 0x20, 4]);
    }
}
