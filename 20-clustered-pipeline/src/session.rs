//! Client sessions and their protocol context.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use bytes::{Bytes, BytesMut};
use parking_lot::{Mutex, MutexGuard, RwLock};
use tokio::sync::mpsc::UnboundedSender;

pub type SessionId = u64;

/// Wire protocol spoken on a connection, decided by the handshake stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Protocol {
    #[default]
    Unknown,
    /// Length-prefixed command frames behind a `RLY1` preamble.
    Framed,
    Mqtt,
}

/// Handshake progress bits kept in [`Context::handshake`].
pub mod handshake {
    pub const PROTOCOL_DETECTED: u8 = 0b0001;
    pub const PREAMBLE_CONSUMED: u8 = 0b0010;
    pub const CIPHER_READY: u8 = 0b0100;
}

/// Per-session protocol state touched by the filter chain.
#[derive(Debug, Default)]
pub struct Context {
    pub protocol: Protocol,
    pub handshake: u8,
    /// Bytes held by the handshake stage until it can sniff the protocol.
    pub preamble: BytesMut,
    /// Partial frame carried between reads by the framing stages.
    pub inbound: BytesMut,
    /// Keystream offsets for the cipher stage, one per direction.
    pub cipher_read: u64,
    pub cipher_write: u64,
}

impl Context {
    pub fn has(&self, bits: u8) -> bool {
        self.handshake & bits == bits
    }

    pub fn mark(&mut self, bits: u8) {
        self.handshake |= bits;
    }

    /// Drops buffered bytes; called once the session is closed.
    pub fn release(&mut self) {
        self.preamble = BytesMut::new();
        self.inbound = BytesMut::new();
    }
}

pub struct Session {
    id: SessionId,
    peer: Option<SocketAddr>,
    closed: AtomicBool,
    context: Mutex<Context>,
    outbound: Mutex<Option<UnboundedSender<Bytes>>>,
}

impl Session {
    pub fn new(
        id: SessionId,
        peer: Option<SocketAddr>,
        outbound: UnboundedSender<Bytes>,
    ) -> Self {
        Self {
            id,
            peer,
            closed: AtomicBool::new(false),
            context: Mutex::new(Context::default()),
            outbound: Mutex::new(Some(outbound)),
        }
    }

    pub fn id(&self) -> SessionId {
        self.id
    }

    /// Stable key used to pin the session to one logic worker.
    pub fn affinity_key(&self) -> u64 {
        self.id
    }

    pub fn peer(&self) -> Option<SocketAddr> {
        self.peer
    }

    pub fn context(&self) -> MutexGuard<'_, Context> {
        self.context.lock()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Marks the session closed and drops its writer. Returns `true` for the
    /// call that actually closed it.
    pub fn close(&self) -> bool {
        if self.closed.swap(true, Ordering::AcqRel) {
            return false;
        }
        self.outbound.lock().take();
        true
    }

    /// Queues bytes for the connection's writer task.
    pub fn deliver(&self, bytes: Bytes) -> bool {
        if self.is_closed() {
            return false;
        }
        match self.outbound.lock().as_ref() {
            Some(tx) => tx.send(bytes).is_ok(),
            None => false,
        }
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("peer", &self.peer)
            .field("closed", &self.is_closed())
            .finish()
    }
}

/// Live sessions on this node, used to route commit notifications.
#[derive(Default)]
pub struct SessionRegistry {
    sessions: RwLock<HashMap<SessionId, Arc<Session>>>,
    next_id: AtomicU64,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self {
            sessions: RwLock::new(HashMap::new()),
            next_id: AtomicU64::new(1),
        }
    }

    pub fn next_id(&self) -> SessionId {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    pub fn insert(&self, session: Arc<Session>) {
        self.sessions.write().insert(session.id(), session);
    }

    pub fn remove(&self, id: SessionId) -> Option<Arc<Session>> {
        self.sessions.write().remove(&id)
    }

    pub fn get(&self, id: SessionId) -> Option<Arc<Session>> {
        self.sessions.read().get(&id).cloned()
    }

    /// Open sessions whose handshake has completed.
    pub fn established(&self) -> Vec<Arc<Session>> {
        self.sessions
            .read()
            .values()
            .filter(|session| {
                !session.is_closed() && session.context().has(handshake::PROTOCOL_DETECTED)
            })
            .cloned()
            .collect()
    }

    pub fn len(&self) -> usize {
        self.sessions.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::mpsc::unbounded_channel;

    #[test]
    fn close_is_reported_once_and_drops_writer() {
        let (tx, mut rx) = unbounded_channel();
        let session = Session::new(1, None, tx);
        assert!(session.deliver(Bytes::from_static(b"hi")));
        assert!(session.close());
        assert!(!session.close());
        assert!(!session.deliver(Bytes::from_static(b"late")));
        assert_eq!(rx.try_recv().unwrap(), Bytes::from_static(b"hi"));
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn registry_lists_only_established_sessions() {
        let registry = SessionRegistry::new();
        let (tx, _rx) = unbounded_channel();
        let a = Arc::new(Session::new(registry.next_id(), None, tx.clone()));
        let b = Arc::new(Session::new(registry.next_id(), None, tx));
        a.context().mark(handshake::PROTOCOL_DETECTED);
        registry.insert(Arc::clone(&a));
        registry.insert(Arc::clone(&b));

        let established = registry.established();
        assert_eq!(established.len(), 1);
        assert_eq!(established[0].id(), a.id());

        a.close();
        assert!(registry.established().is_empty());
        assert_eq!(registry.len(), 2);
    }
}
