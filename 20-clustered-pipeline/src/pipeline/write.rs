use std::collections::HashMap;
use std::sync::Arc;

use bytes::BytesMut;
use tracing::debug;

use crate::event::{Event, EventContent, Fault};
use crate::filter::FilterChain;
use crate::ring::{Ring, Sequence};
use crate::session::{Session, SessionId};
use crate::stage::EventHandler;

use super::{forward, report};

/// Outbound rings of every worker → filter chain encode → wire ring.
pub struct WriteEncode {
    chain: Arc<FilterChain>,
    wire: Arc<Ring<Event>>,
    errors: Arc<Ring<Event>>,
}

impl WriteEncode {
    pub fn new(chain: Arc<FilterChain>, wire: Arc<Ring<Event>>, errors: Arc<Ring<Event>>) -> Self {
        Self {
            chain,
            wire,
            errors,
        }
    }
}

impl EventHandler for WriteEncode {
    fn on_event(&mut self, event: Event, _sequence: Sequence, _end_of_batch: bool) {
        if !event.is_live() {
            return;
        }
        let Some(session) = event.session else {
            return;
        };
        match event.content {
            EventContent::Outbound(command) => {
                let encoded = self.chain.encode(&mut session.context(), command);
                match encoded {
                    Ok(bytes) => forward(&self.wire, &session, EventContent::Wire(bytes)),
                    Err(err) => report(&self.errors, &session, Fault::Filter(err)),
                }
            }
            EventContent::Closed => {
                forward(&self.wire, &session, EventContent::Closed);
            }
            other => debug!(
                session = session.id(),
                content = ?other,
                "unexpected event on outbound ring"
            ),
        }
    }
}

/// Wire ring → session writers. Bytes are coalesced per session and handed
/// to the writer once per batch.
#[derive(Default)]
pub struct WriteDispatch {
    pending: HashMap<SessionId, (Arc<Session>, BytesMut)>,
}

impl WriteDispatch {
    pub fn new() -> Self {
        Self::default()
    }

    fn flush(&mut self) {
        for (_, (session, bytes)) in self.pending.drain() {
            if !bytes.is_empty() && !session.deliver(bytes.freeze()) {
                debug!(session = session.id(), "writer gone, dropping bytes");
            }
        }
    }

    fn flush_session(&mut self, session: &Arc<Session>) {
        if let Some((_, bytes)) = self.pending.remove(&session.id()) {
            session.deliver(bytes.freeze());
        }
    }
}

impl EventHandler for WriteDispatch {
    fn on_event(&mut self, event: Event, _sequence: Sequence, end_of_batch: bool) {
        if event.is_live() {
            if let Some(session) = event.session {
                match event.content {
                    EventContent::Wire(bytes) => {
                        self.pending
                            .entry(session.id())
                            .or_insert_with(|| (Arc::clone(&session), BytesMut::new()))
                            .1
                            .extend_from_slice(&bytes);
                    }
                    // Last event of a session: deliver what is left, then
                    // release its writer and buffers.
                    EventContent::Closed => {
                        self.flush_session(&session);
                        session.close();
                        session.context().release();
                        debug!(session = session.id(), "session released");
                    }
                    other => debug!(
                        session = session.id(),
                        content = ?other,
                        "unexpected event on wire ring"
                    ),
                }
            }
        }
        if end_of_batch {
            self.flush();
        }
    }

    fn on_shutdown(&mut self) {
        self.flush();
    }
}
