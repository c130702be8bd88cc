use std::sync::Arc;

use tracing::{debug, trace};

use crate::dispatch::Dispatcher;
use crate::event::{Event, EventContent, Fault};
use crate::filter::FilterChain;
use crate::ring::{Ring, Sequence};
use crate::stage::EventHandler;

use super::{forward, report};

/// Read ring → filter chain decode → decoded ring.
pub struct ReadDecode {
    chain: Arc<FilterChain>,
    decoded: Arc<Ring<Event>>,
    errors: Arc<Ring<Event>>,
}

impl ReadDecode {
    pub fn new(
        chain: Arc<FilterChain>,
        decoded: Arc<Ring<Event>>,
        errors: Arc<Ring<Event>>,
    ) -> Self {
        Self {
            chain,
            decoded,
            errors,
        }
    }
}

impl EventHandler for ReadDecode {
    fn on_event(&mut self, event: Event, _sequence: Sequence, _end_of_batch: bool) {
        if !event.is_live() {
            return;
        }
        let Some(session) = event.session else {
            return;
        };
        match event.content {
            EventContent::Inbound(bytes) => {
                let decoded = self.chain.decode(&mut session.context(), bytes);
                match decoded {
                    Ok(decoded) => {
                        for err in decoded.dropped {
                            report(&self.errors, &session, Fault::Filter(err));
                        }
                        for routed in decoded.commands {
                            trace!(
                                session = session.id(),
                                serial = routed.command().serial(),
                                "decoded"
                            );
                            forward(&self.decoded, &session, EventContent::Decoded(routed));
                        }
                    }
                    Err(err) => report(&self.errors, &session, Fault::Filter(err)),
                }
            }
            EventContent::Closed => {
                forward(&self.decoded, &session, EventContent::Closed);
            }
            other => debug!(
                session = session.id(),
                content = ?other,
                "unexpected event on read ring"
            ),
        }
    }
}

/// Decoded ring → dispatcher (logic worker or cluster stage).
pub struct DecodedDispatch {
    dispatcher: Arc<Dispatcher>,
    errors: Arc<Ring<Event>>,
}

impl DecodedDispatch {
    pub fn new(dispatcher: Arc<Dispatcher>, errors: Arc<Ring<Event>>) -> Self {
        Self { dispatcher, errors }
    }
}

impl EventHandler for DecodedDispatch {
    fn on_event(&mut self, event: Event, _sequence: Sequence, _end_of_batch: bool) {
        if !event.is_live() {
            return;
        }
        let Some(session) = event.session else {
            return;
        };
        match event.content {
            EventContent::Decoded(routed) => {
                if let Err(fault) = self.dispatcher.dispatch(&session, routed) {
                    report(&self.errors, &session, fault);
                }
            }
            // Follows every earlier command of the session onto its worker.
            EventContent::Closed => {
                forward(self.dispatcher.worker_ring(&session), &session, EventContent::Closed);
            }
            other => debug!(
                session = session.id(),
                content = ?other,
                "unexpected event on decoded ring"
            ),
        }
    }
}
