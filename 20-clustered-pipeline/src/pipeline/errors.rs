use tracing::{debug, warn};

use crate::event::{Event, EventContent};
use crate::ring::Sequence;
use crate::stage::EventHandler;

/// Consumer of the error ring. Logs every fault and closes the session when
/// the fault is not recoverable.
#[derive(Default)]
pub struct ErrorConsumer {
    handled: u64,
}

impl ErrorConsumer {
    pub fn new() -> Self {
        Self::default()
    }
}

impl EventHandler for ErrorConsumer {
    fn on_event(&mut self, event: Event, _sequence: Sequence, _end_of_batch: bool) {
        let EventContent::Fault(fault) = event.content else {
            return;
        };
        self.handled += 1;
        let session_id = event.session.as_ref().map(|session| session.id());
        if !fault.closes_session() {
            debug!(session = ?session_id, %fault, "dropped frame");
            return;
        }
        let peer = event.session.as_ref().and_then(|session| session.peer());
        warn!(session = ?session_id, ?peer, %fault, "closing session after error");
        if let Some(session) = event.session {
            session.close();
        }
    }

    fn on_shutdown(&mut self) {
        debug!(faults = self.handled, "error consumer stopped");
    }
}
