use std::sync::Arc;

use tracing::debug;

use crate::command::{Command, RaftNotify, Routed};
use crate::event::{Event, EventContent};
use crate::logic::{self, LogicHandler, Outbox};
use crate::ring::{Ring, Sequence};
use crate::session::Session;
use crate::stage::EventHandler;

/// One logic worker. Every session is pinned to exactly one of these, so a
/// session's commands are handled in arrival order.
pub struct LogicWorker {
    index: usize,
    logic: Arc<dyn LogicHandler>,
    outbound: Arc<Ring<Event>>,
    outbox: Outbox,
}

impl LogicWorker {
    pub fn new(index: usize, logic: Arc<dyn LogicHandler>, outbound: Arc<Ring<Event>>) -> Self {
        Self {
            index,
            logic,
            outbound,
            outbox: Outbox::new(),
        }
    }

    /// Applies a consensus command directly when the node runs without
    /// cluster routing, answering the way a commit would.
    fn apply_standalone(&mut self, session: &Arc<Session>, command: &Command) {
        let applied = self.logic.apply_committed(command);
        let notify = RaftNotify {
            payload_serial: command.serial(),
            notify_all: applied.notify_all,
            origin: session.id(),
            result: applied.result,
        };
        self.logic.on_notify(session, notify.to_command(), &mut self.outbox);
    }

    fn flush(&mut self, session: &Arc<Session>) {
        let replies: Vec<Command> = self.outbox.drain().collect();
        for reply in replies {
            self.send(session, EventContent::Outbound(reply));
        }
        if std::mem::take(&mut self.outbox).is_closing() {
            debug!(worker = self.index, session = session.id(), "logic closed session");
            self.send(session, EventContent::Closed);
        }
    }

    fn send(&self, session: &Arc<Session>, content: EventContent) {
        let event = Event::for_session(session, content);
        let kind = event.kind();
        if let Err(err) = self.outbound.push(event) {
            debug!(
                worker = self.index,
                session = session.id(),
                kind,
                error = %err,
                "outbound ring gone, dropping"
            );
        }
    }
}

impl EventHandler for LogicWorker {
    fn on_event(&mut self, event: Event, _sequence: Sequence, _end_of_batch: bool) {
        if !event.is_live() {
            return;
        }
        let kind = event.kind();
        let Some(session) = event.session else {
            return;
        };
        match event.content {
            EventContent::Decoded(Routed::Local(command)) => {
                self.logic.handle(&session, command, &mut self.outbox)
            }
            EventContent::Decoded(Routed::Consensus(command)) => {
                self.apply_standalone(&session, &command)
            }
            EventContent::Notify(notify) => {
                self.logic.on_notify(&session, notify, &mut self.outbox)
            }
            EventContent::Rejected { serial, reason } => {
                self.outbox.reply(logic::rejected(serial, reason))
            }
            EventContent::Closed => {
                self.logic.session_closed(&session);
                self.send(&session, EventContent::Closed);
                return;
            }
            _ => {
                debug!(
                    worker = self.index,
                    session = session.id(),
                    kind,
                    "unexpected event on logic ring"
                );
                return;
            }
        }
        self.flush(&session);
    }
}
