//! Ring slot contents.

use std::fmt;
use std::sync::Arc;

use bytes::Bytes;

use crate::command::{Command, Routed};
use crate::consistency::{Proposal, RejectReason};
use crate::error::{FilterError, FilterErrorKind};
use crate::session::Session;

/// Why a stage turned an event into a fault.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Fault {
    Filter(FilterError),
    /// A downstream ring stayed full past the stage's patience.
    Overloaded { stage: &'static str },
}

impl Fault {
    /// Whether the session cannot continue after this fault.
    pub fn closes_session(&self) -> bool {
        match self {
            Fault::Filter(err) => !err.kind.is_recoverable(),
            Fault::Overloaded { .. } => false,
        }
    }

    pub fn filter_kind(&self) -> Option<FilterErrorKind> {
        match self {
            Fault::Filter(err) => Some(err.kind),
            Fault::Overloaded { .. } => None,
        }
    }
}

impl fmt::Display for Fault {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Fault::Filter(err) => write!(f, "{err}"),
            Fault::Overloaded { stage } => write!(f, "{stage} overloaded"),
        }
    }
}

#[derive(Debug, Default)]
pub enum EventContent {
    #[default]
    Empty,
    /// Raw bytes read from the connection.
    Inbound(Bytes),
    /// The session closed; stages release what they hold for it.
    Closed,
    Decoded(Routed),
    /// Consensus request waiting for the cluster stage.
    Proposal(Proposal),
    /// Proposal committed at `index` by the cluster.
    Committed { index: u64, proposal: Proposal },
    /// Commit notification (`0x76`/`0x77`) for a session's logic worker.
    Notify(Command),
    /// A consensus command that was not accepted.
    Rejected { serial: u16, reason: RejectReason },
    /// Application reply, not yet encoded.
    Outbound(Command),
    /// Encoded bytes ready for the socket.
    Wire(Bytes),
    Fault(Fault),
}

/// One ring slot: content plus the session it belongs to.
///
/// Consumers take events out of the ring, which resets the slot and drops its
/// session reference.
#[derive(Debug, Default)]
pub struct Event {
    pub session: Option<Arc<Session>>,
    pub content: EventContent,
}

impl Event {
    pub fn new(session: Option<Arc<Session>>, content: EventContent) -> Self {
        Self { session, content }
    }

    pub fn for_session(session: &Arc<Session>, content: EventContent) -> Self {
        Self::new(Some(Arc::clone(session)), content)
    }

    pub fn is_error(&self) -> bool {
        matches!(self.content, EventContent::Fault(_))
    }

    pub fn fault(&self) -> Option<&Fault> {
        match &self.content {
            EventContent::Fault(fault) => Some(fault),
            _ => None,
        }
    }

    /// Whether the event should still be acted on. Events of a closed session
    /// are dropped, except the `Closed` marker itself.
    pub fn is_live(&self) -> bool {
        match (&self.content, &self.session) {
            (EventContent::Closed, _) => true,
            (_, Some(session)) => !session.is_closed(),
            (_, None) => true,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self.content {
            EventContent::Empty => "empty",
            EventContent::Inbound(_) => "inbound",
            EventContent::Closed => "closed",
            EventContent::Decoded(_) => "decoded",
            EventContent::Proposal(_) => "proposal",
            EventContent::Committed { .. } => "committed",
            EventContent::Notify(_) => "notify",
            EventContent::Rejected { .. } => "rejected",
            EventContent::Outbound(_) => "outbound",
            EventContent::Wire(_) => "wire",
            EventContent::Fault(_) => "fault",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::mpsc::unbounded_channel;

    #[test]
    fn closed_session_events_are_dead_except_closed_marker() {
        let (tx, _rx) = unbounded_channel();
        let session = Arc::new(Session::new(7, None, tx));
        let wire = Event::for_session(&session, EventContent::Wire(Bytes::from_static(b"x")));
        let closed = Event::for_session(&session, EventContent::Closed);
        assert!(wire.is_live());
        session.close();
        assert!(!wire.is_live());
        assert!(closed.is_live());
    }

    #[test]
    fn fault_classification() {
        let unknown = Fault::Filter(FilterError::new(
            FilterErrorKind::UnknownSerial,
            "codec",
            "0x99",
        ));
        let malformed = Fault::Filter(FilterError::new(FilterErrorKind::Malformed, "frame", "bad"));
        assert!(!unknown.closes_session());
        assert!(malformed.closes_session());
        assert!(!Fault::Overloaded { stage: "dispatch" }.closes_session());

        let event = Event::new(None, EventContent::Fault(malformed));
        assert!(event.is_error());
        assert_eq!(event.fault().and_then(Fault::filter_kind), Some(FilterErrorKind::Malformed));
    }
}
