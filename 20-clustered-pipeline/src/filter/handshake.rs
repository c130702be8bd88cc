use bytes::Bytes;

use super::{Direction, FilterStage, Frame, Preflight};
use crate::error::{FilterError, FilterErrorKind};
use crate::session::{handshake, Context, Protocol};

/// Preamble a client sends before speaking the framed protocol.
pub const PREAMBLE: [u8; 4] = *b"RLY1";

/// First byte of an MQTT CONNECT packet.
const MQTT_CONNECT: u8 = 0x10;

/// Sniffs the protocol from the first bytes of a connection.
pub struct HandshakeFilter;

impl FilterStage for HandshakeFilter {
    fn name(&self) -> &'static str {
        "handshake"
    }

    fn check_type(&self, ctx: &Context, direction: Direction, frame: &Frame) -> bool {
        direction == Direction::Decode
            && ctx.protocol == Protocol::Unknown
            && matches!(frame, Frame::Stream(_))
    }

    fn pre_decode(&self, ctx: &mut Context, frame: &Frame) -> Preflight {
        if let Frame::Stream(bytes) = frame {
            ctx.preamble.extend_from_slice(bytes);
        }
        let seen = &ctx.preamble[..];
        match seen.first() {
            None => Preflight::NeedMore,
            Some(&MQTT_CONNECT) => Preflight::Proceed,
            Some(_) if seen.len() >= PREAMBLE.len() && seen.starts_with(&PREAMBLE) => {
                Preflight::Proceed
            }
            Some(_) if PREAMBLE.starts_with(seen) => Preflight::NeedMore,
            Some(_) if seen.starts_with(b"GET ") || b"GET ".starts_with(seen) => {
                Preflight::Fail(FilterError::new(
                    FilterErrorKind::Protocol,
                    "handshake",
                    "websocket upgrade is not served on this listener",
                ))
            }
            Some(first) => Preflight::Fail(FilterError::new(
                FilterErrorKind::Protocol,
                "handshake",
                format!("unrecognised leading byte {first:#04x}"),
            )),
        }
    }

    /// Consumes the buffered preamble that `pre_decode` collected.
    fn decode(&self, ctx: &mut Context, _frame: Frame) -> Result<Vec<Frame>, FilterError> {
        let mut seen = std::mem::take(&mut ctx.preamble);
        if seen.first() == Some(&MQTT_CONNECT) {
            ctx.protocol = Protocol::Mqtt;
        } else {
            ctx.protocol = Protocol::Framed;
            let _ = seen.split_to(PREAMBLE.len());
            ctx.mark(handshake::PREAMBLE_CONSUMED);
        }
        ctx.mark(handshake::PROTOCOL_DETECTED);

        if seen.is_empty() {
            return Ok(Vec::new());
        }
        Ok(vec![Frame::Stream(Bytes::from(seen))])
    }

    fn encode(&self, _ctx: &mut Context, frame: Frame) -> Result<Vec<Frame>, FilterError> {
        Ok(vec![frame])
    }
}
