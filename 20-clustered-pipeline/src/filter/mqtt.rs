use bytes::{Buf, BufMut, Bytes, BytesMut};

use super::{Direction, FilterStage, Frame, Preflight};
use crate::command::{serial, Command};
use crate::error::{FilterError, FilterErrorKind};
use crate::session::{Context, Protocol};

/// Splits MQTT control packets on their fixed header.
///
/// Packets are carried opaquely: the decoded command has serial
/// `0x110 | packet_type` and a payload of `[flags][variable header + body]`.
pub struct MqttFrameFilter {
    max_frame: usize,
}

impl MqttFrameFilter {
    pub fn new(max_frame: usize) -> Self {
        Self { max_frame }
    }
}

/// Parses the remaining-length varint. `Ok(None)` means more bytes are needed.
fn remaining_length(buf: &[u8]) -> Result<Option<(usize, usize)>, FilterError> {
    let mut value = 0usize;
    for (i, byte) in buf.iter().enumerate().take(4) {
        value |= usize::from(byte & 0x7F) << (7 * i);
        if byte & 0x80 == 0 {
            return Ok(Some((value, i + 1)));
        }
    }
    if buf.len() >= 4 {
        return Err(FilterError::new(
            FilterErrorKind::Malformed,
            "mqtt",
            "remaining length longer than four bytes",
        ));
    }
    Ok(None)
}

fn put_remaining_length(out: &mut BytesMut, mut len: usize) {
    loop {
        let mut byte = (len % 128) as u8;
        len /= 128;
        if len > 0 {
            byte |= 0x80;
        }
        out.put_u8(byte);
        if len == 0 {
            break;
        }
    }
}

impl FilterStage for MqttFrameFilter {
    fn name(&self) -> &'static str {
        "mqtt"
    }

    fn check_type(&self, ctx: &Context, direction: Direction, frame: &Frame) -> bool {
        ctx.protocol == Protocol::Mqtt
            && match direction {
                Direction::Decode => matches!(frame, Frame::Stream(_)),
                Direction::Encode => matches!(frame, Frame::Command(_)),
            }
    }

    fn decode(&self, ctx: &mut Context, frame: Frame) -> Result<Vec<Frame>, FilterError> {
        if let Frame::Stream(bytes) = frame {
            ctx.inbound.extend_from_slice(&bytes);
        }
        let mut commands = Vec::new();
        while ctx.inbound.len() >= 2 {
            let first = ctx.inbound[0];
            let packet_type = u16::from(first >> 4);
            if packet_type == 0 || packet_type == 15 {
                return Err(FilterError::new(
                    FilterErrorKind::Protocol,
                    "mqtt",
                    format!("reserved packet type {packet_type}"),
                ));
            }
            let Some((len, len_bytes)) = remaining_length(&ctx.inbound[1..])? else {
                break;
            };
            if len > self.max_frame {
                return Err(FilterError::new(
                    FilterErrorKind::Oversized,
                    "mqtt",
                    format!("packet of {len} bytes exceeds limit {}", self.max_frame),
                ));
            }
            let header = 1 + len_bytes;
            if ctx.inbound.len() < header + len {
                break;
            }
            ctx.inbound.advance(header);
            let body = ctx.inbound.split_to(len);
            let mut payload = BytesMut::with_capacity(1 + len);
            payload.put_u8(first & 0x0F);
            payload.extend_from_slice(&body);
            commands.push(Frame::Command(Command::new(
                serial::MQTT_BASE | packet_type,
                payload.freeze(),
            )));
        }
        Ok(commands)
    }

    fn pre_encode(&self, _ctx: &mut Context, frame: &Frame) -> Preflight {
        let Frame::Command(command) = frame else {
            return Preflight::Proceed;
        };
        let packet_type = command.serial().wrapping_sub(serial::MQTT_BASE);
        if !(1..=14).contains(&packet_type) || command.payload().is_empty() {
            return Preflight::Fail(FilterError::new(
                FilterErrorKind::Protocol,
                "mqtt",
                format!("serial {:#x} cannot be sent to an MQTT session", command.serial()),
            ));
        }
        Preflight::Proceed
    }

    fn encode(&self, _ctx: &mut Context, frame: Frame) -> Result<Vec<Frame>, FilterError> {
        let Frame::Command(command) = frame else {
            return Ok(vec![frame]);
        };
        let packet_type = (command.serial() - serial::MQTT_BASE) as u8;
        let mut payload: Bytes = command.payload().clone();
        let flags = payload.get_u8() & 0x0F;
        let mut out = BytesMut::with_capacity(5 + payload.len());
        out.put_u8((packet_type << 4) | flags);
        put_remaining_length(&mut out, payload.len());
        out.extend_from_slice(&payload);
        Ok(vec![Frame::Stream(out.freeze())])
    }
}
