use bytes::{Buf, BufMut, BytesMut};

use super::{Direction, FilterStage, Frame, Preflight};
use crate::error::{FilterError, FilterErrorKind};
use crate::session::{Context, Protocol};

const LEN_PREFIX: usize = 4;

/// `[u32 length][body]` framing for the proprietary protocol.
pub struct FrameFilter {
    max_frame: usize,
}

impl FrameFilter {
    pub fn new(max_frame: usize) -> Self {
        Self { max_frame }
    }

    fn oversized(&self, len: usize) -> FilterError {
        FilterError::new(
            FilterErrorKind::Oversized,
            "frame",
            format!("frame of {len} bytes exceeds limit {}", self.max_frame),
        )
    }
}

impl FilterStage for FrameFilter {
    fn name(&self) -> &'static str {
        "frame"
    }

    fn check_type(&self, ctx: &Context, direction: Direction, frame: &Frame) -> bool {
        ctx.protocol == Protocol::Framed
            && match direction {
                Direction::Decode => matches!(frame, Frame::Stream(_)),
                Direction::Encode => matches!(frame, Frame::Packet(_)),
            }
    }

    /// Rejects an oversized length header before any body is buffered.
    fn pre_decode(&self, ctx: &mut Context, frame: &Frame) -> Preflight {
        let Frame::Stream(bytes) = frame else {
            return Preflight::Proceed;
        };
        let mut header = [0u8; LEN_PREFIX];
        let buffered = ctx.inbound.len().min(LEN_PREFIX);
        header[..buffered].copy_from_slice(&ctx.inbound[..buffered]);
        let needed = LEN_PREFIX - buffered;
        if bytes.len() < needed {
            return Preflight::Proceed;
        }
        header[buffered..].copy_from_slice(&bytes[..needed]);
        let len = u32::from_be_bytes(header) as usize;
        if len > self.max_frame {
            return Preflight::Fail(self.oversized(len));
        }
        Preflight::Proceed
    }

    fn decode(&self, ctx: &mut Context, frame: Frame) -> Result<Vec<Frame>, FilterError> {
        if let Frame::Stream(bytes) = frame {
            ctx.inbound.extend_from_slice(&bytes);
        }
        let mut packets = Vec::new();
        while ctx.inbound.len() >= LEN_PREFIX {
            let len = (&ctx.inbound[..LEN_PREFIX]).get_u32() as usize;
            if len > self.max_frame {
                return Err(self.oversized(len));
            }
            if ctx.inbound.len() < LEN_PREFIX + len {
                break;
            }
            ctx.inbound.advance(LEN_PREFIX);
            packets.push(Frame::Packet(ctx.inbound.split_to(len).freeze()));
        }
        Ok(packets)
    }

    fn pre_encode(&self, _ctx: &mut Context, frame: &Frame) -> Preflight {
        match frame {
            Frame::Packet(body) if body.len() > self.max_frame => {
                Preflight::Fail(self.oversized(body.len()))
            }
            _ => Preflight::Proceed,
        }
    }

    fn encode(&self, _ctx: &mut Context, frame: Frame) -> Result<Vec<Frame>, FilterError> {
        let Frame::Packet(body) = frame else {
            return Ok(vec![frame]);
        };
        let mut out = BytesMut::with_capacity(LEN_PREFIX + body.len());
        out.put_u32(body.len() as u32);
        out.extend_from_slice(&body);
        Ok(vec![Frame::Stream(out.freeze())])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;

    fn framed_ctx() -> Context {
        Context {
            protocol: Protocol::Framed,
            ..Context::default()
        }
    }

    #[test]
    fn splits_coalesced_frames_and_keeps_remainder() {
        let filter = FrameFilter::new(1024);
        let mut ctx = framed_ctx();
        let mut wire = BytesMut::new();
        for body in [&b"one"[..], &b"three"[..]] {
            wire.put_u32(body.len() as u32);
            wire.extend_from_slice(body);
        }
        wire.put_u32(4);
        wire.extend_from_slice(b"fo");

        let out = filter.decode(&mut ctx, Frame::Stream(wire.freeze())).unwrap();
        assert_eq!(
            out,
            vec![
                Frame::Packet(Bytes::from_static(b"one")),
                Frame::Packet(Bytes::from_static(b"three")),
            ]
        );
        let out = filter
            .decode(&mut ctx, Frame::Stream(Bytes::from_static(b"ur")))
            .unwrap();
        assert_eq!(out, vec![Frame::Packet(Bytes::from_static(b"four"))]);
        assert!(ctx.inbound.is_empty());
    }

    #[test]
    fn oversized_header_fails_preflight() {
        let filter = FrameFilter::new(16);
        let mut ctx = framed_ctx();
        ctx.inbound.extend_from_slice(&[0, 0]);
        let frame = Frame::Stream(Bytes::from_static(&[1, 0, b'x']));
        match filter.pre_decode(&mut ctx, &frame) {
            Preflight::Fail(err) => assert_eq!(err.kind, FilterErrorKind::Oversized),
            other => panic!("expected oversized, got {other:?}"),
        }
    }
}
