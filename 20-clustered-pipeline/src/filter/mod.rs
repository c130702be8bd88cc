//! Bidirectional protocol filter chain.
//!
//! A chain is an ordered list of [`FilterStage`]s. Decoding walks it from the
//! head (wire bytes) to the tail (routed commands); encoding walks it from the
//! tail back to the head. Stages keep no per-session state of their own: all
//! of it lives in the session's [`Context`], so one chain is shared by every
//! session.

mod cipher;
mod codec;
mod frame;
mod handshake;
mod mqtt;

use std::sync::Arc;

use bytes::{Bytes, BytesMut};

pub use cipher::{Cipher, CipherFilter, XorCipher};
pub use codec::CommandCodecFilter;
pub use frame::FrameFilter;
pub use handshake::{HandshakeFilter, PREAMBLE};
pub use mqtt::MqttFrameFilter;

use crate::command::{Command, CommandRegistry, Routed};
use crate::error::{FilterError, FilterErrorKind};
use crate::session::Context;

/// Unit of data passed between stages.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    /// Raw connection bytes with no boundaries.
    Stream(Bytes),
    /// One delimited frame body.
    Packet(Bytes),
    Command(Command),
    /// A command whose route has been resolved; only produced by decoding.
    Decoded(Routed),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Decode,
    Encode,
}

/// Result of a stage's pre-flight check.
#[derive(Debug)]
pub enum Preflight {
    /// Run the full transform.
    Proceed,
    /// The stage kept what it needed from the input; nothing flows on yet.
    NeedMore,
    Fail(FilterError),
}

/// Output of decoding one read from a connection.
#[derive(Debug, Default)]
pub struct Decoded {
    pub commands: Vec<Routed>,
    /// Frames dropped with a recoverable error. The rest of the read was
    /// still decoded.
    pub dropped: Vec<FilterError>,
}

pub trait FilterStage: Send + Sync {
    fn name(&self) -> &'static str;

    /// Whether `frame` is addressed to this stage. Frames that are not pass
    /// through untouched, which is how protocols share one chain.
    fn check_type(&self, ctx: &Context, direction: Direction, frame: &Frame) -> bool;

    fn pre_decode(&self, _ctx: &mut Context, _frame: &Frame) -> Preflight {
        Preflight::Proceed
    }

    fn decode(&self, ctx: &mut Context, frame: Frame) -> Result<Vec<Frame>, FilterError>;

    fn pre_encode(&self, _ctx: &mut Context, _frame: &Frame) -> Preflight {
        Preflight::Proceed
    }

    fn encode(&self, ctx: &mut Context, frame: Frame) -> Result<Vec<Frame>, FilterError>;
}

pub struct FilterChain {
    stages: Vec<Box<dyn FilterStage>>,
}

impl FilterChain {
    pub fn new(stages: Vec<Box<dyn FilterStage>>) -> Self {
        Self { stages }
    }

    /// Cipher (optional), handshake, framed protocol, MQTT, command codec.
    pub fn standard(
        cipher: Option<Arc<dyn Cipher>>,
        registry: Arc<CommandRegistry>,
        max_frame: usize,
    ) -> Self {
        let mut stages: Vec<Box<dyn FilterStage>> = Vec::new();
        if let Some(cipher) = cipher {
            stages.push(Box::new(CipherFilter::new(cipher)));
        }
        stages.push(Box::new(HandshakeFilter));
        stages.push(Box::new(FrameFilter::new(max_frame)));
        stages.push(Box::new(MqttFrameFilter::new(max_frame)));
        stages.push(Box::new(CommandCodecFilter::new(registry)));
        Self::new(stages)
    }

    pub fn stage_names(&self) -> Vec<&'static str> {
        self.stages.iter().map(|stage| stage.name()).collect()
    }

    /// Turns raw connection bytes into zero or more routed commands.
    ///
    /// A recoverable error drops only the frame it belongs to; any other
    /// error fails the whole read and the session with it.
    pub fn decode(&self, ctx: &mut Context, input: Bytes) -> Result<Decoded, FilterError> {
        let mut decoded = Decoded::default();
        let mut frames = vec![Frame::Stream(input)];
        for stage in &self.stages {
            let mut next = Vec::with_capacity(frames.len());
            for frame in frames {
                if !stage.check_type(ctx, Direction::Decode, &frame) {
                    next.push(frame);
                    continue;
                }
                match stage.pre_decode(ctx, &frame) {
                    Preflight::Proceed => match stage.decode(ctx, frame) {
                        Ok(out) => next.extend(out),
                        Err(err) if err.kind.is_recoverable() => decoded.dropped.push(err),
                        Err(err) => return Err(err),
                    },
                    Preflight::NeedMore => {}
                    Preflight::Fail(err) => return Err(err),
                }
            }
            if next.is_empty() {
                return Ok(decoded);
            }
            frames = next;
        }

        for frame in frames {
            match frame {
                Frame::Decoded(routed) => decoded.commands.push(routed),
                other => {
                    return Err(FilterError::new(
                        FilterErrorKind::Protocol,
                        "chain",
                        format!("frame left undecoded: {}", frame_kind(&other)),
                    ));
                }
            }
        }
        Ok(decoded)
    }

    /// Turns an application command into wire bytes for this session.
    pub fn encode(&self, ctx: &mut Context, command: Command) -> Result<Bytes, FilterError> {
        let mut frames = vec![Frame::Command(command)];
        for stage in self.stages.iter().rev() {
            let mut next = Vec::with_capacity(frames.len());
            for frame in frames {
                if !stage.check_type(ctx, Direction::Encode, &frame) {
                    next.push(frame);
                    continue;
                }
                match stage.pre_encode(ctx, &frame) {
                    Preflight::Proceed => next.extend(stage.encode(ctx, frame)?),
                    Preflight::NeedMore => {}
                    Preflight::Fail(err) => return Err(err),
                }
            }
            frames = next;
        }

        let mut out = BytesMut::new();
        for frame in frames {
            match frame {
                Frame::Stream(bytes) => out.extend_from_slice(&bytes),
                other => {
                    return Err(FilterError::new(
                        FilterErrorKind::Protocol,
                        "chain",
                        format!("frame left unencoded: {}", frame_kind(&other)),
                    ));
                }
            }
        }
        Ok(out.freeze())
    }
}

fn frame_kind(frame: &Frame) -> &'static str {
    match frame {
        Frame::Stream(_) => "stream",
        Frame::Packet(_) => "packet",
        Frame::Command(_) => "command",
        Frame::Decoded(_) => "decoded",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command::serial;
    use crate::session::Protocol;
    use bytes::BufMut;

    fn chain(cipher: Option<Arc<dyn Cipher>>) -> FilterChain {
        FilterChain::standard(cipher, Arc::new(CommandRegistry::with_builtin()), 64 * 1024)
    }

    fn framed(commands: &[Command]) -> BytesMut {
        let mut wire = BytesMut::from(&PREAMBLE[..]);
        for command in commands {
            let mut body = BytesMut::new();
            command.encode(&mut body);
            wire.put_u32(body.len() as u32);
            wire.extend_from_slice(&body);
        }
        wire
    }

    #[test]
    fn framed_protocol_decodes_across_split_reads() {
        let chain = chain(None);
        let mut ctx = Context::default();
        let wire = framed(&[
            Command::new(serial::PING, Bytes::new()),
            Command::new(serial::PUT, Bytes::from_static(b"kv")),
        ]);

        let mut decoded = Vec::new();
        for piece in wire.chunks(3) {
            decoded.extend(chain.decode(&mut ctx, Bytes::copy_from_slice(piece)).unwrap().commands);
        }
        assert_eq!(ctx.protocol, Protocol::Framed);
        assert_eq!(decoded.len(), 2);
        assert!(matches!(&decoded[0], Routed::Local(c) if c.serial() == serial::PING));
        assert!(matches!(&decoded[1], Routed::Consensus(c) if c.payload().as_ref() == b"kv"));
    }

    #[test]
    fn encode_then_decode_returns_same_command_through_cipher() {
        let cipher: Arc<dyn Cipher> = Arc::new(XorCipher::new(b"secret".to_vec()));
        let chain = chain(Some(Arc::clone(&cipher)));

        // Server-side context that has already seen the handshake.
        let mut server = Context::default();
        let mut hello = BytesMut::from(&PREAMBLE[..]);
        cipher.apply(0, &mut hello);
        assert!(chain.decode(&mut server, hello.freeze()).unwrap().commands.is_empty());

        let command = Command::new(serial::GET, Bytes::from_static(b"key"));
        let wire = chain.encode(&mut server, command.clone()).unwrap();

        // A peer context mirroring the server's stream offsets reads it back.
        let mut peer = Context {
            protocol: Protocol::Framed,
            handshake: server.handshake,
            cipher_read: 0,
            ..Context::default()
        };
        let decoded = chain.decode(&mut peer, wire).unwrap().commands;
        assert_eq!(decoded.len(), 1);
        assert_eq!(decoded[0].command().serial(), command.serial());
        assert_eq!(decoded[0].command().payload(), command.payload());
    }

    #[test]
    fn unknown_serial_drops_only_its_frame() {
        let chain = chain(None);
        let mut ctx = Context::default();
        let wire = framed(&[
            Command::new(0x0999, Bytes::new()),
            Command::new(serial::PING, Bytes::new()),
        ]);
        let decoded = chain.decode(&mut ctx, wire.freeze()).unwrap();
        assert_eq!(decoded.dropped.len(), 1);
        assert_eq!(decoded.dropped[0].kind, FilterErrorKind::UnknownSerial);
        assert_eq!(decoded.commands.len(), 1);
        assert_eq!(decoded.commands[0].command().serial(), serial::PING);
    }

    #[test]
    fn websocket_upgrade_is_refused() {
        let chain = chain(None);
        let mut ctx = Context::default();
        let err = chain
            .decode(&mut ctx, Bytes::from_static(b"GET /mqtt HTTP/1.1\r\n"))
            .unwrap_err();
        assert_eq!(err.kind, FilterErrorKind::Protocol);
    }

    #[test]
    fn stage_order_is_head_to_tail() {
        let chain = chain(Some(Arc::new(XorCipher::new(vec![1]))));
        assert_eq!(
            chain.stage_names(),
            vec!["cipher", "handshake", "frame", "mqtt", "codec"]
        );
    }
}
