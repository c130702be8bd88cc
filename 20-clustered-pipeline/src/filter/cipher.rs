use std::sync::Arc;

use bytes::BytesMut;

use super::{Direction, FilterStage, Frame};
use crate::error::{FilterError, FilterErrorKind};
use crate::session::{handshake, Context};

/// Pluggable symmetric byte transform. `offset` is the stream position of
/// `data[0]` in the current direction.
pub trait Cipher: Send + Sync {
    fn apply(&self, offset: u64, data: &mut [u8]);
}

/// Repeating-key XOR keystream. Symmetric, so the same call encrypts and
/// decrypts.
pub struct XorCipher {
    key: Vec<u8>,
}

impl XorCipher {
    pub fn new(key: Vec<u8>) -> Self {
        Self { key }
    }
}

impl Cipher for XorCipher {
    fn apply(&self, offset: u64, data: &mut [u8]) {
        if self.key.is_empty() {
            return;
        }
        let len = self.key.len() as u64;
        for (i, byte) in data.iter_mut().enumerate() {
            *byte ^= self.key[((offset + i as u64) % len) as usize];
        }
    }
}

pub struct CipherFilter {
    cipher: Arc<dyn Cipher>,
}

impl CipherFilter {
    pub fn new(cipher: Arc<dyn Cipher>) -> Self {
        Self { cipher }
    }

    fn transform(&self, offset: &mut u64, frame: Frame) -> Result<Vec<Frame>, FilterError> {
        let Frame::Stream(bytes) = frame else {
            return Err(FilterError::new(
                FilterErrorKind::Cipher,
                "cipher",
                "expected stream bytes",
            ));
        };
        let mut buf = BytesMut::from(&bytes[..]);
        self.cipher.apply(*offset, &mut buf);
        *offset += buf.len() as u64;
        Ok(vec![Frame::Stream(buf.freeze())])
    }
}

impl FilterStage for CipherFilter {
    fn name(&self) -> &'static str {
        "cipher"
    }

    fn check_type(&self, _ctx: &Context, _direction: Direction, frame: &Frame) -> bool {
        matches!(frame, Frame::Stream(_))
    }

    fn decode(&self, ctx: &mut Context, frame: Frame) -> Result<Vec<Frame>, FilterError> {
        ctx.mark(handshake::CIPHER_READY);
        let mut offset = ctx.cipher_read;
        let out = self.transform(&mut offset, frame)?;
        ctx.cipher_read = offset;
        Ok(out)
    }

    fn encode(&self, ctx: &mut Context, frame: Frame) -> Result<Vec<Frame>, FilterError> {
        let mut offset = ctx.cipher_write;
        let out = self.transform(&mut offset, frame)?;
        ctx.cipher_write = offset;
        Ok(out)
    }
}
