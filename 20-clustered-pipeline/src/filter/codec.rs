use std::sync::Arc;

use bytes::BytesMut;

use super::{Direction, FilterStage, Frame};
use crate::command::{Command, CommandRegistry};
use crate::error::{FilterError, FilterErrorKind};
use crate::session::{Context, Protocol};

/// Last stage of the chain: frame bodies to commands, and commands to routes.
pub struct CommandCodecFilter {
    registry: Arc<CommandRegistry>,
}

impl CommandCodecFilter {
    pub fn new(registry: Arc<CommandRegistry>) -> Self {
        Self { registry }
    }
}

impl FilterStage for CommandCodecFilter {
    fn name(&self) -> &'static str {
        "codec"
    }

    fn check_type(&self, ctx: &Context, direction: Direction, frame: &Frame) -> bool {
        match direction {
            Direction::Decode => matches!(frame, Frame::Packet(_) | Frame::Command(_)),
            // MQTT sessions hand commands straight to the MQTT stage.
            Direction::Encode => {
                ctx.protocol == Protocol::Framed && matches!(frame, Frame::Command(_))
            }
        }
    }

    fn decode(&self, _ctx: &mut Context, frame: Frame) -> Result<Vec<Frame>, FilterError> {
        let command = match frame {
            Frame::Packet(body) => {
                let Some((command, used)) = Command::decode(&body) else {
                    return Err(FilterError::new(
                        FilterErrorKind::Malformed,
                        "codec",
                        format!("truncated command in {}-byte frame", body.len()),
                    ));
                };
                if used != body.len() {
                    return Err(FilterError::new(
                        FilterErrorKind::Malformed,
                        "codec",
                        format!("{} trailing bytes after command", body.len() - used),
                    ));
                }
                command
            }
            Frame::Command(command) => command,
            other => return Ok(vec![other]),
        };
        Ok(vec![Frame::Decoded(self.registry.resolve(command)?)])
    }

    fn encode(&self, _ctx: &mut Context, frame: Frame) -> Result<Vec<Frame>, FilterError> {
        let Frame::Command(command) = frame else {
            return Ok(vec![frame]);
        };
        let mut body = BytesMut::with_capacity(command.encoded_len());
        command.encode(&mut body);
        Ok(vec![Frame::Packet(body.freeze())])
    }
}
