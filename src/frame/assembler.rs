//! Message reassembly.
//!
//! A text or binary frame starts a message; continuation frames extend it
//! until one carries the FIN bit. Control frames may arrive between
//! fragments and never disturb the message in progress.

use bytes::{Bytes, BytesMut};

use super::codec::{Frame, OpCode};
use super::{CloseStatus, FrameError, Message};

/// Result of feeding one frame to the assembler.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Assembled {
    Message(Message),
    Ping(Bytes),
    Pong(Bytes),
    Close(Option<CloseStatus>),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum MessageKind {
    Text,
    Binary,
}

#[derive(Debug)]
struct Partial {
    kind: MessageKind,
    buf: BytesMut,
}

/// Fragmentation state machine for one connection.
#[derive(Debug)]
pub struct MessageAssembler {
    max_message_size: usize,
    partial: Option<Partial>,
}

impl MessageAssembler {
    pub fn new(max_message_size: usize) -> Self {
        Self {
            max_message_size,
            partial: None,
        }
    }

    /// Whether a fragmented message is waiting for more frames.
    pub fn in_progress(&self) -> bool {
        self.partial.is_some()
    }

    /// Feed one frame. Returns `Ok(None)` while a fragmented message is
    /// still incomplete.
    pub fn push(&mut self, frame: Frame) -> Result<Option<Assembled>, FrameError> {
        match frame.opcode {
            OpCode::Ping => Ok(Some(Assembled::Ping(frame.payload))),
            OpCode::Pong => Ok(Some(Assembled::Pong(frame.payload))),
            OpCode::Close => Ok(Some(Assembled::Close(parse_close_status(&frame.payload)))),
            OpCode::Text | OpCode::Binary => {
                if self.partial.is_some() {
                    return Err(FrameError::PayloadNotAcceptable(
                        "new message started before the previous one finished",
                    ));
                }
                let kind = if frame.opcode == OpCode::Text {
                    MessageKind::Text
                } else {
                    MessageKind::Binary
                };
                self.check_size(frame.payload.len())?;

                let mut buf = BytesMut::with_capacity(frame.payload.len());
                buf.extend_from_slice(&frame.payload);
                if frame.fin {
                    return finish(kind, buf).map(Some);
                }
                self.partial = Some(Partial { kind, buf });
                Ok(None)
            }
            OpCode::Continuation => {
                let Some(partial) = self.partial.as_mut() else {
                    return Err(FrameError::PayloadNotAcceptable(
                        "continuation frame without a message in progress",
                    ));
                };
                let size = partial.buf.len() + frame.payload.len();
                if size > self.max_message_size {
                    self.partial = None;
                    return Err(FrameError::PayloadTooBig {
                        size: size as u64,
                        limit: self.max_message_size,
                    });
                }
                partial.buf.extend_from_slice(&frame.payload);
                if !frame.fin {
                    return Ok(None);
                }
                match self.partial.take() {
                    Some(Partial { kind, buf }) => finish(kind, buf).map(Some),
                    None => Ok(None),
                }
            }
        }
    }

    fn check_size(&self, size: usize) -> Result<(), FrameError> {
        if size > self.max_message_size {
            return Err(FrameError::PayloadTooBig {
                size: size as u64,
                limit: self.max_message_size,
            });
        }
        Ok(())
    }
}

fn finish(kind: MessageKind, buf: BytesMut) -> Result<Assembled, FrameError> {
    let message = match kind {
        MessageKind::Text => {
            let text = String::from_utf8(buf.to_vec()).map_err(|_| FrameError::MalformedPayload)?;
            Message::Text(text)
        }
        MessageKind::Binary => Message::Binary(buf.freeze()),
    };
    Ok(Assembled::Message(message))
}

fn parse_close_status(payload: &[u8]) -> Option<CloseStatus> {
    if payload.len() < 2 {
        return None;
    }
    Some(CloseStatus::from_code(u16::from_be_bytes([
        payload[0], payload[1],
    ])))
}
