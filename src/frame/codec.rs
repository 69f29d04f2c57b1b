//! Physical frame layout.
//!
//! ```text
//! byte 0: FIN(1) RSV(3) opcode(4)
//! byte 1: MASK(1) len(7)     len 126 => u16 BE follows, 127 => u64 BE follows
//! [4-byte mask key if MASK]
//! payload
//! ```
//!
//! The declared payload length is checked against the frame limit as soon as
//! the header is readable, before any of the payload is buffered.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use super::FrameError;

/// Largest payload a control frame may carry.
const MAX_CONTROL_PAYLOAD: u64 = 125;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpCode {
    Continuation,
    Text,
    Binary,
    Close,
    Ping,
    Pong,
}

impl OpCode {
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0x0 => Some(OpCode::Continuation),
            0x1 => Some(OpCode::Text),
            0x2 => Some(OpCode::Binary),
            0x8 => Some(OpCode::Close),
            0x9 => Some(OpCode::Ping),
            0xA => Some(OpCode::Pong),
            _ => None,
        }
    }

    pub fn as_u8(self) -> u8 {
        match self {
            OpCode::Continuation => 0x0,
            OpCode::Text => 0x1,
            OpCode::Binary => 0x2,
            OpCode::Close => 0x8,
            OpCode::Ping => 0x9,
            OpCode::Pong => 0xA,
        }
    }

    pub fn is_control(self) -> bool {
        matches!(self, OpCode::Close | OpCode::Ping | OpCode::Pong)
    }
}

/// One physical frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub fin: bool,
    pub opcode: OpCode,
    pub payload: Bytes,
}

impl Frame {
    pub fn new(opcode: OpCode, payload: impl Into<Bytes>, fin: bool) -> Self {
        Self {
            fin,
            opcode,
            payload: payload.into(),
        }
    }
}

/// Frame decoder/encoder with a maximum payload size.
#[derive(Debug, Clone)]
pub struct FrameCodec {
    max_frame_size: usize,
}

impl FrameCodec {
    pub fn new(max_frame_size: usize) -> Self {
        Self { max_frame_size }
    }
}

impl Decoder for FrameCodec {
    type Item = Frame;
    type Error = FrameError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Frame>, FrameError> {
        if src.len() < 2 {
            return Ok(None);
        }

        let b0 = src[0];
        let b1 = src[1];
        let fin = b0 & 0x80 != 0;

        if b0 & 0x70 != 0 {
            return Err(FrameError::PayloadNotAcceptable("reserved bits set"));
        }
        let opcode = OpCode::from_u8(b0 & 0x0F)
            .ok_or(FrameError::PayloadNotAcceptable("unknown opcode"))?;

        let masked = b1 & 0x80 != 0;
        let (len, mut header_len) = match b1 & 0x7F {
            126 => {
                if src.len() < 4 {
                    return Ok(None);
                }
                (u16::from_be_bytes([src[2], src[3]]) as u64, 4)
            }
            127 => {
                if src.len() < 10 {
                    return Ok(None);
                }
                let mut raw = [0u8; 8];
                raw.copy_from_slice(&src[2..10]);
                (u64::from_be_bytes(raw), 10)
            }
            n => (n as u64, 2),
        };

        if opcode.is_control() && (!fin || len > MAX_CONTROL_PAYLOAD) {
            return Err(FrameError::PayloadNotAcceptable(
                "control frames must be final and at most 125 bytes",
            ));
        }
        if len > self.max_frame_size as u64 {
            return Err(FrameError::PayloadTooBig {
                size: len,
                limit: self.max_frame_size,
            });
        }

        let mask = if masked {
            if src.len() < header_len + 4 {
                return Ok(None);
            }
            let key = [
                src[header_len],
                src[header_len + 1],
                src[header_len + 2],
                src[header_len + 3],
            ];
            header_len += 4;
            Some(key)
        } else {
            None
        };

        let len = len as usize;
        let total = header_len + len;
        if src.len() < total {
            src.reserve(total - src.len());
            return Ok(None);
        }

        src.advance(header_len);
        let mut payload = src.split_to(len);
        if let Some(key) = mask {
            for (i, byte) in payload.iter_mut().enumerate() {
                *byte ^= key[i % 4];
            }
        }

        Ok(Some(Frame {
            fin,
            opcode,
            payload: payload.freeze(),
        }))
    }
}

impl Encoder<Frame> for FrameCodec {
    type Error = FrameError;

    fn encode(&mut self, frame: Frame, dst: &mut BytesMut) -> Result<(), FrameError> {
        let len = frame.payload.len();
        dst.reserve(len + 10);

        let fin_bit = if frame.fin { 0x80 } else { 0x00 };
        dst.put_u8(fin_bit | frame.opcode.as_u8());

        if len < 126 {
            dst.put_u8(len as u8);
        } else if len <= u16::MAX as usize {
            dst.put_u8(126);
            dst.put_u16(len as u16);
        } else {
            dst.put_u8(127);
            dst.put_u64(len as u64);
        }

        dst.extend_from_slice(&frame.payload);
        Ok(())
    }
}
