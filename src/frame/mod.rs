//! Frame codec.
//!
//! Turns a raw bidirectional byte stream into discrete logical messages.
//!
//! ## Architecture
//!
//! - `codec`: physical frame layout as a `tokio_util` decoder/encoder
//! - `assembler`: fragmentation state machine that reassembles messages
//! - `connection`: reader half (answers pings, handles close) and writer
//!   half (chunks large messages into fragments)

mod assembler;
mod codec;
mod connection;

use bytes::Bytes;
use thiserror::Error;

pub use assembler::{Assembled, MessageAssembler};
pub use codec::{Frame, FrameCodec, OpCode};
pub use connection::{FrameReader, FrameWriter, Outbound, Outbox, split};

/// A fully reassembled application message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    Text(String),
    Binary(Bytes),
}

impl Message {
    pub fn len(&self) -> usize {
        match self {
            Message::Text(text) => text.len(),
            Message::Binary(data) => data.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Size limits enforced by the codec.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameLimits {
    /// Largest payload of a single physical frame, also the chunk size used
    /// when fragmenting outgoing messages.
    pub max_frame_size: usize,
    /// Largest reassembled message.
    pub max_message_size: usize,
}

impl Default for FrameLimits {
    fn default() -> Self {
        Self {
            max_frame_size: 64 * 1024,
            max_message_size: 16 * 1024 * 1024,
        }
    }
}

/// Close status codes carried by close frames.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseStatus {
    Normal,
    GoingAway,
    ProtocolError,
    PayloadNotAcceptable,
    MalformedPayload,
    PolicyViolation,
    PayloadTooBig,
    UnexpectedCondition,
    Other(u16),
}

impl CloseStatus {
    pub fn code(self) -> u16 {
        match self {
            CloseStatus::Normal => 1000,
            CloseStatus::GoingAway => 1001,
            CloseStatus::ProtocolError => 1002,
            CloseStatus::PayloadNotAcceptable => 1003,
            CloseStatus::MalformedPayload => 1007,
            CloseStatus::PolicyViolation => 1008,
            CloseStatus::PayloadTooBig => 1009,
            CloseStatus::UnexpectedCondition => 1011,
            CloseStatus::Other(code) => code,
        }
    }

    pub fn from_code(code: u16) -> Self {
        match code {
            1000 => CloseStatus::Normal,
            1001 => CloseStatus::GoingAway,
            1002 => CloseStatus::ProtocolError,
            1003 => CloseStatus::PayloadNotAcceptable,
            1007 => CloseStatus::MalformedPayload,
            1008 => CloseStatus::PolicyViolation,
            1009 => CloseStatus::PayloadTooBig,
            1011 => CloseStatus::UnexpectedCondition,
            other => CloseStatus::Other(other),
        }
    }
}

/// Transport-level failures. Any of these ends the connection.
#[derive(Debug, Error)]
pub enum FrameError {
    #[error("payload too big: {size} bytes (limit {limit})")]
    PayloadTooBig { size: u64, limit: usize },
    #[error("payload not acceptable: {0}")]
    PayloadNotAcceptable(&'static str),
    #[error("text message is not valid UTF-8")]
    MalformedPayload,
    #[error("connection closed by peer")]
    Closed { status: Option<CloseStatus> },
    #[error("connection dropped without a close frame")]
    Disconnected,
    #[error("transport I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("connection loop panicked")]
    Panicked,
}

impl FrameError {
    /// Status to close the connection with after this failure.
    pub fn close_status(&self) -> CloseStatus {
        match self {
            FrameError::PayloadTooBig { .. } => CloseStatus::PayloadTooBig,
            FrameError::PayloadNotAcceptable(_) => CloseStatus::PayloadNotAcceptable,
            FrameError::MalformedPayload => CloseStatus::MalformedPayload,
            FrameError::Closed { .. } => CloseStatus::Normal,
            FrameError::Disconnected => CloseStatus::GoingAway,
            FrameError::Io(_) | FrameError::Panicked => CloseStatus::UnexpectedCondition,
        }
    }

    /// Whether the peer ended the session with a close frame.
    pub fn is_graceful(&self) -> bool {
        matches!(self, FrameError::Closed { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn close_status_codes_round_trip() {
        for status in [
            CloseStatus::Normal,
            CloseStatus::PayloadNotAcceptable,
            CloseStatus::PayloadTooBig,
            CloseStatus::UnexpectedCondition,
            CloseStatus::Other(4000),
        ] {
            assert_eq!(CloseStatus::from_code(status.code()), status);
        }
    }

    #[test]
    fn frame_errors_map_to_close_status() {
        let err = FrameError::PayloadTooBig { size: 10, limit: 5 };
        assert_eq!(err.close_status(), CloseStatus::PayloadTooBig);
        assert_eq!(
            FrameError::PayloadNotAcceptable("x").close_status(),
            CloseStatus::PayloadNotAcceptable
        );
        assert_eq!(FrameError::Panicked.close_status(), CloseStatus::UnexpectedCondition);
        assert!(FrameError::Closed { status: None }.is_graceful());
        assert!(!FrameError::Disconnected.is_graceful());
    }
}
