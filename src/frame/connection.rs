//! Connection halves.
//!
//! The reader half reassembles messages and answers control frames. Every
//! outgoing frame (replies, progress notifications, pongs, the close reply)
//! goes through an [`Outbox`] into a single writer task, so frames of one
//! fragmented message are never interleaved with anything else.

use bytes::{BufMut, Bytes, BytesMut};
use futures::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite, ReadHalf, WriteHalf};
use tokio::sync::mpsc;
use tokio_util::codec::{FramedRead, FramedWrite};
use tracing::{debug, trace, warn};

use super::assembler::{Assembled, MessageAssembler};
use super::codec::{Frame, FrameCodec, OpCode};
use super::{CloseStatus, FrameError, FrameLimits, Message};

/// Work item for the writer task.
#[derive(Debug)]
pub enum Outbound {
    Message(Message),
    Pong(Bytes),
    Close(CloseStatus, String),
}

/// Items one connection may have queued before senders have to wait.
pub const OUTBOX_CAPACITY: usize = 256;

/// Cloneable handle for queueing outgoing frames on one connection.
#[derive(Debug, Clone)]
pub struct Outbox {
    tx: mpsc::Sender<Outbound>,
}

impl Outbox {
    pub fn channel(capacity: usize) -> (Self, mpsc::Receiver<Outbound>) {
        let (tx, rx) = mpsc::channel(capacity);
        (Self { tx }, rx)
    }

    /// Queue a message, waiting for room. Returns false once the writer has
    /// gone away.
    pub async fn send(&self, message: Message) -> bool {
        self.tx.send(Outbound::Message(message)).await.is_ok()
    }

    /// Queue a message only if there is room right now. Progress
    /// notifications go through here and are dropped while the queue is full.
    pub fn try_send(&self, message: Message) -> bool {
        self.tx.try_send(Outbound::Message(message)).is_ok()
    }

    pub async fn pong(&self, payload: Bytes) -> bool {
        self.tx.send(Outbound::Pong(payload)).await.is_ok()
    }

    /// Ask the writer to send a close frame and stop.
    pub async fn close(&self, status: CloseStatus, reason: impl Into<String>) -> bool {
        self.tx.send(Outbound::Close(status, reason.into())).await.is_ok()
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

/// Split a byte stream into a message reader, a frame writer and the outbox
/// feeding that writer.
pub fn split<S>(
    stream: S,
    limits: FrameLimits,
) -> (FrameReader<ReadHalf<S>>, FrameWriter<WriteHalf<S>>, Outbox)
where
    S: AsyncRead + AsyncWrite,
{
    let (read, write) = tokio::io::split(stream);
    let (outbox, rx) = Outbox::channel(OUTBOX_CAPACITY);
    let reader = FrameReader::new(read, limits, outbox.clone());
    let writer = FrameWriter::new(write, limits, rx);
    (reader, writer, outbox)
}

/// Receiving half of a framed connection.
pub struct FrameReader<R> {
    frames: FramedRead<R, FrameCodec>,
    assembler: MessageAssembler,
    outbox: Outbox,
}

impl<R: AsyncRead + Unpin> FrameReader<R> {
    pub fn new(read: R, limits: FrameLimits, outbox: Outbox) -> Self {
        Self {
            frames: FramedRead::new(read, FrameCodec::new(limits.max_frame_size)),
            assembler: MessageAssembler::new(limits.max_message_size),
            outbox,
        }
    }

    /// Wait for the next complete application message.
    ///
    /// Pings are answered on the spot. A close frame is answered with a close
    /// reply and reported as [`FrameError::Closed`].
    pub async fn receive(&mut self) -> Result<Message, FrameError> {
        loop {
            let frame = match self.frames.next().await {
                Some(frame) => frame?,
                None => return Err(FrameError::Disconnected),
            };
            trace!(opcode = ?frame.opcode, fin = frame.fin, len = frame.payload.len(), "Frame received");

            match self.assembler.push(frame)? {
                None | Some(Assembled::Pong(_)) => continue,
                Some(Assembled::Message(message)) => return Ok(message),
                Some(Assembled::Ping(payload)) => {
                    self.outbox.pong(payload).await;
                }
                Some(Assembled::Close(status)) => {
                    debug!(status = ?status, "Close frame received");
                    self.outbox.close(status.unwrap_or(CloseStatus::Normal), "").await;
                    return Err(FrameError::Closed { status });
                }
            }
        }
    }
}

/// Sending half of a framed connection.
pub struct FrameWriter<W> {
    frames: FramedWrite<W, FrameCodec>,
    max_frame_size: usize,
    rx: mpsc::Receiver<Outbound>,
}

impl<W: AsyncWrite + Unpin> FrameWriter<W> {
    pub fn new(write: W, limits: FrameLimits, rx: mpsc::Receiver<Outbound>) -> Self {
        Self {
            frames: FramedWrite::new(write, FrameCodec::new(limits.max_frame_size)),
            max_frame_size: limits.max_frame_size.max(1),
            rx,
        }
    }

    /// Write one physical frame.
    pub async fn send(&mut self, opcode: OpCode, payload: Bytes, fin: bool) -> Result<(), FrameError> {
        self.frames.send(Frame::new(opcode, payload, fin)).await
    }

    /// Write a message, fragmenting it when it exceeds the frame size.
    /// Stops at the first failed fragment.
    pub async fn send_message(&mut self, message: Message) -> Result<(), FrameError> {
        let (opcode, mut payload) = match message {
            Message::Text(text) => (OpCode::Text, Bytes::from(text)),
            Message::Binary(data) => (OpCode::Binary, data),
        };

        if payload.len() <= self.max_frame_size {
            return self.send(opcode, payload, true).await;
        }

        let mut opcode = opcode;
        while payload.len() > self.max_frame_size {
            let chunk = payload.split_to(self.max_frame_size);
            self.send(opcode, chunk, false).await?;
            opcode = OpCode::Continuation;
        }
        self.send(OpCode::Continuation, payload, true).await
    }

    /// Best-effort close frame.
    pub async fn close(&mut self, status: CloseStatus, reason: &str) -> Result<(), FrameError> {
        let mut payload = BytesMut::with_capacity(2 + reason.len());
        payload.put_u16(status.code());
        // control frames are capped at 125 bytes
        let reason = truncate_utf8(reason, 123);
        payload.extend_from_slice(reason.as_bytes());
        self.send(OpCode::Close, payload.freeze(), true).await
    }

    /// Drain the outbox until it closes or a close is requested.
    pub async fn run(mut self) {
        while let Some(item) = self.rx.recv().await {
            match item {
                Outbound::Message(message) => {
                    if let Err(e) = self.send_message(message).await {
                        warn!(error = %e, "Failed to send message, closing connection");
                        let _ = self.close(e.close_status(), "send failed").await;
                        break;
                    }
                }
                Outbound::Pong(payload) => {
                    if let Err(e) = self.send(OpCode::Pong, payload, true).await {
                        debug!(error = %e, "Failed to send pong");
                        break;
                    }
                }
                Outbound::Close(status, reason) => {
                    if let Err(e) = self.close(status, &reason).await {
                        debug!(error = %e, "Failed to send close frame");
                    }
                    break;
                }
            }
        }
        self.rx.close();
    }
}

fn truncate_utf8(text: &str, max: usize) -> &str {
    if text.len() <= max {
        return text;
    }
    let mut end = max;
    while !text.is_char_boundary(end) {
        end -= 1;
    }
    &text[..end]
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io;
    use std::pin::Pin;
    use std::sync::{Arc, Mutex};
    use std::task::{Context, Poll};
    use tokio::io::duplex;
    use tokio_util::codec::{FramedRead, FramedWrite};

    #[derive(Default)]
    struct Written {
        bytes: Vec<u8>,
        rejected: usize,
    }

    /// Accepts `budget` bytes, then fails every write.
    struct BrokenAfter {
        budget: usize,
        written: Arc<Mutex<Written>>,
    }

    impl AsyncWrite for BrokenAfter {
        fn poll_write(self: Pin<&mut Self>, _cx: &mut Context<'_>, buf: &[u8]) -> Poll<io::Result<usize>> {
            let this = self.get_mut();
            let mut written = this.written.lock().unwrap();
            let room = this.budget - written.bytes.len();
            if room == 0 {
                written.rejected += 1;
                return Poll::Ready(Err(io::ErrorKind::BrokenPipe.into()));
            }
            let n = room.min(buf.len());
            written.bytes.extend_from_slice(&buf[..n]);
            Poll::Ready(Ok(n))
        }

        fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
            Poll::Ready(Ok(()))
        }

        fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
            Poll::Ready(Ok(()))
        }
    }

    const LIMITS: FrameLimits = FrameLimits {
        max_frame_size: 8,
        max_message_size: 1024,
    };

    #[tokio::test]
    async fn receive_reassembles_and_answers_ping() {
        let (server, client) = duplex(4096);
        let (mut reader, writer, _outbox) = split(server, LIMITS);
        tokio::spawn(writer.run());

        let (client_read, client_write) = tokio::io::split(client);
        let mut peer_tx = FramedWrite::new(client_write, FrameCodec::new(1024));
        let mut peer_rx = FramedRead::new(client_read, FrameCodec::new(1024));

        peer_tx.send(Frame::new(OpCode::Text, &b"hel"[..], false)).await.unwrap();
        peer_tx.send(Frame::new(OpCode::Ping, &b"!"[..], true)).await.unwrap();
        peer_tx.send(Frame::new(OpCode::Continuation, &b"lo"[..], true)).await.unwrap();

        let message = reader.receive().await.unwrap();
        assert_eq!(message, Message::Text("hello".into()));

        let pong = peer_rx.next().await.unwrap().unwrap();
        assert_eq!(pong.opcode, OpCode::Pong);
        assert_eq!(&pong.payload[..], b"!");
    }

    #[tokio::test]
    async fn outgoing_messages_are_chunked() {
        let (server, client) = duplex(4096);
        let (_reader, writer, outbox) = split(server, LIMITS);
        tokio::spawn(writer.run());

        outbox.send(Message::Binary(Bytes::from_static(b"0123456789abcdefXYZ"))).await;

        let mut peer_rx = FramedRead::new(client, FrameCodec::new(1024));
        let first = peer_rx.next().await.unwrap().unwrap();
        let second = peer_rx.next().await.unwrap().unwrap();
        let third = peer_rx.next().await.unwrap().unwrap();

        assert_eq!((first.opcode, first.fin), (OpCode::Binary, false));
        assert_eq!((second.opcode, second.fin), (OpCode::Continuation, false));
        assert_eq!((third.opcode, third.fin), (OpCode::Continuation, true));
        assert_eq!(&first.payload[..], b"01234567");
        assert_eq!(&second.payload[..], b"89abcdef");
        assert_eq!(&third.payload[..], b"XYZ");
    }

    #[tokio::test]
    async fn close_frame_is_answered_and_reported() {
        let (server, client) = duplex(4096);
        let (mut reader, writer, _outbox) = split(server, LIMITS);
        tokio::spawn(writer.run());

        let (client_read, client_write) = tokio::io::split(client);
        let mut peer_tx = FramedWrite::new(client_write, FrameCodec::new(1024));
        let mut peer_rx = FramedRead::new(client_read, FrameCodec::new(1024));

        peer_tx
            .send(Frame::new(OpCode::Close, Bytes::from_static(&[0x03, 0xE8]), true))
            .await
            .unwrap();

        let err = reader.receive().await.unwrap_err();
        assert!(err.is_graceful());

        let reply = peer_rx.next().await.unwrap().unwrap();
        assert_eq!(reply.opcode, OpCode::Close);
        assert_eq!(&reply.payload[..2], &[0x03, 0xE8]);
    }

    #[tokio::test]
    async fn stray_continuation_fails_receive() {
        let (server, client) = duplex(4096);
        let (mut reader, _writer, _outbox) = split(server, LIMITS);
        let mut peer_tx = FramedWrite::new(client, FrameCodec::new(1024));

        peer_tx.send(Frame::new(OpCode::Continuation, &b"x"[..], true)).await.unwrap();

        let err = reader.receive().await.unwrap_err();
        assert!(matches!(err, FrameError::PayloadNotAcceptable(_)));
        assert_eq!(err.close_status(), CloseStatus::PayloadNotAcceptable);
    }

    #[tokio::test]
    async fn eof_is_reported_as_disconnect() {
        let (server, client) = duplex(64);
        let (mut reader, _writer, _outbox) = split(server, LIMITS);
        drop(client);
        assert!(matches!(reader.receive().await, Err(FrameError::Disconnected)));
    }

    #[tokio::test]
    async fn failed_fragment_stops_the_writer() {
        let written = Arc::new(Mutex::new(Written::default()));
        // first fragment is 10 bytes on the wire, the second gets cut off
        let sink = BrokenAfter {
            budget: 15,
            written: written.clone(),
        };
        let (outbox, rx) = Outbox::channel(8);
        let writer = FrameWriter::new(sink, LIMITS, rx);

        assert!(outbox.send(Message::Binary(Bytes::from_static(b"0123456789abcdefXYZ"))).await);
        assert!(outbox.send(Message::Text("never sent".into())).await);
        writer.run().await;
        assert!(outbox.is_closed());
        assert!(!outbox.send(Message::Text("late".into())).await);

        let written = written.lock().unwrap();
        assert_eq!(written.bytes.len(), 15);
        assert_eq!(&written.bytes[..2], &[0x02, 0x08]);
        assert_eq!(&written.bytes[2..10], b"01234567");
        // the failed fragment and the close attempt, nothing after
        assert_eq!(written.rejected, 2);
    }

    #[tokio::test]
    async fn full_outbox_drops_progress_but_not_replies() {
        let (outbox, mut rx) = Outbox::channel(2);
        assert!(outbox.try_send(Message::Text("a".into())));
        assert!(outbox.try_send(Message::Text("b".into())));
        assert!(!outbox.try_send(Message::Text("c".into())));
        assert!(!outbox.is_closed());

        let reply = {
            let outbox = outbox.clone();
            tokio::spawn(async move { outbox.send(Message::Text("reply".into())).await })
        };
        assert!(matches!(rx.recv().await, Some(Outbound::Message(Message::Text(t))) if t == "a"));
        assert!(reply.await.unwrap());
        assert!(matches!(rx.recv().await, Some(Outbound::Message(Message::Text(t))) if t == "b"));
        assert!(matches!(rx.recv().await, Some(Outbound::Message(Message::Text(t))) if t == "reply"));
    }
}
