//! Write side of a session's primary stream transport.
//!
//! TCP writes never wait on the peer. Bytes the socket will not take right now are
//! held as a single unsent fragment and go out first on the next attempt, so one
//! slow reader only ever costs its own writer pass a failed `try_write`.

use crate::error::Result;
use futures::stream::SplitSink;
use futures::SinkExt;
use std::io;
use tokio::io::AsyncWriteExt;
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;

pub type WebSocketSink = SplitSink<WebSocketStream<TcpStream>, Message>;

/// Result of one write attempt. Both variants carry the bytes that reached the socket.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteProgress {
    /// Everything handed over, including any earlier fragment, was written.
    Complete(usize),
    /// The socket buffer is full. The remainder is held until it drains.
    Blocked(usize),
}

impl WriteProgress {
    pub fn written(self) -> usize {
        match self {
            WriteProgress::Complete(n) | WriteProgress::Blocked(n) => n,
        }
    }

    pub fn is_blocked(self) -> bool {
        matches!(self, WriteProgress::Blocked(_))
    }
}

/// Non-blocking TCP writer with room for one unsent fragment.
pub struct TcpWriter {
    half: Mutex<OwnedWriteHalf>,
    unsent: std::sync::Mutex<Vec<u8>>,
}

impl TcpWriter {
    fn new(half: OwnedWriteHalf) -> Self {
        Self {
            half: Mutex::new(half),
            unsent: std::sync::Mutex::new(Vec::new()),
        }
    }

    fn unsent(&self) -> std::sync::MutexGuard<'_, Vec<u8>> {
        self.unsent.lock().unwrap_or_else(|e| e.into_inner())
    }

    async fn write(&self, bytes: &[u8]) -> Result<WriteProgress> {
        let queued_behind = {
            let mut unsent = self.unsent();
            if unsent.is_empty() {
                false
            } else {
                unsent.extend_from_slice(bytes);
                true
            }
        };
        if queued_behind {
            return self.flush().await;
        }
        let half = self.half.lock().await;
        let written = try_write_all(&half, bytes)?;
        if written < bytes.len() {
            self.unsent().extend_from_slice(&bytes[written..]);
            return Ok(WriteProgress::Blocked(written));
        }
        Ok(WriteProgress::Complete(written))
    }

    async fn flush(&self) -> Result<WriteProgress> {
        let half = self.half.lock().await;
        let mut unsent = self.unsent();
        if unsent.is_empty() {
            return Ok(WriteProgress::Complete(0));
        }
        let written = try_write_all(&half, &unsent)?;
        unsent.drain(..written);
        if unsent.is_empty() {
            Ok(WriteProgress::Complete(written))
        } else {
            Ok(WriteProgress::Blocked(written))
        }
    }
}

/// Write as much of `bytes` as the socket takes without waiting.
fn try_write_all(half: &OwnedWriteHalf, bytes: &[u8]) -> io::Result<usize> {
    let mut written = 0;
    while written < bytes.len() {
        match half.try_write(&bytes[written..]) {
            Ok(0) => return Err(io::ErrorKind::WriteZero.into()),
            Ok(n) => written += n,
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
    Ok(written)
}

/// Stream channel capability of a session. The read side is owned by the reader task.
pub enum StreamChannel {
    Tcp(TcpWriter),
    WebSocket(Mutex<WebSocketSink>),
}

impl StreamChannel {
    pub fn tcp(writer: OwnedWriteHalf) -> Self {
        StreamChannel::Tcp(TcpWriter::new(writer))
    }

    pub fn websocket(sink: WebSocketSink) -> Self {
        StreamChannel::WebSocket(Mutex::new(sink))
    }

    /// Write one framed packet. WebSocket sends it as a single binary message.
    ///
    /// TCP never waits: a [`WriteProgress::Blocked`] result means the rest of the
    /// packet is held and the caller should wait for [`StreamChannel::writable`].
    pub async fn write(&self, bytes: &[u8]) -> Result<WriteProgress> {
        match self {
            StreamChannel::Tcp(writer) => writer.write(bytes).await,
            StreamChannel::WebSocket(sink) => {
                let mut sink = sink.lock().await;
                sink.feed(Message::Binary(bytes.to_vec())).await?;
                Ok(WriteProgress::Complete(bytes.len()))
            }
        }
    }

    /// Push out whatever an earlier write left behind.
    pub async fn flush(&self) -> Result<WriteProgress> {
        match self {
            StreamChannel::Tcp(writer) => writer.flush().await,
            StreamChannel::WebSocket(sink) => {
                sink.lock().await.flush().await?;
                Ok(WriteProgress::Complete(0))
            }
        }
    }

    /// Resolve once the socket can take more bytes.
    pub async fn writable(&self) -> Result<()> {
        match self {
            StreamChannel::Tcp(writer) => writer.half.lock().await.writable().await?,
            StreamChannel::WebSocket(_) => {}
        }
        Ok(())
    }

    /// Bytes held back by a blocked TCP write.
    pub fn unsent_len(&self) -> usize {
        match self {
            StreamChannel::Tcp(writer) => writer.unsent().len(),
            StreamChannel::WebSocket(_) => 0,
        }
    }

    /// Close the write direction. Errors are ignored, the peer may already be gone.
    pub async fn shutdown(&self) {
        match self {
            StreamChannel::Tcp(writer) => {
                let _ = writer.half.lock().await.shutdown().await;
            }
            StreamChannel::WebSocket(sink) => {
                let mut sink = sink.lock().await;
                let _ = sink.send(Message::Close(None)).await;
                let _ = sink.close().await;
            }
        }
    }
}

impl std::fmt::Debug for StreamChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StreamChannel::Tcp(writer) => f
                .debug_struct("StreamChannel::Tcp")
                .field("unsent", &writer.unsent().len())
                .finish(),
            StreamChannel::WebSocket(_) => f.write_str("StreamChannel::WebSocket"),
        }
    }
}
