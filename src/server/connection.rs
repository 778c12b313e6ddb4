//! Client connection handling

use crate::protocol::ProtocolError;
use anyhow::{bail, Result};
use std::fmt;
use std::hash::{Hash, Hasher};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc::error::SendTimeoutError;
use tokio::sync::{mpsc, watch};
use uuid::Uuid;

/// Default longest line accepted or sent, newline excluded
pub const DEFAULT_MAX_MESSAGE_SIZE: usize = 8192;

/// Completion status of a send
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendStatus {
    Ok,
    /// Outbound queue stayed full for the whole timeout
    Timeout,
    Closed,
    /// Payload cannot be framed (embedded newline or oversize)
    Error,
}

impl SendStatus {
    pub fn is_ok(&self) -> bool {
        matches!(self, SendStatus::Ok)
    }
}

/// Completion status of a receive
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecvStatus {
    Message(String),
    Timeout,
    Closed,
    /// A bad line was consumed; the stream is still usable
    Invalid(ProtocolError),
    Error(String),
}

struct Inner {
    id: Uuid,
    peer: Option<SocketAddr>,
    sender: mpsc::Sender<String>,
    closed: watch::Sender<bool>,
    max_message_size: usize,
}

/// Handle to a connected client. Clones share the same connection.
#[derive(Clone)]
pub struct ClientConnection {
    inner: Arc<Inner>,
}

impl ClientConnection {
    /// Create a new client connection
    pub fn new(sender: mpsc::Sender<String>) -> Self {
        Self::with_limits(sender, None, DEFAULT_MAX_MESSAGE_SIZE)
    }

    pub fn with_limits(
        sender: mpsc::Sender<String>,
        peer: Option<SocketAddr>,
        max_message_size: usize,
    ) -> Self {
        let (closed, _) = watch::channel(false);
        Self {
            inner: Arc::new(Inner {
                id: Uuid::new_v4(),
                peer,
                sender,
                closed,
                max_message_size,
            }),
        }
    }

    /// Get client ID
    pub fn id(&self) -> Uuid {
        self.inner.id
    }

    pub fn peer(&self) -> Option<SocketAddr> {
        self.inner.peer
    }

    /// Queue one message for the writer task
    pub async fn send(&self, payload: &str, timeout: Duration) -> SendStatus {
        if self.is_closed() {
            return SendStatus::Closed;
        }
        if payload.contains('\n') || payload.len() > self.inner.max_message_size {
            return SendStatus::Error;
        }

        match self
            .inner
            .sender
            .send_timeout(payload.to_string(), timeout)
            .await
        {
            Ok(()) => SendStatus::Ok,
            Err(SendTimeoutError::Timeout(_)) => SendStatus::Timeout,
            Err(SendTimeoutError::Closed(_)) => SendStatus::Closed,
        }
    }

    /// Raise the close signal. Queued messages are still flushed by the writer.
    pub fn close(&self) {
        self.inner.closed.send_replace(true);
    }

    pub fn is_closed(&self) -> bool {
        *self.inner.closed.borrow() || self.inner.sender.is_closed()
    }

    /// Resolves once the connection has been closed by anyone
    pub async fn closed(&self) {
        let mut rx = self.inner.closed.subscribe();
        let _ = rx.wait_for(|closed| *closed).await;
    }
}

impl PartialEq for ClientConnection {
    fn eq(&self, other: &Self) -> bool {
        self.inner.id == other.inner.id
    }
}

impl Eq for ClientConnection {}

impl Hash for ClientConnection {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.inner.id.hash(state);
    }
}

impl fmt::Debug for ClientConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClientConnection")
            .field("id", &self.inner.id)
            .field("peer", &self.inner.peer)
            .field("closed", &self.is_closed())
            .finish()
    }
}

/// Reads newline-terminated messages.
///
/// Partial lines survive in the internal buffer, so a read may be cancelled
/// (timeout, `select!`) and resumed without losing data.
pub struct MessageReader<R> {
    reader: R,
    buf: Vec<u8>,
    max_message_size: usize,
    /// Skipping the rest of an oversized line
    discarding: bool,
}

impl<R: AsyncBufRead + Unpin> MessageReader<R> {
    pub fn new(reader: R, max_message_size: usize) -> Self {
        Self {
            reader,
            buf: Vec::new(),
            max_message_size,
            discarding: false,
        }
    }

    /// Read one message. `Ok(None)` on end of stream.
    ///
    /// An oversized line fails with [`ProtocolError::MessageTooLarge`] as soon as
    /// the limit is crossed; its remainder is skipped by the following reads.
    pub async fn read_message(&mut self) -> Result<Option<String>> {
        loop {
            if self.discarding {
                self.buf.clear();
            }
            let limit = (self.max_message_size + 1).saturating_sub(self.buf.len());
            if limit == 0 {
                let size = self.buf.len();
                self.buf.clear();
                self.discarding = true;
                bail!(ProtocolError::MessageTooLarge {
                    size,
                    max: self.max_message_size
                });
            }

            let n = (&mut self.reader)
                .take(limit as u64)
                .read_until(b'\n', &mut self.buf)
                .await?;

            if self.buf.last() == Some(&b'\n') {
                let mut line = std::mem::take(&mut self.buf);
                if self.discarding {
                    self.discarding = false;
                    continue;
                }
                line.pop();
                if line.last() == Some(&b'\r') {
                    line.pop();
                }
                return match String::from_utf8(line) {
                    Ok(line) => Ok(Some(line)),
                    Err(_) => Err(ProtocolError::InvalidFormat.into()),
                };
            }

            if n == 0 {
                // Drop any unterminated tail
                self.buf.clear();
                return Ok(None);
            }
        }
    }

    /// Read one message with a timeout
    pub async fn recv(&mut self, timeout: Duration) -> RecvStatus {
        match tokio::time::timeout(timeout, self.read_message()).await {
            Ok(Ok(Some(line))) => RecvStatus::Message(line),
            Ok(Ok(None)) => RecvStatus::Closed,
            Ok(Err(e)) => match e.downcast::<ProtocolError>() {
                Ok(invalid) => RecvStatus::Invalid(invalid),
                Err(e) => RecvStatus::Error(e.to_string()),
            },
            Err(_) => RecvStatus::Timeout,
        }
    }
}

/// Write one newline-terminated message to a stream
pub async fn write_message<W: AsyncWrite + Unpin>(writer: &mut W, payload: &str) -> Result<()> {
    let mut framed = Vec::with_capacity(payload.len() + 1);
    framed.extend_from_slice(payload.as_bytes());
    framed.push(b'\n');
    writer.write_all(&framed).await?;
    writer.flush().await?;
    Ok(())
}

/// Task to write outgoing messages to the client.
///
/// Queued messages are drained before the close signal is honoured; a write
/// failure closes the connection.
pub async fn client_writer_task<W: AsyncWrite + Unpin>(
    mut writer: W,
    mut receiver: mpsc::Receiver<String>,
    connection: ClientConnection,
) {
    loop {
        tokio::select! {
            biased;

            msg = receiver.recv() => match msg {
                Some(payload) => {
                    if let Err(e) = write_message(&mut writer, &payload).await {
                        tracing::debug!("Failed to write message to client {}: {}", connection.id(), e);
                        break;
                    }
                }
                None => break,
            },

            _ = connection.closed() => break,
        }
    }

    connection.close();
    receiver.close();
    let _ = writer.shutdown().await;

    tracing::debug!("Client writer task finished: {}", connection.id());
}
