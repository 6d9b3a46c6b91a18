//! Framed loopback connection between the host and a worker.
//!
//! A `Connection` owns one TCP stream split into a read side and a write side,
//! each behind its own lock. Frames belonging to one logical message are
//! written under a single write-side acquisition so nothing interleaves
//! between a command and its companion data frame.
//!
//! Closing is idempotent: the first `close()` shuts the socket down, wakes
//! every pending read/write and runs the owner's close callback exactly once.

use std::io;
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::Mutex as StdMutex;
use std::sync::atomic::{AtomicBool, Ordering};

use futures::{SinkExt, StreamExt};
use tokio::io::AsyncWriteExt;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Mutex;
use tokio_util::bytes::Bytes;
use tokio_util::codec::{FramedRead, FramedWrite};
use tokio_util::sync::CancellationToken;

use super::codec::{Frame, FrameCodec, FrameError, FrameKind};
use super::protocol::Command;

#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    /// The connection is closed or the peer went away.
    #[error("connection closed")]
    Closed,

    #[error("protocol violation: {0}")]
    Protocol(FrameError),
}

type CloseCallback = Box<dyn FnOnce() + Send>;

pub struct Connection {
    label: String,
    reader: Mutex<FramedRead<OwnedReadHalf, FrameCodec>>,
    writer: Mutex<FramedWrite<OwnedWriteHalf, FrameCodec>>,
    closing: AtomicBool,
    closed: CancellationToken,
    on_close: StdMutex<Option<CloseCallback>>,
}

impl Connection {
    pub fn new(
        stream: TcpStream,
        label: impl Into<String>,
        on_close: impl FnOnce() + Send + 'static,
    ) -> Self {
        if let Err(e) = stream.set_nodelay(true) {
            tracing::debug!(error = %e, "Failed to disable Nagle on preview connection");
        }
        let (read_half, write_half) = stream.into_split();
        Self {
            label: label.into(),
            reader: Mutex::new(FramedRead::new(read_half, FrameCodec::new())),
            writer: Mutex::new(FramedWrite::new(write_half, FrameCodec::new())),
            closing: AtomicBool::new(false),
            closed: CancellationToken::new(),
            on_close: StdMutex::new(Some(Box::new(on_close))),
        }
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn is_closed(&self) -> bool {
        self.closed.is_cancelled()
    }

    /// Resolves once `close()` has started.
    pub async fn closed(&self) {
        self.closed.cancelled().await
    }

    pub async fn send_command(&self, command: &Command) -> Result<(), TransportError> {
        self.send_frames(vec![Frame::command(command.encode())])
            .await?;
        tracing::trace!(connection = %self.label, %command, "Sent command");
        Ok(())
    }

    pub async fn send_data(&self, data: impl Into<Bytes>) -> Result<(), TransportError> {
        let frame = Frame::data(data);
        let size = frame.payload.len();
        self.send_frames(vec![frame]).await?;
        tracing::trace!(connection = %self.label, size, "Sent data");
        Ok(())
    }

    /// Sends a command and its companion data frame back-to-back.
    pub async fn send_command_with_data(
        &self,
        command: &Command,
        data: impl Into<Bytes>,
    ) -> Result<(), TransportError> {
        let data = Frame::data(data);
        let size = data.payload.len();
        self.send_frames(vec![Frame::command(command.encode()), data])
            .await?;
        tracing::trace!(connection = %self.label, %command, size, "Sent command with data");
        Ok(())
    }

    /// Receives the next command.
    ///
    /// Returns `Ok(None)` when a frame arrived that does not decode as a known
    /// command; the frame is dropped and the connection stays open.
    pub async fn receive_command(&self) -> Result<Option<Command>, TransportError> {
        let payload = self.receive_frame(FrameKind::Command).await?;
        let command = std::str::from_utf8(&payload).ok().and_then(Command::decode);
        match command {
            Some(command) => {
                tracing::trace!(connection = %self.label, %command, "Got command");
                Ok(Some(command))
            }
            None => {
                tracing::warn!(
                    connection = %self.label,
                    line = %String::from_utf8_lossy(&payload),
                    "Got unknown command"
                );
                Ok(None)
            }
        }
    }

    pub async fn receive_data(&self) -> Result<Bytes, TransportError> {
        let data = self.receive_frame(FrameKind::Data).await?;
        tracing::trace!(connection = %self.label, size = data.len(), "Got data");
        Ok(data)
    }

    pub async fn close(&self) {
        if self.closing.swap(true, Ordering::SeqCst) {
            return;
        }
        self.closed.cancel();

        {
            let mut writer = self.writer.lock().await;
            if let Err(e) = writer.get_mut().shutdown().await {
                tracing::trace!(connection = %self.label, error = %e, "Socket shutdown failed");
            }
        }
        tracing::debug!(connection = %self.label, "Connection closed");

        let callback = match self.on_close.lock() {
            Ok(mut guard) => guard.take(),
            Err(poisoned) => poisoned.into_inner().take(),
        };
        if let Some(callback) = callback {
            callback();
        }
    }

    async fn send_frames(&self, frames: Vec<Frame>) -> Result<(), TransportError> {
        // Reject oversized frames before any byte of the message hits the wire.
        for frame in &frames {
            frame.check_size().map_err(TransportError::Protocol)?;
        }

        let result = {
            let mut writer = tokio::select! {
                _ = self.closed.cancelled() => return Err(TransportError::Closed),
                writer = self.writer.lock() => writer,
            };
            let mut result = Ok(());
            for frame in frames {
                result = tokio::select! {
                    _ = self.closed.cancelled() => return Err(TransportError::Closed),
                    sent = writer.send(frame) => sent,
                };
                if result.is_err() {
                    break;
                }
            }
            result
        };

        match result {
            Ok(()) => Ok(()),
            Err(e) if e.is_protocol_violation() => Err(TransportError::Protocol(e)),
            Err(e) => {
                tracing::debug!(connection = %self.label, error = %e, "Send failed");
                self.close().await;
                Err(TransportError::Closed)
            }
        }
    }

    async fn receive_frame(&self, kind: FrameKind) -> Result<Bytes, TransportError> {
        let next = {
            let mut reader = tokio::select! {
                _ = self.closed.cancelled() => return Err(TransportError::Closed),
                reader = self.reader.lock() => reader,
            };
            reader.decoder_mut().expect(kind);
            tokio::select! {
                _ = self.closed.cancelled() => return Err(TransportError::Closed),
                next = reader.next() => next,
            }
        };

        match next {
            Some(Ok(payload)) => Ok(payload),
            Some(Err(e)) if e.is_protocol_violation() => {
                tracing::error!(connection = %self.label, error = %e, "Oversized frame received");
                self.close().await;
                Err(TransportError::Protocol(e))
            }
            Some(Err(e)) => {
                tracing::debug!(connection = %self.label, error = %e, "Receive failed");
                self.close().await;
                Err(TransportError::Closed)
            }
            None => {
                tracing::debug!(connection = %self.label, "Peer closed the connection");
                self.close().await;
                Err(TransportError::Closed)
            }
        }
    }
}

/// Binds an ephemeral port on the loopback interface.
pub async fn bind_loopback() -> io::Result<TcpListener> {
    let listener = TcpListener::bind(SocketAddr::from((Ipv4Addr::LOCALHOST, 0))).await?;
    tracing::debug!(addr = %listener.local_addr()?, "Bound preview listener");
    Ok(listener)
}

pub async fn connect_loopback(port: u16) -> io::Result<TcpStream> {
    tracing::trace!(port, "Connecting to preview host");
    TcpStream::connect(SocketAddr::from((Ipv4Addr::LOCALHOST, port))).await
}
