// Copyright 2025 jonefeewang@gmail.com
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use std::borrow::Cow;
use std::fmt;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::BytesMut;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::codec::{Decoder, Encoder};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};
use uuid::Uuid;

use crate::service::NetworkConfig;
use crate::{AppError, AppResult, Shutdown};

use super::{
    ConnectionEvent, EventBus, NulDelimitedCodec, DEFAULT_PORT, READ_BUFFER_SIZE,
};

pub type ConnectionId = Uuid;

/// Synchronous observer installed by whoever owns the connection (the server's registry).
/// It runs on the receive-loop task before the event reaches channel subscribers.
pub type EventHook = Arc<dyn Fn(&ConnectionEvent) + Send + Sync>;

/// One live TCP socket carrying null-delimited text messages.
///
/// The same type serves outbound connections created with [`Connection::new`] and
/// [`Connection::connect`], and connections accepted by a [`crate::Server`].
///
/// The socket is owned exclusively: its read half lives in the receive-loop task and its
/// write half behind a lock that only `send` and teardown take. Inbound messages are queued
/// in arrival order and handed out one per [`Connection::receive`] call.
pub struct Connection {
    id: Option<ConnectionId>,
    peer_addr: parking_lot::Mutex<Option<SocketAddr>>,
    shutdown: Shutdown,
    reader: parking_lot::Mutex<Option<OwnedReadHalf>>,
    writer: tokio::sync::Mutex<Option<OwnedWriteHalf>>,
    inbox_tx: async_channel::Sender<String>,
    inbox_rx: async_channel::Receiver<String>,
    receive_loop: parking_lot::Mutex<Option<JoinHandle<()>>>,
    loop_started: AtomicBool,
    loop_exited: CancellationToken,
    established: AtomicBool,
    connected: AtomicBool,
    disconnected_fired: AtomicBool,
    default_send_timeout: Duration,
    events: EventBus<ConnectionEvent>,
    hook: parking_lot::Mutex<Option<EventHook>>,
}

impl Connection {
    /// Create an outbound connection that is not connected yet.
    ///
    /// Subscribe to its events before calling [`Connection::connect`] to observe `Connected`.
    pub fn new() -> Arc<Connection> {
        Self::with_send_timeout(NetworkConfig::default().send_timeout())
    }

    pub fn with_send_timeout(send_timeout: Duration) -> Arc<Connection> {
        Arc::new(Self::build(None, Shutdown::new(), send_timeout, None))
    }

    fn build(
        id: Option<ConnectionId>,
        shutdown: Shutdown,
        send_timeout: Duration,
        hook: Option<EventHook>,
    ) -> Connection {
        let (inbox_tx, inbox_rx) = async_channel::unbounded();
        Connection {
            id,
            peer_addr: parking_lot::Mutex::new(None),
            shutdown,
            reader: parking_lot::Mutex::new(None),
            writer: tokio::sync::Mutex::new(None),
            inbox_tx,
            inbox_rx,
            receive_loop: parking_lot::Mutex::new(None),
            loop_started: AtomicBool::new(false),
            loop_exited: CancellationToken::new(),
            established: AtomicBool::new(false),
            connected: AtomicBool::new(false),
            disconnected_fired: AtomicBool::new(false),
            default_send_timeout: send_timeout,
            events: EventBus::new(),
            hook: parking_lot::Mutex::new(hook),
        }
    }

    /// Wrap a socket handed over by a listener. The receive loop is not running until
    /// [`Connection::start_receive_loop`] is called.
    pub(crate) fn accepted(
        socket: TcpStream,
        id: ConnectionId,
        peer_addr: SocketAddr,
        shutdown: Shutdown,
        send_timeout: Duration,
        hook: EventHook,
    ) -> Arc<Connection> {
        let mut connection = Self::build(Some(id), shutdown, send_timeout, Some(hook));
        if let Err(err) = socket.set_nodelay(true) {
            warn!(%peer_addr, "failed to set TCP_NODELAY: {}", err);
        }
        let (reader, writer) = socket.into_split();
        *connection.peer_addr.get_mut() = Some(peer_addr);
        *connection.reader.get_mut() = Some(reader);
        *connection.writer.get_mut() = Some(writer);
        *connection.established.get_mut() = true;
        *connection.connected.get_mut() = true;
        Arc::new(connection)
    }

    /// Server-assigned identity, `None` for connections opened with [`Connection::connect`].
    pub fn id(&self) -> Option<ConnectionId> {
        self.id
    }

    pub fn peer_addr(&self) -> Option<SocketAddr> {
        *self.peer_addr.lock()
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    /// Number of complete messages waiting to be received.
    pub fn pending_messages(&self) -> usize {
        self.inbox_rx.len()
    }

    pub fn subscribe(&self) -> async_channel::Receiver<ConnectionEvent> {
        self.events.subscribe()
    }

    pub async fn connect_default(self: &Arc<Self>, host: &str) -> AppResult<()> {
        self.connect(host, DEFAULT_PORT).await
    }

    /// Open the socket, start the receive loop and emit `Connected`.
    ///
    /// A connection is good for a single socket: connecting it again, whether still open
    /// or already closed, is an illegal state.
    pub async fn connect(self: &Arc<Self>, host: &str, port: u16) -> AppResult<()> {
        if self.established.load(Ordering::SeqCst) {
            return Err(AppError::IllegalStateError(Cow::Borrowed(
                "connection already used a socket",
            )));
        }
        let addr = format!("{}:{}", host, port);
        let connect_failure = |reason: String| AppError::ConnectFailure {
            addr: addr.clone(),
            reason,
        };

        let socket = TcpStream::connect(&addr)
            .await
            .map_err(|e| connect_failure(e.to_string()))?;
        // a socket without a peer address never finished connecting
        let peer_addr = socket
            .peer_addr()
            .map_err(|e| connect_failure(format!("socket not connected: {}", e)))?;

        // a concurrent connect may have won the race while this one was dialing
        if self.established.swap(true, Ordering::SeqCst) {
            return Err(AppError::IllegalStateError(Cow::Borrowed(
                "connection already used a socket",
            )));
        }
        if let Err(err) = socket.set_nodelay(true) {
            warn!(%peer_addr, "failed to set TCP_NODELAY: {}", err);
        }
        let (reader, writer) = socket.into_split();
        *self.peer_addr.lock() = Some(peer_addr);
        *self.reader.lock() = Some(reader);
        *self.writer.lock().await = Some(writer);
        self.connected.store(true, Ordering::SeqCst);

        info!(%peer_addr, "connected");
        self.start_receive_loop(None);
        Ok(())
    }

    /// Start the one receive loop this connection ever runs and emit `Connected`.
    ///
    /// The socket's read half is moved into the loop task, so later calls find nothing to
    /// read from and return without effect. `completion` is held until the loop task ends.
    pub(crate) fn start_receive_loop(self: &Arc<Self>, completion: Option<mpsc::Sender<()>>) {
        let mut slot = self.receive_loop.lock();
        let Some(reader) = self.reader.lock().take() else {
            return;
        };
        self.loop_started.store(true, Ordering::SeqCst);
        self.emit(ConnectionEvent::Connected(Arc::clone(self)));

        let connection = Arc::clone(self);
        *slot = Some(tokio::spawn(async move {
            let _completion = completion;
            connection.run_receive_loop(reader).await;
        }));
    }

    async fn run_receive_loop(self: Arc<Self>, mut reader: OwnedReadHalf) {
        let peer_addr = self.peer_addr();
        debug!(id = ?self.id, ?peer_addr, "receive loop started");

        // errors end the loop, they never reach callers
        if let Err(err) = self.read_messages(&mut reader).await {
            error!(id = ?self.id, ?peer_addr, "receive loop error: {}", err);
        }
        drop(reader);

        self.close().await;
        self.loop_exited.cancel();
        debug!(id = ?self.id, ?peer_addr, "receive loop exited");
    }

    async fn read_messages(&self, reader: &mut OwnedReadHalf) -> AppResult<()> {
        let mut codec = NulDelimitedCodec::new();
        let mut buffer = BytesMut::with_capacity(READ_BUFFER_SIZE);
        let mut chunk = [0u8; READ_BUFFER_SIZE];

        loop {
            let read = tokio::select! {
                biased;
                _ = self.shutdown.recv() => {
                    debug!(id = ?self.id, "receive loop cancelled");
                    return Ok(());
                }
                res = reader.read(&mut chunk) => res?,
            };

            if read == 0 {
                if !buffer.is_empty() {
                    // the unterminated tail is dropped, never delivered as a message
                    debug!(
                        id = ?self.id,
                        "peer closed with {} bytes of partial frame, discarded",
                        buffer.len()
                    );
                }
                return Ok(());
            }

            buffer.extend_from_slice(&chunk[..read]);
            while let Some(message) = codec.decode(&mut buffer)? {
                trace!(id = ?self.id, len = message.len(), "message queued");
                self.inbox_tx.try_send(message).map_err(|e| {
                    AppError::IllegalStateError(Cow::Owned(format!("inbox closed: {}", e)))
                })?;
            }
        }
    }

    /// Release the socket after the receive loop ended and emit `Disconnected` once.
    async fn close(self: &Arc<Self>) {
        self.connected.store(false, Ordering::SeqCst);
        // wakes a pending send holding the writer and every waiting receive
        self.shutdown.trigger();
        self.release_writer().await;

        if !self.disconnected_fired.swap(true, Ordering::SeqCst) {
            info!(id = ?self.id, peer_addr = ?self.peer_addr(), "disconnected");
            self.emit(ConnectionEvent::Disconnected(Arc::clone(self)));
        }
        // queued events hold this connection, the senders and the hook must not outlive it
        self.events.close();
        self.hook.lock().take();
    }

    async fn release_writer(&self) {
        let writer = self.writer.lock().await.take();
        if let Some(mut writer) = writer {
            if let Err(err) = writer.shutdown().await {
                debug!(id = ?self.id, "socket shutdown error: {}", err);
            }
        }
    }

    /// Cancel the connection, wait for the receive loop to exit and release the socket.
    ///
    /// Concurrent callers all return only after the loop has exited. Calling it on a
    /// connection that is already disconnected, or that never connected, does nothing.
    pub async fn disconnect(&self) {
        if !self.established.load(Ordering::SeqCst) {
            return;
        }
        self.shutdown.trigger();

        let receive_loop = self.receive_loop.lock().take();
        match receive_loop {
            Some(handle) => {
                if let Err(err) = handle.await {
                    error!(id = ?self.id, "receive loop task failed: {}", err);
                }
                // a panicked loop never signals on its own
                self.loop_exited.cancel();
            }
            None if self.loop_started.load(Ordering::SeqCst) => {
                self.loop_exited.cancelled().await;
            }
            None => {}
        }
        self.connected.store(false, Ordering::SeqCst);
        self.release_writer().await;
    }

    /// Send with the connection's default timeout.
    pub async fn send(&self, message: &str) -> AppResult<()> {
        self.send_timeout(message, self.default_send_timeout).await
    }

    /// Frame `message` and write it to the socket.
    ///
    /// The message must not contain the delimiter byte. Fails with `SendFailure` when fewer
    /// bytes than encoded were written, on a socket error, or when the timeout or the
    /// connection's cancellation fires first.
    pub async fn send_timeout(&self, message: &str, timeout: Duration) -> AppResult<()> {
        if !self.is_connected() {
            return Err(AppError::NoConnection);
        }
        let mut frame = BytesMut::with_capacity(NulDelimitedCodec::encoded_len(message));
        NulDelimitedCodec::new().encode(message, &mut frame)?;

        tokio::select! {
            biased;
            _ = self.shutdown.recv() => {
                Err(AppError::SendFailure("cancelled by connection shutdown".to_string()))
            }
            res = tokio::time::timeout(timeout, self.write_frame(&frame)) => match res {
                Ok(written) => written,
                Err(_) => Err(AppError::SendFailure(format!(
                    "timed out after {}ms",
                    timeout.as_millis()
                ))),
            },
        }
    }

    async fn write_frame(&self, frame: &[u8]) -> AppResult<()> {
        let mut guard = self.writer.lock().await;
        let writer = guard.as_mut().ok_or(AppError::NoConnection)?;

        let expected = frame.len();
        let mut sent = 0;
        while sent < expected {
            let written = writer.write(&frame[sent..]).await.map_err(|e| {
                AppError::SendFailure(format!("wrote {} of {} bytes: {}", sent, expected, e))
            })?;
            if written == 0 {
                break;
            }
            sent += written;
        }
        if sent < expected {
            return Err(AppError::SendFailure(format!(
                "transferred {} of {} bytes",
                sent, expected
            )));
        }
        Ok(())
    }

    /// Wait without deadline for the oldest queued message.
    pub async fn receive(&self) -> AppResult<String> {
        self.receive_inner(None).await
    }

    /// Wait at most `timeout` for the oldest queued message.
    ///
    /// A timeout leaves the connection and its queue untouched.
    pub async fn receive_timeout(&self, timeout: Duration) -> AppResult<String> {
        self.receive_inner(Some(timeout)).await
    }

    async fn receive_inner(&self, timeout: Option<Duration>) -> AppResult<String> {
        if !self.established.load(Ordering::SeqCst) {
            return Err(AppError::NoConnection);
        }

        // queued messages win over cancellation so they stay readable after disconnect
        let wait = async {
            tokio::select! {
                biased;
                message = self.inbox_rx.recv() => message.map_err(|e| {
                    AppError::IllegalStateError(Cow::Owned(format!("inbox closed: {}", e)))
                }),
                _ = self.shutdown.recv() => Err(AppError::Cancelled),
            }
        };

        match timeout {
            Some(timeout) => tokio::time::timeout(timeout, wait)
                .await
                .map_err(|_| AppError::Timeout(timeout.as_millis()))?,
            None => wait.await,
        }
    }

    fn emit(&self, event: ConnectionEvent) {
        let hook = self.hook.lock().clone();
        if let Some(hook) = hook {
            hook(&event);
        }
        self.events.emit(event);
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("peer_addr", &self.peer_addr())
            .field("connected", &self.is_connected())
            .finish()
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        trace!(id = ?self.id, "connection dropped");
    }
}
