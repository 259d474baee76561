//! Connection actor
//!
//! A [`Connection`] owns one WebSocket session. Two tasks serve it: the read
//! loop hands inbound frames to the owner, the write loop drains a bounded
//! output queue onto the socket. Writers never wait; a full queue rejects the
//! frame with [`SendError::BufferFull`].
//!
//! Closing goes through the same queue as data: [`Connection::close`]
//! enqueues a `Close` sentinel, so frames written before it are flushed
//! before the close frame. The drain is bounded by the close timeout: if the
//! sentinel has not been reached by then, the connection is aborted. If the
//! peer goes away or the transport fails, the shutdown token is cancelled
//! instead and anything still queued is dropped.

use crate::error::ConnectionError;
use crate::handler::EventHandler;
use crate::id::ConnId;
use crate::properties::Properties;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use parking_lot::Mutex;
use std::any::Any;
use std::net::SocketAddr;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio_tungstenite::tungstenite::error::ProtocolError;
use tokio_tungstenite::tungstenite::{Error as WsError, Message as WsMessage};
use tokio_tungstenite::WebSocketStream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};
use wicket_dispatch::{panic_message, Conn, Dispatcher, MessageDecoder, SendError};

/// One unit of outbound I/O
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    Text(String),
    Binary(Vec<u8>),
    /// Close after everything queued ahead of it has been written
    Close,
}

/// Connection lifecycle. Only ever moves forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum ConnectionState {
    Open,
    Closing,
    Closed,
}

/// Where inbound data frames go
#[derive(Clone)]
pub(crate) enum Inbound {
    /// `on_text` / `on_binary`
    Callbacks,
    /// Decoded into messages and put on a dispatcher
    Routed {
        dispatcher: Arc<Dispatcher>,
        decoder: Arc<dyn MessageDecoder>,
    },
}

/// Handle to a live WebSocket session
pub struct Connection {
    id: ConnId,
    local_addr: SocketAddr,
    remote_addr: SocketAddr,
    state: Mutex<ConnectionState>,
    outbound: mpsc::Sender<Frame>,
    buffer_size: usize,
    shutdown: CancellationToken,
    /// Cancelled by the first `close()`; starts the drain deadline
    closing: CancellationToken,
    properties: Properties,
}

impl Connection {
    /// Create a connection and the receiving end of its output queue
    pub(crate) fn new(
        id: ConnId,
        local_addr: SocketAddr,
        remote_addr: SocketAddr,
        buffer_size: usize,
    ) -> (Arc<Self>, mpsc::Receiver<Frame>) {
        let (outbound, queue) = mpsc::channel(buffer_size);
        let conn = Arc::new(Self {
            id,
            local_addr,
            remote_addr,
            state: Mutex::new(ConnectionState::Open),
            outbound,
            buffer_size,
            shutdown: CancellationToken::new(),
            closing: CancellationToken::new(),
            properties: Properties::new(),
        });
        (conn, queue)
    }

    pub fn id(&self) -> ConnId {
        self.id
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn remote_addr(&self) -> SocketAddr {
        self.remote_addr
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.lock()
    }

    pub fn is_closed(&self) -> bool {
        self.state() != ConnectionState::Open
    }

    /// Frames queued and not yet written
    pub fn pending(&self) -> usize {
        self.buffer_size.saturating_sub(self.outbound.capacity())
    }

    /// Send a binary frame
    pub fn write(&self, data: impl Into<Vec<u8>>) -> Result<(), SendError> {
        self.write_binary(data)
    }

    pub fn write_text(&self, text: impl Into<String>) -> Result<(), SendError> {
        self.write_frame(Frame::Text(text.into()))
    }

    pub fn write_binary(&self, data: impl Into<Vec<u8>>) -> Result<(), SendError> {
        self.write_frame(Frame::Binary(data.into()))
    }

    /// Queue a frame without waiting. A `Close` frame is the same as
    /// calling [`close`](Self::close).
    pub fn write_frame(&self, frame: Frame) -> Result<(), SendError> {
        if frame == Frame::Close {
            self.close();
            return Ok(());
        }

        // Held across the enqueue so nothing lands behind the close sentinel
        let state = self.state.lock();
        if *state != ConnectionState::Open {
            return Err(SendError::Closed);
        }
        match self.outbound.try_send(frame) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(_)) => Err(SendError::BufferFull),
            Err(TrySendError::Closed(_)) => Err(SendError::Closed),
        }
    }

    /// Begin a graceful close. Returns `true` for the call that initiated
    /// it; every later call is a no-op returning `false`.
    ///
    /// Frames already queued are flushed first, for at most the close
    /// timeout. A peer that stops reading gets the connection aborted once
    /// it expires.
    pub fn close(&self) -> bool {
        let mut state = self.state.lock();
        if *state != ConnectionState::Open {
            return false;
        }
        *state = ConnectionState::Closing;
        if self.outbound.try_send(Frame::Close).is_err() {
            // No room for the sentinel, or the write loop is gone
            self.shutdown.cancel();
        }
        self.closing.cancel();
        drop(state);

        debug!(conn_id = %self.id, "Connection closing");
        true
    }

    /// Stop both loops now, dropping whatever is still queued
    fn abort(&self) {
        {
            let mut state = self.state.lock();
            if *state == ConnectionState::Open {
                *state = ConnectionState::Closing;
            }
        }
        self.shutdown.cancel();
    }

    pub(crate) fn mark_closed(&self) {
        *self.state.lock() = ConnectionState::Closed;
    }

    pub fn properties(&self) -> &Properties {
        &self.properties
    }

    pub fn set<T: Any + Send + Sync>(&self, key: impl Into<String>, value: T) {
        self.properties.set(key, value);
    }

    pub fn get<T: Any + Send + Sync>(&self, key: &str) -> Option<Arc<T>> {
        self.properties.get(key)
    }

    pub fn remove(&self, key: &str) -> bool {
        self.properties.remove(key)
    }

    /// Serve the socket until both loops exit
    pub(crate) async fn run<S>(
        self: Arc<Self>,
        ws: WebSocketStream<S>,
        queue: mpsc::Receiver<Frame>,
        inbound: Inbound,
        events: Arc<dyn EventHandler>,
        close_timeout: Duration,
    ) where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let (sink, stream) = ws.split();

        let reader = tokio::spawn(read_loop(
            Arc::clone(&self),
            stream,
            inbound,
            Arc::clone(&events),
        ));
        let writer = tokio::spawn(write_loop(
            Arc::clone(&self),
            sink,
            queue,
            Arc::clone(&events),
            close_timeout,
        ));
        let (read, write) = tokio::join!(reader, writer);

        for (side, result) in [("read", read), ("write", write)] {
            let Err(e) = result else { continue };
            let reason = if e.is_panic() {
                panic_message(e.into_panic().as_ref())
            } else {
                e.to_string()
            };
            error!(conn_id = %self.id, "Connection {} loop failed: {}", side, reason);

            let err = ConnectionError::HandlerPanic(reason);
            contain(self.id, "on_error", || events.on_error(&self, &err));
        }
    }
}

impl Conn for Connection {
    fn id(&self) -> u64 {
        self.id.as_u64()
    }

    fn remote_addr(&self) -> SocketAddr {
        self.remote_addr
    }

    fn write_text(&self, text: String) -> Result<(), SendError> {
        Connection::write_text(self, text)
    }

    fn write_binary(&self, data: Vec<u8>) -> Result<(), SendError> {
        Connection::write_binary(self, data)
    }

    fn close(&self) -> bool {
        Connection::close(self)
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("remote_addr", &self.remote_addr)
            .field("state", &self.state())
            .field("pending", &self.pending())
            .finish()
    }
}

/// Run a user callback, logging and swallowing a panic
pub(crate) fn contain<R>(id: ConnId, callback: &str, f: impl FnOnce() -> R) -> Option<R> {
    match std::panic::catch_unwind(AssertUnwindSafe(f)) {
        Ok(value) => Some(value),
        Err(panic) => {
            error!(
                conn_id = %id,
                "{} panicked: {}",
                callback,
                panic_message(panic.as_ref())
            );
            None
        }
    }
}

/// Aborts the connection when a loop exits, including by unwinding
struct AbortOnExit<'a>(&'a Connection);

impl Drop for AbortOnExit<'_> {
    fn drop(&mut self) {
        self.0.abort();
    }
}

/// Close variants that are a normal end of a session
fn is_graceful(err: &WsError) -> bool {
    matches!(err, WsError::ConnectionClosed | WsError::AlreadyClosed)
}

fn report(conn: &Arc<Connection>, events: &dyn EventHandler, err: ConnectionError) {
    events.on_error(conn, &err);
}

impl Inbound {
    fn text(&self, conn: &Arc<Connection>, events: &dyn EventHandler, text: String) {
        match self {
            Self::Callbacks => events.on_text(conn, text),
            Self::Routed { .. } => self.route(conn, events, text.as_bytes()),
        }
    }

    fn binary(&self, conn: &Arc<Connection>, events: &dyn EventHandler, data: Vec<u8>) {
        match self {
            Self::Callbacks => events.on_binary(conn, data),
            Self::Routed { .. } => self.route(conn, events, &data),
        }
    }

    fn route(&self, conn: &Arc<Connection>, events: &dyn EventHandler, data: &[u8]) {
        let Self::Routed { dispatcher, decoder } = self else {
            return;
        };
        let origin: Arc<dyn Conn> = Arc::clone(conn) as Arc<dyn Conn>;
        let result = decoder
            .decode(origin, data)
            .and_then(|msg| dispatcher.put(msg));
        if let Err(e) = result {
            warn!(conn_id = %conn.id, "Failed to dispatch inbound frame: {}", e);
            report(conn, events, ConnectionError::Dispatch(e));
        }
    }
}

async fn read_loop<S>(
    conn: Arc<Connection>,
    mut stream: SplitStream<WebSocketStream<S>>,
    inbound: Inbound,
    events: Arc<dyn EventHandler>,
) where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let _exit = AbortOnExit(&conn);

    loop {
        let next = tokio::select! {
            biased;
            _ = conn.shutdown.cancelled() => break,
            next = stream.next() => next,
        };

        match next {
            Some(Ok(WsMessage::Text(text))) => inbound.text(&conn, events.as_ref(), text),
            Some(Ok(WsMessage::Binary(data))) => inbound.binary(&conn, events.as_ref(), data),
            Some(Ok(WsMessage::Close(frame))) => {
                debug!(conn_id = %conn.id, ?frame, "Peer closed connection");
                break;
            }
            // Ping, pong and raw frames are handled by the protocol layer
            Some(Ok(_)) => {}
            Some(Err(e)) if is_graceful(&e) => {
                debug!(conn_id = %conn.id, "Connection closed: {}", e);
                break;
            }
            Some(Err(e)) => {
                if !matches!(e, WsError::Protocol(ProtocolError::ResetWithoutClosingHandshake)) {
                    warn!(conn_id = %conn.id, "Read failed: {}", e);
                } else {
                    debug!(conn_id = %conn.id, "Peer reset without closing handshake");
                }
                report(&conn, events.as_ref(), ConnectionError::Transport(e));
                break;
            }
            None => {
                debug!(conn_id = %conn.id, "Stream ended");
                break;
            }
        }
    }
}

async fn write_loop<S>(
    conn: Arc<Connection>,
    mut sink: SplitSink<WebSocketStream<S>, WsMessage>,
    mut queue: mpsc::Receiver<Frame>,
    events: Arc<dyn EventHandler>,
    close_timeout: Duration,
) where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let _exit = AbortOnExit(&conn);
    let mut graceful = false;

    let drain_deadline = async {
        conn.closing.cancelled().await;
        tokio::time::sleep(close_timeout).await;
    };
    tokio::pin!(drain_deadline);

    loop {
        let frame = tokio::select! {
            biased;
            _ = conn.shutdown.cancelled() => break,
            _ = &mut drain_deadline => {
                debug!(conn_id = %conn.id, "Close drain timed out");
                conn.abort();
                break;
            }
            frame = queue.recv() => frame,
        };

        let msg = match frame {
            Some(Frame::Text(text)) => WsMessage::Text(text),
            Some(Frame::Binary(data)) => WsMessage::Binary(data),
            Some(Frame::Close) => {
                graceful = true;
                break;
            }
            None => break,
        };

        // A cancelled send leaves the frame whole in the sink's buffer;
        // the close below flushes it ahead of the close frame.
        let sent = tokio::select! {
            biased;
            _ = conn.shutdown.cancelled() => break,
            _ = &mut drain_deadline => {
                debug!(conn_id = %conn.id, "Close drain timed out mid-write");
                conn.abort();
                break;
            }
            sent = sink.send(msg) => sent,
        };
        if let Err(e) = sent {
            if is_graceful(&e) {
                debug!(conn_id = %conn.id, "Write on closed connection: {}", e);
            } else {
                warn!(conn_id = %conn.id, "Write failed: {}", e);
                report(&conn, events.as_ref(), ConnectionError::Transport(e));
            }
            conn.abort();
            break;
        }
    }

    queue.close();
    let dropped = std::iter::from_fn(|| queue.try_recv().ok()).count();
    if dropped > 0 {
        debug!(conn_id = %conn.id, dropped, "Dropped queued frames");
    }

    match tokio::time::timeout(close_timeout, sink.close()).await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => debug!(conn_id = %conn.id, "Close frame not sent: {}", e),
        Err(_) => debug!(conn_id = %conn.id, "Timed out sending close frame"),
    }

    if graceful {
        // Give the peer a chance to answer the close before tearing down
        let _ = tokio::time::timeout(close_timeout, conn.shutdown.cancelled()).await;
    }
}
