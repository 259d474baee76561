//! Gateway main structure
//!
//! Accepts WebSocket upgrades, enforces the connection ceiling, and runs
//! each connection from registration to disconnect.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpListener;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio_tungstenite::accept_hdr_async;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::http::StatusCode;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use wicket_dispatch::{Dispatcher, JsonEnvelopeDecoder, MessageDecoder};

use crate::config::GatewayConfig;
use crate::connection::{contain, Connection, Frame, Inbound};
use crate::error::{ConnectionError, GatewayError, Result};
use crate::handler::{EventHandler, NoopHandler};
use crate::id::{ConnId, IdGenerator, SequentialIdGenerator};
use crate::registry::Registry;
use crate::upgrade::{self, Preread};

/// The WebSocket gateway
#[derive(Clone)]
pub struct Gateway {
    config: Arc<GatewayConfig>,
    registry: Registry,
    events: Arc<dyn EventHandler>,
    ids: Arc<dyn IdGenerator>,
    dispatcher: Option<Arc<Dispatcher>>,
    decoder: Arc<dyn MessageDecoder>,
    slots: Arc<Semaphore>,
    shutdown: CancellationToken,
    local_addr: Arc<Mutex<Option<SocketAddr>>>,
}

impl std::fmt::Debug for Gateway {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Gateway")
            .field("config", &self.config)
            .field("connections", &self.registry.len())
            .field("routed", &self.dispatcher.is_some())
            .field("shutdown", &self.is_shutdown())
            .finish()
    }
}

impl Gateway {
    /// Create a gateway with no-op callbacks and sequential IDs
    pub fn new(config: GatewayConfig) -> Result<Self> {
        config.validate()?;
        let slots = Arc::new(Semaphore::new(config.max_connections));

        Ok(Self {
            config: Arc::new(config),
            registry: Registry::new(),
            events: Arc::new(NoopHandler),
            ids: Arc::new(SequentialIdGenerator::new()),
            dispatcher: None,
            decoder: Arc::new(JsonEnvelopeDecoder),
            slots,
            shutdown: CancellationToken::new(),
            local_addr: Arc::new(Mutex::new(None)),
        })
    }

    pub fn with_handler(mut self, handler: impl EventHandler + 'static) -> Self {
        self.events = Arc::new(handler);
        self
    }

    pub fn with_handler_arc(mut self, handler: Arc<dyn EventHandler>) -> Self {
        self.events = handler;
        self
    }

    pub fn with_id_generator(mut self, ids: impl IdGenerator + 'static) -> Self {
        self.ids = Arc::new(ids);
        self
    }

    /// Route inbound data frames to `dispatcher` instead of `on_text` /
    /// `on_binary`. The dispatcher's lifecycle stays with the caller.
    pub fn with_dispatcher(mut self, dispatcher: Arc<Dispatcher>) -> Self {
        self.dispatcher = Some(dispatcher);
        self
    }

    /// Decoder used in routed mode (JSON envelopes by default)
    pub fn with_decoder(mut self, decoder: impl MessageDecoder + 'static) -> Self {
        self.decoder = Arc::new(decoder);
        self
    }

    pub fn config(&self) -> &GatewayConfig {
        &self.config
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// Number of registered connections
    pub fn len(&self) -> usize {
        self.registry.len()
    }

    pub fn is_empty(&self) -> bool {
        self.registry.is_empty()
    }

    /// Address the gateway is listening on, once serving
    pub fn local_addr(&self) -> Option<SocketAddr> {
        *self.local_addr.lock()
    }

    pub fn is_shutdown(&self) -> bool {
        self.shutdown.is_cancelled()
    }

    /// Bind `config.bind` and serve until [`shutdown`](Self::shutdown)
    pub async fn run(&self) -> Result<()> {
        let addr: SocketAddr = self.config.bind.parse()?;
        let listener = TcpListener::bind(&addr).await?;
        self.serve(listener).await
    }

    /// Accept connections from `listener` until [`shutdown`](Self::shutdown)
    pub async fn serve(&self, listener: TcpListener) -> Result<()> {
        let addr = listener.local_addr()?;
        *self.local_addr.lock() = Some(addr);
        info!("Gateway listening on ws://{}", addr);

        loop {
            let accepted = tokio::select! {
                _ = self.shutdown.cancelled() => break,
                accepted = listener.accept() => accepted,
            };
            let (stream, peer) = match accepted {
                Ok(pair) => pair,
                Err(e) => {
                    warn!("Accept failed: {}", e);
                    tokio::time::sleep(Duration::from_millis(50)).await;
                    continue;
                }
            };
            let local = match stream.local_addr() {
                Ok(local) => local,
                Err(e) => {
                    debug!(peer = %peer, "Dropping socket without local address: {}", e);
                    continue;
                }
            };

            let gateway = self.clone();
            tokio::spawn(async move {
                if let Err(e) = gateway.accept(stream, local, peer).await {
                    debug!(peer = %peer, "Connection not established: {}", e);
                }
            });
        }

        info!("Gateway on {} stopped accepting connections", addr);
        Ok(())
    }

    /// Upgrade `stream` and serve it until the connection ends.
    ///
    /// Returns once both connection loops have exited and `on_disconnect`
    /// has run, or with an error if the upgrade was refused.
    pub async fn accept<S>(&self, mut stream: S, local: SocketAddr, peer: SocketAddr) -> Result<()>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let head = upgrade::read_head(&mut stream).await?;
        if let Err(reason) = upgrade::check_upgrade(&head) {
            debug!(peer = %peer, "Bad upgrade request: {}", reason);
            if let Err(e) = upgrade::refuse(&mut stream, StatusCode::BAD_REQUEST, reason).await {
                debug!(peer = %peer, "Failed to send 400: {}", e);
            }
            return Err(GatewayError::BadRequest(reason.to_string()));
        }
        let stream = Preread::new(head, stream);

        let permit = self.reserve_slot();
        if let Err(reason) = &permit {
            warn!(peer = %peer, "Refusing connection: {}", reason);
        }

        let refusal = permit.as_ref().err().copied();
        let path = self.config.path.clone();
        let check = move |req: &Request, resp: Response| -> std::result::Result<Response, ErrorResponse> {
            if let Some(path) = &path {
                if req.uri().path() != path.as_str() {
                    return Err(reject(StatusCode::NOT_FOUND, "not found"));
                }
            }
            match refusal {
                Some(reason) => Err(reject(StatusCode::SERVICE_UNAVAILABLE, reason)),
                None => Ok(resp),
            }
        };

        let mut ws = accept_hdr_async(stream, check).await?;
        let permit = permit.map_err(|reason| GatewayError::Refused(reason.to_string()))?;

        let id = self.ids.next_id();
        let veto = match contain(id, "on_connect", || self.events.on_connect(id, peer)) {
            Some(verdict) => verdict,
            None => Err(GatewayError::Refused("on_connect panicked".to_string())),
        };
        if let Err(e) = veto {
            info!(conn_id = %id, peer = %peer, "Connection vetoed: {}", e);
            let _ = ws.close(Some(policy_close())).await;
            return Err(e);
        }

        let (conn, queue) = Connection::new(id, local, peer, self.config.output_buffer_size);
        if !self.registry.add(Arc::clone(&conn)) {
            error!(conn_id = %id, "Connection ID already registered");
            let _ = ws.close(Some(policy_close())).await;
            return Err(GatewayError::Refused(format!("duplicate connection id {}", id)));
        }
        // A shutdown racing with registration may have missed this one
        if self.is_shutdown() {
            conn.close();
        }

        info!(conn_id = %id, peer = %peer, "Connection opened");
        contain(id, "on_open", || self.events.on_open(&conn));

        Arc::clone(&conn)
            .run(
                ws,
                queue,
                self.inbound(),
                Arc::clone(&self.events),
                self.config.close_timeout(),
            )
            .await;

        self.registry.remove(id);
        conn.mark_closed();
        drop(permit);

        info!(conn_id = %id, peer = %peer, "Connection closed");
        contain(id, "on_disconnect", || self.events.on_disconnect(id));
        Ok(())
    }

    fn reserve_slot(&self) -> std::result::Result<OwnedSemaphorePermit, &'static str> {
        if self.is_shutdown() {
            return Err("gateway is shutting down");
        }
        Arc::clone(&self.slots)
            .try_acquire_owned()
            .map_err(|_| "too many connections")
    }

    fn inbound(&self) -> Inbound {
        match &self.dispatcher {
            Some(dispatcher) => Inbound::Routed {
                dispatcher: Arc::clone(dispatcher),
                decoder: Arc::clone(&self.decoder),
            },
            None => Inbound::Callbacks,
        }
    }

    /// Queue a text frame for connection `id`. Returns `false` if the
    /// connection is unknown or the frame was dropped.
    pub fn send_text(&self, id: ConnId, text: impl Into<String>) -> bool {
        self.send(id, Frame::Text(text.into()))
    }

    pub fn send_binary(&self, id: ConnId, data: impl Into<Vec<u8>>) -> bool {
        self.send(id, Frame::Binary(data.into()))
    }

    /// Close connection `id`. Returns `true` if this call initiated the close.
    pub fn kick(&self, id: ConnId) -> bool {
        self.registry.apply(id, |conn| conn.close()).unwrap_or(false)
    }

    /// Queue a text frame on every connection, returning how many accepted it
    pub fn broadcast_text(&self, text: impl Into<String>) -> usize {
        self.broadcast(Frame::Text(text.into()))
    }

    pub fn broadcast_binary(&self, data: impl Into<Vec<u8>>) -> usize {
        self.broadcast(Frame::Binary(data.into()))
    }

    fn send(&self, id: ConnId, frame: Frame) -> bool {
        self.registry
            .apply(id, |conn| self.deliver(conn, frame))
            .unwrap_or(false)
    }

    fn broadcast(&self, frame: Frame) -> usize {
        let mut delivered = 0;
        self.registry.for_each(|conn| {
            if self.deliver(conn, frame.clone()) {
                delivered += 1;
            }
        });
        delivered
    }

    fn deliver(&self, conn: &Arc<Connection>, frame: Frame) -> bool {
        match conn.write_frame(frame) {
            Ok(()) => true,
            Err(e) => {
                debug!(conn_id = %conn.id(), "Push failed: {}", e);
                let err = ConnectionError::Send(e);
                contain(conn.id(), "on_error", || self.events.on_error(conn, &err));
                false
            }
        }
    }

    /// Stop accepting, refuse further upgrades and close every connection.
    /// Returns how many connections this call closed; repeated calls close
    /// nothing.
    pub fn shutdown(&self) -> usize {
        if self.shutdown.is_cancelled() {
            return 0;
        }
        self.shutdown.cancel();
        let closed = self.registry.close_all();
        info!(closed, "Gateway shutting down");
        closed
    }

    /// Wait until every connection slot is free again
    pub async fn wait_closed(&self) {
        let all = self.config.max_connections as u32;
        if let Ok(permits) = self.slots.acquire_many(all).await {
            drop(permits);
        }
    }
}

impl std::fmt::Display for Gateway {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Gateway({})", self.config.bind)
    }
}

fn reject(status: StatusCode, reason: &str) -> ErrorResponse {
    let mut response = ErrorResponse::new(Some(reason.to_string()));
    *response.status_mut() = status;
    response
}

fn policy_close() -> CloseFrame<'static> {
    CloseFrame {
        code: CloseCode::Policy,
        reason: "connection refused".into(),
    }
}
