//! Connection lifecycle hooks

use crate::connection::Connection;
use crate::error::{ConnectionError, GatewayError};
use crate::id::ConnId;
use std::net::SocketAddr;
use std::sync::Arc;

/// Callbacks a gateway invokes over a connection's lifetime.
///
/// Every method has a no-op default. Callbacks run on the connection's own
/// tasks (`on_text`/`on_binary` on its read loop) and must not block; hand
/// long work to a [`Dispatcher`](wicket_dispatch::Dispatcher) instead.
pub trait EventHandler: Send + Sync {
    /// Veto hook, called before the connection is registered. Returning an
    /// error closes the socket; no other callback fires for it.
    fn on_connect(&self, _id: ConnId, _remote: SocketAddr) -> Result<(), GatewayError> {
        Ok(())
    }

    /// The connection is registered and about to start its loops
    fn on_open(&self, _conn: &Arc<Connection>) {}

    fn on_text(&self, _conn: &Arc<Connection>, _text: String) {}

    fn on_binary(&self, _conn: &Arc<Connection>, _data: Vec<u8>) {}

    fn on_error(&self, _conn: &Arc<Connection>, _error: &ConnectionError) {}

    /// Called exactly once, after the connection left the registry
    fn on_disconnect(&self, _id: ConnId) {}
}

/// Handler that ignores every event
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopHandler;

impl EventHandler for NoopHandler {}
