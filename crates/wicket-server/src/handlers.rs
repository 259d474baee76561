//! Connection callbacks and dispatcher handlers for the two server modes

use async_trait::async_trait;
use std::sync::Arc;
use tracing::{debug, info, warn};
use wicket_dispatch::{DispatchError, Dispatcher, Handler, Message};
use wicket_gateway::{ConnId, Connection, ConnectionError, EventHandler, Registry};

/// Logs connection lifecycle events. Used as-is in routed mode.
#[derive(Debug, Default, Clone, Copy)]
pub struct ConnectionLog;

impl EventHandler for ConnectionLog {
    fn on_open(&self, conn: &Arc<Connection>) {
        info!(conn_id = %conn.id(), peer = %conn.remote_addr(), "Client connected");
    }

    fn on_error(&self, conn: &Arc<Connection>, error: &ConnectionError) {
        warn!(conn_id = %conn.id(), "Connection error: {}", error);
    }

    fn on_disconnect(&self, id: ConnId) {
        info!(conn_id = %id, "Client disconnected");
    }
}

/// Writes every inbound frame back on the connection it arrived on
#[derive(Debug, Default, Clone, Copy)]
pub struct EchoHandler;

impl EventHandler for EchoHandler {
    fn on_open(&self, conn: &Arc<Connection>) {
        ConnectionLog.on_open(conn);
    }

    fn on_text(&self, conn: &Arc<Connection>, text: String) {
        if let Err(e) = conn.write_text(text) {
            self.on_error(conn, &e.into());
        }
    }

    fn on_binary(&self, conn: &Arc<Connection>, data: Vec<u8>) {
        if let Err(e) = conn.write_binary(data) {
            self.on_error(conn, &e.into());
        }
    }

    fn on_error(&self, conn: &Arc<Connection>, error: &ConnectionError) {
        ConnectionLog.on_error(conn, error);
    }

    fn on_disconnect(&self, id: ConnId) {
        ConnectionLog.on_disconnect(id);
    }
}

/// Routed `echo`: replies with the message payload as text
pub struct Echo;

#[async_trait]
impl Handler for Echo {
    async fn handle(&self, msg: Message) {
        let reply = String::from_utf8_lossy(msg.payload()).into_owned();
        if let Err(e) = msg.reply_text(reply) {
            debug!(key = msg.key(), "Echo reply dropped: {}", e);
        }
    }
}

/// Routed `broadcast`: sends the payload to every registered connection
pub struct Broadcast {
    registry: Registry,
}

impl Broadcast {
    pub fn new(registry: Registry) -> Self {
        Self { registry }
    }
}

#[async_trait]
impl Handler for Broadcast {
    async fn handle(&self, msg: Message) {
        let text = String::from_utf8_lossy(msg.payload()).into_owned();
        let mut delivered = 0usize;
        self.registry.for_each(|conn| {
            if conn.write_text(text.clone()).is_ok() {
                delivered += 1;
            }
        });
        debug!(
            from = ?msg.conn().map(|c| c.id()),
            delivered,
            "Broadcast delivered"
        );
    }
}

/// Register the routed-mode handlers on `dispatcher`
pub fn register_routes(dispatcher: &Dispatcher, registry: Registry) -> Result<(), DispatchError> {
    dispatcher.handle("echo", Echo)?;
    dispatcher.handle("broadcast", Broadcast::new(registry))?;
    Ok(())
}
