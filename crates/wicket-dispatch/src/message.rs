//! Dispatch message and the connection capability it carries

use serde::de::DeserializeOwned;
use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;
use thiserror::Error;

/// Why a frame could not be queued on a connection.
///
/// Both variants mean the frame was dropped; neither blocks the caller.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendError {
    #[error("Connection is closed")]
    Closed,
    #[error("Connection output buffer is full")]
    BufferFull,
}

/// The part of a live connection a handler may use to reply.
///
/// Implementations must never block: writes are enqueued and flushed by the
/// connection's own write loop.
pub trait Conn: Send + Sync {
    /// Connection ID, unique for the lifetime of the gateway
    fn id(&self) -> u64;

    /// Peer address
    fn remote_addr(&self) -> SocketAddr;

    /// Queue a text frame
    fn write_text(&self, text: String) -> Result<(), SendError>;

    /// Queue a binary frame
    fn write_binary(&self, data: Vec<u8>) -> Result<(), SendError>;

    /// Begin closing the connection. Returns `true` only for the call that
    /// initiated the close.
    fn close(&self) -> bool;
}

/// An inbound application message
#[derive(Clone)]
pub struct Message {
    conn: Option<Arc<dyn Conn>>,
    key: u64,
    name: String,
    payload: Vec<u8>,
}

impl Message {
    /// Create a message without an originating connection
    pub fn new(name: impl Into<String>, key: u64, payload: impl Into<Vec<u8>>) -> Self {
        Self {
            conn: None,
            key,
            name: name.into(),
            payload: payload.into(),
        }
    }

    /// Attach the connection the message arrived on
    pub fn with_conn(mut self, conn: Arc<dyn Conn>) -> Self {
        self.conn = Some(conn);
        self
    }

    /// Connection to reply on, if the message came from one
    pub fn conn(&self) -> Option<&Arc<dyn Conn>> {
        self.conn.as_ref()
    }

    /// Routing key; messages sharing a key are handled in order
    pub fn key(&self) -> u64 {
        self.key
    }

    /// Handler selector
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    /// Deserialize the payload as JSON
    pub fn payload_json<T: DeserializeOwned>(&self) -> serde_json::Result<T> {
        serde_json::from_slice(&self.payload)
    }

    /// Reply with a text frame on the originating connection.
    ///
    /// A message without a connection replies into the void and reports
    /// `SendError::Closed`.
    pub fn reply_text(&self, text: impl Into<String>) -> Result<(), SendError> {
        match &self.conn {
            Some(conn) => conn.write_text(text.into()),
            None => Err(SendError::Closed),
        }
    }

    /// Reply with a binary frame on the originating connection
    pub fn reply_binary(&self, data: impl Into<Vec<u8>>) -> Result<(), SendError> {
        match &self.conn {
            Some(conn) => conn.write_binary(data.into()),
            None => Err(SendError::Closed),
        }
    }
}

impl fmt::Debug for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Message")
            .field("conn", &self.conn.as_ref().map(|c| c.id()))
            .field("key", &self.key)
            .field("name", &self.name)
            .field("payload_len", &self.payload.len())
            .finish()
    }
}
