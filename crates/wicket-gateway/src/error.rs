//! Gateway and connection error types

use thiserror::Error;
use tokio_tungstenite::tungstenite;
use wicket_dispatch::{DispatchError, SendError};

/// Errors reported to [`EventHandler::on_error`](crate::EventHandler::on_error).
///
/// None of these are fatal to the gateway; a `Transport` error ends the
/// connection it occurred on, the others only drop the offending frame or
/// message.
#[derive(Error, Debug)]
pub enum ConnectionError {
    #[error("Send failed: {0}")]
    Send(#[from] SendError),

    #[error("Transport error: {0}")]
    Transport(#[from] tungstenite::Error),

    #[error("Dispatch failed: {0}")]
    Dispatch(#[from] DispatchError),

    #[error("Connection task panicked: {0}")]
    HandlerPanic(String),
}

impl ConnectionError {
    /// Whether the error dropped a frame because the output queue was full
    pub fn is_buffer_full(&self) -> bool {
        matches!(self, Self::Send(SendError::BufferFull))
    }
}

/// Gateway-level errors
#[derive(Error, Debug)]
pub enum GatewayError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tungstenite::Error),

    #[error("Address parse error: {0}")]
    AddrParse(#[from] std::net::AddrParseError),

    #[error("Invalid gateway configuration: {0}")]
    InvalidConfig(String),

    #[error("Bad upgrade request: {0}")]
    BadRequest(String),

    /// Returned by an `on_connect` hook to veto a connection
    #[error("Connection refused: {0}")]
    Refused(String),
}

pub type Result<T> = std::result::Result<T, GatewayError>;
