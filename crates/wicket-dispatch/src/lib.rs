//! wicket-dispatch - partitioned message dispatch for the wicket gateway
//!
//! Inbound application messages are assigned to one of N partitions by their
//! routing key. Each partition is a bounded FIFO queue drained by exactly one
//! worker, so messages sharing a key are handled in submission order while
//! unrelated keys proceed in parallel. Handlers are looked up by message name
//! through a [`Router`] populated before the dispatcher starts.

pub mod decode;
pub mod dispatcher;
pub mod message;
pub mod router;

pub use decode::{JsonEnvelopeDecoder, MessageDecoder};
pub use dispatcher::{panic_message, partition, Dispatcher, DispatcherConfig};
pub use message::{Conn, Message, SendError};
pub use router::{handler_fn, Handler, HandlerFn, Router};

/// Re-export async_trait for handler implementers
pub use async_trait::async_trait;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum DispatchError {
    #[error("Partition {partition} queue is full")]
    QueueFull { partition: usize },

    #[error("Dispatcher is stopped")]
    Stopped,

    #[error("Dispatcher already started")]
    AlreadyStarted,

    #[error("Multiple registrations for handler: {0}")]
    DuplicateHandler(String),

    #[error("Invalid dispatcher configuration: {0}")]
    InvalidConfig(String),

    #[error("Invalid message: {0}")]
    InvalidMessage(String),

    #[error("Decode error: {0}")]
    Decode(#[from] serde_json::Error),
}

impl DispatchError {
    /// Setup-time errors that must abort startup rather than be retried
    pub fn is_config(&self) -> bool {
        matches!(
            self,
            Self::DuplicateHandler(_) | Self::InvalidConfig(_) | Self::AlreadyStarted
        )
    }
}

pub type Result<T> = std::result::Result<T, DispatchError>;
