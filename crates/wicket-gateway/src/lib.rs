//! wicket-gateway - WebSocket connection gateway
//!
//! A [`Gateway`] accepts WebSocket upgrades and gives every session its own
//! [`Connection`] actor: a read loop and a write loop around a bounded output
//! queue. Live connections are reachable by ID through the [`Registry`], which
//! is how server-side code pushes frames or kicks clients.
//!
//! Inbound frames go either to an [`EventHandler`] (simple mode) or, when the
//! gateway is built with a [`Dispatcher`](wicket_dispatch::Dispatcher), through
//! a decoder onto the dispatcher's partitioned workers (routed mode).
//!
//! ```no_run
//! use std::sync::Arc;
//! use wicket_gateway::{Connection, EventHandler, Gateway, GatewayConfig};
//!
//! struct Echo;
//!
//! impl EventHandler for Echo {
//!     fn on_text(&self, conn: &Arc<Connection>, text: String) {
//!         let _ = conn.write_text(text);
//!     }
//! }
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let gateway = Gateway::new(GatewayConfig::default())?.with_handler(Echo);
//!     gateway.run().await?;
//!     Ok(())
//! }
//! ```

mod config;
mod connection;
mod error;
mod gateway;
mod handler;
mod id;
mod properties;
mod registry;
mod upgrade;

pub use config::GatewayConfig;
pub use connection::{Connection, ConnectionState, Frame};
pub use error::{ConnectionError, GatewayError, Result};
pub use gateway::Gateway;
pub use handler::{EventHandler, NoopHandler};
pub use id::{ConnId, IdGenerator, RandomIdGenerator, SequentialIdGenerator, SnowflakeIdGenerator};
pub use properties::Properties;
pub use registry::Registry;

pub use wicket_dispatch::SendError;
