//! # CorvidMQ Broker Module
//!
//! The server side of the protocol: acceptors and connections come from
//! [`crate::remoting`], everything above the packet layer lives here.
//!
//! ## Architecture
//!
//! - [`server`] - [`BrokerServer`] wires storage, the post office, the
//!   transaction coordinator and the remoting service together, recovers
//!   durable state on start and runs the reapers
//! - [`handler`] - the control channel (session creation, reattach, queue
//!   administration) and the per-connection cleanup on failure
//! - [`session`] - [`ServerSession`], one per client session: sends, acks,
//!   local and XA transactions, producer credits, command confirmations
//! - [`consumer`] - [`ServerConsumer`], pushing messages to the client
//!   within its byte window
//!
//! ## Usage Example
//!
//! ```rust,no_run
//! use corvidmq::{BrokerConfig, BrokerServer};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = BrokerConfig {
//!         data_dir: "./corvid-data".to_string(),
//!         ..Default::default()
//!     }
//!     .with_tcp_acceptor("0.0.0.0", 5445);
//!
//!     let server = BrokerServer::new(config)?;
//!     server.start().await?;
//!     tokio::signal::ctrl_c().await?;
//!     server.stop();
//!     Ok(())
//! }
//! ```
//!
//! ## Delivery guarantees
//!
//! Messages are delivered at least once. Sessions created with
//! `pre_acknowledge` trade that for fewer round trips: the server
//! acknowledges a message as soon as it is written to the client, so a
//! crash between that write and the client reading it loses the message.
//! This is an opt-in risk.

pub mod consumer;
pub mod handler;
pub mod server;
pub mod session;

pub use consumer::ServerConsumer;
pub use handler::{BrokerState, ControlHandler};
pub use server::BrokerServer;
pub use session::{ConnectionSlot, ServerSession, SessionOptions};
