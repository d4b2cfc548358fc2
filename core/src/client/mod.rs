//! # CorvidMQ Client
//!
//! The client side of the protocol, usable in-VM or over TCP.
//!
//! - [`ClientSessionFactory`] owns the connection, pings the server and
//!   reconnects after a failure when `reconnect_attempts` allows it
//! - [`ClientSession`] sends commands on its session channel and keeps the
//!   unconfirmed ones for replay after a reattach
//! - [`ClientProducer`] waits for producer credits before every send
//! - [`ClientConsumer`] buffers pushed messages within its byte window
//!
//! ## Usage Example
//!
//! ```rust,no_run
//! use std::time::Duration;
//! use corvidmq::config::TransportConfig;
//! use corvidmq::remoting::TransportContext;
//! use corvidmq::{ClientConfig, ClientSessionFactory, Message};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = ClientConfig {
//!         connector: TransportConfig::tcp("127.0.0.1", 5445),
//!         ..Default::default()
//!     };
//!     let factory = ClientSessionFactory::connect(config, TransportContext::new()).await?;
//!     let session = factory.create_session().await?;
//!     session.create_queue("orders", "orders", None, true).await?;
//!
//!     let producer = session.create_producer("orders")?;
//!     producer.send(Message::new("orders", "hello").with_durable(true)).await?;
//!
//!     let consumer = session.create_consumer("orders").await?;
//!     session.start()?;
//!     if let Some(message) = consumer.receive(Duration::from_secs(1)).await? {
//!         consumer.acknowledge(&message).await?;
//!     }
//!     factory.close().await;
//!     Ok(())
//! }
//! ```

pub mod consumer;
pub mod credits;
pub mod producer;
pub mod session;
pub mod session_factory;

pub use consumer::{ClientConsumer, ReceivedMessage};
pub use credits::{ProducerCreditManager, ProducerCredits, MAX_UNREFERENCED_CREDITS};
pub use producer::ClientProducer;
pub use session::{ClientSession, QueueQuery, SessionFlags};
pub use session_factory::ClientSessionFactory;
