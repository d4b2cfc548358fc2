//! # Remoting
//!
//! Everything between a socket and a session handler.
//!
//! - [`transport`] - in-VM and TCP transports and their lifecycle events
//! - [`connection`] - packet encoding, blocking requests, failure fan-out
//! - [`dispatcher`] - channel id to handler routing
//! - [`executor`] - ordered per-connection execution and the bounded
//!   failure-callback pool
//! - [`service`] - the server side: acceptors, connection registry,
//!   interceptors and the TTL scanner

pub mod connection;
pub mod dispatcher;
pub mod executor;
pub mod service;
pub mod transport;

pub use connection::{FailureListener, RemotingConnection};
pub use dispatcher::{PacketDispatcher, PacketHandler};
pub use executor::{CallbackExecutor, OrderedExecutor};
pub use service::{Interceptor, RemotingService, ServerConnectionHandler};
pub use transport::{TransportContext, TransportKind};
