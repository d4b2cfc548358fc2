//! # CorvidMQ Core Library
//!
//! CorvidMQ is a message broker core: a server that accepts client connections,
//! routes and queues messages durably or non-durably, and delivers them to
//! consumers under configurable acknowledgement and transaction semantics.
//!
//! ## Architecture Overview
//!
//! - [`protocol`] - packet model and the positional binary wire codec
//! - [`remoting`] - transports (in-VM and TCP), the packet dispatcher,
//!   connection lifecycle and the liveness scanner
//! - [`client`] - session factory, sessions, producers with credit flow
//!   control, consumers with acknowledgement batching
//! - [`broker`] - the server, its connection handler and server sessions
//! - [`postoffice`] - bindings, queues, priority-ordered delivery and filters
//! - [`paging`] - page files, the bounded page cache and per-queue cursors
//! - [`storage`] - the storage collaborator contract and an in-memory backend
//! - [`transaction`] - local and XA transactions
//! - [`security`] - authentication and role-based authorization
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use corvidmq::{BrokerConfig, BrokerServer};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let server = BrokerServer::new(BrokerConfig::default())?;
//!     server.start().await?;
//!     tokio::signal::ctrl_c().await?;
//!     server.stop();
//!     Ok(())
//! }
//! ```

pub mod broker;
pub mod client;
pub mod config;
pub mod metrics;
pub mod paging;
pub mod postoffice;
pub mod protocol;
pub mod remoting;
pub mod security;
pub mod storage;
pub mod transaction;

pub use broker::BrokerServer;
pub use client::{ClientConsumer, ClientProducer, ClientSession, ClientSessionFactory};
pub use config::{BrokerConfig, ClientConfig};
pub use metrics::{MetricsRegistry, MetricsSnapshot};
pub use protocol::{Message, Packet, PacketBody, PacketType};

use thiserror::Error;

/// CorvidMQ error types
///
/// Every variant maps to a stable numeric code (see [`CorvidError::code`]) so
/// that a failure raised on the server can travel inside an EXCEPTION packet
/// and be rebuilt as the same variant on the client.
#[derive(Debug, Error)]
pub enum CorvidError {
    /// File and socket I/O failures
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Malformed or truncated frames
    #[error("Codec error: {0}")]
    Codec(#[from] protocol::CodecError),

    /// JSON encoding of storage records
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Invalid configuration; fatal to whatever was being started
    #[error("Configuration error: {0}")]
    Config(String),

    /// The connection went away underneath the caller
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    /// The peer missed its liveness deadline
    #[error("Connection timed out")]
    ConnectionTimedOut,

    /// A blocking call did not receive its response in time
    #[error("Operation timed out after {0}ms")]
    Timeout(u64),

    /// The queue or temporary destination does not exist (any more)
    #[error("Invalid destination: {0}")]
    InvalidDestination(String),

    #[error("Queue already exists: {0}")]
    QueueExists(String),

    #[error("Invalid filter expression: {0}")]
    InvalidFilter(String),

    /// Authentication or authorization failure
    #[error("Security error: {0}")]
    Security(String),

    /// XA / local transaction failures
    #[error("Transaction error: {0}")]
    Transaction(#[from] transaction::TransactionError),

    /// The session, producer or consumer was closed
    #[error("Object closed: {0}")]
    ObjectClosed(String),

    #[error("Illegal state: {0}")]
    IllegalState(String),

    /// The storage collaborator rejected an operation
    #[error("Storage error: {0}")]
    Storage(String),

    /// Unknown packet type or target channel
    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Incompatible protocol version: client {client}, server {server}")]
    IncompatibleVersion { client: i32, server: i32 },
}

/// Stable error codes carried by EXCEPTION packets
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i32)]
pub enum ErrorCode {
    Internal = 0,
    UnsupportedPacket = 1,
    NotConnected = 2,
    ConnectionTimedOut = 3,
    Timeout = 4,
    IoError = 6,
    Codec = 7,
    InvalidDestination = 100,
    QueueExists = 101,
    ObjectClosed = 102,
    InvalidFilter = 103,
    IllegalState = 104,
    Security = 105,
    IncompatibleVersion = 108,
    Transaction = 110,
    Config = 111,
    Storage = 112,
}

impl From<i32> for ErrorCode {
    fn from(code: i32) -> Self {
        match code {
            1 => ErrorCode::UnsupportedPacket,
            2 => ErrorCode::NotConnected,
            3 => ErrorCode::ConnectionTimedOut,
            4 => ErrorCode::Timeout,
            6 => ErrorCode::IoError,
            7 => ErrorCode::Codec,
            100 => ErrorCode::InvalidDestination,
            101 => ErrorCode::QueueExists,
            102 => ErrorCode::ObjectClosed,
            103 => ErrorCode::InvalidFilter,
            104 => ErrorCode::IllegalState,
            105 => ErrorCode::Security,
            108 => ErrorCode::IncompatibleVersion,
            110 => ErrorCode::Transaction,
            111 => ErrorCode::Config,
            112 => ErrorCode::Storage,
            _ => ErrorCode::Internal,
        }
    }
}

impl CorvidError {
    pub fn code(&self) -> ErrorCode {
        match self {
            CorvidError::Io(_) => ErrorCode::IoError,
            CorvidError::Codec(_) => ErrorCode::Codec,
            CorvidError::Json(_) => ErrorCode::Storage,
            CorvidError::Config(_) => ErrorCode::Config,
            CorvidError::ConnectionFailed(_) => ErrorCode::NotConnected,
            CorvidError::ConnectionTimedOut => ErrorCode::ConnectionTimedOut,
            CorvidError::Timeout(_) => ErrorCode::Timeout,
            CorvidError::InvalidDestination(_) => ErrorCode::InvalidDestination,
            CorvidError::QueueExists(_) => ErrorCode::QueueExists,
            CorvidError::InvalidFilter(_) => ErrorCode::InvalidFilter,
            CorvidError::Security(_) => ErrorCode::Security,
            CorvidError::Transaction(_) => ErrorCode::Transaction,
            CorvidError::ObjectClosed(_) => ErrorCode::ObjectClosed,
            CorvidError::IllegalState(_) => ErrorCode::IllegalState,
            CorvidError::Storage(_) => ErrorCode::Storage,
            CorvidError::Protocol(_) => ErrorCode::UnsupportedPacket,
            CorvidError::IncompatibleVersion { .. } => ErrorCode::IncompatibleVersion,
        }
    }

    /// Rebuild an error received in an EXCEPTION packet
    pub fn from_code(code: i32, message: String) -> Self {
        match ErrorCode::from(code) {
            ErrorCode::NotConnected => CorvidError::ConnectionFailed(message),
            ErrorCode::ConnectionTimedOut => CorvidError::ConnectionTimedOut,
            ErrorCode::Timeout => CorvidError::Timeout(0),
            ErrorCode::InvalidDestination => CorvidError::InvalidDestination(message),
            ErrorCode::QueueExists => CorvidError::QueueExists(message),
            ErrorCode::InvalidFilter => CorvidError::InvalidFilter(message),
            ErrorCode::Security => CorvidError::Security(message),
            ErrorCode::ObjectClosed => CorvidError::ObjectClosed(message),
            ErrorCode::IllegalState => CorvidError::IllegalState(message),
            ErrorCode::Transaction => {
                CorvidError::Transaction(transaction::TransactionError::Remote(message))
            }
            ErrorCode::Config => CorvidError::Config(message),
            ErrorCode::Storage | ErrorCode::IoError => CorvidError::Storage(message),
            ErrorCode::IncompatibleVersion => CorvidError::Protocol(message),
            ErrorCode::Codec | ErrorCode::UnsupportedPacket | ErrorCode::Internal => {
                CorvidError::Protocol(message)
            }
        }
    }

    /// Errors after which the connection cannot be used any more
    pub fn is_connection_error(&self) -> bool {
        matches!(
            self,
            CorvidError::ConnectionFailed(_) | CorvidError::ConnectionTimedOut
        )
    }
}

/// Result type alias for CorvidMQ operations
pub type Result<T> = std::result::Result<T, CorvidError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_code_round_trip() {
        let err = CorvidError::InvalidDestination("tmp.queue".to_string());
        let rebuilt = CorvidError::from_code(err.code() as i32, "tmp.queue".to_string());
        assert!(matches!(rebuilt, CorvidError::InvalidDestination(ref name) if name == "tmp.queue"));

        let err = CorvidError::Security("denied".to_string());
        let rebuilt = CorvidError::from_code(err.code() as i32, err.to_string());
        assert!(matches!(rebuilt, CorvidError::Security(_)));
    }

    #[test]
    fn test_unknown_code_maps_to_protocol_error() {
        let rebuilt = CorvidError::from_code(9999, "boom".to_string());
        assert!(matches!(rebuilt, CorvidError::Protocol(_)));
    }

    #[test]
    fn test_connection_errors() {
        assert!(CorvidError::ConnectionTimedOut.is_connection_error());
        assert!(CorvidError::ConnectionFailed("x".into()).is_connection_error());
        assert!(!CorvidError::Timeout(10).is_connection_error());
    }
}
