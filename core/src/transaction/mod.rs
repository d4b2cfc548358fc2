//! Local and XA transactions
//!
//! A [`Transaction`] buffers the sends and acknowledgements of a session
//! until it is committed. Preparing or committing performs the durable
//! side (message records, ack deletions, page ack records) inside a
//! storage transaction; only after the storage commit are messages made
//! visible to consumers and acknowledgements applied. Rolling back returns
//! acknowledged references to their queues for redelivery.
//!
//! XA branches are registered with the [`TransactionCoordinator`], which
//! also lists in-doubt (prepared) branches and rolls back branches whose
//! timeout elapsed before they were prepared.

pub mod coordinator;
pub mod state_machine;

pub use coordinator::{SharedTransaction, TransactionCoordinator};
pub use state_machine::{Transaction, TransactionState};

use thiserror::Error;

use crate::CorvidError;

/// The operation completed
pub const XA_OK: i32 = 0;
/// Resource manager error
pub const XAER_RMERR: i32 = -3;
/// Unknown xid
pub const XAER_NOTA: i32 = -4;
/// Invalid arguments
pub const XAER_INVAL: i32 = -5;
/// Operation invoked in the wrong state
pub const XAER_PROTO: i32 = -6;
/// Xid already exists
pub const XAER_DUPID: i32 = -8;
/// The branch was rolled back
pub const XA_RBROLLBACK: i32 = 100;

/// Transaction-related errors
#[derive(Debug, Error)]
pub enum TransactionError {
    #[error("Invalid transaction state: {0}")]
    InvalidState(String),

    #[error("Unknown xid: {0}")]
    UnknownXid(String),

    #[error("Xid already in use: {0}")]
    DuplicateXid(String),

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Transaction rolled back: {0}")]
    RolledBack(String),

    #[error("Transaction timed out: {0}")]
    TimedOut(String),

    /// Raised on the server and rebuilt on the client from its message
    #[error("{0}")]
    Remote(String),
}

/// Result type for transaction operations
pub type TransactionResult<T> = std::result::Result<T, TransactionError>;

impl TransactionError {
    pub fn xa_code(&self) -> i32 {
        match self {
            TransactionError::InvalidState(_) => XAER_PROTO,
            TransactionError::UnknownXid(_) => XAER_NOTA,
            TransactionError::DuplicateXid(_) => XAER_DUPID,
            TransactionError::InvalidArgument(_) => XAER_INVAL,
            TransactionError::RolledBack(_) | TransactionError::TimedOut(_) => XA_RBROLLBACK,
            TransactionError::Remote(_) => XAER_RMERR,
        }
    }

    /// Rebuild the error a server reported as an XA code
    pub fn from_xa_code(code: i32, message: String) -> Self {
        match code {
            XAER_PROTO => TransactionError::InvalidState(message),
            XAER_NOTA => TransactionError::UnknownXid(message),
            XAER_DUPID => TransactionError::DuplicateXid(message),
            XAER_INVAL => TransactionError::InvalidArgument(message),
            XA_RBROLLBACK => TransactionError::RolledBack(message),
            _ => TransactionError::Remote(message),
        }
    }
}

/// XA code reported for a failed operation
pub fn xa_code_for(error: &CorvidError) -> i32 {
    match error {
        CorvidError::Transaction(e) => e.xa_code(),
        _ => XAER_RMERR,
    }
}
