//! Error types and result handling for pg-walsession.
//!
//! This module defines the main error type [`Error`] and a convenience
//! [`Result`] type alias used throughout the crate.
//!
//! # Example
//!
//! ```rust
//! use pg_walsession::{Error, Result};
//!
//! fn lookup_relation(id: u32) -> Result<()> {
//!     Err(Error::UnknownRelation(id))
//! }
//!
//! match lookup_relation(16384) {
//!     Ok(()) => println!("found"),
//!     Err(Error::UnknownRelation(id)) => eprintln!("no schema for relation {}", id),
//!     Err(e) => eprintln!("Other error: {}", e),
//! }
//! ```

use thiserror::Error;

/// The main error type for replication session operations.
///
/// Every variant except the configuration ones ends the session. Recovery is
/// the job of whatever supervises the process: a fresh session resumes from
/// the position retained by the replication slot.
#[derive(Error, Debug)]
pub enum Error {
    /// Configuration error, raised while loading or validating settings.
    #[error("Configuration error: {0}")]
    Config(String),

    /// I/O error on the server socket.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// The connection was lost or the server ended the replication stream.
    #[error("Connection error: {0}")]
    Connection(String),

    /// Authentication failure with PostgreSQL.
    #[error("Authentication error: {0}")]
    Authentication(String),

    /// The server sent a backend message that is not valid at this point.
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// The server rejected a query or replication command.
    #[error("Query failed [{code}]: {message}")]
    Query {
        /// SQLSTATE reported by the server
        code: String,
        /// Primary error message reported by the server
        message: String,
    },

    /// Replication frame or logical message whose body does not match its tag.
    #[error("Invalid message format: {message}")]
    InvalidMessage {
        /// Description of what was invalid
        message: String,
    },

    /// A row change referenced a relation id that no Relation message
    /// has described in this session.
    #[error("Unknown relation ID: {0}")]
    UnknownRelation(u32),

    /// A downstream hook reported failure.
    #[error("Hook error: {0}")]
    Hook(#[source] anyhow::Error),

    /// Operation timeout.
    #[error("Timeout error: {message}")]
    Timeout {
        /// Description of what timed out
        message: String,
    },
}

/// A convenient Result type alias for pg-walsession operations.
///
/// This is equivalent to `std::result::Result<T, pg_walsession::Error>`.
pub type Result<T> = std::result::Result<T, Error>;
