#![cfg_attr(feature = "fail-on-warnings", deny(warnings))]
#![warn(clippy::all, clippy::pedantic, clippy::nursery, clippy::cargo)]
#![allow(clippy::multiple_crate_versions)]

//! Async client for the SQLit database server.
//!
//! Speaks the length-framed binary protocol (magic `SQLT`, little-endian)
//! over a plain TCP stream. The surface is intentionally small: queries,
//! write-execute, transactions, and a health check, backed by a bounded
//! connection pool that serializes concurrent callers.
//!
//! Exactly one request/response exchange is in flight per connection at
//! any time. This is enforced structurally: connection operations take
//! `&mut self`, and callers that need concurrency go through
//! [`SqlitStorage`], which hands each caller a dedicated pooled
//! connection.
//!
//! ```rust,ignore
//! use sqlit_database::{DatabaseValue, SqlitConfig, SqlitStorage};
//!
//! let storage = SqlitStorage::new(SqlitConfig {
//!     endpoint: "db.example.com:4662".to_string(),
//!     database_id: "app".to_string(),
//!     ..SqlitConfig::default()
//! })?;
//!
//! let cursor = storage
//!     .query("SELECT id, name FROM users WHERE id = ?", &[1_i64.into()])
//!     .await?;
//!
//! for row in cursor {
//!     println!("{:?}", row.get("name"));
//! }
//! ```

pub mod config;
pub mod connection;
pub mod cursor;
pub mod pool;
pub mod storage;
pub mod transaction;
pub mod wire;

use std::io;

use thiserror::Error;

pub use config::SqlitConfig;
pub use connection::{ConnectionConfig, ExecResult, SqlitConnection};
pub use cursor::SqlitCursor;
pub use pool::{ConnectionPool, PoolStats};
pub use storage::{SqlitStorage, StorageStats};
pub use transaction::SqlitTransaction;
pub use wire::ProtocolError;

/// A single cell on the wire: six variants plus a distinguished null.
///
/// Round-trips through the codec preserve bits exactly, including NaN
/// payloads, negative zero, and the two's-complement integer extremes.
#[derive(Debug, Clone, PartialEq)]
pub enum DatabaseValue {
    Null,
    Int64(i64),
    Real64(f64),
    String(String),
    Blob(Vec<u8>),
    Bool(bool),
}

impl DatabaseValue {
    #[must_use]
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::String(value) => Some(value),
            _ => None,
        }
    }

    #[must_use]
    pub const fn as_i64(&self) -> Option<i64> {
        match self {
            Self::Int64(value) => Some(*value),
            _ => None,
        }
    }

    #[must_use]
    pub const fn as_f64(&self) -> Option<f64> {
        match self {
            Self::Real64(value) => Some(*value),
            _ => None,
        }
    }

    #[must_use]
    pub fn as_blob(&self) -> Option<&[u8]> {
        match self {
            Self::Blob(value) => Some(value),
            _ => None,
        }
    }

    #[must_use]
    pub const fn as_bool(&self) -> Option<bool> {
        match self {
            Self::Bool(value) => Some(*value),
            _ => None,
        }
    }

    #[must_use]
    pub const fn is_null(&self) -> bool {
        matches!(self, Self::Null)
    }
}

impl<T: Into<Self>> From<Option<T>> for DatabaseValue {
    fn from(val: Option<T>) -> Self {
        val.map_or(Self::Null, std::convert::Into::into)
    }
}

impl From<bool> for DatabaseValue {
    fn from(val: bool) -> Self {
        Self::Bool(val)
    }
}

impl From<&str> for DatabaseValue {
    fn from(val: &str) -> Self {
        Self::String(val.to_string())
    }
}

impl From<&String> for DatabaseValue {
    fn from(val: &String) -> Self {
        Self::String(val.to_string())
    }
}

impl From<String> for DatabaseValue {
    fn from(val: String) -> Self {
        Self::String(val)
    }
}

impl From<f32> for DatabaseValue {
    fn from(val: f32) -> Self {
        Self::Real64(f64::from(val))
    }
}

impl From<f64> for DatabaseValue {
    fn from(val: f64) -> Self {
        Self::Real64(val)
    }
}

impl From<i8> for DatabaseValue {
    fn from(val: i8) -> Self {
        Self::Int64(i64::from(val))
    }
}

impl From<i16> for DatabaseValue {
    fn from(val: i16) -> Self {
        Self::Int64(i64::from(val))
    }
}

impl From<i32> for DatabaseValue {
    fn from(val: i32) -> Self {
        Self::Int64(i64::from(val))
    }
}

impl From<i64> for DatabaseValue {
    fn from(val: i64) -> Self {
        Self::Int64(val)
    }
}

impl From<u8> for DatabaseValue {
    fn from(val: u8) -> Self {
        Self::Int64(i64::from(val))
    }
}

impl From<u16> for DatabaseValue {
    fn from(val: u16) -> Self {
        Self::Int64(i64::from(val))
    }
}

impl From<u32> for DatabaseValue {
    fn from(val: u32) -> Self {
        Self::Int64(i64::from(val))
    }
}

impl From<Vec<u8>> for DatabaseValue {
    fn from(val: Vec<u8>) -> Self {
        Self::Blob(val)
    }
}

impl From<&[u8]> for DatabaseValue {
    fn from(val: &[u8]) -> Self {
        Self::Blob(val.to_vec())
    }
}

/// A result row in associative form: column name paired with the cell
/// value, in result-set column order.
#[derive(Debug, Clone, PartialEq)]
pub struct Row {
    pub columns: Vec<(String, DatabaseValue)>,
}

impl Row {
    #[must_use]
    pub fn get(&self, column_name: &str) -> Option<DatabaseValue> {
        self.columns
            .iter()
            .find(|c| c.0 == column_name)
            .map(|c| c.1.clone())
    }
}

#[derive(Debug, Error)]
pub enum DatabaseError {
    /// Malformed `host:port` endpoint string.
    #[error("Invalid endpoint '{0}'")]
    InvalidEndpoint(String),
    /// DNS resolution or TCP connect failure.
    #[error("Failed to connect: {0}")]
    Connect(#[source] io::Error),
    /// Transport fault mid-exchange. Poisons the connection.
    #[error("Transport error: {0}")]
    Io(#[from] io::Error),
    /// The peer violated the wire protocol. Poisons the connection.
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
    /// The server returned an ERROR frame. The exchange completed
    /// cleanly, so the connection remains usable.
    #[error("Server error: {0}")]
    Server(String),
    /// The exchange exceeded the configured deadline. Poisons the
    /// connection.
    #[error("Operation timed out after {0}ms")]
    Timeout(u64),
    #[error("Transaction already completed")]
    TransactionCompleted,
    #[error("Expected exactly one row, got {0}")]
    ExpectedOneRow(usize),
    /// The connection is closed or was poisoned by an earlier failure.
    #[error("Connection closed")]
    ConnectionClosed,
}

impl DatabaseError {
    /// Whether this error leaves the connection's wire state unknown.
    ///
    /// A poisoned connection must be closed and dropped rather than
    /// returned to the pool.
    #[must_use]
    pub const fn poisons_connection(&self) -> bool {
        matches!(self, Self::Io(_) | Self::Protocol(_) | Self::Timeout(_))
    }
}
