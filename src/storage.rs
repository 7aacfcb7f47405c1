//! The host-facing storage facade.

use std::sync::Arc;

use crate::config::{self, SqlitConfig};
use crate::connection::{ConnectionConfig, ExecResult};
use crate::cursor::SqlitCursor;
use crate::pool::{ConnectionPool, PoolStats};
use crate::transaction::SqlitTransaction;
use crate::{DatabaseError, DatabaseValue};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StorageStats {
    pub connected: bool,
    pub endpoint: String,
    pub database_id: String,
}

/// Entry point for the embedding host.
///
/// Every operation borrows a dedicated connection from the pool for the
/// duration of one exchange, which is what serializes concurrent
/// callers onto the single-exchange-per-connection wire protocol.
/// Connections are opened lazily on first demand.
#[derive(Debug)]
pub struct SqlitStorage {
    config: SqlitConfig,
    pool: Arc<ConnectionPool>,
}

impl SqlitStorage {
    /// # Errors
    ///
    /// * [`DatabaseError::InvalidEndpoint`] if the endpoint string does
    ///   not parse
    pub fn new(config: SqlitConfig) -> Result<Self, DatabaseError> {
        let (host, port) = config::parse_endpoint(&config.endpoint)?;

        let connection_config = ConnectionConfig {
            host,
            port,
            database_id: config.database_id.clone(),
            timeout_ms: config.timeout_ms,
        };
        let pool = Arc::new(ConnectionPool::new(connection_config, config.pool_size));

        Ok(Self { config, pool })
    }

    /// Run a SELECT and materialize the full result set.
    ///
    /// # Errors
    ///
    /// * Acquisition, wire, and server failures; see
    ///   [`SqlitConnection::query`](crate::SqlitConnection::query)
    pub async fn query(
        &self,
        sql: &str,
        bindings: &[DatabaseValue],
    ) -> Result<SqlitCursor, DatabaseError> {
        let mut connection = self.pool.acquire().await?;
        let result = connection.query(sql, bindings).await;
        self.pool.release(connection);

        let (columns, rows) = result?;
        Ok(SqlitCursor::new(columns, rows))
    }

    /// Run a write statement.
    ///
    /// # Errors
    ///
    /// * Same failure surface as [`Self::query`]
    pub async fn exec(
        &self,
        sql: &str,
        bindings: &[DatabaseValue],
    ) -> Result<ExecResult, DatabaseError> {
        let mut connection = self.pool.acquire().await?;
        let result = connection.exec(sql, bindings).await;
        self.pool.release(connection);
        result
    }

    /// Start a transaction. The acquired connection moves into the
    /// returned handle for the transaction's whole life and returns to
    /// the pool when the transaction completes.
    ///
    /// # Errors
    ///
    /// * Same failure surface as [`Self::query`]
    pub async fn transaction(&self) -> Result<SqlitTransaction, DatabaseError> {
        let mut connection = self.pool.acquire().await?;
        match connection.begin_transaction().await {
            Ok(transaction_id) => Ok(SqlitTransaction::new(
                connection,
                Arc::clone(&self.pool),
                transaction_id,
            )),
            Err(e) => {
                self.pool.release(connection);
                Err(e)
            }
        }
    }

    /// Health check against the server.
    ///
    /// # Errors
    ///
    /// * Same failure surface as [`Self::query`]
    pub async fn ping(&self) -> Result<bool, DatabaseError> {
        let mut connection = self.pool.acquire().await?;
        let result = connection.ping().await;
        self.pool.release(connection);
        result
    }

    /// `connected` reports whether the pool currently holds at least
    /// one live connection, idle or checked out.
    #[must_use]
    pub fn stats(&self) -> StorageStats {
        let pool = self.pool.stats();
        StorageStats {
            connected: pool.available > 0 || pool.in_use > 0,
            endpoint: self.config.endpoint.clone(),
            database_id: self.config.database_id.clone(),
        }
    }

    #[must_use]
    pub fn pool_stats(&self) -> PoolStats {
        self.pool.stats()
    }
}
