//! Transaction handles.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use crate::connection::{ExecResult, SqlitConnection};
use crate::cursor::SqlitCursor;
use crate::pool::ConnectionPool;
use crate::{DatabaseError, DatabaseValue};

/// A server-side transaction with exclusive ownership of its
/// connection.
///
/// `committed` and `rolled_back` are monotone: at most one ever becomes
/// true, and every operation after either is set fails with
/// [`DatabaseError::TransactionCompleted`]. The completion flag is set
/// *before* the wire exchange, so a reentrant call made while a commit
/// is still pending fails the guard rather than racing it.
///
/// Dropping a transaction that was never committed nor rolled back
/// discards the connection; the server times the transaction out.
pub struct SqlitTransaction {
    connection: Option<SqlitConnection>,
    pool: Arc<ConnectionPool>,
    transaction_id: String,
    committed: AtomicBool,
    rolled_back: AtomicBool,
}

impl std::fmt::Debug for SqlitTransaction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SqlitTransaction")
            .field("transaction_id", &self.transaction_id)
            .field("committed", &self.committed.load(Ordering::SeqCst))
            .field("rolled_back", &self.rolled_back.load(Ordering::SeqCst))
            .finish_non_exhaustive()
    }
}

impl SqlitTransaction {
    pub(crate) fn new(
        connection: SqlitConnection,
        pool: Arc<ConnectionPool>,
        transaction_id: String,
    ) -> Self {
        Self {
            connection: Some(connection),
            pool,
            transaction_id,
            committed: AtomicBool::new(false),
            rolled_back: AtomicBool::new(false),
        }
    }

    #[must_use]
    pub fn transaction_id(&self) -> &str {
        &self.transaction_id
    }

    #[must_use]
    pub fn is_committed(&self) -> bool {
        self.committed.load(Ordering::SeqCst)
    }

    #[must_use]
    pub fn is_rolled_back(&self) -> bool {
        self.rolled_back.load(Ordering::SeqCst)
    }

    /// Run a SELECT inside the transaction.
    ///
    /// # Errors
    ///
    /// * [`DatabaseError::TransactionCompleted`] after commit or
    ///   rollback
    /// * Otherwise the failure surface of
    ///   [`SqlitConnection::query`]
    pub async fn query(
        &mut self,
        sql: &str,
        bindings: &[DatabaseValue],
    ) -> Result<SqlitCursor, DatabaseError> {
        self.guard_active()?;
        let connection = self
            .connection
            .as_mut()
            .ok_or(DatabaseError::ConnectionClosed)?;
        let (columns, rows) = connection.query(sql, bindings).await?;
        Ok(SqlitCursor::new(columns, rows))
    }

    /// Run a write statement inside the transaction.
    ///
    /// # Errors
    ///
    /// * Same failure surface as [`Self::query`]
    pub async fn exec(
        &mut self,
        sql: &str,
        bindings: &[DatabaseValue],
    ) -> Result<ExecResult, DatabaseError> {
        self.guard_active()?;
        let connection = self
            .connection
            .as_mut()
            .ok_or(DatabaseError::ConnectionClosed)?;
        connection.exec(sql, bindings).await
    }

    /// Commit the transaction and release its connection back to the
    /// pool.
    ///
    /// The committed flag is set even when the wire exchange fails: the
    /// transaction is completed from this client's perspective either
    /// way, and the connection is discarded if the failure poisoned it.
    ///
    /// # Errors
    ///
    /// * [`DatabaseError::TransactionCompleted`] if already completed
    /// * Any wire-level failure of the commit exchange
    pub async fn commit(&mut self) -> Result<(), DatabaseError> {
        self.guard_active()?;
        self.committed.store(true, Ordering::SeqCst);
        self.finish(true).await
    }

    /// Roll back the transaction and release its connection back to
    /// the pool.
    ///
    /// # Errors
    ///
    /// * Same failure surface as [`Self::commit`]
    pub async fn rollback(&mut self) -> Result<(), DatabaseError> {
        self.guard_active()?;
        self.rolled_back.store(true, Ordering::SeqCst);
        self.finish(false).await
    }

    fn guard_active(&self) -> Result<(), DatabaseError> {
        if self.is_committed() || self.is_rolled_back() {
            Err(DatabaseError::TransactionCompleted)
        } else {
            Ok(())
        }
    }

    async fn finish(&mut self, commit: bool) -> Result<(), DatabaseError> {
        let Some(mut connection) = self.connection.take() else {
            return Err(DatabaseError::ConnectionClosed);
        };

        let result = if commit {
            connection.commit_transaction(&self.transaction_id).await
        } else {
            connection.rollback_transaction(&self.transaction_id).await
        };

        self.pool.release(connection);
        result
    }
}

impl Drop for SqlitTransaction {
    fn drop(&mut self) {
        if let Some(mut connection) = self.connection.take() {
            if !self.is_committed() && !self.is_rolled_back() {
                log::warn!(
                    "transaction {} dropped without commit or rollback; discarding its connection",
                    self.transaction_id
                );
            }
            connection.close();
            self.pool.release(connection);
        }
    }
}
