//! A single connection to the server.
//!
//! One exchange (request frame, then exactly one response frame) is in
//! flight at a time. The invariant is structural: every operation takes
//! `&mut self` and moves the stream out of the connection for the
//! duration of the exchange, so a future dropped mid-exchange leaves
//! the connection closed instead of half-read.

use std::future::Future;
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::{self, error::Elapsed};

use crate::wire::{self, FLAG_ASSOC, MessageType, ProtocolError};
use crate::{DatabaseError, DatabaseValue};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionConfig {
    pub host: String,
    pub port: u16,
    pub database_id: String,
    pub timeout_ms: u64,
}

/// Outcome of a write-execute statement.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExecResult {
    pub last_insert_id: u64,
    pub rows_affected: u64,
}

pub struct SqlitConnection {
    config: ConnectionConfig,
    stream: Option<TcpStream>,
    closed: bool,
    next_request_id: u32,
}

impl std::fmt::Debug for SqlitConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SqlitConnection")
            .field("host", &self.config.host)
            .field("port", &self.config.port)
            .field("connected", &self.is_connected())
            .finish_non_exhaustive()
    }
}

impl SqlitConnection {
    #[must_use]
    pub const fn new(config: ConnectionConfig) -> Self {
        Self {
            config,
            stream: None,
            closed: false,
            next_request_id: 0,
        }
    }

    /// Resolve the configured address and open the TCP stream.
    ///
    /// A no-op when already connected.
    ///
    /// # Errors
    ///
    /// * [`DatabaseError::ConnectionClosed`] if the connection was
    ///   closed
    /// * [`DatabaseError::Connect`] if resolution or the TCP connect
    ///   fails
    pub async fn connect(&mut self) -> Result<(), DatabaseError> {
        if self.closed {
            return Err(DatabaseError::ConnectionClosed);
        }
        if self.stream.is_some() {
            return Ok(());
        }

        let stream = TcpStream::connect((self.config.host.as_str(), self.config.port))
            .await
            .map_err(DatabaseError::Connect)?;

        log::debug!("connected to {}:{}", self.config.host, self.config.port);
        self.stream = Some(stream);
        Ok(())
    }

    /// Drop the stream and mark the connection closed. Never fails;
    /// a closed connection is not reused.
    pub fn close(&mut self) {
        if self.stream.take().is_some() {
            log::debug!("closed connection to {}:{}", self.config.host, self.config.port);
        }
        self.closed = true;
    }

    #[must_use]
    pub const fn is_connected(&self) -> bool {
        self.stream.is_some() && !self.closed
    }

    fn next_request_id(&mut self) -> u32 {
        let id = self.next_request_id;
        self.next_request_id = id.wrapping_add(1);
        id
    }

    /// Run a SELECT, returning the column names and the fully
    /// materialized rows.
    ///
    /// # Errors
    ///
    /// * [`DatabaseError::Server`] if the server rejected the statement
    /// * Transport, protocol, and timeout errors poison the connection
    pub async fn query(
        &mut self,
        sql: &str,
        bindings: &[DatabaseValue],
    ) -> Result<(Vec<String>, Vec<Vec<DatabaseValue>>), DatabaseError> {
        log::trace!("query: {sql} with {} bindings", bindings.len());

        let request_id = self.next_request_id();
        let frame = wire::build_request(
            MessageType::Query,
            request_id,
            FLAG_ASSOC,
            &self.config.database_id,
            sql,
            bindings,
        )?;

        let mut stream = self.take_stream()?;
        let result = bounded(self.config.timeout_ms, async {
            stream.write_all(&frame).await?;
            read_query_result(&mut stream, request_id).await
        })
        .await;
        self.finish_exchange(stream, result)
    }

    /// Run a write statement (INSERT/UPDATE/DELETE).
    ///
    /// # Errors
    ///
    /// * Same failure surface as [`Self::query`]
    pub async fn exec(
        &mut self,
        sql: &str,
        bindings: &[DatabaseValue],
    ) -> Result<ExecResult, DatabaseError> {
        log::trace!("exec: {sql} with {} bindings", bindings.len());

        let request_id = self.next_request_id();
        let frame = wire::build_request(
            MessageType::Exec,
            request_id,
            0,
            &self.config.database_id,
            sql,
            bindings,
        )?;

        let mut stream = self.take_stream()?;
        let result = bounded(self.config.timeout_ms, async {
            stream.write_all(&frame).await?;
            read_exec_result(&mut stream, request_id).await
        })
        .await;
        self.finish_exchange(stream, result)
    }

    /// Health check. Returns `true` when the server answers PONG.
    ///
    /// # Errors
    ///
    /// * [`DatabaseError::Server`] if the server answered with an ERROR
    ///   frame; any other response type is a protocol error
    pub async fn ping(&mut self) -> Result<bool, DatabaseError> {
        let request_id = self.next_request_id();
        let frame = wire::build_ping(request_id);

        let mut stream = self.take_stream()?;
        let result = bounded(self.config.timeout_ms, async {
            stream.write_all(&frame).await?;
            let header = read_response_header(&mut stream, request_id).await?;
            if header.message_type == MessageType::Pong as u8 {
                Ok(true)
            } else {
                Err(ProtocolError::UnexpectedMessageType(header.message_type).into())
            }
        })
        .await;
        self.finish_exchange(stream, result)
    }

    /// Start a transaction, returning the server-assigned id.
    ///
    /// # Errors
    ///
    /// * Same failure surface as [`Self::query`]
    pub async fn begin_transaction(&mut self) -> Result<String, DatabaseError> {
        let request_id = self.next_request_id();
        let frame = wire::build_request(
            MessageType::TxBegin,
            request_id,
            0,
            &self.config.database_id,
            "",
            &[],
        )?;

        let mut stream = self.take_stream()?;
        let result = bounded(self.config.timeout_ms, async {
            stream.write_all(&frame).await?;
            let header = read_response_header(&mut stream, request_id).await?;
            expect_result(&header)?;
            read_success(&mut stream).await?;
            wire::read_string(&mut stream).await
        })
        .await;
        self.finish_exchange(stream, result)
    }

    /// Commit the transaction with the given id. The id travels in the
    /// request body's sql slot.
    ///
    /// # Errors
    ///
    /// * Same failure surface as [`Self::query`]
    pub async fn commit_transaction(&mut self, transaction_id: &str) -> Result<(), DatabaseError> {
        self.complete_transaction(MessageType::TxCommit, transaction_id)
            .await
    }

    /// Roll back the transaction with the given id.
    ///
    /// # Errors
    ///
    /// * Same failure surface as [`Self::query`]
    pub async fn rollback_transaction(
        &mut self,
        transaction_id: &str,
    ) -> Result<(), DatabaseError> {
        self.complete_transaction(MessageType::TxRollback, transaction_id)
            .await
    }

    async fn complete_transaction(
        &mut self,
        message_type: MessageType,
        transaction_id: &str,
    ) -> Result<(), DatabaseError> {
        let request_id = self.next_request_id();
        let frame = wire::build_request(
            message_type,
            request_id,
            0,
            &self.config.database_id,
            transaction_id,
            &[],
        )?;

        let mut stream = self.take_stream()?;
        let result = bounded(self.config.timeout_ms, async {
            stream.write_all(&frame).await?;
            let header = read_response_header(&mut stream, request_id).await?;
            expect_result(&header)?;
            read_success(&mut stream).await
        })
        .await;
        self.finish_exchange(stream, result)
    }

    fn take_stream(&mut self) -> Result<TcpStream, DatabaseError> {
        self.stream.take().ok_or(DatabaseError::ConnectionClosed)
    }

    /// Restore the stream after an exchange, or poison the connection
    /// when the exchange left the wire state unknown.
    fn finish_exchange<T>(
        &mut self,
        stream: TcpStream,
        result: Result<Result<T, DatabaseError>, Elapsed>,
    ) -> Result<T, DatabaseError> {
        match result {
            Ok(Ok(value)) => {
                self.stream = Some(stream);
                Ok(value)
            }
            Ok(Err(e)) => {
                if e.poisons_connection() {
                    drop(stream);
                    self.close();
                } else {
                    self.stream = Some(stream);
                }
                Err(e)
            }
            Err(_) => {
                drop(stream);
                self.close();
                Err(DatabaseError::Timeout(self.config.timeout_ms))
            }
        }
    }
}

async fn bounded<T>(
    timeout_ms: u64,
    future: impl Future<Output = Result<T, DatabaseError>>,
) -> Result<Result<T, DatabaseError>, Elapsed> {
    if timeout_ms == 0 {
        Ok(future.await)
    } else {
        time::timeout(Duration::from_millis(timeout_ms), future).await
    }
}

/// Read and validate a response header, surfacing ERROR frames as
/// [`DatabaseError::Server`].
async fn read_response_header<R: AsyncRead + Unpin>(
    stream: &mut R,
    request_id: u32,
) -> Result<wire::FrameHeader, DatabaseError> {
    let header = wire::read_header(stream).await?;

    if header.request_id != request_id {
        return Err(ProtocolError::RequestIdMismatch {
            expected: request_id,
            actual: header.request_id,
        }
        .into());
    }

    if header.message_type == MessageType::Error as u8 {
        let message = wire::read_string(stream).await?;
        return Err(DatabaseError::Server(message));
    }

    Ok(header)
}

fn expect_result(header: &wire::FrameHeader) -> Result<(), DatabaseError> {
    if header.message_type == MessageType::Result as u8 {
        Ok(())
    } else {
        Err(ProtocolError::UnexpectedMessageType(header.message_type).into())
    }
}

async fn read_success<R: AsyncRead + Unpin>(stream: &mut R) -> Result<(), DatabaseError> {
    if stream.read_u8().await? == 1 {
        Ok(())
    } else {
        Err(ProtocolError::FailureResult.into())
    }
}

async fn read_query_result<R: AsyncRead + Unpin>(
    stream: &mut R,
    request_id: u32,
) -> Result<(Vec<String>, Vec<Vec<DatabaseValue>>), DatabaseError> {
    let header = read_response_header(stream, request_id).await?;
    expect_result(&header)?;
    read_success(stream).await?;

    let column_count = stream.read_u8().await?;
    let mut columns = Vec::with_capacity(usize::from(column_count));
    for _ in 0..column_count {
        columns.push(wire::read_string(stream).await?);
    }

    let row_count = stream.read_u32_le().await?;
    let mut rows = Vec::new();
    for _ in 0..row_count {
        let mut row = Vec::with_capacity(usize::from(column_count));
        for _ in 0..column_count {
            row.push(wire::read_value(stream).await?);
        }
        rows.push(row);
    }

    Ok((columns, rows))
}

async fn read_exec_result<R: AsyncRead + Unpin>(
    stream: &mut R,
    request_id: u32,
) -> Result<ExecResult, DatabaseError> {
    let header = read_response_header(stream, request_id).await?;
    expect_result(&header)?;
    read_success(stream).await?;

    let last_insert_id = stream.read_u64_le().await?;
    let rows_affected = stream.read_u64_le().await?;

    Ok(ExecResult {
        last_insert_id,
        rows_affected,
    })
}
