//! Bounded connection pool.
//!
//! Idle connections are reused most-recently-released first; callers
//! that arrive while every slot is in use wait in strict FIFO order on
//! single-shot handoff channels. A slot freed by a dead connection is
//! handed to the head waiter still reserved, so a fresh caller can
//! never overtake a queued one.

use std::collections::VecDeque;
use std::sync::Mutex;

use tokio::sync::oneshot;

use crate::DatabaseError;
use crate::connection::{ConnectionConfig, SqlitConnection};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolStats {
    pub total: usize,
    pub available: usize,
    pub in_use: usize,
}

enum Handoff {
    Connection(SqlitConnection),
    /// The released connection was dead. Its slot stays reserved for
    /// the receiving waiter, which opens a replacement connection
    /// against it without re-checking capacity.
    Reserved,
}

enum Acquired {
    Ready(SqlitConnection),
    Connect,
    Wait(oneshot::Receiver<Handoff>),
}

struct PoolState {
    idle: Vec<SqlitConnection>,
    in_use: usize,
    waiters: VecDeque<oneshot::Sender<Handoff>>,
}

pub struct ConnectionPool {
    connection_config: ConnectionConfig,
    pool_size: usize,
    state: Mutex<PoolState>,
}

impl std::fmt::Debug for ConnectionPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let stats = self.stats();
        f.debug_struct("ConnectionPool")
            .field("total", &stats.total)
            .field("available", &stats.available)
            .field("in_use", &stats.in_use)
            .finish()
    }
}

impl ConnectionPool {
    /// A `pool_size` of zero is treated as one; the pool must be able
    /// to hold at least a single connection.
    #[must_use]
    pub fn new(connection_config: ConnectionConfig, pool_size: usize) -> Self {
        Self {
            connection_config,
            pool_size: pool_size.max(1),
            state: Mutex::new(PoolState {
                idle: Vec::new(),
                in_use: 0,
                waiters: VecDeque::new(),
            }),
        }
    }

    /// Take exclusive ownership of a connection.
    ///
    /// Pops the most recently released idle connection if there is one,
    /// opens a new connection while below capacity, and otherwise
    /// queues behind earlier acquirers until a slot frees up.
    ///
    /// # Errors
    ///
    /// * If opening a new connection fails; the reserved slot is given
    ///   back (or passed to the next waiter), so a failed connect never
    ///   consumes capacity
    ///
    /// # Panics
    ///
    /// * If the pool mutex is poisoned
    pub async fn acquire(&self) -> Result<SqlitConnection, DatabaseError> {
        loop {
            let acquired = {
                let mut state = self.state.lock().unwrap();
                if let Some(connection) = state.idle.pop() {
                    state.in_use += 1;
                    Acquired::Ready(connection)
                } else if state.in_use < self.pool_size {
                    state.in_use += 1;
                    Acquired::Connect
                } else {
                    let (tx, rx) = oneshot::channel();
                    state.waiters.push_back(tx);
                    Acquired::Wait(rx)
                }
            };

            match acquired {
                Acquired::Ready(connection) => return Ok(connection),
                Acquired::Connect => return self.connect_reserved().await,
                Acquired::Wait(rx) => match rx.await {
                    Ok(Handoff::Connection(connection)) => return Ok(connection),
                    Ok(Handoff::Reserved) => return self.connect_reserved().await,
                    Err(_) => {}
                },
            }
        }
    }

    /// Give a connection back.
    ///
    /// A live connection goes to the longest-waiting acquirer, or onto
    /// the idle stack. A dead connection is dropped, and its slot is
    /// handed to the head waiter still reserved so that a fresh caller
    /// cannot take it first.
    ///
    /// # Panics
    ///
    /// * If the pool mutex is poisoned
    pub fn release(&self, connection: SqlitConnection) {
        let mut state = self.state.lock().unwrap();

        if !connection.is_connected() {
            log::debug!("discarding dead connection: {connection:?}");
            drop(connection);
            while let Some(waiter) = state.waiters.pop_front() {
                if waiter.send(Handoff::Reserved).is_ok() {
                    // The slot stays reserved for that waiter.
                    return;
                }
            }
            state.in_use = state.in_use.saturating_sub(1);
            return;
        }

        let mut connection = connection;
        while let Some(waiter) = state.waiters.pop_front() {
            match waiter.send(Handoff::Connection(connection)) {
                // Slot ownership transfers to the waiter as-is.
                Ok(()) => return,
                // The acquirer gave up waiting; try the next one.
                Err(Handoff::Connection(returned)) => connection = returned,
                Err(Handoff::Reserved) => unreachable!("sent a connection"),
            }
        }

        state.in_use = state.in_use.saturating_sub(1);
        state.idle.push(connection);
    }

    /// # Panics
    ///
    /// * If the pool mutex is poisoned
    #[must_use]
    pub fn stats(&self) -> PoolStats {
        let state = self.state.lock().unwrap();
        PoolStats {
            total: self.pool_size,
            available: state.idle.len(),
            in_use: state.in_use,
        }
    }

    /// Open a connection against a slot that is already counted in
    /// `in_use`. On failure the reservation moves to the next waiter,
    /// or is dropped when nobody is queued.
    async fn connect_reserved(&self) -> Result<SqlitConnection, DatabaseError> {
        match self.open_connection().await {
            Ok(connection) => Ok(connection),
            Err(e) => {
                let mut state = self.state.lock().unwrap();
                while let Some(waiter) = state.waiters.pop_front() {
                    if waiter.send(Handoff::Reserved).is_ok() {
                        return Err(e);
                    }
                }
                state.in_use = state.in_use.saturating_sub(1);
                Err(e)
            }
        }
    }

    async fn open_connection(&self) -> Result<SqlitConnection, DatabaseError> {
        let mut connection = SqlitConnection::new(self.connection_config.clone());
        connection.connect().await?;
        Ok(connection)
    }
}
