use crate::error::{DaemonError, Result};
use std::collections::VecDeque;
use std::net::{Ipv4Addr, SocketAddr};
use std::ops::{Deref, DerefMut};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tracing::{debug, info, trace, warn};

/// Pool size for a daemon with `workers` children: half of them, leaving headroom.
pub fn capacity_for(workers: usize) -> usize {
    workers / 2
}

/// One established connection to a daemon port.
#[derive(Debug)]
pub struct Connection {
    port: u16,
    stream: BufReader<TcpStream>,
}

impl Connection {
    pub async fn connect(port: u16) -> Result<Self> {
        let addr = SocketAddr::from((Ipv4Addr::LOCALHOST, port));
        let stream = TcpStream::connect(addr)
            .await
            .map_err(|source| DaemonError::Connect { port, source })?;
        stream.set_nodelay(true)?;
        Ok(Self {
            port,
            stream: BufReader::new(stream),
        })
    }

    /// Write one request and read exactly one response line.
    pub async fn round_trip(&mut self, payload: &[u8]) -> Result<String> {
        self.stream.get_mut().write_all(payload).await?;

        let mut line = String::new();
        let read = self.stream.read_line(&mut line).await?;
        if read == 0 {
            return Err(DaemonError::ConnectionClosed { port: self.port });
        }
        Ok(line)
    }
}

/// Bounded set of connections to one daemon port.
///
/// Every connection is either idle in the pool or held by exactly one
/// `PooledConnection`. A semaphore permit travels with each checkout, so at
/// most `capacity` connections exist or are in use at any time.
#[derive(Debug)]
pub struct ConnectionPool {
    port: u16,
    capacity: usize,
    idle: Mutex<VecDeque<Connection>>,
    permits: Arc<Semaphore>,
}

impl ConnectionPool {
    /// Dial `capacity` connections up front. Any failed dial fails the whole fill.
    pub async fn fill(port: u16, capacity: usize) -> Result<Arc<Self>> {
        if capacity == 0 {
            return Err(DaemonError::Config(
                "connection pool capacity must be at least 1".to_string(),
            ));
        }

        let mut idle = VecDeque::with_capacity(capacity);
        for _ in 0..capacity {
            idle.push_back(Connection::connect(port).await?);
        }

        info!(port, capacity, "Connection pool filled");

        Ok(Arc::new(Self {
            port,
            capacity,
            idle: Mutex::new(idle),
            permits: Arc::new(Semaphore::new(capacity)),
        }))
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Connections currently checked out
    pub fn in_use(&self) -> usize {
        self.capacity - self.permits.available_permits()
    }

    pub fn is_closed(&self) -> bool {
        self.permits.is_closed()
    }

    /// Borrow a connection, waiting up to `timeout` (forever if `None`).
    pub async fn checkout(self: &Arc<Self>, timeout: Option<Duration>) -> Result<PooledConnection> {
        let acquire = Arc::clone(&self.permits).acquire_owned();
        let permit = match timeout {
            Some(limit) => tokio::time::timeout(limit, acquire)
                .await
                .map_err(|_| DaemonError::CheckoutTimeout(limit))?,
            None => acquire.await,
        }
        .map_err(|_| DaemonError::PoolClosed { port: self.port })?;

        let reused = self
            .idle
            .lock()
            .expect("ConnectionPool lock poisoned")
            .pop_front();

        let conn = match reused {
            Some(conn) => conn,
            None => {
                // A previous holder discarded its connection; refill the slot.
                debug!(port = self.port, "Dialing replacement pooled connection");
                Connection::connect(self.port).await.map_err(|e| match e {
                    DaemonError::Connect { port, source } => DaemonError::Reconnect { port, source },
                    other => other,
                })?
            }
        };

        trace!(port = self.port, in_use = self.in_use(), "Connection checked out");

        Ok(PooledConnection {
            conn: Some(conn),
            pool: Arc::clone(self),
            _permit: permit,
        })
    }

    /// Wait until every connection is back in the pool. Returns `false` on timeout.
    pub async fn drain(&self, timeout: Duration) -> bool {
        let all = u32::try_from(self.capacity).unwrap_or(u32::MAX);
        match tokio::time::timeout(timeout, self.permits.acquire_many(all)).await {
            Ok(Ok(_permits)) => true,
            Ok(Err(_)) => false,
            Err(_) => {
                warn!(
                    port = self.port,
                    in_use = self.in_use(),
                    "Pool did not drain in time"
                );
                false
            }
        }
    }

    /// Refuse further checkouts and drop idle connections.
    pub fn close(&self) {
        self.permits.close();
        self.idle.lock().expect("ConnectionPool lock poisoned").clear();
        debug!(port = self.port, "Connection pool closed");
    }

    fn checkin(&self, conn: Connection) {
        if self.permits.is_closed() {
            return;
        }
        self.idle
            .lock()
            .expect("ConnectionPool lock poisoned")
            .push_back(conn);
    }
}

/// A checked-out connection. Dropping it checks it back in.
#[derive(Debug)]
pub struct PooledConnection {
    conn: Option<Connection>,
    pool: Arc<ConnectionPool>,
    _permit: OwnedSemaphorePermit,
}

impl PooledConnection {
    /// Return the connection to the pool for the next checkout.
    pub fn checkin(self) {
        drop(self);
    }

    /// Drop a broken connection instead of returning it; its slot is re-dialed lazily.
    pub fn discard(mut self) {
        if let Some(conn) = self.conn.take() {
            warn!(port = conn.port, "Discarding broken pooled connection");
        }
    }
}

impl Deref for PooledConnection {
    type Target = Connection;

    fn deref(&self) -> &Connection {
        self.conn.as_ref().expect("pooled connection already released")
    }
}

impl DerefMut for PooledConnection {
    fn deref_mut(&mut self) -> &mut Connection {
        self.conn.as_mut().expect("pooled connection already released")
    }
}

impl Drop for PooledConnection {
    fn drop(&mut self) {
        // Connection goes back before the permit is released (field drop order).
        if let Some(conn) = self.conn.take() {
            self.pool.checkin(conn);
        }
    }
}
