//! Bounded per-node connection pool: `Pool` owns idle connections and a
//! capacity limiter, `Guard` is an RAII checkout that returns its connection
//! on drop, `Inner` holds the shared state behind an `Arc`.
//!
//! Checkout waiting uses `tokio::sync::Semaphore` (`acquire_owned` plus a
//! timeout), which gives bounded-wait-with-timeout behavior without a
//! hand-rolled wait queue, since the connections here are multiplexed and
//! stateless between commands, so there's no per-connection protocol state
//! to track across a wait.
use std::collections::VecDeque;
use std::ops::{Deref, DerefMut};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use redis::aio::MultiplexedConnection;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio::time::timeout;
use tracing::debug;

use chronoset_config::NodeConfig;

use super::error::Error;

struct Inner {
    addr: String,
    client: redis::Client,
    idle: Mutex<VecDeque<MultiplexedConnection>>,
    permits: Arc<Semaphore>,
    connect_timeout: Duration,
    checkout_timeout: Duration,
}

/// A bounded pool of multiplexed connections to one storage node.
#[derive(Clone)]
pub struct Pool(Arc<Inner>);

impl Pool {
    pub fn new(node: &NodeConfig, max_conns: usize, connect_timeout: Duration, checkout_timeout: Duration) -> Result<Self, Error> {
        let addr = node.addr();
        let client = redis::Client::open(node.redis_url()).map_err(|source| Error::Connect {
            addr: addr.clone(),
            source,
        })?;
        Ok(Pool(Arc::new(Inner {
            addr,
            client,
            idle: Mutex::new(VecDeque::with_capacity(max_conns)),
            permits: Arc::new(Semaphore::new(max_conns)),
            connect_timeout,
            checkout_timeout,
        })))
    }

    pub fn addr(&self) -> &str {
        &self.0.addr
    }

    /// Check out a connection, waiting up to `checkout_timeout` for a free
    /// slot. Reuses an idle connection if one exists; otherwise opens a new
    /// one bounded by `connect_timeout`.
    pub async fn get(&self) -> Result<Guard, Error> {
        let permit = timeout(self.0.checkout_timeout, self.0.permits.clone().acquire_owned())
            .await
            .map_err(|_| Error::PoolExhausted {
                addr: self.0.addr.clone(),
            })?
            .map_err(|_| Error::PoolClosed {
                addr: self.0.addr.clone(),
            })?;

        let idle = self.0.idle.lock().pop_front();
        let conn = match idle {
            Some(conn) => conn,
            None => {
                debug!(addr = %self.0.addr, "opening new storage connection");
                timeout(
                    self.0.connect_timeout,
                    self.0.client.get_multiplexed_tokio_connection(),
                )
                .await
                .map_err(|_| Error::PoolExhausted {
                    addr: self.0.addr.clone(),
                })?
                .map_err(|source| Error::Connect {
                    addr: self.0.addr.clone(),
                    source,
                })?
            }
        };

        Ok(Guard {
            conn: Some(conn),
            pool: self.clone(),
            _permit: permit,
        })
    }

    fn checkin(&self, conn: MultiplexedConnection) {
        self.0.idle.lock().push_back(conn);
    }

    /// Close the pool: pending and future `get()` calls fail with
    /// `PoolClosed`, and idle connections are dropped.
    pub fn shutdown(&self) {
        self.0.permits.close();
        self.0.idle.lock().clear();
    }
}

/// RAII handle to a checked-out connection; returns it to the pool on drop.
pub struct Guard {
    conn: Option<MultiplexedConnection>,
    pool: Pool,
    _permit: OwnedSemaphorePermit,
}

impl Deref for Guard {
    type Target = MultiplexedConnection;
    fn deref(&self) -> &Self::Target {
        self.conn.as_ref().expect("connection taken before drop")
    }
}

impl DerefMut for Guard {
    fn deref_mut(&mut self) -> &mut Self::Target {
        self.conn.as_mut().expect("connection taken before drop")
    }
}

impl Drop for Guard {
    fn drop(&mut self) {
        if let Some(conn) = self.conn.take() {
            self.pool.checkin(conn);
        }
    }
}
