use std::collections::VecDeque;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use log::{debug, warn};
use tokio::sync::Mutex;

use super::config::PoolConfig;
use super::{Connection, Driver};
use crate::core::{DbError, Result};

// ============================================================================
// Connection pool
// ============================================================================

/// Cloneable handle to a shared connection pool.
///
/// Connections are opened lazily up to `max_connections`; `acquire` fails
/// immediately when the pool is exhausted rather than waiting. Dropping a
/// [`PoolGuard`] returns its connection to the freelist.
pub struct DbPool<D: Driver> {
    inner: Arc<PoolInner<D>>,
}

struct PoolInner<D: Driver> {
    driver: D,
    config: PoolConfig,
    idle: Mutex<VecDeque<D::Conn>>,
    /// All live connections, idle and handed out.
    total: AtomicUsize,
    closed: AtomicBool,
}

impl<D: Driver> Clone for DbPool<D> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<D: Driver> DbPool<D> {
    /// Create a pool and eagerly open `min_connections` connections.
    pub async fn connect(driver: D, config: PoolConfig) -> Result<Self> {
        config.validate()?;
        let pool = Self {
            inner: Arc::new(PoolInner {
                driver,
                config,
                idle: Mutex::new(VecDeque::new()),
                total: AtomicUsize::new(0),
                closed: AtomicBool::new(false),
            }),
        };
        pool.ensure_min_connections().await?;
        debug!(
            "Pool ready: {} connection(s) open, max {}",
            pool.inner.total.load(Ordering::SeqCst),
            pool.inner.config.max_connections
        );
        Ok(pool)
    }

    async fn ensure_min_connections(&self) -> Result<()> {
        let mut idle = self.inner.idle.lock().await;
        while self.inner.total.load(Ordering::SeqCst) < self.inner.config.min_connections {
            let conn = self.inner.driver.connect(&self.inner.config).await?;
            self.inner.total.fetch_add(1, Ordering::SeqCst);
            idle.push_back(conn);
        }
        Ok(())
    }

    /// Check out a connection. Reuses an idle one when available, otherwise
    /// opens a new connection unless the pool is already at capacity.
    pub async fn acquire(&self) -> Result<PoolGuard<D>> {
        if self.inner.closed.load(Ordering::SeqCst) {
            return Err(DbError::PoolError("Pool is closed".to_string()));
        }

        if let Some(conn) = self.inner.idle.lock().await.pop_front() {
            return Ok(PoolGuard {
                connection: Some(conn),
                pool: Arc::clone(&self.inner),
            });
        }

        // Reserve a slot before connecting so concurrent acquires cannot
        // overshoot max_connections.
        let reserved = self.inner.total.fetch_add(1, Ordering::SeqCst);
        if reserved >= self.inner.config.max_connections {
            self.inner.total.fetch_sub(1, Ordering::SeqCst);
            return Err(DbError::PoolError(format!(
                "Pool exhausted: all {} connections in use",
                self.inner.config.max_connections
            )));
        }

        match self.inner.driver.connect(&self.inner.config).await {
            Ok(conn) => Ok(PoolGuard {
                connection: Some(conn),
                pool: Arc::clone(&self.inner),
            }),
            Err(e) => {
                self.inner.total.fetch_sub(1, Ordering::SeqCst);
                Err(e)
            }
        }
    }

    pub async fn stats(&self) -> PoolStats {
        let idle = self.inner.idle.lock().await.len();
        let total = self.inner.total.load(Ordering::SeqCst);
        PoolStats {
            total_connections: total,
            idle_connections: idle,
            active_connections: total.saturating_sub(idle),
            max_connections: self.inner.config.max_connections,
        }
    }

    pub fn config(&self) -> &PoolConfig {
        &self.inner.config
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::SeqCst)
    }

    /// Close the pool: reject further acquires and shut down idle
    /// connections. Handed-out connections are discarded on return.
    pub async fn close(&self) -> Result<()> {
        self.inner.closed.store(true, Ordering::SeqCst);
        let mut idle = self.inner.idle.lock().await;
        while let Some(mut conn) = idle.pop_front() {
            if let Err(e) = conn.close().await {
                warn!("Error closing pooled connection {}: {}", conn.id(), e);
            }
            self.inner.total.fetch_sub(1, Ordering::SeqCst);
        }
        debug!("Pool closed");
        Ok(())
    }
}

/// Point-in-time snapshot of pool occupancy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolStats {
    pub total_connections: usize,
    pub idle_connections: usize,
    pub active_connections: usize,
    pub max_connections: usize,
}

impl fmt::Display for PoolStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Pool Stats: {}/{} active, {} idle, max {}",
            self.active_connections,
            self.total_connections,
            self.idle_connections,
            self.max_connections
        )
    }
}

// ============================================================================
// Pool guard
// ============================================================================

/// A checked-out connection. Dropping the guard returns the connection to
/// the pool; a connection dropped mid-transaction is discarded instead so
/// uncommitted state never leaks to the next borrower.
pub struct PoolGuard<D: Driver> {
    connection: Option<D::Conn>,
    pool: Arc<PoolInner<D>>,
}

impl<D: Driver> fmt::Debug for PoolGuard<D> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PoolGuard")
            .field("has_connection", &self.connection.is_some())
            .finish()
    }
}

impl<D: Driver> PoolGuard<D> {
    pub fn connection(&self) -> &D::Conn {
        self.connection
            .as_ref()
            .expect("Connection already returned to pool")
    }

    pub fn connection_mut(&mut self) -> &mut D::Conn {
        self.connection
            .as_mut()
            .expect("Connection already returned to pool")
    }

    /// Explicitly return the connection, rolling back any transaction left
    /// open. Prefer this over drop when the rollback outcome matters.
    pub async fn close(mut self) -> Result<()> {
        let Some(mut conn) = self.connection.take() else {
            return Ok(());
        };

        if conn.in_transaction() {
            if let Err(e) = conn.rollback().await {
                self.pool.total.fetch_sub(1, Ordering::SeqCst);
                return Err(e);
            }
        }

        if self.pool.closed.load(Ordering::SeqCst) {
            self.pool.total.fetch_sub(1, Ordering::SeqCst);
            return conn.close().await;
        }

        self.pool.idle.lock().await.push_back(conn);
        Ok(())
    }
}

impl<D: Driver> Drop for PoolGuard<D> {
    fn drop(&mut self) {
        let Some(conn) = self.connection.take() else {
            return;
        };

        if conn.in_transaction() {
            warn!(
                "Connection {} dropped with an open transaction; discarding",
                conn.id()
            );
            self.pool.total.fetch_sub(1, Ordering::SeqCst);
            return;
        }

        if self.pool.closed.load(Ordering::SeqCst) {
            self.pool.total.fetch_sub(1, Ordering::SeqCst);
            return;
        }

        match self.pool.idle.try_lock() {
            Ok(mut idle) => idle.push_back(conn),
            Err(_) => {
                warn!("Freelist busy; discarding returned connection");
                self.pool.total.fetch_sub(1, Ordering::SeqCst);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mem::MemDriver;

    fn test_config() -> PoolConfig {
        PoolConfig::new("test", "")
            .min_connections(0)
            .max_connections(2)
    }

    #[tokio::test]
    async fn test_connect_opens_min_connections() {
        let config = PoolConfig::new("test", "")
            .min_connections(2)
            .max_connections(4);
        let pool = DbPool::connect(MemDriver::new(), config).await.unwrap();

        let stats = pool.stats().await;
        assert_eq!(stats.total_connections, 2);
        assert_eq!(stats.idle_connections, 2);
        assert_eq!(stats.active_connections, 0);
    }

    #[tokio::test]
    async fn test_acquire_and_return_on_drop() {
        let pool = DbPool::connect(MemDriver::new(), test_config()).await.unwrap();

        let guard = pool.acquire().await.unwrap();
        let stats = pool.stats().await;
        assert_eq!(stats.active_connections, 1);
        assert_eq!(stats.idle_connections, 0);

        drop(guard);
        let stats = pool.stats().await;
        assert_eq!(stats.active_connections, 0);
        assert_eq!(stats.idle_connections, 1);
    }

    #[tokio::test]
    async fn test_acquire_fails_when_exhausted() {
        let pool = DbPool::connect(MemDriver::new(), test_config()).await.unwrap();

        let _g1 = pool.acquire().await.unwrap();
        let _g2 = pool.acquire().await.unwrap();

        let err = pool.acquire().await.unwrap_err();
        assert!(matches!(err, DbError::PoolError(_)));
    }

    #[tokio::test]
    async fn test_returned_connection_is_reused() {
        let pool = DbPool::connect(MemDriver::new(), test_config()).await.unwrap();

        let guard = pool.acquire().await.unwrap();
        let first_id = guard.connection().id();
        drop(guard);

        let guard = pool.acquire().await.unwrap();
        assert_eq!(guard.connection().id(), first_id);
        assert_eq!(pool.stats().await.total_connections, 1);
    }

    #[tokio::test]
    async fn test_clone_shares_the_pool() {
        let pool = DbPool::connect(MemDriver::new(), test_config()).await.unwrap();
        let other = pool.clone();

        let _g1 = pool.acquire().await.unwrap();
        let _g2 = other.acquire().await.unwrap();
        assert!(other.acquire().await.is_err());
        assert_eq!(pool.stats().await.total_connections, 2);
    }

    #[tokio::test]
    async fn test_acquire_after_close_fails() {
        let pool = DbPool::connect(MemDriver::new(), test_config()).await.unwrap();
        pool.close().await.unwrap();

        assert!(pool.is_closed());
        let err = pool.acquire().await.unwrap_err();
        assert!(matches!(err, DbError::PoolError(_)));
    }

    #[tokio::test]
    async fn test_close_drains_idle_connections() {
        let config = PoolConfig::new("test", "")
            .min_connections(2)
            .max_connections(4);
        let pool = DbPool::connect(MemDriver::new(), config).await.unwrap();

        pool.close().await.unwrap();
        assert_eq!(pool.stats().await.total_connections, 0);
    }

    #[tokio::test]
    async fn test_guard_close_rolls_back_open_transaction() {
        let pool = DbPool::connect(MemDriver::new(), test_config()).await.unwrap();

        let mut guard = pool.acquire().await.unwrap();
        guard.connection_mut().begin().await.unwrap();
        assert!(guard.connection().in_transaction());

        guard.close().await.unwrap();
        assert_eq!(pool.stats().await.idle_connections, 1);

        let guard = pool.acquire().await.unwrap();
        assert!(!guard.connection().in_transaction());
    }

    #[tokio::test]
    async fn test_drop_mid_transaction_discards_connection() {
        let pool = DbPool::connect(MemDriver::new(), test_config()).await.unwrap();

        let mut guard = pool.acquire().await.unwrap();
        guard.connection_mut().begin().await.unwrap();
        drop(guard);

        let stats = pool.stats().await;
        assert_eq!(stats.total_connections, 0);
        assert_eq!(stats.idle_connections, 0);
    }

    #[tokio::test]
    async fn test_stats_display() {
        let stats = PoolStats {
            total_connections: 3,
            idle_connections: 1,
            active_connections: 2,
            max_connections: 10,
        };
        assert_eq!(stats.to_string(), "Pool Stats: 2/3 active, 1 idle, max 10");
    }
}
