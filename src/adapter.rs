use std::fmt;

use futures::stream::{self, Stream};
use log::warn;

use crate::connection::config::PoolConfig;
use crate::connection::pool::{DbPool, PoolStats};
use crate::connection::{Connection, Driver};
use crate::core::{Result, Row, Value};

/// High-level entry point: owns a pool and runs one-shot statements on it.
/// Each call checks a connection out, runs in autocommit mode, and returns
/// the connection before yielding the result.
pub struct DbAdapter<D: Driver> {
    pool: DbPool<D>,
}

impl<D: Driver> Clone for DbAdapter<D> {
    fn clone(&self) -> Self {
        Self {
            pool: self.pool.clone(),
        }
    }
}

impl<D: Driver> DbAdapter<D> {
    pub async fn connect(driver: D, config: PoolConfig) -> Result<Self> {
        let pool = DbPool::connect(driver, config).await?;
        Ok(Self { pool })
    }

    /// Wrap an existing pool, sharing its connections.
    pub fn from_pool(pool: DbPool<D>) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &DbPool<D> {
        &self.pool
    }

    pub async fn execute(&self, command: &str, params: &[Value]) -> Result<u64> {
        let mut guard = self.pool.acquire().await?;
        guard.connection_mut().execute(command, params).await
    }

    pub async fn fetch(&self, command: &str, params: &[Value]) -> Result<Vec<Row>> {
        let mut guard = self.pool.acquire().await?;
        guard.connection_mut().fetch(command, params).await
    }

    pub async fn fetch_one(&self, command: &str, params: &[Value]) -> Result<Option<Row>> {
        let rows = self.fetch(command, params).await?;
        Ok(rows.into_iter().next())
    }

    /// Fetch under a short transaction and expose the rows as a stream.
    /// The connection is back in the pool before the stream is consumed.
    pub async fn iterate(
        &self,
        command: &str,
        params: &[Value],
    ) -> Result<impl Stream<Item = Row> + fmt::Debug + Send + Unpin + 'static> {
        let mut guard = self.pool.acquire().await?;
        let conn = guard.connection_mut();
        conn.begin().await?;
        match conn.fetch(command, params).await {
            Ok(rows) => {
                conn.commit().await?;
                Ok(stream::iter(rows))
            }
            Err(e) => {
                if let Err(rollback_error) = conn.rollback().await {
                    warn!("Rollback failed after fetch error: {}", rollback_error);
                }
                Err(e)
            }
        }
    }

    pub async fn stats(&self) -> PoolStats {
        self.pool.stats().await
    }

    pub async fn close(&self) -> Result<()> {
        self.pool.close().await
    }
}
