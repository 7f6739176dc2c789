// ============================================================================
// Connection layer: driver traits, configuration, pooling
// ============================================================================

pub mod config;
pub mod pool;

use async_trait::async_trait;

use crate::core::{Result, Row, Value};
use config::PoolConfig;

/// A single database connection with transaction and savepoint support.
///
/// Implementations track their own transaction state; `in_transaction`
/// must reflect whether `begin` has been called without a matching
/// `commit` or `rollback`.
#[async_trait]
pub trait Connection: Send {
    /// Stable identifier for this connection, unique within its driver.
    fn id(&self) -> u64;

    fn in_transaction(&self) -> bool;

    /// Run a statement and return the number of affected rows.
    async fn execute(&mut self, command: &str, params: &[Value]) -> Result<u64>;

    /// Run a statement and return its result rows.
    async fn fetch(&mut self, command: &str, params: &[Value]) -> Result<Vec<Row>>;

    async fn begin(&mut self) -> Result<()>;

    async fn commit(&mut self) -> Result<()>;

    /// Roll back the active transaction. A no-op when none is active.
    async fn rollback(&mut self) -> Result<()>;

    /// Create a named savepoint inside the active transaction.
    async fn begin_nested(&mut self, savepoint: &str) -> Result<()>;

    /// Discard a savepoint, keeping the work done since it was created.
    /// The savepoint must be the innermost one.
    async fn release_nested(&mut self, savepoint: &str) -> Result<()>;

    /// Undo all work since the savepoint and discard it.
    /// The savepoint must be the innermost one.
    async fn rollback_nested(&mut self, savepoint: &str) -> Result<()>;

    async fn close(&mut self) -> Result<()>;
}

/// Factory for connections, shared by a pool.
#[async_trait]
pub trait Driver: Send + Sync + 'static {
    type Conn: Connection + Send + 'static;

    async fn connect(&self, config: &PoolConfig) -> Result<Self::Conn>;
}
