use crate::connection::pool::PoolGuard;
use crate::connection::{Connection, Driver};
use crate::core::{Result, Row, Value};

/// Live handle to a transaction chain: the checked-out connection plus the
/// current nesting depth. Passed by mutable reference through every unit of
/// work so the whole chain runs on one connection.
pub struct CallContext<D: Driver> {
    guard: PoolGuard<D>,
    depth: usize,
}

impl<D: Driver> CallContext<D> {
    pub(crate) fn new(guard: PoolGuard<D>) -> Self {
        Self { guard, depth: 0 }
    }

    /// Identifier of the connection this chain runs on.
    pub fn connection_id(&self) -> u64 {
        self.guard.connection().id()
    }

    /// Nesting depth: 1 inside the outermost unit, 2 inside the first
    /// nested unit, and so on.
    pub fn depth(&self) -> usize {
        self.depth
    }

    /// Direct access to the underlying connection.
    pub fn connection(&mut self) -> &mut D::Conn {
        self.guard.connection_mut()
    }

    pub async fn execute(&mut self, command: &str, params: &[Value]) -> Result<u64> {
        self.guard.connection_mut().execute(command, params).await
    }

    pub async fn fetch(&mut self, command: &str, params: &[Value]) -> Result<Vec<Row>> {
        self.guard.connection_mut().fetch(command, params).await
    }

    pub async fn fetch_one(&mut self, command: &str, params: &[Value]) -> Result<Option<Row>> {
        let rows = self.fetch(command, params).await?;
        Ok(rows.into_iter().next())
    }

    pub(crate) fn enter(&mut self) {
        self.depth += 1;
    }

    pub(crate) fn exit(&mut self) {
        self.depth = self.depth.saturating_sub(1);
    }
}
