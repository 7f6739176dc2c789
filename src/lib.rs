// ============================================================================
// txwrap: composable nested transactions over pooled async connections
// ============================================================================

pub mod adapter;
pub mod atomic;
pub mod connection;
pub mod core;
pub mod mem;

pub use crate::adapter::DbAdapter;
pub use crate::atomic::{Atomic, CallContext, Caller, Composed, ExceptionHandler, ExceptionPolicy};
pub use crate::connection::config::PoolConfig;
pub use crate::connection::pool::{DbPool, PoolGuard, PoolStats};
pub use crate::connection::{Connection, Driver};
pub use crate::core::{DbError, Result, Row, Value};
pub use crate::mem::{MemConn, MemDriver};
