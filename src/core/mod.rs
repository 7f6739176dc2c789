// ============================================================================
// Core types: errors, scalar values, rows
// ============================================================================

pub mod error;
pub mod row;
pub mod value;

pub use error::{DbError, Result};
pub use row::Row;
pub use value::Value;
