use log::debug;

use crate::connection::Connection;
use crate::core::Result;

/// Where a unit of work sits in the chain: the outermost unit owns the real
/// transaction, nested units own a savepoint inside it.
#[derive(Debug)]
pub(crate) enum TransactionScope {
    Root,
    Nested { savepoint: String },
}

impl TransactionScope {
    pub(crate) async fn open_root<C: Connection>(conn: &mut C) -> Result<Self> {
        conn.begin().await?;
        debug!("Transaction started on connection {}", conn.id());
        Ok(Self::Root)
    }

    /// Savepoint names are derived from the depth of the enclosing unit,
    /// so the first nested unit gets `sp_1`, its child `sp_2`, and so on.
    pub(crate) async fn open_nested<C: Connection>(conn: &mut C, depth: usize) -> Result<Self> {
        let savepoint = format!("sp_{}", depth);
        conn.begin_nested(&savepoint).await?;
        debug!(
            "Savepoint {} created on connection {}",
            savepoint,
            conn.id()
        );
        Ok(Self::Nested { savepoint })
    }

    pub(crate) async fn commit<C: Connection>(self, conn: &mut C) -> Result<()> {
        match self {
            Self::Root => conn.commit().await,
            Self::Nested { savepoint } => conn.release_nested(&savepoint).await,
        }
    }

    pub(crate) async fn rollback<C: Connection>(self, conn: &mut C) -> Result<()> {
        match self {
            Self::Root => conn.rollback().await,
            Self::Nested { savepoint } => conn.rollback_nested(&savepoint).await,
        }
    }
}
