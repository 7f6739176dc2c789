// ============================================================================
// Atomic composition: transactional units of work
// ============================================================================

pub mod context;
pub mod policy;
mod scope;

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use log::error;

use crate::connection::pool::DbPool;
use crate::connection::Driver;
use crate::core::{DbError, Result};

pub use context::CallContext;
pub use policy::{ExceptionHandler, ExceptionPolicy};

use scope::TransactionScope;

/// Shared callable form of a unit of work, as stored by [`Composed`].
pub type UnitOfWork<D, T> = Arc<
    dyn for<'a> Fn(&'a mut CallContext<D>) -> Pin<Box<dyn Future<Output = Result<T>> + Send + 'a>>
        + Send
        + Sync,
>;

/// A transactional boundary with an exception policy attached.
///
/// `run` executes a unit of work as the outermost transaction of a fresh
/// pooled connection; `run_nested` executes it inside an enclosing chain
/// under a savepoint. Either way the unit's result decides the outcome:
/// `Ok` commits the scope and yields `Ok(Some(value))`, `Err` rolls the
/// scope back and then defers to the policy.
pub struct Atomic<T> {
    policy: ExceptionPolicy<T>,
}

impl<T> Clone for Atomic<T> {
    fn clone(&self) -> Self {
        Self {
            policy: self.policy.clone(),
        }
    }
}

impl<T: Send + 'static> Atomic<T> {
    pub fn new() -> Self {
        Self {
            policy: ExceptionPolicy::new(),
        }
    }

    /// When false and no handler is installed, a rolled-back failure yields
    /// `Ok(None)` instead of re-raising.
    pub fn raise_on_exception(mut self, raise: bool) -> Self {
        self.policy = self.policy.raise_on_exception(raise);
        self
    }

    /// Install a handler consulted after rollback. See
    /// [`ExceptionPolicy::on_exception`].
    pub fn on_exception<H, Fut>(mut self, handler: H) -> Self
    where
        H: Fn(DbError) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<T>> + Send + 'static,
    {
        self.policy = self.policy.on_exception(handler);
        self
    }

    /// Run the unit as a root transaction on a connection acquired from the
    /// pool. The connection is released exactly once, on every exit path.
    ///
    /// Acquisition, `BEGIN` and `COMMIT` failures propagate directly; the
    /// policy only ever sees failures of the unit itself.
    pub async fn run<D, F>(&self, pool: &DbPool<D>, work: F) -> Result<Option<T>>
    where
        D: Driver,
        F: for<'a> FnOnce(
                &'a mut CallContext<D>,
            ) -> Pin<Box<dyn Future<Output = Result<T>> + Send + 'a>>
            + Send,
    {
        let guard = pool.acquire().await?;
        let mut ctx = CallContext::new(guard);
        let scope = TransactionScope::open_root(ctx.connection()).await?;
        ctx.enter();
        let outcome = work(&mut ctx).await;
        ctx.exit();
        self.finish(scope, &mut ctx, outcome).await
    }

    /// Run the unit inside an enclosing chain, guarded by a savepoint on
    /// the chain's connection.
    pub async fn run_nested<D, F>(&self, ctx: &mut CallContext<D>, work: F) -> Result<Option<T>>
    where
        D: Driver,
        F: for<'a> FnOnce(
                &'a mut CallContext<D>,
            ) -> Pin<Box<dyn Future<Output = Result<T>> + Send + 'a>>
            + Send,
    {
        let depth = ctx.depth();
        let scope = TransactionScope::open_nested(ctx.connection(), depth).await?;
        ctx.enter();
        let outcome = work(&mut *ctx).await;
        ctx.exit();
        self.finish(scope, ctx, outcome).await
    }

    /// Bind a unit of work to this boundary, producing a reusable value
    /// that can be invoked from a pool or from an enclosing context.
    pub fn wrap<D, F>(self, work: F) -> Composed<D, T>
    where
        D: Driver,
        F: for<'a> Fn(
                &'a mut CallContext<D>,
            ) -> Pin<Box<dyn Future<Output = Result<T>> + Send + 'a>>
            + Send
            + Sync
            + 'static,
    {
        Composed {
            atomic: self,
            work: Arc::new(work),
        }
    }

    async fn finish<D: Driver>(
        &self,
        scope: TransactionScope,
        ctx: &mut CallContext<D>,
        outcome: Result<T>,
    ) -> Result<Option<T>> {
        match outcome {
            Ok(value) => {
                scope.commit(ctx.connection()).await?;
                Ok(Some(value))
            }
            Err(error) => {
                // The scope is always rolled back before the policy runs.
                // A rollback failure must not displace the work's error.
                if let Err(rollback_error) = scope.rollback(ctx.connection()).await {
                    error!(
                        "Rollback failed on connection {}: {} (original failure: {})",
                        ctx.connection_id(),
                        rollback_error,
                        error
                    );
                }
                self.policy.apply(error).await
            }
        }
    }
}

impl<T: Send + 'static> Default for Atomic<T> {
    fn default() -> Self {
        Self::new()
    }
}

/// How a composed unit is invoked: from a pool, opening a fresh root
/// transaction, or from an enclosing context, nesting a savepoint.
pub enum Caller<'a, D: Driver> {
    Pool(&'a DbPool<D>),
    Context(&'a mut CallContext<D>),
}

impl<'a, D: Driver> From<&'a DbPool<D>> for Caller<'a, D> {
    fn from(pool: &'a DbPool<D>) -> Self {
        Self::Pool(pool)
    }
}

impl<'a, D: Driver> From<&'a mut CallContext<D>> for Caller<'a, D> {
    fn from(ctx: &'a mut CallContext<D>) -> Self {
        Self::Context(ctx)
    }
}

/// A unit of work bound to its transactional boundary. Cloning is cheap;
/// the work is shared.
pub struct Composed<D: Driver, T> {
    atomic: Atomic<T>,
    work: UnitOfWork<D, T>,
}

impl<D: Driver, T> Clone for Composed<D, T> {
    fn clone(&self) -> Self {
        Self {
            atomic: self.atomic.clone(),
            work: Arc::clone(&self.work),
        }
    }
}

impl<D: Driver, T: Send + 'static> Composed<D, T> {
    /// Invoke the unit. Accepts `&DbPool` to run as a root transaction, or
    /// `&mut CallContext` to nest inside the live chain on its connection.
    pub async fn call<'a>(&self, caller: impl Into<Caller<'a, D>>) -> Result<Option<T>> {
        let work = Arc::clone(&self.work);
        match caller.into() {
            Caller::Pool(pool) => self.atomic.run(pool, move |ctx| work(ctx)).await,
            Caller::Context(ctx) => self.atomic.run_nested(ctx, move |ctx| work(ctx)).await,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::config::PoolConfig;
    use crate::connection::Connection;
    use crate::core::Value;
    use crate::mem::MemDriver;

    async fn test_pool() -> DbPool<MemDriver> {
        DbPool::connect(MemDriver::new(), PoolConfig::new("test", ""))
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_depth_counts_nesting_levels() {
        let pool = test_pool().await;
        let depths = Atomic::new()
            .run(&pool, |ctx| {
                Box::pin(async move {
                    let root = ctx.depth();
                    let nested = Atomic::new()
                        .run_nested(ctx, |ctx| Box::pin(async move { Ok(ctx.depth()) }))
                        .await?;
                    Ok((root, nested))
                })
            })
            .await
            .unwrap()
            .unwrap();
        assert_eq!(depths, (1, Some(2)));
    }

    #[tokio::test]
    async fn test_suppressed_failure_rolls_back_and_yields_none() {
        let pool = test_pool().await;
        let atomic: Atomic<()> = Atomic::new().raise_on_exception(false);
        let result = atomic
            .run(&pool, |ctx| {
                Box::pin(async move {
                    ctx.execute("create items", &[]).await?;
                    ctx.execute("insert items", &[Value::Integer(1)]).await?;
                    Err(DbError::AppError("abort".to_string()))
                })
            })
            .await
            .unwrap();
        assert_eq!(result, None);

        // the create was rolled back with everything else
        let mut guard = pool.acquire().await.unwrap();
        let err = guard
            .connection_mut()
            .fetch("count items", &[])
            .await
            .unwrap_err();
        assert!(matches!(err, DbError::TableNotFound(_)));
    }

    #[tokio::test]
    async fn test_commit_failure_propagates_without_the_policy() {
        let pool = test_pool().await;
        // close the transaction behind the composer's back so COMMIT fails
        let result: Result<Option<()>> = Atomic::new()
            .on_exception(|_| async move { Ok(()) })
            .run(&pool, |ctx| {
                Box::pin(async move {
                    ctx.connection().rollback().await?;
                    Ok(())
                })
            })
            .await;
        assert!(matches!(result, Err(DbError::TransactionError(_))));
    }
}
