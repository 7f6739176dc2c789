use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use log::debug;

use crate::core::{DbError, Result};

/// Boxed future returned by an exception handler.
pub type HandlerFuture<T> = Pin<Box<dyn Future<Output = Result<T>> + Send>>;

/// Async callback that turns a failure into a substitute result.
pub type ExceptionHandler<T> = Arc<dyn Fn(DbError) -> HandlerFuture<T> + Send + Sync>;

/// What a unit of work does with a failure after its transaction scope has
/// been rolled back: re-raise it, swallow it, or hand it to a handler.
pub struct ExceptionPolicy<T> {
    raise_on_exception: bool,
    handler: Option<ExceptionHandler<T>>,
}

impl<T> Clone for ExceptionPolicy<T> {
    fn clone(&self) -> Self {
        Self {
            raise_on_exception: self.raise_on_exception,
            handler: self.handler.clone(),
        }
    }
}

impl<T: Send + 'static> ExceptionPolicy<T> {
    pub fn new() -> Self {
        Self {
            raise_on_exception: true,
            handler: None,
        }
    }

    /// When false and no handler is installed, failures are swallowed and
    /// the unit yields `Ok(None)`.
    pub fn raise_on_exception(mut self, raise: bool) -> Self {
        self.raise_on_exception = raise;
        self
    }

    /// Install a handler invoked with the failure after rollback. Its result
    /// replaces the unit's result; its own error propagates to the caller
    /// unhandled. A handler takes precedence over `raise_on_exception`.
    pub fn on_exception<H, Fut>(mut self, handler: H) -> Self
    where
        H: Fn(DbError) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<T>> + Send + 'static,
    {
        self.handler = Some(Arc::new(move |error| -> HandlerFuture<T> {
            Box::pin(handler(error))
        }));
        self
    }

    /// Resolve a work failure. The scope must already be rolled back.
    pub(crate) async fn apply(&self, error: DbError) -> Result<Option<T>> {
        if let Some(handler) = &self.handler {
            let replacement = handler(error).await?;
            return Ok(Some(replacement));
        }
        if self.raise_on_exception {
            return Err(error);
        }
        debug!("Suppressed failure: {}", error);
        Ok(None)
    }
}

impl<T: Send + 'static> Default for ExceptionPolicy<T> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_default_policy_reraises() {
        let policy: ExceptionPolicy<i64> = ExceptionPolicy::new();
        let result = policy.apply(DbError::AppError("boom".to_string())).await;
        assert!(matches!(result, Err(DbError::AppError(_))));
    }

    #[tokio::test]
    async fn test_suppressing_policy_yields_none() {
        let policy: ExceptionPolicy<i64> = ExceptionPolicy::new().raise_on_exception(false);
        let result = policy.apply(DbError::AppError("boom".to_string())).await;
        assert_eq!(result.unwrap(), None);
    }

    #[tokio::test]
    async fn test_handler_replaces_the_result() {
        let policy = ExceptionPolicy::new().on_exception(|error| async move {
            assert!(error.to_string().contains("boom"));
            Ok(42i64)
        });
        let result = policy.apply(DbError::AppError("boom".to_string())).await;
        assert_eq!(result.unwrap(), Some(42));
    }

    #[tokio::test]
    async fn test_handler_takes_precedence_over_suppression() {
        let policy = ExceptionPolicy::new()
            .raise_on_exception(false)
            .on_exception(|_| async move { Ok(7i64) });
        let result = policy.apply(DbError::AppError("x".to_string())).await;
        assert_eq!(result.unwrap(), Some(7));
    }

    #[tokio::test]
    async fn test_handler_failure_propagates() {
        let policy: ExceptionPolicy<i64> = ExceptionPolicy::new()
            .on_exception(|_| async move { Err(DbError::AppError("handler failed".to_string())) });
        let result = policy
            .apply(DbError::QueryError("original".to_string()))
            .await;
        match result {
            Err(DbError::AppError(msg)) => assert_eq!(msg, "handler failed"),
            other => panic!("expected the handler's error, got {:?}", other),
        }
    }
}
