/// Example: Nested Atomic Composition
///
/// This example demonstrates nested transactional units of work,
/// exception policies, and composed calls over the in-memory driver.
///
/// Run: cargo run --example nested_atomic

use txwrap::{
    Atomic, CallContext, DbAdapter, DbError, MemDriver, PoolConfig, Result, Value,
};

async fn current_count(adapter: &DbAdapter<MemDriver>, table: &str) -> Result<i64> {
    let row = adapter.fetch_one(&format!("count {}", table), &[]).await?;
    Ok(row
        .and_then(|r| r.get("count").and_then(|v| v.as_i64()))
        .unwrap_or(0))
}

#[tokio::main]
async fn main() -> Result<()> {
    println!("=== Nested Atomic Composition Demo ===\n");

    // ========================================================================
    // 1. Setup: in-memory driver behind a pooled adapter
    // ========================================================================
    let config = PoolConfig::new("demo", "").max_connections(4);
    let adapter = DbAdapter::connect(MemDriver::new(), config).await?;
    adapter.execute("create accounts", &[]).await?;
    adapter.execute("create audit_log", &[]).await?;
    println!("✓ {}", adapter.stats().await);

    // ========================================================================
    // 2. Root and nested units committing together
    // ========================================================================
    let pool = adapter.pool().clone();
    let total = Atomic::new()
        .run(&pool, |ctx| {
            Box::pin(async move {
                ctx.execute(
                    "insert accounts",
                    &[Value::Text("alice".to_string()), Value::Integer(100)],
                )
                .await?;
                Atomic::new()
                    .run_nested(ctx, |ctx| {
                        Box::pin(async move {
                            ctx.execute(
                                "insert accounts",
                                &[Value::Text("bob".to_string()), Value::Integer(50)],
                            )
                            .await
                        })
                    })
                    .await?;
                let row = ctx.fetch_one("count accounts", &[]).await?;
                Ok(row
                    .and_then(|r| r.get("count").and_then(|v| v.as_i64()))
                    .unwrap_or(0))
            })
        })
        .await?;
    println!("✓ Root + nested committed, accounts in chain: {:?}", total);

    // ========================================================================
    // 3. A failing unit rolls every insert back
    // ========================================================================
    let failing: Result<Option<i64>> = Atomic::new()
        .run(&pool, |ctx| {
            Box::pin(async move {
                ctx.execute("insert accounts", &[Value::Text("mallory".to_string())])
                    .await?;
                Err(DbError::AppError("balance check failed".to_string()))
            })
        })
        .await;
    if let Err(e) = failing {
        println!("✓ Failure propagated: {}", e);
    }
    println!(
        "✓ Accounts unchanged: {}",
        current_count(&adapter, "accounts").await?
    );

    // ========================================================================
    // 4. Suppressing the failure instead
    // ========================================================================
    let suppressed = Atomic::<i64>::new()
        .raise_on_exception(false)
        .run(&pool, |ctx| {
            Box::pin(async move {
                ctx.execute("insert accounts", &[Value::Text("eve".to_string())])
                    .await?;
                Err(DbError::AppError("audit rejected".to_string()))
            })
        })
        .await?;
    println!("✓ Suppressed unit yielded {:?}", suppressed);

    // ========================================================================
    // 5. Substituting a fallback through a handler
    // ========================================================================
    let recovered = Atomic::new()
        .on_exception(|error| async move {
            println!("  handler saw: {}", error);
            Ok(-1i64)
        })
        .run(&pool, |ctx| {
            Box::pin(async move {
                ctx.execute("insert accounts", &[Value::Text("trent".to_string())])
                    .await?;
                Err(DbError::AppError("quota exceeded".to_string()))
            })
        })
        .await?;
    println!("✓ Handler substituted {:?}", recovered);

    // ========================================================================
    // 6. Composing reusable units
    // ========================================================================
    let audit = Atomic::new().wrap(|ctx: &mut CallContext<MemDriver>| {
        Box::pin(async move {
            ctx.execute("insert audit_log", &[Value::Text("checked".to_string())])
                .await
        })
    });

    // as its own root transaction
    audit.call(&pool).await?;

    // nested inside another unit, on the same connection
    let entries = Atomic::new()
        .run(&pool, |ctx| {
            Box::pin(async move {
                audit.call(&mut *ctx).await?;
                let row = ctx.fetch_one("count audit_log", &[]).await?;
                Ok(row
                    .and_then(|r| r.get("count").and_then(|v| v.as_i64()))
                    .unwrap_or(0))
            })
        })
        .await?;
    println!("✓ Composed unit ran from pool and context, entries: {:?}", entries);

    // ========================================================================
    // 7. Shutdown
    // ========================================================================
    println!("\n{}", adapter.stats().await);
    adapter.close().await?;
    println!("✓ Pool closed");
    Ok(())
}
