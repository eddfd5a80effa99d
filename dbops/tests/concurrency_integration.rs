// Copyright (c) 2025 Kirky.X
//
// Licensed under the MIT License
// See LICENSE file in the project root for full license information.

//! 并发集成测试
//!
//! 测试事务重试、乐观锁、库存扣减、并发转账与唯一字段更新

use dbops::DbError;
use dbops::concurrency::{
    Bounds, ConcurrencyError, ConcurrentUpdateHelper, RetryPolicy, TableRef, TransactionOptions, TransactionToolkit,
};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
mod common;

async fn setup_accounts() -> common::TestDb {
    let db = common::setup().await;
    common::exec_all(
        &db.pool,
        &[
            "CREATE TABLE accounts (id INTEGER PRIMARY KEY, balance INTEGER NOT NULL, version INTEGER NOT NULL DEFAULT 0, email TEXT)",
            "INSERT INTO accounts (id, balance, email) VALUES (1, 100, 'a@example.com'), (2, 100, 'b@example.com')",
            "CREATE TABLE products (id INTEGER PRIMARY KEY, stock INTEGER NOT NULL)",
            "INSERT INTO products (id, stock) VALUES (1, 5)",
        ],
    )
    .await;
    db
}

fn fast_policy(max_retries: u32) -> RetryPolicy {
    RetryPolicy {
        max_retries,
        base_delay: Duration::from_millis(10),
        max_delay: Duration::from_millis(50),
        jitter: true,
    }
}

/// TEST-CONC-001: 乐观锁冲突两次后成功，退避时间不递减
#[tokio::test]
async fn test_retry_succeeds_after_two_conflicts() {
    let db = setup_accounts().await;
    let toolkit = TransactionToolkit::new(db.pool.clone());
    let attempts = Arc::new(AtomicUsize::new(0));

    let counter = attempts.clone();
    let result = toolkit
        .with_transaction_retry(TransactionOptions::default(), RetryPolicy::default(), move |_txn| {
            let counter = counter.clone();
            Box::pin(async move {
                let n = counter.fetch_add(1, Ordering::SeqCst);
                if n < 2 {
                    Err(DbError::Concurrency(ConcurrencyError::optimistic_lock("accounts", 1, 0)))
                } else {
                    Ok(n)
                }
            })
        })
        .await;

    assert_eq!(result.expect("Third attempt should succeed"), 2);
    assert_eq!(attempts.load(Ordering::SeqCst), 3);

    let snapshot = db.pool.instrumentation().get_performance_metrics();
    assert_eq!(snapshot.transaction_stats.rolled_back, 2);
    assert_eq!(snapshot.transaction_stats.completed, 1);

    let policy = RetryPolicy::default();
    let delays: Vec<Duration> = (0..5).map(|attempt| policy.delay_for(attempt)).collect();
    assert!(delays.windows(2).all(|pair| pair[0] <= pair[1]), "backoff decreased: {:?}", delays);
    assert_eq!(delays[0], policy.base_delay);
    assert_eq!(delays[4], policy.max_delay);
}

/// TEST-CONC-002: 不可重试的错误只执行一次
#[tokio::test]
async fn test_non_retryable_error_is_not_retried() {
    let db = setup_accounts().await;
    let toolkit = TransactionToolkit::new(db.pool.clone());
    let attempts = Arc::new(AtomicUsize::new(0));

    let counter = attempts.clone();
    let result: Result<(), DbError> = toolkit
        .with_transaction_retry(TransactionOptions::default(), fast_policy(5), move |_txn| {
            let counter = counter.clone();
            Box::pin(async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Err(DbError::business("rule violated"))
            })
        })
        .await;

    assert!(matches!(result, Err(DbError::Business(_))));
    assert_eq!(attempts.load(Ordering::SeqCst), 1);
}

/// TEST-CONC-003: 重试次数耗尽后返回最后一次错误
#[tokio::test]
async fn test_retries_exhausted() {
    let db = setup_accounts().await;
    let toolkit = TransactionToolkit::new(db.pool.clone());
    let attempts = Arc::new(AtomicUsize::new(0));

    let counter = attempts.clone();
    let result: Result<(), DbError> = toolkit
        .with_transaction_retry(TransactionOptions::default(), fast_policy(3), move |_txn| {
            let counter = counter.clone();
            Box::pin(async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Err(DbError::Concurrency(ConcurrencyError::lock_timeout("simulated wait timeout")))
            })
        })
        .await;

    let err = result.expect_err("Should fail after retries");
    assert!(err.is_retryable());
    assert_eq!(attempts.load(Ordering::SeqCst), 3);
}

/// TEST-CONC-004: 事务出错时回滚全部写入
#[tokio::test]
async fn test_failed_transaction_rolls_back() {
    let db = setup_accounts().await;
    let toolkit = TransactionToolkit::new(db.pool.clone());
    let table = TableRef::new("accounts");

    let result: Result<(), DbError> = toolkit
        .with_transaction(TransactionOptions::default(), |txn| {
            let toolkit = toolkit.clone();
            let table = table.clone();
            Box::pin(async move {
                toolkit
                    .update_with_optimistic_lock(txn, &table, 1, vec![("balance".to_string(), 0i64.into())], 0)
                    .await?;
                Err(DbError::business("abort after write"))
            })
        })
        .await;

    assert!(result.is_err());
    assert_eq!(common::scalar_i64(&db.pool, "SELECT balance FROM accounts WHERE id = 1").await, 100);
    assert_eq!(common::scalar_i64(&db.pool, "SELECT version FROM accounts WHERE id = 1").await, 0);
}

/// TEST-CONC-005: 版本号不匹配时返回乐观锁错误
#[tokio::test]
async fn test_optimistic_lock_conflict() {
    let db = setup_accounts().await;
    let toolkit = TransactionToolkit::new(db.pool.clone());
    let table = TableRef::new("accounts");

    let first = toolkit
        .with_transaction(TransactionOptions::default(), |txn| {
            let toolkit = toolkit.clone();
            let table = table.clone();
            Box::pin(async move {
                toolkit
                    .update_with_optimistic_lock(txn, &table, 1, vec![("balance".to_string(), 90i64.into())], 0)
                    .await
            })
        })
        .await
        .expect("First update should succeed");
    assert_eq!(first, 1);

    let stale = toolkit
        .with_transaction(TransactionOptions::default(), |txn| {
            let toolkit = toolkit.clone();
            let table = table.clone();
            Box::pin(async move {
                toolkit
                    .update_with_optimistic_lock(txn, &table, 1, vec![("balance".to_string(), 80i64.into())], 0)
                    .await
            })
        })
        .await;

    match stale {
        Err(DbError::Concurrency(ConcurrencyError::OptimisticLock { expected_version, .. })) => {
            assert_eq!(expected_version, 0)
        }
        other => panic!("Expected optimistic lock error, got {:?}", other),
    }
    assert_eq!(common::scalar_i64(&db.pool, "SELECT balance FROM accounts WHERE id = 1").await, 90);
    assert_eq!(common::scalar_i64(&db.pool, "SELECT version FROM accounts WHERE id = 1").await, 1);
}

/// TEST-CONC-006: 事务超时回滚
#[tokio::test]
async fn test_transaction_timeout() {
    let db = setup_accounts().await;
    let toolkit = TransactionToolkit::new(db.pool.clone());

    let result: Result<(), DbError> = toolkit
        .with_transaction(
            TransactionOptions::default().timeout(Duration::from_millis(50)),
            |_txn| {
                Box::pin(async move {
                    tokio::time::sleep(Duration::from_millis(500)).await;
                    Ok(())
                })
            },
        )
        .await;

    match result {
        Err(DbError::Concurrency(e)) => {
            assert_eq!(e.lock_timeout_kind(), Some(dbops::concurrency::LockTimeoutKind::TransactionTimeout));
        }
        other => panic!("Expected transaction timeout, got {:?}", other),
    }
}

/// TEST-CONC-007: 库存不足时失败且库存不变
#[tokio::test]
async fn test_decrease_stock_insufficient() {
    let db = setup_accounts().await;
    let helper = ConcurrentUpdateHelper::new(TransactionToolkit::new(db.pool.clone()));
    let products = TableRef::new("products");

    assert_eq!(helper.decrease_stock(&products, "stock", 1, 3).await.expect("Should succeed"), 2);

    let result = helper.decrease_stock(&products, "stock", 1, 3).await;
    assert!(matches!(result, Err(DbError::Business(_))));
    assert_eq!(common::scalar_i64(&db.pool, "SELECT stock FROM products WHERE id = 1").await, 2);
}

/// TEST-CONC-008: 带界限的增减
#[tokio::test]
async fn test_increment_with_bounds() {
    let db = setup_accounts().await;
    let helper = ConcurrentUpdateHelper::new(TransactionToolkit::new(db.pool.clone()));
    let accounts = TableRef::new("accounts");

    assert_eq!(
        helper
            .increment(&accounts, "balance", 1, 50, Bounds::at_most(200))
            .await
            .expect("Within bounds"),
        150
    );
    assert!(helper
        .increment(&accounts, "balance", 1, 100, Bounds::at_most(200))
        .await
        .is_err());
    assert!(helper
        .decrement(&accounts, "balance", 1, 151, Bounds::at_least(0))
        .await
        .is_err());
    assert_eq!(common::scalar_i64(&db.pool, "SELECT balance FROM accounts WHERE id = 1").await, 150);
}

/// TEST-CONC-009: 并发反向转账不丢失金额
#[tokio::test]
async fn test_concurrent_opposite_transfers() {
    let db = setup_accounts().await;
    let helper = Arc::new(
        ConcurrentUpdateHelper::new(TransactionToolkit::new(db.pool.clone())).with_policy(fast_policy(10)),
    );
    let accounts = TableRef::new("accounts");

    let mut tasks = Vec::new();
    for i in 0..6 {
        let helper = helper.clone();
        let accounts = accounts.clone();
        let (from, to) = if i % 2 == 0 { (1, 2) } else { (2, 1) };
        tasks.push(tokio::spawn(async move {
            helper.transfer_balance(&accounts, "balance", from, to, 10).await
        }));
    }

    let results = futures::future::join_all(tasks).await;
    for result in results {
        result.expect("Task panicked").expect("Transfer should succeed");
    }

    let total = common::scalar_i64(&db.pool, "SELECT SUM(balance) FROM accounts").await;
    assert_eq!(total, 200);
    assert_eq!(common::scalar_i64(&db.pool, "SELECT balance FROM accounts WHERE id = 1").await, 100);
}

/// TEST-CONC-010: 余额不足的转账不产生任何写入
#[tokio::test]
async fn test_transfer_insufficient_balance() {
    let db = setup_accounts().await;
    let helper = ConcurrentUpdateHelper::new(TransactionToolkit::new(db.pool.clone()));
    let accounts = TableRef::new("accounts");

    let result = helper.transfer_balance(&accounts, "balance", 1, 2, 1000).await;
    assert!(matches!(result, Err(DbError::Business(_))));
    assert_eq!(common::scalar_i64(&db.pool, "SELECT balance FROM accounts WHERE id = 2").await, 100);
}

/// TEST-CONC-011: 唯一字段被占用时拒绝更新
#[tokio::test]
async fn test_update_unique_field() {
    let db = setup_accounts().await;
    let helper = ConcurrentUpdateHelper::new(TransactionToolkit::new(db.pool.clone()));
    let accounts = TableRef::new("accounts");

    let taken = helper.update_unique_field(&accounts, "email", 1, "b@example.com").await;
    assert!(matches!(taken, Err(DbError::Business(_))));

    helper
        .update_unique_field(&accounts, "email", 1, "new@example.com")
        .await
        .expect("Free value should be accepted");
    helper
        .update_unique_field(&accounts, "email", 1, "new@example.com")
        .await
        .expect("Writing the value already held by the same row is allowed");
}

/// TEST-CONC-012: 不同金额的并发反向转账
#[tokio::test]
async fn test_concurrent_transfers_with_different_amounts() {
    let db = setup_accounts().await;
    let helper = Arc::new(
        ConcurrentUpdateHelper::new(TransactionToolkit::new(db.pool.clone())).with_policy(fast_policy(10)),
    );
    let accounts = TableRef::new("accounts");

    let forward = {
        let helper = helper.clone();
        let accounts = accounts.clone();
        tokio::spawn(async move { helper.transfer_balance(&accounts, "balance", 1, 2, 100).await })
    };
    let backward = {
        let helper = helper.clone();
        let accounts = accounts.clone();
        tokio::spawn(async move { helper.transfer_balance(&accounts, "balance", 2, 1, 50).await })
    };

    forward.await.expect("Task panicked").expect("A to B should succeed");
    backward.await.expect("Task panicked").expect("B to A should succeed");

    assert_eq!(common::scalar_i64(&db.pool, "SELECT balance FROM accounts WHERE id = 1").await, 50);
    assert_eq!(common::scalar_i64(&db.pool, "SELECT balance FROM accounts WHERE id = 2").await, 150);
    assert_eq!(common::scalar_i64(&db.pool, "SELECT SUM(balance) FROM accounts").await, 200);
}
