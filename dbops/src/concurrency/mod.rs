// Copyright (c) 2025 Kirky.X
//
// Licensed under the MIT License
// See LICENSE file in the project root for full license information.

//! 事务并发工具模块
//!
//! 提供：
//! - **事务执行**: 指定隔离级别、只读模式与超时，成功提交、失败回滚
//! - **重试**: 对可重试的并发冲突按指数退避重新执行整个事务
//! - **悲观锁**: `SELECT ... FOR UPDATE`
//! - **乐观锁**: 基于版本号的条件更新
//!
//! 引擎原生错误只在这里经由 [`EngineAdapter`](crate::engine::EngineAdapter) 翻译为 [`ConcurrencyError`]。
//!
//! # Example
//!
//! ```rust,ignore
//! let toolkit = TransactionToolkit::new(pool.clone());
//! let balance = toolkit
//!     .with_transaction_retry(TransactionOptions::default(), RetryPolicy::default(), |txn| {
//!         Box::pin(async move {
//!             let row = TransactionToolkit::fetch_one(txn, "SELECT balance FROM accounts WHERE id = 1").await?;
//!             Ok(row)
//!         })
//!     })
//!     .await?;
//! ```

mod error;
mod helper;

pub use error::{ConcurrencyError, LockTimeoutKind};
pub use helper::{Bounds, ConcurrentUpdateHelper};

use rand::Rng;
use sea_orm::{
    AccessMode, ConnectionTrait, DatabaseTransaction, FromQueryResult, JsonValue, Statement, TransactionTrait, Value,
};
use std::future::Future;
use std::pin::Pin;
use std::time::{Duration, Instant};
use tracing::{debug, error, warn};

use crate::config::{DbError, DbResult};
use crate::pool::DbPool;

/// 事务体返回的 Future
pub type TxFuture<'c, T> = Pin<Box<dyn Future<Output = DbResult<T>> + Send + 'c>>;

/// 事务隔离级别
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum IsolationLevel {
    /// 读未提交
    ReadUncommitted,
    /// 读已提交
    ReadCommitted,
    /// 可重复读
    #[default]
    RepeatableRead,
    /// 串行化
    Serializable,
}

impl From<IsolationLevel> for sea_orm::IsolationLevel {
    fn from(level: IsolationLevel) -> Self {
        match level {
            IsolationLevel::ReadUncommitted => sea_orm::IsolationLevel::ReadUncommitted,
            IsolationLevel::ReadCommitted => sea_orm::IsolationLevel::ReadCommitted,
            IsolationLevel::RepeatableRead => sea_orm::IsolationLevel::RepeatableRead,
            IsolationLevel::Serializable => sea_orm::IsolationLevel::Serializable,
        }
    }
}

/// 事务选项
#[derive(Debug, Clone)]
pub struct TransactionOptions {
    /// 隔离级别（引擎不支持时忽略）
    pub isolation_level: IsolationLevel,
    /// 事务整体超时
    pub timeout: Option<Duration>,
    /// 只读事务
    pub read_only: bool,
    /// 跟踪标签
    pub label: String,
}

impl Default for TransactionOptions {
    fn default() -> Self {
        Self {
            isolation_level: IsolationLevel::default(),
            timeout: None,
            read_only: false,
            label: "transaction".to_string(),
        }
    }
}

impl TransactionOptions {
    /// 设置隔离级别
    pub fn isolation(mut self, level: IsolationLevel) -> Self {
        self.isolation_level = level;
        self
    }

    /// 设置超时
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// 设置只读
    pub fn read_only(mut self) -> Self {
        self.read_only = true;
        self
    }

    /// 设置跟踪标签
    pub fn label(mut self, label: impl Into<String>) -> Self {
        self.label = label.into();
        self
    }
}

/// 重试策略
///
/// `max_retries` 为总尝试次数；第 `attempt`（从 0 开始）次失败后的等待时间为
/// `min(base_delay * 2^attempt, max_delay)`。
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// 总尝试次数
    pub max_retries: u32,
    /// 基础退避
    pub base_delay: Duration,
    /// 退避上限
    pub max_delay: Duration,
    /// 是否在 `[delay/2, delay]` 范围内随机抖动
    pub jitter: bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(1000),
            jitter: false,
        }
    }
}

impl RetryPolicy {
    /// 第 `attempt` 次失败后的退避时间
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt);
        let delay = self.base_delay.saturating_mul(factor).min(self.max_delay);
        if self.jitter && delay.as_millis() > 1 {
            let millis = delay.as_millis() as u64;
            Duration::from_millis(rand::thread_rng().gen_range(millis / 2..=millis))
        } else {
            delay
        }
    }
}

/// 表定位信息
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableRef {
    /// 表名
    pub name: String,
    /// 主键列
    pub primary_key: String,
    /// 版本列
    pub version_column: String,
}

impl TableRef {
    /// 使用默认主键 `id` 与版本列 `version`
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            primary_key: "id".to_string(),
            version_column: "version".to_string(),
        }
    }

    /// 指定主键列
    pub fn with_primary_key(mut self, column: impl Into<String>) -> Self {
        self.primary_key = column.into();
        self
    }

    /// 指定版本列
    pub fn with_version_column(mut self, column: impl Into<String>) -> Self {
        self.version_column = column.into();
        self
    }
}

/// 事务并发工具
#[derive(Debug, Clone)]
pub struct TransactionToolkit {
    pool: DbPool,
}

impl TransactionToolkit {
    /// 创建工具
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }

    /// 所属连接池
    pub fn pool(&self) -> &DbPool {
        &self.pool
    }

    /// 将引擎原生错误翻译为并发错误，其他错误原样返回
    pub fn translate(&self, err: DbError) -> DbError {
        match err {
            DbError::Connection(db_err) => match self.pool.engine().translate_error(&db_err) {
                Some(concurrency) => DbError::Concurrency(concurrency),
                None => DbError::Connection(db_err),
            },
            other => other,
        }
    }

    /// 在事务中执行 `work`
    ///
    /// 成功时提交；任何错误或超时都会回滚。超时返回 [`LockTimeoutKind::TransactionTimeout`]。
    pub async fn with_transaction<T, F>(&self, options: TransactionOptions, work: F) -> DbResult<T>
    where
        T: Send,
        F: for<'c> FnOnce(&'c DatabaseTransaction) -> TxFuture<'c, T> + Send,
    {
        let lease = self.pool.acquire().await?;
        let engine = self.pool.engine();
        let instrumentation = self.pool.instrumentation();

        let (isolation, access) = if engine.supports_isolation_levels() {
            (
                Some(options.isolation_level.into()),
                options.read_only.then_some(AccessMode::ReadOnly),
            )
        } else {
            (None, None)
        };

        let txn = lease
            .begin_with_config(isolation, access)
            .await
            .map_err(|e| self.translate(DbError::Connection(e)))?;

        let id = uuid::Uuid::new_v4().to_string();
        instrumentation.start_transaction_tracking(&id, &options.label);
        let started = Instant::now();

        let outcome = match options.timeout {
            Some(limit) => match tokio::time::timeout(limit, work(&txn)).await {
                Ok(result) => result,
                Err(_) => Err(DbError::Concurrency(ConcurrencyError::transaction_timeout(limit.as_millis()))),
            },
            None => work(&txn).await,
        };

        match outcome.map_err(|e| self.translate(e)) {
            Ok(value) => match txn.commit().await {
                Ok(()) => {
                    instrumentation.end_transaction_tracking(&id, true);
                    debug!(
                        transaction_id = %id,
                        label = %options.label,
                        elapsed_ms = started.elapsed().as_millis() as u64,
                        "Transaction committed"
                    );
                    Ok(value)
                }
                Err(e) => {
                    instrumentation.end_transaction_tracking(&id, false);
                    Err(self.translate(DbError::Connection(e)))
                }
            },
            Err(e) => {
                if let Err(rollback_err) = txn.rollback().await {
                    warn!(transaction_id = %id, error = %rollback_err, "Rollback failed");
                }
                instrumentation.end_transaction_tracking(&id, false);
                debug!(transaction_id = %id, label = %options.label, error = %e, "Transaction rolled back");
                Err(e)
            }
        }
    }

    /// 在事务中执行 `work`，可重试错误按策略重新执行
    ///
    /// 退避等待是可取消的挂起点：丢弃返回的 Future 即取消重试。
    pub async fn with_transaction_retry<T, F>(
        &self,
        options: TransactionOptions,
        policy: RetryPolicy,
        mut work: F,
    ) -> DbResult<T>
    where
        T: Send,
        F: for<'c> FnMut(&'c DatabaseTransaction) -> TxFuture<'c, T> + Send,
    {
        let attempts = policy.max_retries.max(1);
        let mut attempt = 0u32;

        loop {
            match self.with_transaction(options.clone(), &mut work).await {
                Ok(value) => return Ok(value),
                Err(e) if e.is_retryable() && attempt + 1 < attempts => {
                    let delay = policy.delay_for(attempt);
                    warn!(
                        label = %options.label,
                        attempt = attempt + 1,
                        max_attempts = attempts,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "Retryable transaction conflict, retrying"
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(e) => {
                    if e.is_retryable() {
                        error!(label = %options.label, attempts = attempts, error = %e, "Transaction retries exhausted");
                    }
                    return Err(e);
                }
            }
        }
    }

    /// 执行查询并以 JSON 行返回
    pub async fn fetch_all(txn: &DatabaseTransaction, sql: &str, values: Vec<Value>) -> DbResult<Vec<JsonValue>> {
        let stmt = Statement::from_sql_and_values(txn.get_database_backend(), sql, values);
        Ok(JsonValue::find_by_statement(stmt).all(txn).await?)
    }

    /// 执行查询并返回第一行
    pub async fn fetch_one(txn: &DatabaseTransaction, sql: &str) -> DbResult<Option<JsonValue>> {
        let stmt = Statement::from_string(txn.get_database_backend(), sql.to_string());
        Ok(JsonValue::find_by_statement(stmt).one(txn).await?)
    }

    /// 对单行加排他锁并返回该行
    pub async fn lock_for_update(
        &self,
        txn: &DatabaseTransaction,
        table: &TableRef,
        id: i64,
    ) -> DbResult<Option<JsonValue>> {
        let engine = self.pool.engine();
        let sql = format!(
            "SELECT * FROM {} WHERE {} = {}{}",
            engine.quote_ident(&table.name),
            engine.quote_ident(&table.primary_key),
            engine.placeholder(1),
            engine.lock_clause()
        );
        let rows = Self::fetch_all(txn, &sql, vec![id.into()]).await?;
        Ok(rows.into_iter().next())
    }

    /// 对满足条件的所有行加排他锁
    ///
    /// `where_clause` 中的占位符须与引擎一致（MySQL/SQLite 为 `?`，PostgreSQL 为 `$n`）。
    pub async fn lock_for_update_all(
        &self,
        txn: &DatabaseTransaction,
        table: &TableRef,
        where_clause: &str,
        values: Vec<Value>,
    ) -> DbResult<Vec<JsonValue>> {
        let engine = self.pool.engine();
        let sql = format!(
            "SELECT * FROM {} WHERE {}{}",
            engine.quote_ident(&table.name),
            where_clause,
            engine.lock_clause()
        );
        Self::fetch_all(txn, &sql, values).await
    }

    /// 基于版本号的条件更新
    ///
    /// 版本号被设置为 `expected_version + 1`；没有行被更新时返回 [`ConcurrencyError::OptimisticLock`]。
    pub async fn update_with_optimistic_lock(
        &self,
        txn: &DatabaseTransaction,
        table: &TableRef,
        id: i64,
        updates: Vec<(String, Value)>,
        expected_version: i64,
    ) -> DbResult<u64> {
        let engine = self.pool.engine();

        let mut assignments = vec![format!(
            "{} = {}",
            engine.quote_ident(&table.version_column),
            engine.placeholder(1)
        )];
        let mut values: Vec<Value> = vec![(expected_version + 1).into()];
        for (column, value) in updates {
            values.push(value);
            assignments.push(format!(
                "{} = {}",
                engine.quote_ident(&column),
                engine.placeholder(values.len())
            ));
        }
        values.push(id.into());
        let id_ph = engine.placeholder(values.len());
        values.push(expected_version.into());
        let version_ph = engine.placeholder(values.len());

        let sql = format!(
            "UPDATE {} SET {} WHERE {} = {} AND {} = {}",
            engine.quote_ident(&table.name),
            assignments.join(", "),
            engine.quote_ident(&table.primary_key),
            id_ph,
            engine.quote_ident(&table.version_column),
            version_ph
        );

        let stmt = Statement::from_sql_and_values(txn.get_database_backend(), sql, values);
        let result = txn.execute_raw(stmt).await.map_err(|e| self.translate(DbError::Connection(e)))?;

        if result.rows_affected() == 0 {
            return Err(ConcurrencyError::optimistic_lock(&table.name, id, expected_version).into());
        }
        Ok(result.rows_affected())
    }
}
