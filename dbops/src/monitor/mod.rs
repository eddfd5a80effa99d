// Copyright (c) 2025 Kirky.X
//
// Licensed under the MIT License
// See LICENSE file in the project root for full license information.

//! 事务监控模块
//!
//! 读取引擎的运行时事务与锁视图：
//! - 活跃事务、长事务、锁等待
//! - 最近一次死锁
//! - 健康判定与可选的自动终止
//!
//! 引擎不提供相应视图时（例如 SQLite）返回空结果。

mod deadlock;
mod health;
mod service;

pub use deadlock::{DeadlockParser, DeadlockReport, InnoDbDeadlockParser, parse_server_time};
pub use health::{HealthInputs, HealthIssue, HealthStatus, TransactionHealth};
pub use service::{MonitorHandle, MonitorService};

use parking_lot::Mutex;
use sea_orm::{ConnectionTrait, FromQueryResult, JsonValue, Statement};
use serde::Serialize;
use std::collections::HashSet;
use std::sync::Arc;
use tracing::{debug, error, warn};

use crate::config::DbResult;
use crate::engine::{DeadlockSource, row};
use crate::instrument::log_and_continue;
use crate::pool::DbPool;

/// 活跃事务
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ActiveTransaction {
    /// 事务 ID
    pub id: String,
    /// 线程/会话 ID
    pub thread_id: Option<i64>,
    /// 用户
    pub user: Option<String>,
    /// 开始时间
    pub start_time: Option<String>,
    /// 状态
    pub state: Option<String>,
    /// 已持续时间（秒）
    pub duration_sec: i64,
    /// 持有的锁数量
    pub lock_count: i64,
    /// 是否在等待锁
    pub waiting_for_lock: bool,
    /// 当前语句
    pub query: Option<String>,
}

impl ActiveTransaction {
    fn from_row(r: &JsonValue) -> Self {
        Self {
            id: row::str(r, "id").unwrap_or_default(),
            thread_id: row::i64(r, "thread_id"),
            user: row::str(r, "user"),
            start_time: row::str(r, "start_time"),
            state: row::str(r, "state"),
            duration_sec: row::i64(r, "duration_sec").unwrap_or(0),
            lock_count: row::i64(r, "lock_count").unwrap_or(0),
            waiting_for_lock: row::bool(r, "waiting_for_lock"),
            query: row::str(r, "query"),
        }
    }
}

/// 锁等待（等待者指向阻塞者的一条边）
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LockWait {
    /// 等待方事务 ID
    pub requesting_trx_id: String,
    /// 等待方线程 ID
    pub requesting_thread_id: Option<i64>,
    /// 等待方语句
    pub requesting_query: Option<String>,
    /// 已等待时间（秒）
    pub wait_time_sec: i64,
    /// 阻塞方事务 ID
    pub blocking_trx_id: String,
    /// 阻塞方线程 ID
    pub blocking_thread_id: Option<i64>,
    /// 阻塞方事务已持续时间（秒）
    pub blocking_trx_age_sec: i64,
    /// 阻塞方语句
    pub blocking_query: Option<String>,
    /// 被锁的表
    pub lock_table: Option<String>,
}

impl LockWait {
    fn from_row(r: &JsonValue) -> Self {
        Self {
            requesting_trx_id: row::str(r, "requesting_trx_id").unwrap_or_default(),
            requesting_thread_id: row::i64(r, "requesting_thread_id"),
            requesting_query: row::str(r, "requesting_query"),
            wait_time_sec: row::i64(r, "wait_time_sec").unwrap_or(0),
            blocking_trx_id: row::str(r, "blocking_trx_id").unwrap_or_default(),
            blocking_thread_id: row::i64(r, "blocking_thread_id"),
            blocking_trx_age_sec: row::i64(r, "blocking_trx_age_sec").unwrap_or(0),
            blocking_query: row::str(r, "blocking_query"),
            lock_table: row::str(r, "lock_table"),
        }
    }
}

/// 死锁信息
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DeadlockInfo {
    /// 原始诊断文本
    pub raw: String,
    /// 解析结果
    pub report: Option<DeadlockReport>,
    /// 是否发生在近期窗口内
    pub recent: bool,
}

/// 被终止的事务
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct KilledTransaction {
    /// 事务 ID
    pub id: String,
    /// 线程 ID
    pub thread_id: i64,
    /// 已持续时间（秒）
    pub duration_sec: i64,
}

/// 自动管理结果
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AutoManageReport {
    /// 自动终止未启用
    pub skipped: bool,
    /// 已终止
    pub killed: Vec<KilledTransaction>,
    /// 终止失败数
    pub failed: usize,
}

/// 事务监控器
#[derive(Debug)]
pub struct TransactionMonitor {
    pool: DbPool,
    deadlock_parser: Arc<dyn DeadlockParser>,
    last_deadlock_count: Mutex<Option<i64>>,
}

impl TransactionMonitor {
    /// 创建监控器，使用 InnoDB 死锁解析器
    pub fn new(pool: DbPool) -> Self {
        Self::with_parser(pool, Arc::new(InnoDbDeadlockParser))
    }

    /// 使用自定义死锁解析器
    pub fn with_parser(pool: DbPool, deadlock_parser: Arc<dyn DeadlockParser>) -> Self {
        Self {
            pool,
            deadlock_parser,
            last_deadlock_count: Mutex::new(None),
        }
    }

    /// 所属连接池
    pub fn pool(&self) -> &DbPool {
        &self.pool
    }

    async fn fetch(&self, sql: String) -> DbResult<Vec<JsonValue>> {
        let conn = self.pool.connection();
        let stmt = Statement::from_string(conn.get_database_backend(), sql);
        Ok(JsonValue::find_by_statement(stmt).all(conn).await?)
    }

    /// 活跃事务
    pub async fn get_active_transactions(&self) -> DbResult<Vec<ActiveTransaction>> {
        let Some(sql) = self.pool.engine().active_transactions_sql() else {
            return Ok(Vec::new());
        };
        let rows = self.fetch(sql).await?;
        Ok(rows.iter().map(ActiveTransaction::from_row).collect())
    }

    /// 持续时间超过 `threshold_sec` 的事务
    pub async fn get_long_running_transactions(&self, threshold_sec: u64) -> DbResult<Vec<ActiveTransaction>> {
        let threshold = i64::try_from(threshold_sec).unwrap_or(i64::MAX);
        Ok(self
            .get_active_transactions()
            .await?
            .into_iter()
            .filter(|t| t.duration_sec > threshold)
            .collect())
    }

    /// 锁等待
    pub async fn get_transaction_lock_waits(&self) -> DbResult<Vec<LockWait>> {
        let Some(sql) = self.pool.engine().lock_waits_sql() else {
            return Ok(Vec::new());
        };
        let rows = self.fetch(sql).await?;
        Ok(rows.iter().map(LockWait::from_row).collect())
    }

    /// 最近一次死锁
    ///
    /// 计数器来源的引擎以“自上次观察以来计数增加”判定近期死锁，首次观察只建立基线。
    pub async fn get_deadlock_info(&self) -> DbResult<Option<DeadlockInfo>> {
        let window = self.pool.config().monitoring.health.deadlock_recent_window_sec;

        match self.pool.engine().deadlock_source() {
            None => Ok(None),
            Some(DeadlockSource::StatusText { sql, column, clock_sql }) => {
                let rows = self.fetch(sql).await?;
                let Some(raw) = rows.first().and_then(|r| row::str(r, column)) else {
                    return Ok(None);
                };
                let Some(report) = self.deadlock_parser.parse(&raw) else {
                    return Ok(None);
                };
                let server_now = log_and_continue("read server clock", self.fetch(clock_sql).await)
                    .and_then(|rows| rows.first().and_then(|r| row::str(r, "server_now")))
                    .and_then(|now| parse_server_time(&now));
                let recent = server_now
                    .and_then(|now| report.age_sec(now))
                    .is_some_and(|age| age >= 0 && age as u64 <= window);
                Ok(Some(DeadlockInfo {
                    raw,
                    report: Some(report),
                    recent,
                }))
            }
            Some(DeadlockSource::Counter { sql }) => {
                let rows = self.fetch(sql).await?;
                let Some(count) = rows.first().and_then(|r| row::i64(r, "deadlocks")) else {
                    return Ok(None);
                };
                let previous = self.last_deadlock_count.lock().replace(count);
                let recent = previous.is_some_and(|p| count > p);
                if count == 0 {
                    return Ok(None);
                }
                Ok(Some(DeadlockInfo {
                    raw: format!("deadlocks={}", count),
                    report: None,
                    recent,
                }))
            }
        }
    }

    /// 事务健康报告
    ///
    /// 任一数据源查询失败时按空结果处理并记录警告。
    pub async fn get_transaction_health(&self) -> TransactionHealth {
        let monitoring = &self.pool.config().monitoring;

        let active = log_and_continue("query active transactions", self.get_active_transactions().await)
            .unwrap_or_default();
        let lock_waits = log_and_continue("query lock waits", self.get_transaction_lock_waits().await)
            .unwrap_or_default();
        let deadlock = log_and_continue("query deadlock info", self.get_deadlock_info().await).flatten();

        let threshold = i64::try_from(monitoring.long_running_threshold_sec).unwrap_or(i64::MAX);
        let long_running = active.iter().filter(|t| t.duration_sec > threshold).count();
        let waiting: HashSet<&str> = lock_waits.iter().map(|w| w.requesting_trx_id.as_str()).collect();
        let average_duration_sec = if active.is_empty() {
            0.0
        } else {
            active.iter().map(|t| t.duration_sec as f64).sum::<f64>() / active.len() as f64
        };

        let health = TransactionHealth::evaluate(
            HealthInputs {
                active: active.len(),
                long_running,
                lock_waits: waiting.len(),
                recent_deadlock: deadlock.is_some_and(|d| d.recent),
                average_duration_sec,
            },
            &monitoring.health,
        );

        debug!(status = ?health.status, issues = health.issues.len(), "Transaction health evaluated");
        health
    }

    /// 终止超过自动终止阈值的事务（默认关闭）
    pub async fn auto_manage_transactions(&self) -> DbResult<AutoManageReport> {
        let monitoring = &self.pool.config().monitoring;
        if !monitoring.auto_kill_enabled {
            debug!("Auto-kill disabled, skipping transaction management");
            return Ok(AutoManageReport {
                skipped: true,
                ..AutoManageReport::default()
            });
        }

        let engine = self.pool.engine();
        let mut report = AutoManageReport::default();

        for tx in self
            .get_long_running_transactions(monitoring.auto_kill_threshold_sec)
            .await?
        {
            let Some(thread_id) = tx.thread_id else {
                continue;
            };
            let Some(sql) = engine.kill_sql(thread_id) else {
                continue;
            };

            warn!(
                transaction_id = %tx.id,
                thread_id = thread_id,
                duration_sec = tx.duration_sec,
                "Killing transaction over auto-kill threshold"
            );
            match self.pool.connection().execute_unprepared(&sql).await {
                Ok(_) => report.killed.push(KilledTransaction {
                    id: tx.id,
                    thread_id,
                    duration_sec: tx.duration_sec,
                }),
                Err(e) => {
                    error!(transaction_id = %tx.id, error = %e, "Failed to kill transaction");
                    report.failed += 1;
                }
            }
        }

        Ok(report)
    }
}
