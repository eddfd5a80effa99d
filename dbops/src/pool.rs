// Copyright (c) 2025 Kirky.X
//
// Licensed under the MIT License
// See LICENSE file in the project root for full license information.

//! 连接池管理模块
//!
//! 在 Sea-ORM 连接池之上提供：
//! - 按配置修正后的连接参数创建连接
//! - 引擎适配器的自动选择
//! - 以 RAII 租约计量的活跃/等待连接数，供监控读取
//! - 共享的指标存储与查询埋点

use sea_orm::{ConnectOptions, ConnectionTrait, DatabaseBackend, DatabaseConnection, Statement};
use serde::Serialize;
use std::ops::Deref;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio::time::timeout;
use tracing::info;

use crate::config::{ConfigCorrector, DbConfig, DbError, DbResult};
use crate::engine::{EngineAdapter, adapter_for};
use crate::instrument::QueryInstrumentation;
use crate::metrics::MetricsStore;

/// 连接池状态
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PoolStatus {
    /// 当前连接数
    pub size: u32,
    /// 可立即获取的连接数
    pub available: u32,
    /// 等待获取连接的请求数
    pub pending: u32,
    /// 最大连接数
    pub max: u32,
    /// 最小连接数
    pub min: u32,
}

/// 连接租约计数器
///
/// 由连接池和查询埋点共享，用于读取实时连接池状态。
#[derive(Debug)]
pub struct PoolGauge {
    active: AtomicU32,
    pending: AtomicU32,
    max: u32,
    min: u32,
}

impl PoolGauge {
    /// 创建计数器
    pub fn new(max: u32, min: u32) -> Self {
        Self {
            active: AtomicU32::new(0),
            pending: AtomicU32::new(0),
            max,
            min,
        }
    }

    /// 读取当前状态
    pub fn status(&self) -> PoolStatus {
        let active = self.active.load(Ordering::SeqCst);
        PoolStatus {
            size: active.max(self.min),
            available: self.max.saturating_sub(active),
            pending: self.pending.load(Ordering::SeqCst),
            max: self.max,
            min: self.min,
        }
    }
}

/// 连接池管理器
#[derive(Clone)]
pub struct DbPool {
    inner: Arc<DbPoolInner>,
}

struct DbPoolInner {
    /// 修正后的配置
    config: DbConfig,

    /// Sea-ORM 连接（内部自带连接池）
    connection: DatabaseConnection,

    /// 引擎适配器
    engine: Arc<dyn EngineAdapter>,

    /// 租约许可
    permits: Arc<Semaphore>,

    /// 租约计数
    gauge: Arc<PoolGauge>,

    /// 指标存储
    metrics: Arc<MetricsStore>,

    /// 查询埋点
    instrumentation: QueryInstrumentation,
}

impl std::fmt::Debug for DbPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DbPool")
            .field("engine", &self.inner.engine.name())
            .field("status", &self.status())
            .finish()
    }
}

impl DbPool {
    /// 使用默认配置创建连接池
    pub async fn new(url: &str) -> DbResult<Self> {
        Self::with_config(DbConfig::with_url(url)).await
    }

    /// 使用配置创建连接池（带自动修正）
    pub async fn with_config(config: DbConfig) -> DbResult<Self> {
        let metrics = Arc::new(MetricsStore::new());
        Self::with_metrics(config, metrics).await
    }

    /// 使用外部指标存储创建连接池
    pub async fn with_metrics(config: DbConfig, metrics: Arc<MetricsStore>) -> DbResult<Self> {
        let config = ConfigCorrector::auto_correct(config);
        config.validate()?;

        let mut options = ConnectOptions::new(config.url.clone());
        options
            .max_connections(config.max_connections)
            .min_connections(config.min_connections)
            .idle_timeout(config.idle_timeout_duration())
            .acquire_timeout(config.acquire_timeout_duration())
            .sqlx_logging(false);

        let connection = sea_orm::Database::connect(options).await.map_err(DbError::Connection)?;
        let engine = adapter_for(connection.get_database_backend());

        let gauge = Arc::new(PoolGauge::new(config.max_connections, config.min_connections));
        let instrumentation =
            QueryInstrumentation::new(metrics.clone(), config.monitoring.clone()).with_pool_gauge(gauge.clone());

        info!(
            engine = engine.name(),
            max_connections = config.max_connections,
            min_connections = config.min_connections,
            "Connection pool initialized"
        );

        Ok(Self {
            inner: Arc::new(DbPoolInner {
                permits: Arc::new(Semaphore::new(config.max_connections as usize)),
                config,
                connection,
                engine,
                gauge,
                metrics,
                instrumentation,
            }),
        })
    }

    /// 获取一个连接租约
    ///
    /// 超过 `acquire_timeout` 仍未获得许可时返回连接获取超时错误。
    pub async fn acquire(&self) -> DbResult<PooledConnection> {
        self.inner.gauge.pending.fetch_add(1, Ordering::SeqCst);
        let result = timeout(
            self.inner.config.acquire_timeout_duration(),
            self.inner.permits.clone().acquire_owned(),
        )
        .await;
        self.inner.gauge.pending.fetch_sub(1, Ordering::SeqCst);

        let permit = match result {
            Ok(Ok(permit)) => permit,
            Ok(Err(_)) | Err(_) => {
                return Err(DbError::Connection(sea_orm::DbErr::ConnectionAcquire(
                    sea_orm::ConnAcquireErr::Timeout,
                )));
            }
        };

        self.inner.gauge.active.fetch_add(1, Ordering::SeqCst);
        Ok(PooledConnection {
            pool: self.inner.clone(),
            _permit: permit,
        })
    }

    /// 底层连接（不计入租约）
    pub fn connection(&self) -> &DatabaseConnection {
        &self.inner.connection
    }

    /// 引擎适配器
    pub fn engine(&self) -> Arc<dyn EngineAdapter> {
        self.inner.engine.clone()
    }

    /// 数据库后端
    pub fn backend(&self) -> DatabaseBackend {
        self.inner.connection.get_database_backend()
    }

    /// 指标存储
    pub fn metrics(&self) -> Arc<MetricsStore> {
        self.inner.metrics.clone()
    }

    /// 查询埋点
    pub fn instrumentation(&self) -> &QueryInstrumentation {
        &self.inner.instrumentation
    }

    /// 获取配置
    pub fn config(&self) -> &DbConfig {
        &self.inner.config
    }

    /// 获取连接池状态
    pub fn status(&self) -> PoolStatus {
        self.inner.gauge.status()
    }

    /// 检查连接健康状态
    ///
    /// 执行 `SELECT 1`，5 秒内无结果视为不健康。
    pub async fn check_connection_health(&self) -> bool {
        let stmt = Statement::from_string(self.backend(), "SELECT 1".to_string());
        match timeout(Duration::from_secs(5), self.inner.connection.execute_raw(stmt)).await {
            Ok(Ok(_)) => {
                tracing::debug!("Connection health check passed");
                true
            }
            Ok(Err(e)) => {
                tracing::warn!("Connection health check failed: {}", e);
                false
            }
            Err(_) => {
                tracing::warn!("Connection health check timed out");
                false
            }
        }
    }
}

/// 连接租约
///
/// 持有期间计为一个活跃连接，离开作用域时自动归还。
pub struct PooledConnection {
    pool: Arc<DbPoolInner>,
    _permit: OwnedSemaphorePermit,
}

impl Deref for PooledConnection {
    type Target = DatabaseConnection;

    fn deref(&self) -> &Self::Target {
        &self.pool.connection
    }
}

impl Drop for PooledConnection {
    fn drop(&mut self) {
        // 使用 fetch_update 防止计数变成负数
        let _ = self
            .pool
            .gauge
            .active
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |c| Some(c.saturating_sub(1)));
    }
}
