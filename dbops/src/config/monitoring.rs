// Copyright (c) 2025 Kirky.X
//
// Licensed under the MIT License
// See LICENSE file in the project root for full license information.

//! 监控配置
//!
//! 慢查询阈值、长事务阈值、自动终止开关、采集周期和健康判定阈值。
//! 嵌套在 [`DbConfig`](super::DbConfig) 的 `monitoring` 段中，可被 `DBOPS_*` 环境变量覆盖。

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

use super::{ConfigError, env_or};

/// 事务健康判定阈值
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct HealthThresholds {
    /// 长事务数量超过该值判定为 critical
    pub critical_long_running: usize,
    /// 锁等待数量超过该值判定为 critical
    pub critical_lock_waits: usize,
    /// 平均事务时长（秒）超过该值判定为 warning
    pub warning_avg_duration_sec: f64,
    /// 在该窗口（秒）内发生的死锁视为“最近发生”
    pub deadlock_recent_window_sec: u64,
}

impl Default for HealthThresholds {
    fn default() -> Self {
        Self {
            critical_long_running: 5,
            critical_lock_waits: 3,
            warning_avg_duration_sec: 10.0,
            deadlock_recent_window_sec: 3600,
        }
    }
}

/// 监控配置
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct MonitoringConfig {
    /// 总开关
    pub enabled: bool,
    /// 慢查询阈值（毫秒）
    pub slow_query_threshold_ms: u64,
    /// 批量写入单批上限
    pub bulk_operation_limit: usize,
    /// 长事务阈值（秒）
    pub long_running_threshold_sec: u64,
    /// 自动终止阈值（秒）
    pub auto_kill_threshold_sec: u64,
    /// 是否启用自动终止
    pub auto_kill_enabled: bool,
    /// 采集间隔（毫秒）
    pub collection_interval_ms: u64,
    /// 是否采集连接池状态
    pub monitor_pool: bool,
    /// 是否记录查询
    pub monitor_queries: bool,
    /// 是否跟踪事务
    pub monitor_transactions: bool,
    /// 是否写入性能指标日志
    pub log_metrics: bool,
    /// 日志目录
    pub log_dir: PathBuf,
    /// 单个日志文件的轮转上限（字节）
    pub max_log_bytes: u64,
    /// 慢查询分析窗口大小
    pub slow_query_window: usize,
    /// 超过该行数的表在分页时可使用估算计数
    pub count_estimation_threshold: u64,
    /// 是否对无使用记录的索引建议 DROP
    pub recommend_unused_index_drops: bool,
    /// 健康判定阈值
    pub health: HealthThresholds,
}

impl Default for MonitoringConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            slow_query_threshold_ms: 1000,
            bulk_operation_limit: 1000,
            long_running_threshold_sec: 60,
            auto_kill_threshold_sec: 300,
            auto_kill_enabled: false,
            collection_interval_ms: 60_000,
            monitor_pool: true,
            monitor_queries: true,
            monitor_transactions: true,
            log_metrics: true,
            log_dir: PathBuf::from("logs"),
            max_log_bytes: 10 * 1024 * 1024,
            slow_query_window: 50,
            count_estimation_threshold: 100_000,
            recommend_unused_index_drops: false,
            health: HealthThresholds::default(),
        }
    }
}

impl MonitoringConfig {
    /// 应用 `DBOPS_*` 环境变量覆盖
    ///
    /// # Errors
    ///
    /// 环境变量值无法解析时返回错误
    pub fn with_env_overrides(mut self) -> Result<Self, ConfigError> {
        self.enabled = env_or("DBOPS_MONITORING_ENABLED", self.enabled)?;
        self.slow_query_threshold_ms = env_or("DBOPS_SLOW_QUERY_THRESHOLD_MS", self.slow_query_threshold_ms)?;
        self.bulk_operation_limit = env_or("DBOPS_BULK_OPERATION_LIMIT", self.bulk_operation_limit)?;
        self.long_running_threshold_sec = env_or("DBOPS_LONG_RUNNING_THRESHOLD_SEC", self.long_running_threshold_sec)?;
        self.auto_kill_threshold_sec = env_or("DBOPS_AUTO_KILL_THRESHOLD_SEC", self.auto_kill_threshold_sec)?;
        self.auto_kill_enabled = env_or("DBOPS_AUTO_KILL_ENABLED", self.auto_kill_enabled)?;
        self.collection_interval_ms = env_or("DBOPS_COLLECTION_INTERVAL_MS", self.collection_interval_ms)?;
        self.log_metrics = env_or("DBOPS_LOG_METRICS", self.log_metrics)?;
        if let Ok(dir) = std::env::var("DBOPS_LOG_DIR") {
            self.log_dir = PathBuf::from(dir);
        }
        Ok(self)
    }

    /// 验证监控配置
    ///
    /// # Errors
    ///
    /// 阈值组合非法时返回 [`ConfigError::InvalidFormat`]
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.auto_kill_threshold_sec < self.long_running_threshold_sec {
            return Err(ConfigError::InvalidFormat(format!(
                "auto_kill_threshold_sec ({}) must not be below long_running_threshold_sec ({})",
                self.auto_kill_threshold_sec, self.long_running_threshold_sec
            )));
        }

        if self.bulk_operation_limit == 0 {
            return Err(ConfigError::InvalidFormat(
                "bulk_operation_limit must be greater than 0".to_string(),
            ));
        }

        if self.collection_interval_ms == 0 {
            return Err(ConfigError::InvalidFormat(
                "collection_interval_ms must be greater than 0".to_string(),
            ));
        }

        Ok(())
    }

    /// 采集间隔
    pub fn collection_interval(&self) -> Duration {
        Duration::from_millis(self.collection_interval_ms)
    }

    /// 查询记录是否生效
    pub fn queries_enabled(&self) -> bool {
        self.enabled && self.monitor_queries
    }

    /// 事务跟踪是否生效
    pub fn transactions_enabled(&self) -> bool {
        self.enabled && self.monitor_transactions
    }

    /// 慢查询日志路径
    pub fn slow_query_log_path(&self) -> PathBuf {
        self.log_dir.join("slow-queries.log")
    }

    /// 性能指标日志路径
    pub fn performance_log_path(&self) -> PathBuf {
        self.log_dir.join("performance-metrics.log")
    }
}
