// Copyright (c) 2025 Kirky.X
//
// Licensed under the MIT License
// See LICENSE file in the project root for full license information.

//! 查询埋点模块
//!
//! 为任意查询计时并写入指标存储；超过慢查询阈值时追加慢查询日志。
//! 埋点自身永远不会让业务调用失败，所有写日志错误都经由 [`log_and_continue`] 吞掉。

pub mod log_file;

use std::fmt::Display;
use std::future::Future;
use std::sync::Arc;
use std::time::Instant;

use crate::config::MonitoringConfig;
use crate::metrics::{MetricsSnapshot, MetricsStore, SweepReport, timestamp_now};
use crate::pool::PoolGauge;

pub use log_file::{AppendLog, PerformanceLog, SlowQueryLog};

/// 记录错误并继续
///
/// 成功时返回 `Some(value)`；失败时以 warn 级别记录上下文和错误，返回 `None`。
pub fn log_and_continue<T, E: Display>(context: &str, result: Result<T, E>) -> Option<T> {
    match result {
        Ok(value) => Some(value),
        Err(e) => {
            tracing::warn!(context = context, error = %e, "Ignoring non-fatal failure");
            None
        }
    }
}

/// 查询埋点
#[derive(Debug, Clone)]
pub struct QueryInstrumentation {
    metrics: Arc<MetricsStore>,
    config: Arc<MonitoringConfig>,
    slow_log: Arc<SlowQueryLog>,
    performance_log: Arc<PerformanceLog>,
    pool_gauge: Option<Arc<PoolGauge>>,
}

impl QueryInstrumentation {
    /// 创建埋点
    pub fn new(metrics: Arc<MetricsStore>, config: MonitoringConfig) -> Self {
        let slow_log = SlowQueryLog::new(config.slow_query_log_path(), config.max_log_bytes);
        let performance_log = PerformanceLog::new(config.performance_log_path(), config.max_log_bytes);
        Self {
            metrics,
            config: Arc::new(config),
            slow_log: Arc::new(slow_log),
            performance_log: Arc::new(performance_log),
            pool_gauge: None,
        }
    }

    /// 关联连接池计数器，读取快照前刷新连接池状态
    pub fn with_pool_gauge(mut self, gauge: Arc<PoolGauge>) -> Self {
        self.pool_gauge = Some(gauge);
        self
    }

    /// 监控配置
    pub fn config(&self) -> &MonitoringConfig {
        &self.config
    }

    /// 指标存储
    pub fn metrics(&self) -> &Arc<MetricsStore> {
        &self.metrics
    }

    /// 慢查询日志
    pub fn slow_log(&self) -> &SlowQueryLog {
        &self.slow_log
    }

    /// 记录一次查询
    ///
    /// `elapsed_ms` 严格大于慢查询阈值时写入慢查询日志并计为慢查询；
    /// 带有错误时计入错误数并记录标签与错误信息。
    pub fn record_query_performance(&self, label: &str, elapsed_ms: f64, error: Option<&dyn Display>) {
        if !self.config.queries_enabled() {
            return;
        }

        let slow = elapsed_ms > self.config.slow_query_threshold_ms as f64;
        self.metrics.record_query(elapsed_ms, slow, error.is_some());

        if slow {
            tracing::warn!(query = label, elapsed_ms = elapsed_ms, "Slow query detected");
            log_and_continue(
                "append slow query log",
                self.slow_log.append(&timestamp_now(), elapsed_ms, label),
            );
        }

        if let Some(e) = error {
            tracing::error!(query = label, error = %e, "Query failed");
        }
    }

    /// 计时执行一个查询
    ///
    /// 返回原始结果，错误不做任何转换。
    pub async fn instrument<T, E, F>(&self, label: &str, fut: F) -> Result<T, E>
    where
        E: Display,
        F: Future<Output = Result<T, E>>,
    {
        let start = Instant::now();
        let result = fut.await;
        let elapsed_ms = start.elapsed().as_secs_f64() * 1000.0;

        match &result {
            Ok(_) => self.record_query_performance(label, elapsed_ms, None),
            Err(e) => self.record_query_performance(label, elapsed_ms, Some(e as &dyn Display)),
        }
        result
    }

    /// 开始跟踪事务
    pub fn start_transaction_tracking(&self, id: &str, query_label: &str) {
        if self.config.transactions_enabled() {
            self.metrics.start_transaction(id, query_label);
        }
    }

    /// 结束跟踪事务
    pub fn end_transaction_tracking(&self, id: &str, committed: bool) {
        if self.config.transactions_enabled() {
            if let Some(elapsed) = self.metrics.end_transaction(id, committed) {
                tracing::debug!(
                    transaction_id = id,
                    committed = committed,
                    elapsed_ms = elapsed.as_millis() as u64,
                    "Transaction finished"
                );
            }
        }
    }

    /// 获取指标快照
    pub fn get_performance_metrics(&self) -> MetricsSnapshot {
        if self.config.monitor_pool {
            if let Some(gauge) = &self.pool_gauge {
                self.metrics.update_pool_stats(gauge.status());
            }
        }
        self.metrics.snapshot()
    }

    /// 清扫事务跟踪表
    ///
    /// 仅在启用自动终止时移除超过自动终止阈值的条目。
    pub fn sweep_transactions(&self) -> SweepReport {
        let auto_kill = self
            .config
            .auto_kill_enabled
            .then_some(self.config.auto_kill_threshold_sec);
        self.metrics
            .sweep_tracked_transactions(self.config.long_running_threshold_sec, auto_kill)
    }

    /// 写入一行性能指标日志（`log_metrics` 关闭时跳过）
    pub fn write_performance_snapshot(&self) -> std::io::Result<()> {
        if !self.config.log_metrics {
            return Ok(());
        }
        let snapshot = self.get_performance_metrics();
        self.performance_log.append(&timestamp_now(), &snapshot)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn instrumentation(dir: &std::path::Path, threshold_ms: u64) -> QueryInstrumentation {
        let config = MonitoringConfig {
            slow_query_threshold_ms: threshold_ms,
            log_dir: dir.to_path_buf(),
            ..MonitoringConfig::default()
        };
        QueryInstrumentation::new(Arc::new(MetricsStore::new()), config)
    }

    /// TEST-U-050: 超过阈值时写慢查询日志
    #[test]
    fn test_slow_query_is_logged() {
        let dir = tempfile::tempdir().expect("tempdir");
        let inst = instrumentation(dir.path(), 100);

        inst.record_query_performance("SELECT * FROM orders", 250.0, None);
        inst.record_query_performance("SELECT 1", 100.0, None);

        let snapshot = inst.get_performance_metrics();
        assert_eq!(snapshot.total_queries, 2);
        assert_eq!(snapshot.slow_queries, 1);

        let content = inst.slow_log().read_to_string().expect("read");
        assert!(content.contains("elapsed: 250ms\nSELECT * FROM orders\n\n"));
        assert!(!content.contains("SELECT 1"));
    }

    /// TEST-U-051: 错误计数
    #[test]
    fn test_error_is_counted() {
        let dir = tempfile::tempdir().expect("tempdir");
        let inst = instrumentation(dir.path(), 1000);

        inst.record_query_performance("UPDATE t", 3.0, Some(&"constraint failed"));
        assert_eq!(inst.get_performance_metrics().total_errors, 1);
    }

    /// TEST-U-052: 日志写入失败不影响调用方
    #[test]
    fn test_log_failure_is_swallowed() {
        let dir = tempfile::tempdir().expect("tempdir");
        let blocker = dir.path().join("not-a-dir");
        std::fs::write(&blocker, b"x").expect("write blocker");

        let inst = instrumentation(&blocker, 0);
        inst.record_query_performance("SELECT 1", 5.0, None);

        assert_eq!(inst.get_performance_metrics().slow_queries, 1);
    }

    /// TEST-U-053: 关闭查询监控时不记录
    #[test]
    fn test_disabled_monitoring_records_nothing() {
        let dir = tempfile::tempdir().expect("tempdir");
        let config = MonitoringConfig {
            monitor_queries: false,
            log_dir: dir.path().to_path_buf(),
            ..MonitoringConfig::default()
        };
        let inst = QueryInstrumentation::new(Arc::new(MetricsStore::new()), config);

        inst.record_query_performance("SELECT 1", 5000.0, None);
        assert_eq!(inst.get_performance_metrics().total_queries, 0);
    }

    /// TEST-U-054: instrument 透传原始结果
    #[tokio::test]
    async fn test_instrument_passes_result_through() {
        let dir = tempfile::tempdir().expect("tempdir");
        let inst = instrumentation(dir.path(), 1000);

        let ok: Result<u32, String> = inst.instrument("ok", async { Ok(7) }).await;
        let err: Result<u32, String> = inst.instrument("err", async { Err("boom".to_string()) }).await;

        assert_eq!(ok, Ok(7));
        assert_eq!(err, Err("boom".to_string()));
        let snapshot = inst.get_performance_metrics();
        assert_eq!(snapshot.total_queries, 2);
        assert_eq!(snapshot.total_errors, 1);
    }

    /// TEST-U-055: log_and_continue
    #[test]
    fn test_log_and_continue() {
        assert_eq!(log_and_continue::<_, String>("ok", Ok(1)), Some(1));
        assert_eq!(log_and_continue::<i32, _>("fail", Err("bad")), None);
    }

    /// TEST-U-056: 性能指标日志
    #[test]
    fn test_write_performance_snapshot() {
        let dir = tempfile::tempdir().expect("tempdir");
        let inst = instrumentation(dir.path(), 1000);
        inst.record_query_performance("SELECT 1", 1.0, None);

        inst.write_performance_snapshot().expect("write");
        let content = std::fs::read_to_string(dir.path().join("performance-metrics.log")).expect("read");
        assert!(content.starts_with('['));
        assert!(content.contains("\"totalQueries\":1"));
    }
}
