// Copyright (c) 2025 Kirky.X
//
// Licensed under the MIT License
// See LICENSE file in the project root for full license information.

//! 周期性监控任务
//!
//! 每个采集周期依次执行：刷新连接池指标、清扫事务跟踪表、评估事务健康、
//! 自动终止（启用时）、写入性能指标日志。

use std::sync::Arc;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{info, warn};

use super::{HealthStatus, TransactionMonitor};
use crate::instrument::log_and_continue;

/// 监控服务
#[derive(Debug, Clone)]
pub struct MonitorService {
    monitor: Arc<TransactionMonitor>,
}

impl MonitorService {
    /// 创建服务
    pub fn new(monitor: Arc<TransactionMonitor>) -> Self {
        Self { monitor }
    }

    /// 执行一次采集
    pub async fn collect_once(&self) {
        let pool = self.monitor.pool();
        let instrumentation = pool.instrumentation();
        let config = instrumentation.config();

        if !config.enabled {
            return;
        }

        let snapshot = instrumentation.get_performance_metrics();
        tracing::debug!(
            total_queries = snapshot.total_queries,
            slow_queries = snapshot.slow_queries,
            active_transactions = snapshot.transaction_stats.active,
            "Collected performance metrics"
        );

        if config.monitor_transactions {
            let sweep = instrumentation.sweep_transactions();
            if !sweep.removed.is_empty() {
                warn!(removed = sweep.removed.len(), "Removed tracked transactions over auto-kill threshold");
            }

            let health = self.monitor.get_transaction_health().await;
            if health.status != HealthStatus::Healthy {
                for issue in &health.issues {
                    warn!(
                        severity = ?issue.severity,
                        issue = %issue.message,
                        recommendation = %issue.recommendation,
                        "Transaction health issue"
                    );
                }
            }

            if config.auto_kill_enabled {
                if let Some(report) =
                    log_and_continue("auto-manage transactions", self.monitor.auto_manage_transactions().await)
                {
                    if !report.killed.is_empty() {
                        info!(killed = report.killed.len(), failed = report.failed, "Auto-managed transactions");
                    }
                }
            }
        }

        log_and_continue(
            "write performance metrics log",
            instrumentation.write_performance_snapshot(),
        );
    }

    /// 启动后台任务
    pub fn start(self) -> MonitorHandle {
        let interval = self.monitor.pool().config().monitoring.collection_interval();
        let (shutdown_tx, mut shutdown_rx) = watch::channel(false);

        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            info!(interval_ms = interval.as_millis() as u64, "Monitor service started");

            loop {
                tokio::select! {
                    _ = ticker.tick() => self.collect_once().await,
                    changed = shutdown_rx.changed() => {
                        if changed.is_err() || *shutdown_rx.borrow() {
                            break;
                        }
                    }
                }
            }

            info!("Monitor service stopped");
        });

        MonitorHandle {
            shutdown: shutdown_tx,
            task: Some(task),
        }
    }
}

/// 监控任务句柄
///
/// 调用 [`MonitorHandle::shutdown`] 或丢弃句柄都会停止后台任务。
#[derive(Debug)]
pub struct MonitorHandle {
    shutdown: watch::Sender<bool>,
    task: Option<JoinHandle<()>>,
}

impl MonitorHandle {
    /// 停止后台任务并等待其退出
    pub async fn shutdown(mut self) {
        let _ = self.shutdown.send(true);
        if let Some(task) = self.task.take() {
            if let Err(e) = task.await {
                warn!(error = %e, "Monitor task ended abnormally");
            }
        }
    }

    /// 后台任务是否已结束
    pub fn is_finished(&self) -> bool {
        self.task.as_ref().is_none_or(|t| t.is_finished())
    }
}

impl Drop for MonitorHandle {
    fn drop(&mut self) {
        let _ = self.shutdown.send(true);
    }
}
