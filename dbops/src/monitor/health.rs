// Copyright (c) 2025 Kirky.X
//
// Licensed under the MIT License
// See LICENSE file in the project root for full license information.

//! 事务健康判定

use serde::Serialize;

use crate::config::HealthThresholds;

/// 健康状态，按严重程度排序
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    /// 健康
    #[default]
    Healthy,
    /// 警告
    Warning,
    /// 严重
    Critical,
}

/// 单个问题及处理建议
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HealthIssue {
    /// 严重程度
    pub severity: HealthStatus,
    /// 问题描述
    pub message: String,
    /// 处理建议
    pub recommendation: String,
}

/// 判定输入
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct HealthInputs {
    /// 活跃事务数
    pub active: usize,
    /// 长事务数
    pub long_running: usize,
    /// 锁等待数
    pub lock_waits: usize,
    /// 近期是否发生死锁
    pub recent_deadlock: bool,
    /// 活跃事务平均持续时间（秒）
    pub average_duration_sec: f64,
}

/// 事务健康报告
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TransactionHealth {
    /// 总体状态
    pub status: HealthStatus,
    /// 活跃事务数
    pub active_transactions: usize,
    /// 长事务数
    pub long_running_transactions: usize,
    /// 锁等待数
    pub lock_waits: usize,
    /// 近期是否发生死锁
    pub recent_deadlock: bool,
    /// 活跃事务平均持续时间（秒）
    pub average_duration_sec: f64,
    /// 问题列表
    pub issues: Vec<HealthIssue>,
    /// 检查时间（RFC 3339）
    pub checked_at: String,
}

impl TransactionHealth {
    /// 根据输入与阈值判定健康状态
    pub fn evaluate(inputs: HealthInputs, thresholds: &HealthThresholds) -> Self {
        let mut issues = Vec::new();

        if inputs.long_running > thresholds.critical_long_running {
            issues.push(HealthIssue {
                severity: HealthStatus::Critical,
                message: format!("{} long-running transactions", inputs.long_running),
                recommendation: "Inspect the longest transactions, split large units of work and consider enabling auto-kill"
                    .to_string(),
            });
        } else if inputs.long_running > 0 {
            issues.push(HealthIssue {
                severity: HealthStatus::Warning,
                message: format!("{} long-running transactions", inputs.long_running),
                recommendation: "Review long-running transactions for missing commits or slow statements".to_string(),
            });
        }

        if inputs.lock_waits > thresholds.critical_lock_waits {
            issues.push(HealthIssue {
                severity: HealthStatus::Critical,
                message: format!("{} transactions waiting for locks", inputs.lock_waits),
                recommendation: "Identify blocking transactions and shorten the time locks are held".to_string(),
            });
        } else if inputs.lock_waits > 0 {
            issues.push(HealthIssue {
                severity: HealthStatus::Warning,
                message: format!("{} transactions waiting for locks", inputs.lock_waits),
                recommendation: "Check lock waits for hot rows and missing indexes on filtered columns".to_string(),
            });
        }

        if inputs.recent_deadlock {
            issues.push(HealthIssue {
                severity: HealthStatus::Critical,
                message: format!(
                    "Deadlock detected within the last {}s",
                    thresholds.deadlock_recent_window_sec
                ),
                recommendation: "Acquire row locks in a consistent order and keep transactions short".to_string(),
            });
        }

        if inputs.average_duration_sec > thresholds.warning_avg_duration_sec {
            issues.push(HealthIssue {
                severity: HealthStatus::Warning,
                message: format!(
                    "Average transaction duration {:.1}s exceeds {:.1}s",
                    inputs.average_duration_sec, thresholds.warning_avg_duration_sec
                ),
                recommendation: "Move non-database work out of transactions".to_string(),
            });
        }

        let status = issues.iter().map(|i| i.severity).max().unwrap_or_default();

        Self {
            status,
            active_transactions: inputs.active,
            long_running_transactions: inputs.long_running,
            lock_waits: inputs.lock_waits,
            recent_deadlock: inputs.recent_deadlock,
            average_duration_sec: inputs.average_duration_sec,
            issues,
            checked_at: crate::metrics::timestamp_now(),
        }
    }
}
