// Copyright (c) 2025 Kirky.X
//
// Licensed under the MIT License
// See LICENSE file in the project root for full license information.

//! 性能指标存储模块
//!
//! 进程内的查询与事务指标：
//! - **查询指标**: 总数、慢查询数、增量平均耗时、最大耗时、错误数
//! - **延迟分布**: 直方图统计
//! - **连接池指标**: 由查询埋点在读取快照前刷新
//! - **事务指标**: 活跃事务跟踪表、提交/回滚计数、平均持续时间
//!
//! 所有组件共享同一个 `Arc<MetricsStore>`，计数器只能通过 [`MetricsStore::reset`] 清零。

use parking_lot::Mutex;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use crate::pool::PoolStatus;

/// 当前 UTC 时间的 RFC 3339 表示
pub(crate) fn timestamp_now() -> String {
    time::OffsetDateTime::now_utc()
        .format(&time::format_description::well_known::Rfc3339)
        .unwrap_or_default()
}

/// 延迟直方图
#[derive(Debug)]
pub struct LatencyHistogram {
    /// 桶边界（毫秒）
    buckets: Vec<u64>,
    /// 每个桶的计数，最后一个为溢出桶
    counts: Vec<AtomicU64>,
    /// 总样本数
    total: AtomicU64,
}

impl LatencyHistogram {
    /// 创建新的延迟直方图
    ///
    /// # Arguments
    ///
    /// * `bucket_boundaries` - 桶边界定义（毫秒），如 [1, 5, 10, 50, 100, 500, 1000]
    pub fn new(bucket_boundaries: Vec<u64>) -> Self {
        let counts: Vec<_> = (0..bucket_boundaries.len() + 1).map(|_| AtomicU64::new(0)).collect();

        Self {
            buckets: bucket_boundaries,
            counts,
            total: AtomicU64::new(0),
        }
    }

    /// 记录一次延迟
    pub fn record(&self, elapsed_ms: f64) {
        let bucket_idx = self
            .buckets
            .iter()
            .position(|boundary| elapsed_ms <= *boundary as f64)
            .unwrap_or(self.buckets.len());

        self.counts[bucket_idx].fetch_add(1, Ordering::SeqCst);
        self.total.fetch_add(1, Ordering::SeqCst);
    }

    /// 获取直方图统计
    pub fn stats(&self) -> HistogramStats {
        let total = self.total.load(Ordering::SeqCst);
        let mut cumulative = 0u64;

        let buckets = self
            .buckets
            .iter()
            .copied()
            .chain(std::iter::once(u64::MAX))
            .zip(self.counts.iter())
            .map(|(boundary_ms, count)| {
                let count = count.load(Ordering::SeqCst);
                cumulative += count;
                HistogramBucket {
                    boundary_ms,
                    count,
                    cumulative_count: cumulative,
                    percentile: if total > 0 {
                        (cumulative as f64 / total as f64) * 100.0
                    } else {
                        0.0
                    },
                }
            })
            .collect();

        HistogramStats {
            total_samples: total,
            buckets,
        }
    }

    fn clear(&self) {
        for count in &self.counts {
            count.store(0, Ordering::SeqCst);
        }
        self.total.store(0, Ordering::SeqCst);
    }
}

/// 直方图桶统计
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HistogramBucket {
    /// 桶边界（毫秒），溢出桶为 `u64::MAX`
    pub boundary_ms: u64,
    /// 桶内样本数
    pub count: u64,
    /// 累计样本数
    pub cumulative_count: u64,
    /// 累计百分比
    pub percentile: f64,
}

/// 直方图统计
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HistogramStats {
    /// 总样本数
    pub total_samples: u64,
    /// 桶统计
    pub buckets: Vec<HistogramBucket>,
}

/// 事务统计
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TransactionStats {
    /// 正在跟踪的事务数
    pub active: u64,
    /// 已提交
    pub completed: u64,
    /// 已回滚
    pub rolled_back: u64,
    /// 平均持续时间（毫秒）
    pub average_duration_ms: f64,
}

/// 指标快照
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MetricsSnapshot {
    /// 查询总数
    pub total_queries: u64,
    /// 慢查询数
    pub slow_queries: u64,
    /// 平均查询耗时（毫秒）
    pub average_query_time_ms: f64,
    /// 最大查询耗时（毫秒）
    pub max_query_time_ms: f64,
    /// 错误总数
    pub total_errors: u64,
    /// 连接池状态
    pub pool_stats: PoolStatus,
    /// 事务统计
    pub transaction_stats: TransactionStats,
    /// 最后更新时间（RFC 3339）
    pub last_updated: String,
}

/// 被跟踪的事务
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TrackedTransaction {
    /// 事务 ID
    pub id: String,
    /// 查询标签
    pub query_label: String,
    /// 已持续时间（秒）
    pub age_sec: u64,
}

/// 跟踪表清扫结果
#[derive(Debug, Clone, Default)]
pub struct SweepReport {
    /// 超过长事务阈值的事务（包括被移除的）
    pub long_running: Vec<TrackedTransaction>,
    /// 超过自动终止阈值而被移除的事务
    pub removed: Vec<TrackedTransaction>,
}

#[derive(Debug, Default)]
struct QueryCounters {
    total: u64,
    slow: u64,
    average_ms: f64,
    max_ms: f64,
}

#[derive(Debug)]
struct TrackedEntry {
    started: Instant,
    query_label: String,
}

#[derive(Debug, Default)]
struct TransactionCounters {
    tracked: HashMap<String, TrackedEntry>,
    completed: u64,
    rolled_back: u64,
    average_duration_ms: f64,
}

/// 指标存储
#[derive(Debug)]
pub struct MetricsStore {
    queries: Mutex<QueryCounters>,
    errors: AtomicU64,
    histogram: LatencyHistogram,
    pool: Mutex<PoolStatus>,
    transactions: Mutex<TransactionCounters>,
    last_updated: Mutex<String>,
    start_time: Instant,
}

impl Default for MetricsStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MetricsStore {
    /// 创建新的指标存储
    pub fn new() -> Self {
        Self {
            queries: Mutex::new(QueryCounters::default()),
            errors: AtomicU64::new(0),
            histogram: LatencyHistogram::new(vec![1, 5, 10, 25, 50, 100, 250, 500, 1000, 5000]),
            pool: Mutex::new(PoolStatus::default()),
            transactions: Mutex::new(TransactionCounters::default()),
            last_updated: Mutex::new(timestamp_now()),
            start_time: Instant::now(),
        }
    }

    /// 记录一次查询
    ///
    /// 平均值按 `(avg*(n-1)+x)/n` 增量更新，总数、慢查询数与平均值在同一把锁内修改。
    pub fn record_query(&self, elapsed_ms: f64, slow: bool, failed: bool) {
        {
            let mut q = self.queries.lock();
            q.total += 1;
            let n = q.total as f64;
            q.average_ms = (q.average_ms * (n - 1.0) + elapsed_ms) / n;
            if elapsed_ms > q.max_ms {
                q.max_ms = elapsed_ms;
            }
            if slow {
                q.slow += 1;
            }
        }

        self.histogram.record(elapsed_ms);
        if failed {
            self.errors.fetch_add(1, Ordering::SeqCst);
        }
        self.touch();
    }

    /// 开始跟踪事务
    pub fn start_transaction(&self, id: &str, query_label: &str) {
        self.track_transaction(id, query_label, Instant::now());
    }

    fn track_transaction(&self, id: &str, query_label: &str, started: Instant) {
        self.transactions.lock().tracked.insert(
            id.to_string(),
            TrackedEntry {
                started,
                query_label: query_label.to_string(),
            },
        );
    }

    /// 结束跟踪事务，返回持续时间；未被跟踪的 ID 返回 `None` 且不计数
    pub fn end_transaction(&self, id: &str, committed: bool) -> Option<Duration> {
        let mut t = self.transactions.lock();
        let entry = t.tracked.remove(id)?;
        let elapsed = entry.started.elapsed();

        if committed {
            t.completed += 1;
        } else {
            t.rolled_back += 1;
        }
        let n = (t.completed + t.rolled_back) as f64;
        t.average_duration_ms = (t.average_duration_ms * (n - 1.0) + elapsed.as_secs_f64() * 1000.0) / n;
        drop(t);

        self.touch();
        Some(elapsed)
    }

    /// 当前被跟踪的事务
    pub fn tracked_transactions(&self) -> Vec<TrackedTransaction> {
        let t = self.transactions.lock();
        let mut out: Vec<_> = t
            .tracked
            .iter()
            .map(|(id, entry)| TrackedTransaction {
                id: id.clone(),
                query_label: entry.query_label.clone(),
                age_sec: entry.started.elapsed().as_secs(),
            })
            .collect();
        out.sort_by(|a, b| b.age_sec.cmp(&a.age_sec));
        out
    }

    /// 清扫跟踪表
    ///
    /// 超过 `long_running_sec` 的事务以 warn 事件上报；给出 `auto_kill_sec` 时，
    /// 超过该阈值的条目被移除并以 error 事件上报。
    pub fn sweep_tracked_transactions(&self, long_running_sec: u64, auto_kill_sec: Option<u64>) -> SweepReport {
        let mut report = SweepReport::default();

        for tx in self.tracked_transactions() {
            if tx.age_sec <= long_running_sec {
                continue;
            }
            tracing::warn!(
                transaction_id = %tx.id,
                query = %tx.query_label,
                age_sec = tx.age_sec,
                "Long-running transaction detected"
            );
            if auto_kill_sec.is_some_and(|limit| tx.age_sec > limit) {
                report.removed.push(tx.clone());
            }
            report.long_running.push(tx);
        }

        if !report.removed.is_empty() {
            let mut t = self.transactions.lock();
            for tx in &report.removed {
                t.tracked.remove(&tx.id);
                tracing::error!(
                    transaction_id = %tx.id,
                    age_sec = tx.age_sec,
                    "Transaction exceeded auto-kill threshold, removed from tracking"
                );
            }
        }

        report
    }

    /// 刷新连接池状态
    pub fn update_pool_stats(&self, status: PoolStatus) {
        *self.pool.lock() = status;
        self.touch();
    }

    /// 延迟直方图统计
    pub fn latency_histogram(&self) -> HistogramStats {
        self.histogram.stats()
    }

    /// 运行时长
    pub fn uptime(&self) -> Duration {
        self.start_time.elapsed()
    }

    /// 获取指标快照
    pub fn snapshot(&self) -> MetricsSnapshot {
        let (total_queries, slow_queries, average_query_time_ms, max_query_time_ms) = {
            let q = self.queries.lock();
            (q.total, q.slow, q.average_ms, q.max_ms)
        };
        let transaction_stats = {
            let t = self.transactions.lock();
            TransactionStats {
                active: t.tracked.len() as u64,
                completed: t.completed,
                rolled_back: t.rolled_back,
                average_duration_ms: t.average_duration_ms,
            }
        };

        MetricsSnapshot {
            total_queries,
            slow_queries,
            average_query_time_ms,
            max_query_time_ms,
            total_errors: self.errors.load(Ordering::SeqCst),
            pool_stats: *self.pool.lock(),
            transaction_stats,
            last_updated: self.last_updated.lock().clone(),
        }
    }

    /// 重置所有指标
    pub fn reset(&self) {
        *self.queries.lock() = QueryCounters::default();
        *self.transactions.lock() = TransactionCounters::default();
        *self.pool.lock() = PoolStatus::default();
        self.errors.store(0, Ordering::SeqCst);
        self.histogram.clear();
        self.touch();
    }

    fn touch(&self) {
        *self.last_updated.lock() = timestamp_now();
    }

    /// 导出为 Prometheus 文本格式
    #[cfg(feature = "metrics")]
    pub fn export_prometheus(&self) -> Result<String, prometheus::Error> {
        use prometheus::{Encoder, Gauge, GaugeVec, IntGauge, IntGaugeVec, Opts, Registry, TextEncoder};

        let snapshot = self.snapshot();
        let registry = Registry::new();

        let uptime = Gauge::new("dbops_uptime_seconds", "Seconds since the metrics store was created")?;
        uptime.set(self.uptime().as_secs_f64());
        registry.register(Box::new(uptime))?;

        let queries = IntGaugeVec::new(
            Opts::new("dbops_queries", "Recorded queries by outcome"),
            &["kind"],
        )?;
        queries.with_label_values(&["total"]).set(snapshot.total_queries as i64);
        queries.with_label_values(&["slow"]).set(snapshot.slow_queries as i64);
        queries.with_label_values(&["error"]).set(snapshot.total_errors as i64);
        registry.register(Box::new(queries))?;

        let query_time = GaugeVec::new(
            Opts::new("dbops_query_time_ms", "Query execution time in milliseconds"),
            &["stat"],
        )?;
        query_time.with_label_values(&["avg"]).set(snapshot.average_query_time_ms);
        query_time.with_label_values(&["max"]).set(snapshot.max_query_time_ms);
        registry.register(Box::new(query_time))?;

        let latency = IntGaugeVec::new(
            Opts::new("dbops_query_latency_bucket", "Cumulative query count per latency bucket"),
            &["le"],
        )?;
        for bucket in self.latency_histogram().buckets {
            let le = if bucket.boundary_ms == u64::MAX {
                "+Inf".to_string()
            } else {
                bucket.boundary_ms.to_string()
            };
            latency.with_label_values(&[le.as_str()]).set(bucket.cumulative_count as i64);
        }
        registry.register(Box::new(latency))?;

        let pool = IntGaugeVec::new(Opts::new("dbops_pool_connections", "Connection pool status"), &["state"])?;
        pool.with_label_values(&["size"]).set(i64::from(snapshot.pool_stats.size));
        pool.with_label_values(&["available"]).set(i64::from(snapshot.pool_stats.available));
        pool.with_label_values(&["pending"]).set(i64::from(snapshot.pool_stats.pending));
        pool.with_label_values(&["max"]).set(i64::from(snapshot.pool_stats.max));
        registry.register(Box::new(pool))?;

        let transactions = IntGaugeVec::new(
            Opts::new("dbops_transactions", "Tracked transactions by state"),
            &["state"],
        )?;
        let stats = &snapshot.transaction_stats;
        transactions.with_label_values(&["active"]).set(stats.active as i64);
        transactions.with_label_values(&["completed"]).set(stats.completed as i64);
        transactions.with_label_values(&["rolled_back"]).set(stats.rolled_back as i64);
        registry.register(Box::new(transactions))?;

        let avg_duration = Gauge::new(
            "dbops_transaction_duration_avg_ms",
            "Average transaction duration in milliseconds",
        )?;
        avg_duration.set(stats.average_duration_ms);
        registry.register(Box::new(avg_duration))?;

        let timestamp = IntGauge::new("dbops_metrics_timestamp", "Unix timestamp of the export")?;
        timestamp.set(time::OffsetDateTime::now_utc().unix_timestamp());
        registry.register(Box::new(timestamp))?;

        let mut buffer = Vec::new();
        TextEncoder::new().encode(&registry.gather(), &mut buffer)?;
        String::from_utf8(buffer).map_err(|e| prometheus::Error::Msg(e.to_string()))
    }
}
