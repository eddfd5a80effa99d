// Copyright (c) 2025 Kirky.X
//
// Licensed under the MIT License
// See LICENSE file in the project root for full license information.

//! 慢查询分析模块
//!
//! 读取慢查询记录（引擎慢日志表或日志文件），对每条语句获取执行计划，
//! 按固定的模式分类并生成带优先级的优化建议。
//!
//! # 示例
//!
//! ```rust,ignore
//! use dbops::analyzer::SlowQueryAnalyzer;
//!
//! let analyzer = SlowQueryAnalyzer::new(pool.clone());
//! let report = analyzer.analyze().await?;
//! for rec in &report.recommendations {
//!     println!("{:?} {} {}", rec.priority, rec.table_name, rec.reason);
//! }
//! ```

pub mod patterns;
pub mod plan;
mod slow_log;

pub use patterns::{SlowQueryPattern, detect_slow_query_patterns, generate_recommendation};
pub use plan::PlanRow;
pub use slow_log::{InstrumentationLogParser, MySqlSlowLogParser, ParsedSlowLog, SlowLogParser, SlowQueryRecord};

use async_trait::async_trait;
use sea_orm::{ConnectionTrait, FromQueryResult, JsonValue, Statement};
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{debug, warn};

use crate::config::{DbError, DbResult};
use crate::engine::row;
use crate::instrument::log_and_continue;
use crate::metrics::MetricsSnapshot;
use crate::pool::DbPool;
use crate::recommendation::{Recommendation, sort_by_priority};

/// 慢查询记录来源
#[async_trait]
pub trait SlowQuerySource: Send + Sync + std::fmt::Debug {
    /// 读取最多 `limit` 条记录（不保证顺序）
    async fn fetch(&self, limit: usize) -> DbResult<ParsedSlowLog>;
}

/// 引擎持久化的慢查询表
#[derive(Debug, Clone)]
pub struct EngineSlowLogSource {
    pool: DbPool,
}

impl EngineSlowLogSource {
    /// 创建来源
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }
}

fn split_user_host(raw: &str) -> (Option<String>, Option<String>) {
    let Some((user, host)) = raw.split_once('@') else {
        return (Some(raw.trim().to_string()).filter(|s| !s.is_empty()), None);
    };
    let user = user.split('[').next().unwrap_or(user).trim();
    let host = host.trim();
    let host = match host.split_once('[') {
        Some((name, ip)) if name.trim().is_empty() => ip.trim_end_matches(']').trim(),
        Some((name, _)) => name.trim(),
        None => host,
    };
    (
        Some(user.to_string()).filter(|s| !s.is_empty()),
        Some(host.to_string()).filter(|s| !s.is_empty()),
    )
}

fn record_from_row(r: &JsonValue, n: usize) -> Option<SlowQueryRecord> {
    let query_text = row::str(r, "query_text")?;
    let (user, host) = row::str(r, "user_host")
        .map(|uh| split_user_host(&uh))
        .unwrap_or((None, None));
    Some(SlowQueryRecord {
        id: row::str(r, "id").unwrap_or_else(|| format!("slowlog-{}", n + 1)),
        start_time: row::str(r, "start_time"),
        query_time_sec: row::f64(r, "query_time_sec")?,
        lock_time_sec: row::f64(r, "lock_time_sec").unwrap_or(0.0),
        rows_examined: row::i64(r, "rows_examined").unwrap_or(0),
        rows_sent: row::i64(r, "rows_sent").unwrap_or(0),
        user,
        host,
        schema: row::str(r, "schema_name"),
        query_text,
    })
}

#[async_trait]
impl SlowQuerySource for EngineSlowLogSource {
    async fn fetch(&self, limit: usize) -> DbResult<ParsedSlowLog> {
        let Some(sql) = self.pool.engine().slow_log_sql(limit) else {
            return Ok(ParsedSlowLog::default());
        };
        let conn = self.pool.connection();
        let rows = JsonValue::find_by_statement(Statement::from_string(conn.get_database_backend(), sql))
            .all(conn)
            .await?;

        let mut parsed = ParsedSlowLog::default();
        for (n, r) in rows.iter().enumerate() {
            match record_from_row(r, n) {
                Some(record) => parsed.records.push(record),
                None => parsed.skipped += 1,
            }
        }
        Ok(parsed)
    }
}

/// 慢查询日志文件
#[derive(Debug, Clone)]
pub struct FileSlowLogSource {
    path: PathBuf,
    parser: Arc<dyn SlowLogParser>,
}

impl FileSlowLogSource {
    /// 使用指定解析器读取文件
    pub fn new(path: impl Into<PathBuf>, parser: Arc<dyn SlowLogParser>) -> Self {
        Self {
            path: path.into(),
            parser,
        }
    }

    /// 读取本库写入的 `slow-queries.log`
    pub fn instrumentation_log(pool: &DbPool) -> Self {
        Self::new(
            pool.config().monitoring.slow_query_log_path(),
            Arc::new(InstrumentationLogParser),
        )
    }

    /// 读取 MySQL 慢查询日志文件
    pub fn mysql(path: impl Into<PathBuf>) -> Self {
        Self::new(path, Arc::new(MySqlSlowLogParser))
    }
}

#[async_trait]
impl SlowQuerySource for FileSlowLogSource {
    async fn fetch(&self, _limit: usize) -> DbResult<ParsedSlowLog> {
        let content = match tokio::fs::read_to_string(&self.path).await {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => String::new(),
            Err(e) => return Err(DbError::Io(e)),
        };
        Ok(self.parser.parse(&content))
    }
}

/// 单条慢查询的分析结果
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SlowQueryAnalysis {
    /// 原始记录
    pub record: SlowQueryRecord,
    /// 执行计划
    pub plan: Vec<PlanRow>,
    /// 命中的模式
    pub patterns: BTreeSet<SlowQueryPattern>,
    /// 建议
    pub recommendations: Vec<Recommendation>,
}

/// 分析报告
#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AnalysisReport {
    /// 逐条结果，按执行时间降序
    pub analyses: Vec<SlowQueryAnalysis>,
    /// 解析或分析失败而跳过的记录数
    pub skipped: usize,
    /// 全部建议，按优先级排序
    pub recommendations: Vec<Recommendation>,
}

/// 慢查询统计
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SlowQueryStats {
    /// 分析的记录数
    pub total: usize,
    /// 跳过的记录数
    pub skipped: usize,
    /// 按表计数
    pub by_table: BTreeMap<String, usize>,
    /// 按模式计数
    pub by_pattern: BTreeMap<String, usize>,
    /// 平均执行时间（秒）
    pub average_query_time_sec: f64,
    /// 最长执行时间（秒）
    pub max_query_time_sec: f64,
}

/// 慢日志语句类型分布
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct QueryTypeDistribution {
    /// SELECT
    pub select: usize,
    /// INSERT
    pub insert: usize,
    /// UPDATE
    pub update: usize,
    /// DELETE
    pub delete: usize,
    /// 其他
    pub other: usize,
}

impl QueryTypeDistribution {
    fn add(&mut self, query: &str) {
        let keyword = query.split_whitespace().next().unwrap_or("").to_ascii_uppercase();
        match keyword.as_str() {
            "SELECT" | "WITH" => self.select += 1,
            "INSERT" | "REPLACE" => self.insert += 1,
            "UPDATE" => self.update += 1,
            "DELETE" => self.delete += 1,
            _ => self.other += 1,
        }
    }
}

/// 查询统计
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct QueryStats {
    /// 指标快照
    pub metrics: MetricsSnapshot,
    /// 最慢的 10 条记录
    pub top_slow_queries: Vec<SlowQueryRecord>,
    /// 语句类型分布
    pub distribution: QueryTypeDistribution,
}

fn is_explainable(query: &str) -> bool {
    let keyword = query.split_whitespace().next().unwrap_or("").to_ascii_uppercase();
    matches!(
        keyword.as_str(),
        "SELECT" | "WITH" | "INSERT" | "REPLACE" | "UPDATE" | "DELETE"
    )
}

/// 慢查询分析器
#[derive(Debug, Clone)]
pub struct SlowQueryAnalyzer {
    pool: DbPool,
    source: Arc<dyn SlowQuerySource>,
    window: usize,
}

impl SlowQueryAnalyzer {
    /// 分析窗口默认大小
    pub const DEFAULT_WINDOW: usize = 50;

    /// 创建分析器
    ///
    /// 引擎提供慢查询表时从表读取，否则读取本库写入的慢查询日志。
    pub fn new(pool: DbPool) -> Self {
        let source: Arc<dyn SlowQuerySource> = if pool.engine().slow_log_sql(1).is_some() {
            Arc::new(EngineSlowLogSource::new(pool.clone()))
        } else {
            Arc::new(FileSlowLogSource::instrumentation_log(&pool))
        };
        Self::with_source(pool, source)
    }

    /// 使用指定来源
    pub fn with_source(pool: DbPool, source: Arc<dyn SlowQuerySource>) -> Self {
        let window = pool.config().monitoring.slow_query_window.max(1);
        Self { pool, source, window }
    }

    /// 设置分析窗口
    pub fn with_window(mut self, window: usize) -> Self {
        self.window = window.max(1);
        self
    }

    async fn fetch_window(&self) -> DbResult<ParsedSlowLog> {
        let mut parsed = self.source.fetch(self.window).await?;
        parsed
            .records
            .sort_by(|a, b| b.query_time_sec.total_cmp(&a.query_time_sec));
        parsed.records.truncate(self.window);
        Ok(parsed)
    }

    /// 获取语句的执行计划
    pub async fn explain(&self, query: &str) -> DbResult<Vec<PlanRow>> {
        if !is_explainable(query) {
            return Ok(Vec::new());
        }
        let engine = self.pool.engine();
        let conn = self.pool.connection();
        let stmt = Statement::from_string(conn.get_database_backend(), engine.explain_sql(query));
        let rows = JsonValue::find_by_statement(stmt).all(conn).await?;
        Ok(engine.parse_plan(&rows))
    }

    /// 分析单条记录
    pub async fn analyze_record(&self, record: SlowQueryRecord) -> DbResult<SlowQueryAnalysis> {
        let plan = self.explain(&record.query_text).await?;
        let patterns = detect_slow_query_patterns(&record, &plan);
        let engine = self.pool.engine();
        let recommendations = patterns
            .iter()
            .filter_map(|p| generate_recommendation(&record, *p, &plan, engine.as_ref()))
            .collect();
        Ok(SlowQueryAnalysis {
            record,
            plan,
            patterns,
            recommendations,
        })
    }

    /// 分析窗口内的慢查询
    ///
    /// 来源无法读取时返回空报告；单条记录无法获取执行计划时跳过并计数。
    pub async fn analyze(&self) -> DbResult<AnalysisReport> {
        let parsed = log_and_continue("read slow query source", self.fetch_window().await).unwrap_or_default();
        let mut report = AnalysisReport {
            skipped: parsed.skipped,
            ..AnalysisReport::default()
        };

        for record in parsed.records {
            let id = record.id.clone();
            match self.analyze_record(record).await {
                Ok(analysis) => {
                    report.recommendations.extend(analysis.recommendations.iter().cloned());
                    report.analyses.push(analysis);
                }
                Err(e) => {
                    warn!(record = %id, error = %e, "Skipping slow query that could not be analyzed");
                    report.skipped += 1;
                }
            }
        }

        sort_by_priority(&mut report.recommendations);
        debug!(
            analyzed = report.analyses.len(),
            skipped = report.skipped,
            recommendations = report.recommendations.len(),
            "Slow query analysis finished"
        );
        Ok(report)
    }

    /// 按表、按模式统计窗口内的慢查询
    pub async fn get_slow_query_stats(&self) -> DbResult<SlowQueryStats> {
        let report = self.analyze().await?;
        let mut stats = SlowQueryStats {
            total: report.analyses.len(),
            skipped: report.skipped,
            ..SlowQueryStats::default()
        };

        let mut total_time = 0.0;
        for analysis in &report.analyses {
            total_time += analysis.record.query_time_sec;
            stats.max_query_time_sec = stats.max_query_time_sec.max(analysis.record.query_time_sec);

            let mut tables: BTreeSet<String> = analysis.plan.iter().filter_map(|p| p.table.clone()).collect();
            if tables.is_empty() {
                tables.extend(patterns::guess_table(&analysis.record.query_text));
            }
            for table in tables {
                *stats.by_table.entry(table).or_default() += 1;
            }
            for pattern in &analysis.patterns {
                *stats.by_pattern.entry(pattern.to_string()).or_default() += 1;
            }
        }
        if stats.total > 0 {
            stats.average_query_time_sec = total_time / stats.total as f64;
        }

        Ok(stats)
    }

    /// 指标总览与本库慢查询日志统计
    pub async fn get_query_stats(&self) -> DbResult<QueryStats> {
        let metrics = self.pool.instrumentation().get_performance_metrics();
        let parsed = log_and_continue(
            "read slow query log",
            FileSlowLogSource::instrumentation_log(&self.pool).fetch(usize::MAX).await,
        )
        .unwrap_or_default();

        let mut distribution = QueryTypeDistribution::default();
        for record in &parsed.records {
            distribution.add(&record.query_text);
        }

        let mut top = parsed.records;
        top.sort_by(|a, b| b.query_time_sec.total_cmp(&a.query_time_sec));
        top.truncate(10);

        Ok(QueryStats {
            metrics,
            top_slow_queries: top,
            distribution,
        })
    }
}
