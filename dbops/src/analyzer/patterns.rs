// Copyright (c) 2025 Kirky.X
//
// Licensed under the MIT License
// See LICENSE file in the project root for full license information.

//! 慢查询模式分类与建议生成
//!
//! 两个函数都是纯函数：输入慢查询记录与执行计划，不访问数据库，也不执行任何 DDL。

use regex::Regex;
use serde::Serialize;
use std::collections::BTreeSet;
use std::sync::OnceLock;

use super::SlowQueryRecord;
use super::plan::PlanRow;
use crate::engine::EngineAdapter;
use crate::recommendation::{Priority, Recommendation, RecommendationKind};

/// 慢查询模式
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SlowQueryPattern {
    /// 全表扫描
    FullTableScan,
    /// 有访问路径但未使用索引
    MissingIndex,
    /// 连接中存在全表扫描
    InefficientJoin,
    /// 使用临时表
    TemporaryTable,
    /// 额外排序
    Filesort,
    /// 扫描行数远大于返回行数
    LargeResultSet,
    /// 嵌套子查询
    ComplexSubquery,
    /// 锁等待时间过长
    LockWait,
}

impl SlowQueryPattern {
    /// 稳定的名称
    pub fn as_str(&self) -> &'static str {
        match self {
            SlowQueryPattern::FullTableScan => "FULL_TABLE_SCAN",
            SlowQueryPattern::MissingIndex => "MISSING_INDEX",
            SlowQueryPattern::InefficientJoin => "INEFFICIENT_JOIN",
            SlowQueryPattern::TemporaryTable => "TEMPORARY_TABLE",
            SlowQueryPattern::Filesort => "FILESORT",
            SlowQueryPattern::LargeResultSet => "LARGE_RESULT_SET",
            SlowQueryPattern::ComplexSubquery => "COMPLEX_SUBQUERY",
            SlowQueryPattern::LockWait => "LOCK_WAIT",
        }
    }
}

impl std::fmt::Display for SlowQueryPattern {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

macro_rules! cached_regex {
    ($name:ident, $pattern:expr) => {
        fn $name() -> &'static Regex {
            static RE: OnceLock<Regex> = OnceLock::new();
            RE.get_or_init(|| Regex::new($pattern).expect("valid regex"))
        }
    };
}

cached_regex!(join_re, r"(?i)\bjoin\b");
cached_regex!(subquery_re, r"(?i)\(\s*select\b");
cached_regex!(from_re, r#"(?i)\bfrom\s+[`"\[]?([\w.]+)"#);
cached_regex!(
    where_re,
    r"(?is)\bwhere\b(.*?)(?:\border\s+by\b|\bgroup\s+by\b|\blimit\b|\bhaving\b|;|$)"
);
cached_regex!(
    predicate_re,
    r#"(?i)[`"]?([A-Za-z_][\w]*)[`"]?\s*(?:=|<>|!=|<=|>=|<|>|\blike\b|\bin\b|\bis\b|\bbetween\b)"#
);
cached_regex!(order_by_re, r"(?is)\border\s+by\s+(.*?)(?:\blimit\b|;|$)");

const SQL_KEYWORDS: &[&str] = &["and", "or", "not", "null", "true", "false", "select", "exists"];

/// 从 FROM 子句猜测表名
pub fn guess_table(query: &str) -> Option<String> {
    from_re()
        .captures(query)
        .and_then(|c| c.get(1))
        .map(|m| m.as_str().rsplit('.').next().unwrap_or(m.as_str()).to_string())
}

/// 从 WHERE 子句猜测过滤列（去重、保序）
pub fn guess_filter_columns(query: &str) -> Vec<String> {
    let Some(clause) = where_re().captures(query).and_then(|c| c.get(1)) else {
        return Vec::new();
    };

    let mut columns: Vec<String> = Vec::new();
    for cap in predicate_re().captures_iter(clause.as_str()) {
        let column = cap[1].to_string();
        if SQL_KEYWORDS.contains(&column.to_lowercase().as_str()) {
            continue;
        }
        if !columns.contains(&column) {
            columns.push(column);
        }
    }
    columns
}

fn guess_order_columns(query: &str) -> Vec<String> {
    let Some(clause) = order_by_re().captures(query).and_then(|c| c.get(1)) else {
        return Vec::new();
    };
    clause
        .as_str()
        .split(',')
        .filter_map(|part| part.split_whitespace().next())
        .map(|col| col.rsplit('.').next().unwrap_or(col).trim_matches(|c| c == '`' || c == '"'))
        .filter(|col| !col.is_empty())
        .map(str::to_string)
        .collect()
}

fn index_ddl(engine: &dyn EngineAdapter, table: &str, columns: &[String]) -> String {
    let cols: Vec<&str> = columns.iter().map(String::as_str).collect();
    engine.create_index_ddl(table, &format!("idx_{}_{}", table, columns.join("_")), &cols)
}

fn target_table(record: &SlowQueryRecord, plan: &[PlanRow], pick: impl Fn(&PlanRow) -> bool) -> String {
    plan.iter()
        .find(|r| pick(r))
        .and_then(|r| r.table.clone())
        .or_else(|| guess_table(&record.query_text))
        .unwrap_or_else(|| "unknown".to_string())
}

/// 检测慢查询模式
pub fn detect_slow_query_patterns(record: &SlowQueryRecord, plan: &[PlanRow]) -> BTreeSet<SlowQueryPattern> {
    let mut patterns = BTreeSet::new();
    let query = record.query_text.as_str();

    let full_scan = plan.iter().any(PlanRow::is_full_scan);
    if full_scan {
        patterns.insert(SlowQueryPattern::FullTableScan);
        if join_re().is_match(query) {
            patterns.insert(SlowQueryPattern::InefficientJoin);
        }
    }
    if plan.iter().any(PlanRow::lacks_index) {
        patterns.insert(SlowQueryPattern::MissingIndex);
    }
    if plan.iter().any(|r| r.extra_contains("Using temporary")) {
        patterns.insert(SlowQueryPattern::TemporaryTable);
    }
    if plan.iter().any(|r| r.extra_contains("Using filesort")) {
        patterns.insert(SlowQueryPattern::Filesort);
    }
    if record.rows_examined > 1000 && record.rows_sent < record.rows_examined / 10 {
        patterns.insert(SlowQueryPattern::LargeResultSet);
    }
    if subquery_re().is_match(query) {
        patterns.insert(SlowQueryPattern::ComplexSubquery);
    }
    if record.lock_time_sec > 1.0 {
        patterns.insert(SlowQueryPattern::LockWait);
    }

    patterns
}

/// 为单个模式生成建议
pub fn generate_recommendation(
    record: &SlowQueryRecord,
    pattern: SlowQueryPattern,
    plan: &[PlanRow],
    engine: &dyn EngineAdapter,
) -> Option<Recommendation> {
    let query = record.query_text.as_str();

    let rec = match pattern {
        SlowQueryPattern::FullTableScan => {
            let table = target_table(record, plan, PlanRow::is_full_scan);
            let columns = guess_filter_columns(query);
            if columns.is_empty() {
                Recommendation::new(
                    table,
                    "",
                    RecommendationKind::Modify,
                    Priority::High,
                    "Full table scan without filter columns; add a selective predicate or a LIMIT",
                )
            } else {
                let ddl = index_ddl(engine, &table, &columns);
                Recommendation::new(
                    table,
                    columns.join(","),
                    RecommendationKind::Create,
                    Priority::High,
                    format!("Full table scan filtered on {}", columns.join(", ")),
                )
                .with_ddl(ddl)
            }
        }
        SlowQueryPattern::MissingIndex => {
            let table = target_table(record, plan, PlanRow::lacks_index);
            let columns = guess_filter_columns(query);
            let rec = Recommendation::new(
                table.clone(),
                columns.join(","),
                RecommendationKind::Create,
                Priority::Medium,
                format!("Query reads {} without using an index", table),
            );
            if columns.is_empty() {
                rec
            } else {
                rec.with_ddl(index_ddl(engine, &table, &columns))
            }
        }
        SlowQueryPattern::InefficientJoin => Recommendation::new(
            target_table(record, plan, PlanRow::is_full_scan),
            "",
            RecommendationKind::Modify,
            Priority::High,
            "Join performs a full scan; index the join columns of the scanned table",
        ),
        SlowQueryPattern::TemporaryTable => Recommendation::new(
            target_table(record, plan, |r| r.extra_contains("Using temporary")),
            "",
            RecommendationKind::Modify,
            Priority::Medium,
            "GROUP BY or DISTINCT materializes a temporary table; index the grouping columns",
        ),
        SlowQueryPattern::Filesort => {
            let table = target_table(record, plan, |r| r.table.is_some());
            let columns = guess_order_columns(query);
            Recommendation::new(
                table,
                columns.join(","),
                RecommendationKind::Modify,
                Priority::Medium,
                "ORDER BY requires an extra sort; an index matching the sort order avoids it",
            )
        }
        SlowQueryPattern::LargeResultSet => Recommendation::new(
            target_table(record, plan, |r| r.table.is_some()),
            "",
            RecommendationKind::Modify,
            Priority::Medium,
            format!(
                "Examined {} rows to return {}; select only needed columns and bound the result with LIMIT",
                record.rows_examined, record.rows_sent
            ),
        ),
        SlowQueryPattern::ComplexSubquery => Recommendation::new(
            target_table(record, plan, |r| r.table.is_some()),
            "",
            RecommendationKind::Modify,
            Priority::Medium,
            "Nested subquery; rewrite it as a JOIN or a derived table",
        ),
        SlowQueryPattern::LockWait => Recommendation::new(
            target_table(record, plan, |r| r.table.is_some()),
            "",
            RecommendationKind::Modify,
            Priority::Medium,
            format!(
                "Waited {:.2}s for locks; review the isolation level and transaction length",
                record.lock_time_sec
            ),
        ),
    };

    Some(rec)
}
