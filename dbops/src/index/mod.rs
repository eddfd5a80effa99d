// Copyright (c) 2025 Kirky.X
//
// Licensed under the MIT License
// See LICENSE file in the project root for full license information.

//! 索引优化模块
//!
//! 读取各表的索引与外键定义并交叉比对：
//! - **重复索引**: 覆盖相同列序列的多个普通索引，保留第一个，其余建议删除
//! - **未使用索引**: 仅在引擎提供索引使用计数时判定
//! - **缺失索引**: 外键列不是任何索引的前导列
//!
//! 分析只产生建议，执行 DDL 需要显式调用 [`IndexOptimizer::execute_index_optimization`]。

use sea_orm::{ConnectionTrait, FromQueryResult, JsonValue, Statement};
use serde::Serialize;
use std::collections::{HashMap, HashSet};
use tracing::{info, warn};

use crate::config::{DbError, DbResult};
use crate::engine::{EngineAdapter, row};
use crate::instrument::log_and_continue;
use crate::pool::DbPool;
use crate::recommendation::{Priority, Recommendation, RecommendationKind, sort_by_priority};

/// 外键所在表行数超过该值时缺失索引为高优先级
pub const LARGE_TABLE_ROWS: i64 = 10_000;

/// 索引的一列
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct IndexDescriptor {
    /// 表名
    pub table_name: String,
    /// 索引名
    pub index_name: String,
    /// 列名
    pub column_name: String,
    /// 是否唯一
    pub is_unique: bool,
    /// 是否主键
    pub is_primary: bool,
    /// 列在索引中的位置
    pub seq_in_index: i64,
}

impl IndexDescriptor {
    fn from_row(r: &JsonValue) -> Option<Self> {
        Some(Self {
            table_name: row::str(r, "table_name")?,
            index_name: row::str(r, "index_name")?,
            column_name: row::str(r, "column_name")?,
            is_unique: row::bool(r, "is_unique"),
            is_primary: row::bool(r, "is_primary"),
            seq_in_index: row::i64(r, "seq_in_index").unwrap_or(0),
        })
    }
}

/// 外键
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ForeignKeyDescriptor {
    /// 表名
    pub table_name: String,
    /// 外键列
    pub column_name: String,
    /// 被引用表
    pub referenced_table: String,
    /// 被引用列
    pub referenced_column: Option<String>,
    /// 表行数估算
    pub table_row_estimate: Option<i64>,
}

impl ForeignKeyDescriptor {
    fn from_row(r: &JsonValue) -> Option<Self> {
        Some(Self {
            table_name: row::str(r, "table_name")?,
            column_name: row::str(r, "column_name")?,
            referenced_table: row::str(r, "referenced_table")?,
            referenced_column: row::str(r, "referenced_column"),
            table_row_estimate: row::i64(r, "table_row_estimate"),
        })
    }
}

/// 按索引聚合后的定义
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct IndexDefinition {
    /// 表名
    pub table_name: String,
    /// 索引名
    pub index_name: String,
    /// 按位置排列的列
    pub columns: Vec<String>,
    /// 是否唯一
    pub is_unique: bool,
    /// 是否主键
    pub is_primary: bool,
}

/// 将逐列描述聚合为索引定义，保持首次出现的顺序
pub fn group_indexes(descriptors: &[IndexDescriptor]) -> Vec<IndexDefinition> {
    let mut order: Vec<(String, String)> = Vec::new();
    let mut columns: HashMap<(String, String), Vec<(i64, String)>> = HashMap::new();
    let mut flags: HashMap<(String, String), (bool, bool)> = HashMap::new();

    for d in descriptors {
        let key = (d.table_name.clone(), d.index_name.clone());
        if !columns.contains_key(&key) {
            order.push(key.clone());
        }
        columns
            .entry(key.clone())
            .or_default()
            .push((d.seq_in_index, d.column_name.clone()));
        let entry = flags.entry(key).or_insert((false, false));
        entry.0 |= d.is_unique;
        entry.1 |= d.is_primary;
    }

    order
        .into_iter()
        .map(|key| {
            let mut cols = columns.remove(&key).unwrap_or_default();
            cols.sort_by_key(|(seq, _)| *seq);
            let (is_unique, is_primary) = flags.get(&key).copied().unwrap_or_default();
            IndexDefinition {
                table_name: key.0,
                index_name: key.1,
                columns: cols.into_iter().map(|(_, c)| c).collect(),
                is_unique,
                is_primary,
            }
        })
        .collect()
}

/// 重复索引：同表、列序列完全相同的普通索引，保留第一个
pub fn find_duplicate_indexes(indexes: &[IndexDefinition], engine: &dyn EngineAdapter) -> Vec<Recommendation> {
    let mut seen: HashMap<(&str, &[String]), &str> = HashMap::new();
    let mut recommendations = Vec::new();

    for index in indexes.iter().filter(|i| !i.is_primary && !i.is_unique) {
        let key = (index.table_name.as_str(), index.columns.as_slice());
        match seen.get(&key) {
            Some(kept) => recommendations.push(
                Recommendation::new(
                    index.table_name.clone(),
                    index.columns.join(","),
                    RecommendationKind::Drop,
                    Priority::Low,
                    format!("Index {} duplicates {} on ({})", index.index_name, kept, index.columns.join(", ")),
                )
                .with_ddl(engine.drop_index_ddl(&index.table_name, &index.index_name)),
            ),
            None => {
                seen.insert(key, index.index_name.as_str());
            }
        }
    }

    recommendations
}

/// 缺失索引：外键列不属于任何索引
pub fn find_missing_fk_indexes(
    indexes: &[IndexDefinition],
    foreign_keys: &[ForeignKeyDescriptor],
    engine: &dyn EngineAdapter,
) -> Vec<Recommendation> {
    let covered: HashSet<(&str, &str)> = indexes
        .iter()
        .flat_map(|i| i.columns.iter().map(move |c| (i.table_name.as_str(), c.as_str())))
        .collect();

    let mut reported: HashSet<(&str, &str)> = HashSet::new();
    let mut recommendations = Vec::new();

    for fk in foreign_keys {
        let key = (fk.table_name.as_str(), fk.column_name.as_str());
        if covered.contains(&key) || !reported.insert(key) {
            continue;
        }

        let rows = fk.table_row_estimate.unwrap_or(0);
        let priority = if rows > LARGE_TABLE_ROWS {
            Priority::High
        } else {
            Priority::Medium
        };
        let index_name = format!("idx_{}_{}", fk.table_name, fk.column_name);

        recommendations.push(
            Recommendation::new(
                fk.table_name.clone(),
                fk.column_name.clone(),
                RecommendationKind::Create,
                priority,
                format!(
                    "Foreign key {}.{} references {} without an index (~{} rows)",
                    fk.table_name, fk.column_name, fk.referenced_table, rows
                ),
            )
            .with_ddl(engine.create_index_ddl(&fk.table_name, &index_name, &[fk.column_name.as_str()])),
        );
    }

    recommendations
}

/// 索引使用计数
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct IndexUsage {
    /// 表名
    pub table_name: String,
    /// 索引名
    pub index_name: String,
    /// 使用次数
    pub usage_count: i64,
}

/// 表统计
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TableStats {
    /// 表名
    pub table_name: String,
    /// 行数（估算）
    pub row_count: Option<i64>,
    /// 数据大小（字节）
    pub data_size: Option<i64>,
    /// 索引大小（字节）
    pub index_size: Option<i64>,
}

/// 索引分析报告
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct IndexAnalysisReport {
    /// 建议，按优先级排序
    pub recommendations: Vec<Recommendation>,
    /// 分析的表数量
    pub tables_analyzed: usize,
    /// 分析的索引数量
    pub indexes_analyzed: usize,
    /// 重复索引数量
    pub duplicate_indexes: usize,
    /// 未使用索引数量
    pub unused_indexes: usize,
    /// 缺失索引数量
    pub missing_indexes: usize,
    /// 引擎是否提供索引使用计数
    pub usage_stats_available: bool,
}

/// 执行建议的结果
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct IndexOptimizationOutcome {
    /// 执行的建议
    pub recommendation: Recommendation,
    /// 是否成功
    pub success: bool,
    /// 失败原因
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// 索引优化器
#[derive(Debug, Clone)]
pub struct IndexOptimizer {
    pool: DbPool,
}

impl IndexOptimizer {
    /// 创建优化器
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }

    async fn fetch(&self, sql: String) -> DbResult<Vec<JsonValue>> {
        let conn = self.pool.connection();
        let stmt = Statement::from_string(conn.get_database_backend(), sql);
        Ok(JsonValue::find_by_statement(stmt).all(conn).await?)
    }

    async fn row_estimate(&self, table: &str) -> Option<i64> {
        let sql = self.pool.engine().row_estimate_sql(table);
        let rows = log_and_continue("estimate table rows", self.fetch(sql).await)?;
        rows.first().and_then(|r| row::i64(r, "row_estimate"))
    }

    /// 索引列表（每列一条）
    pub async fn get_indexes(&self, table_name: Option<&str>) -> DbResult<Vec<IndexDescriptor>> {
        let rows = self.fetch(self.pool.engine().indexes_sql()).await?;
        Ok(rows
            .iter()
            .filter_map(IndexDescriptor::from_row)
            .filter(|d| table_name.is_none_or(|t| d.table_name == t))
            .collect())
    }

    /// 外键列表，行数估算缺失时逐表补齐
    pub async fn get_foreign_keys(&self, table_name: Option<&str>) -> DbResult<Vec<ForeignKeyDescriptor>> {
        let rows = self.fetch(self.pool.engine().foreign_keys_sql()).await?;
        let mut fks: Vec<ForeignKeyDescriptor> = rows
            .iter()
            .filter_map(ForeignKeyDescriptor::from_row)
            .filter(|fk| table_name.is_none_or(|t| fk.table_name == t))
            .collect();

        let mut estimates: HashMap<String, Option<i64>> = HashMap::new();
        for fk in fks.iter_mut().filter(|fk| fk.table_row_estimate.is_none()) {
            if !estimates.contains_key(&fk.table_name) {
                let estimate = self.row_estimate(&fk.table_name).await;
                estimates.insert(fk.table_name.clone(), estimate);
            }
            fk.table_row_estimate = estimates.get(&fk.table_name).copied().flatten();
        }
        Ok(fks)
    }

    /// 索引使用计数；引擎不提供或读取失败时为空
    pub async fn get_index_usage_stats(&self) -> Vec<IndexUsage> {
        let Some(sql) = self.pool.engine().index_usage_sql() else {
            return Vec::new();
        };
        log_and_continue("read index usage statistics", self.fetch(sql).await)
            .unwrap_or_default()
            .iter()
            .filter_map(|r| {
                Some(IndexUsage {
                    table_name: row::str(r, "table_name")?,
                    index_name: row::str(r, "index_name")?,
                    usage_count: row::i64(r, "usage_count").unwrap_or(0),
                })
            })
            .collect()
    }

    /// 表统计；读取失败时为空
    pub async fn get_table_stats(&self) -> Vec<TableStats> {
        let sql = self.pool.engine().table_stats_sql();
        let Some(rows) = log_and_continue("read table statistics", self.fetch(sql).await) else {
            return Vec::new();
        };

        let mut stats = Vec::with_capacity(rows.len());
        for r in &rows {
            let Some(table_name) = row::str(r, "table_name") else {
                continue;
            };
            let mut row_count = row::i64(r, "row_count");
            if row_count.is_none() {
                row_count = self.row_estimate(&table_name).await;
            }
            stats.push(TableStats {
                table_name,
                row_count,
                data_size: row::i64(r, "data_size"),
                index_size: row::i64(r, "index_size"),
            });
        }
        stats
    }

    /// 分析索引，`table_name` 为 `None` 时分析全部表
    pub async fn analyze_indexes(&self, table_name: Option<&str>) -> DbResult<IndexAnalysisReport> {
        let engine = self.pool.engine();
        let monitoring = &self.pool.config().monitoring;

        let descriptors = log_and_continue("read indexes", self.get_indexes(table_name).await).unwrap_or_default();
        let indexes = group_indexes(&descriptors);
        let foreign_keys = log_and_continue("read foreign keys", self.get_foreign_keys(table_name).await)
            .unwrap_or_default();

        let mut report = IndexAnalysisReport {
            indexes_analyzed: indexes.len(),
            tables_analyzed: indexes
                .iter()
                .map(|i| i.table_name.as_str())
                .chain(foreign_keys.iter().map(|f| f.table_name.as_str()))
                .collect::<HashSet<_>>()
                .len(),
            ..IndexAnalysisReport::default()
        };

        let duplicates = find_duplicate_indexes(&indexes, engine.as_ref());
        report.duplicate_indexes = duplicates.len();
        report.recommendations.extend(duplicates);

        if engine.index_usage_sql().is_some() {
            let usage = self.get_index_usage_stats().await;
            report.usage_stats_available = !usage.is_empty();

            let counts: HashMap<(&str, &str), i64> = usage
                .iter()
                .map(|u| ((u.table_name.as_str(), u.index_name.as_str()), u.usage_count))
                .collect();
            for index in indexes.iter().filter(|i| !i.is_primary && !i.is_unique) {
                let key = (index.table_name.as_str(), index.index_name.as_str());
                if counts.get(&key) != Some(&0) {
                    continue;
                }
                report.unused_indexes += 1;
                if monitoring.recommend_unused_index_drops {
                    report.recommendations.push(
                        Recommendation::new(
                            index.table_name.clone(),
                            index.columns.join(","),
                            RecommendationKind::Drop,
                            Priority::Low,
                            format!("Index {} has not been used since statistics were reset", index.index_name),
                        )
                        .with_ddl(engine.drop_index_ddl(&index.table_name, &index.index_name)),
                    );
                }
            }
        }

        let missing = find_missing_fk_indexes(&indexes, &foreign_keys, engine.as_ref());
        report.missing_indexes = missing.len();
        report.recommendations.extend(missing);

        sort_by_priority(&mut report.recommendations);
        info!(
            tables = report.tables_analyzed,
            indexes = report.indexes_analyzed,
            duplicates = report.duplicate_indexes,
            unused = report.unused_indexes,
            missing = report.missing_indexes,
            "Index analysis finished"
        );
        Ok(report)
    }

    /// 执行一条建议的 DDL
    ///
    /// 语句经过查询计时；失败时返回结果中的错误信息而不是 `Err`。
    pub async fn execute_index_optimization(&self, rec: &Recommendation) -> DbResult<IndexOptimizationOutcome> {
        let Some(ddl) = rec.suggested_ddl.as_deref() else {
            return Err(DbError::Analysis(format!(
                "Recommendation for {}.{} has no DDL to execute",
                rec.table_name, rec.column_name
            )));
        };

        warn!(table = %rec.table_name, ddl = %ddl, "Executing index optimization");
        let conn = self.pool.connection();
        let result = self
            .pool
            .instrumentation()
            .instrument(ddl, conn.execute_unprepared(ddl))
            .await;

        Ok(match result {
            Ok(_) => IndexOptimizationOutcome {
                recommendation: rec.clone(),
                success: true,
                error: None,
            },
            Err(e) => IndexOptimizationOutcome {
                recommendation: rec.clone(),
                success: false,
                error: Some(e.to_string()),
            },
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::{MySqlAdapter, SqliteAdapter};

    fn column(table: &str, index: &str, col: &str, seq: i64) -> IndexDescriptor {
        IndexDescriptor {
            table_name: table.to_string(),
            index_name: index.to_string(),
            column_name: col.to_string(),
            is_unique: false,
            is_primary: false,
            seq_in_index: seq,
        }
    }

    fn fk(table: &str, col: &str, rows: Option<i64>) -> ForeignKeyDescriptor {
        ForeignKeyDescriptor {
            table_name: table.to_string(),
            column_name: col.to_string(),
            referenced_table: "users".to_string(),
            referenced_column: Some("id".to_string()),
            table_row_estimate: rows,
        }
    }

    /// TEST-U-090: 聚合复合索引并按位置排序
    #[test]
    fn test_group_composite_index() {
        let defs = group_indexes(&[
            column("orders", "idx_a", "status", 2),
            column("orders", "idx_a", "user_id", 1),
            column("orders", "idx_b", "created_at", 1),
        ]);

        assert_eq!(defs.len(), 2);
        assert_eq!(defs[0].index_name, "idx_a");
        assert_eq!(defs[0].columns, vec!["user_id", "status"]);
    }

    /// TEST-U-091: 重复索引只建议删除后出现的一个，主键不参与
    #[test]
    fn test_duplicate_indexes() {
        let mut pk = column("orders", "PRIMARY", "user_id", 1);
        pk.is_primary = true;
        pk.is_unique = true;
        let defs = group_indexes(&[
            pk,
            column("orders", "idx_user", "user_id", 1),
            column("orders", "idx_user_dup", "user_id", 1),
            column("orders", "idx_user_status", "user_id", 1),
            column("orders", "idx_user_status", "status", 2),
            column("items", "idx_user", "user_id", 1),
        ]);

        let recs = find_duplicate_indexes(&defs, &MySqlAdapter);

        assert_eq!(recs.len(), 1);
        assert_eq!(recs[0].kind, RecommendationKind::Drop);
        assert_eq!(recs[0].priority, Priority::Low);
        assert_eq!(recs[0].suggested_ddl.as_deref(), Some("DROP INDEX `idx_user_dup` ON `orders`"));
    }

    /// TEST-U-092: 缺失外键索引的优先级取决于行数
    #[test]
    fn test_missing_fk_index_priority() {
        let defs = group_indexes(&[column("orders", "idx_status", "status", 1)]);
        let fks = vec![
            fk("orders", "customer_id", Some(50_000)),
            fk("payments", "user_id", Some(10_000)),
            fk("payments", "user_id", Some(10_000)),
        ];

        let recs = find_missing_fk_indexes(&defs, &fks, &SqliteAdapter);

        assert_eq!(recs.len(), 2);
        assert_eq!(recs[0].priority, Priority::High);
        assert_eq!(recs[1].priority, Priority::Medium);
        assert_eq!(
            recs[0].suggested_ddl.as_deref(),
            Some("CREATE INDEX \"idx_orders_customer_id\" ON \"orders\" (\"customer_id\")")
        );
    }

    /// TEST-U-093: 外键列为索引前导列时不报告
    #[test]
    fn test_covered_fk_not_reported() {
        let defs = group_indexes(&[column("orders", "idx_user", "user_id", 1)]);
        assert!(find_missing_fk_indexes(&defs, &[fk("orders", "user_id", None)], &SqliteAdapter).is_empty());
    }

    /// TEST-U-094: 外键列位于复合索引非首列时同样视为已有索引
    #[test]
    fn test_fk_in_later_composite_column_not_reported() {
        let defs = group_indexes(&[
            column("orders", "idx_status_user", "status", 1),
            column("orders", "idx_status_user", "user_id", 2),
        ]);
        let recs = find_missing_fk_indexes(&defs, &[fk("orders", "user_id", Some(50_000))], &SqliteAdapter);
        assert!(recs.is_empty(), "{:?}", recs);
    }
}
