// Copyright (c) 2025 Kirky.X
//
// Licensed under the MIT License
// See LICENSE file in the project root for full license information.

//! 数据库引擎适配层
//!
//! 将各引擎差异收敛到 [`EngineAdapter`] 中：
//! - **错误翻译**: 死锁、锁等待超时等原生错误映射为 [`ConcurrencyError`]
//! - **运行时视图**: 活跃事务、锁等待、死锁诊断信息的查询语句
//! - **执行计划**: `EXPLAIN` 语句与结果解析
//! - **模式自省**: 索引、外键、表统计、索引使用统计
//!
//! 所有查询语句使用统一的列别名，结果以 JSON 行读取，见 [`row`]。

mod mysql;
mod postgres;
mod sqlite;

pub use mysql::MySqlAdapter;
pub use postgres::PostgresAdapter;
pub use sqlite::SqliteAdapter;

use sea_orm::{DbBackend, DbErr};
use std::sync::Arc;

use crate::analyzer::plan::PlanRow;
use crate::concurrency::ConcurrencyError;

/// 死锁诊断信息来源
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeadlockSource {
    /// 返回一段状态文本（例如 InnoDB 状态报告），取结果中指定列
    StatusText {
        /// 查询语句
        sql: String,
        /// 文本所在列
        column: &'static str,
        /// 读取服务器本地时间的语句（列名 `server_now`，格式 `YYYY-MM-DD HH:MM:SS`）
        clock_sql: String,
    },
    /// 返回一个单调递增的死锁计数器（列名 `deadlocks`）
    Counter {
        /// 查询语句
        sql: String,
    },
}

/// 数据库引擎适配器
pub trait EngineAdapter: Send + Sync + std::fmt::Debug {
    /// 引擎名称
    fn name(&self) -> &'static str;

    /// 对应的 Sea-ORM 后端
    fn backend(&self) -> DbBackend;

    /// 将原生错误翻译为并发错误；无法识别时返回 `None`
    fn translate_error(&self, err: &DbErr) -> Option<ConcurrencyError>;

    /// 引用标识符
    fn quote_ident(&self, ident: &str) -> String {
        format!("\"{}\"", ident.replace('"', "\"\""))
    }

    /// 第 `index` 个（从 1 开始）绑定参数占位符
    fn placeholder(&self, _index: usize) -> String {
        "?".to_string()
    }

    /// 单条语句允许的绑定参数上限
    fn max_bind_params(&self) -> usize {
        65_535
    }

    /// 行锁子句，不支持时为空串
    fn lock_clause(&self) -> &'static str {
        " FOR UPDATE"
    }

    /// 是否支持按事务设置隔离级别
    fn supports_isolation_levels(&self) -> bool {
        true
    }

    /// 活跃事务查询
    fn active_transactions_sql(&self) -> Option<String>;

    /// 锁等待查询
    fn lock_waits_sql(&self) -> Option<String>;

    /// 死锁诊断来源
    fn deadlock_source(&self) -> Option<DeadlockSource>;

    /// 终止指定线程/会话的语句
    fn kill_sql(&self, thread_id: i64) -> Option<String>;

    /// 执行计划语句
    fn explain_sql(&self, query: &str) -> String;

    /// 解析执行计划结果
    fn parse_plan(&self, rows: &[serde_json::Value]) -> Vec<PlanRow>;

    /// 引擎持久化的慢查询记录
    fn slow_log_sql(&self, limit: usize) -> Option<String>;

    /// 索引列表（每列一行，按表、索引、列序排列）
    fn indexes_sql(&self) -> String;

    /// 外键列表
    fn foreign_keys_sql(&self) -> String;

    /// 表统计
    fn table_stats_sql(&self) -> String;

    /// 索引使用计数，引擎不提供时为 `None`
    fn index_usage_sql(&self) -> Option<String>;

    /// 单表行数估算（列名 `row_estimate`）
    fn row_estimate_sql(&self, table: &str) -> String;

    /// 创建索引 DDL
    fn create_index_ddl(&self, table: &str, index_name: &str, columns: &[&str]) -> String {
        let cols: Vec<String> = columns.iter().map(|c| self.quote_ident(c)).collect();
        format!(
            "CREATE INDEX {} ON {} ({})",
            self.quote_ident(index_name),
            self.quote_ident(table),
            cols.join(", ")
        )
    }

    /// 删除索引 DDL
    fn drop_index_ddl(&self, _table: &str, index_name: &str) -> String {
        format!("DROP INDEX {}", self.quote_ident(index_name))
    }
}

/// 按后端选择适配器
pub fn adapter_for(backend: DbBackend) -> Arc<dyn EngineAdapter> {
    #[allow(unreachable_patterns)]
    match backend {
        DbBackend::MySql => Arc::new(MySqlAdapter),
        DbBackend::Postgres => Arc::new(PostgresAdapter),
        DbBackend::Sqlite => Arc::new(SqliteAdapter),
        _ => Arc::new(SqliteAdapter),
    }
}

/// 转义 SQL 字符串字面量
pub(crate) fn quote_literal(value: &str) -> String {
    format!("'{}'", value.replace('\'', "''"))
}

/// JSON 结果行读取工具
///
/// 不同引擎对同一列可能返回数字、字符串或布尔值，这里统一做宽松转换。
pub mod row {
    use serde_json::Value;

    /// 读取字符串列
    pub fn str(row: &Value, key: &str) -> Option<String> {
        match row.get(key)? {
            Value::Null => None,
            Value::String(s) => Some(s.clone()),
            other => Some(other.to_string()),
        }
    }

    /// 读取整数列
    pub fn i64(row: &Value, key: &str) -> Option<i64> {
        match row.get(key)? {
            Value::Number(n) => n.as_i64().or_else(|| n.as_f64().map(|f| f as i64)),
            Value::String(s) => s.trim().parse::<f64>().ok().map(|f| f as i64),
            Value::Bool(b) => Some(i64::from(*b)),
            _ => None,
        }
    }

    /// 读取浮点列
    pub fn f64(row: &Value, key: &str) -> Option<f64> {
        match row.get(key)? {
            Value::Number(n) => n.as_f64(),
            Value::String(s) => s.trim().parse().ok(),
            Value::Bool(b) => Some(if *b { 1.0 } else { 0.0 }),
            _ => None,
        }
    }

    /// 读取布尔列（`1`、`true`、`t`、`yes` 视为真）
    pub fn bool(row: &Value, key: &str) -> bool {
        match row.get(key) {
            Some(Value::Bool(b)) => *b,
            Some(Value::Number(n)) => n.as_i64().unwrap_or(0) != 0,
            Some(Value::String(s)) => matches!(s.to_lowercase().as_str(), "1" | "true" | "t" | "yes" | "y"),
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_adapter_for_backend() {
        assert_eq!(adapter_for(DbBackend::MySql).name(), "mysql");
        assert_eq!(adapter_for(DbBackend::Postgres).name(), "postgres");
        assert_eq!(adapter_for(DbBackend::Sqlite).name(), "sqlite");
        assert_eq!(adapter_for(DbBackend::Sqlite).max_bind_params(), 32_766);
        assert_eq!(adapter_for(DbBackend::Postgres).max_bind_params(), 65_535);
    }

    #[test]
    fn test_row_helpers_are_lenient() {
        let row = json!({"a": "42", "b": 7, "c": 1, "d": "t", "e": null, "f": 2.5});

        assert_eq!(row::i64(&row, "a"), Some(42));
        assert_eq!(row::str(&row, "b").as_deref(), Some("7"));
        assert!(row::bool(&row, "c"));
        assert!(row::bool(&row, "d"));
        assert_eq!(row::str(&row, "e"), None);
        assert_eq!(row::f64(&row, "f"), Some(2.5));
        assert_eq!(row::i64(&row, "missing"), None);
    }

    #[test]
    fn test_quote_literal_escapes() {
        assert_eq!(quote_literal("o'brien"), "'o''brien'");
    }
}
