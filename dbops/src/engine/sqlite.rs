// Copyright (c) 2025 Kirky.X
//
// Licensed under the MIT License
// See LICENSE file in the project root for full license information.

//! SQLite 适配器
//!
//! SQLite 没有事务/锁运行时视图，也没有会话终止能力，相关查询返回 `None`，
//! 监控器据此返回空结果。

use sea_orm::{DbBackend, DbErr};

use super::{DeadlockSource, EngineAdapter, row};
use crate::analyzer::plan::PlanRow;
use crate::concurrency::ConcurrencyError;

/// SQLite 适配器
#[derive(Debug, Clone, Copy, Default)]
pub struct SqliteAdapter;

impl SqliteAdapter {
    /// 解析 `EXPLAIN QUERY PLAN` 的 `detail` 列
    fn parse_detail(detail: &str) -> Option<PlanRow> {
        let detail = detail.trim();

        if let Some(rest) = detail.strip_prefix("USE TEMP B-TREE FOR ") {
            let extra = if rest.starts_with("ORDER BY") {
                "Using filesort"
            } else {
                "Using temporary"
            };
            return Some(PlanRow {
                extra: Some(extra.to_string()),
                ..PlanRow::default()
            });
        }

        let (verb, rest) = if let Some(rest) = detail.strip_prefix("SCAN ") {
            ("SCAN", rest)
        } else if let Some(rest) = detail.strip_prefix("SEARCH ") {
            ("SEARCH", rest)
        } else {
            return None;
        };

        let rest = rest.strip_prefix("TABLE ").unwrap_or(rest);
        let table = rest.split_whitespace().next().map(str::to_string);

        let key = if rest.contains("INTEGER PRIMARY KEY") {
            Some("PRIMARY".to_string())
        } else {
            rest.split(" INDEX ")
                .nth(1)
                .and_then(|s| s.split_whitespace().next())
                .map(str::to_string)
        };

        let access_type = match (verb, key.is_some()) {
            ("SCAN", false) => "ALL",
            ("SCAN", true) => "index",
            (_, _) if key.as_deref() == Some("PRIMARY") => "const",
            _ => "ref",
        };

        Some(PlanRow {
            table,
            access_type: Some(access_type.to_string()),
            possible_keys: key.clone(),
            key,
            rows: None,
            extra: None,
        })
    }
}

impl EngineAdapter for SqliteAdapter {
    fn name(&self) -> &'static str {
        "sqlite"
    }

    fn backend(&self) -> DbBackend {
        DbBackend::Sqlite
    }

    fn translate_error(&self, err: &DbErr) -> Option<ConcurrencyError> {
        let message = err.to_string();
        let lower = message.to_lowercase();

        // SQLITE_BUSY / SQLITE_LOCKED
        if lower.contains("database is locked")
            || lower.contains("database table is locked")
            || lower.contains("(code: 5)")
            || lower.contains("(code: 6)")
        {
            return Some(ConcurrencyError::lock_timeout(message));
        }
        None
    }

    fn lock_clause(&self) -> &'static str {
        ""
    }

    // SQLITE_MAX_VARIABLE_NUMBER since 3.32
    fn max_bind_params(&self) -> usize {
        32_766
    }

    fn supports_isolation_levels(&self) -> bool {
        false
    }

    fn active_transactions_sql(&self) -> Option<String> {
        None
    }

    fn lock_waits_sql(&self) -> Option<String> {
        None
    }

    fn deadlock_source(&self) -> Option<DeadlockSource> {
        None
    }

    fn kill_sql(&self, _thread_id: i64) -> Option<String> {
        None
    }

    fn explain_sql(&self, query: &str) -> String {
        format!("EXPLAIN QUERY PLAN {}", query)
    }

    fn parse_plan(&self, rows: &[serde_json::Value]) -> Vec<PlanRow> {
        rows.iter()
            .filter_map(|r| row::str(r, "detail"))
            .filter_map(|detail| Self::parse_detail(&detail))
            .collect()
    }

    fn slow_log_sql(&self, _limit: usize) -> Option<String> {
        None
    }

    fn indexes_sql(&self) -> String {
        "SELECT m.tbl_name AS table_name, \
                m.name AS index_name, \
                ii.name AS column_name, \
                il.\"unique\" AS is_unique, \
                CASE WHEN il.origin = 'pk' THEN 1 ELSE 0 END AS is_primary, \
                ii.seqno AS seq_in_index \
         FROM sqlite_master m \
         JOIN pragma_index_list(m.tbl_name) il ON il.name = m.name \
         JOIN pragma_index_info(m.name) ii \
         WHERE m.type = 'index' \
         ORDER BY m.rowid, ii.seqno"
            .to_string()
    }

    fn foreign_keys_sql(&self) -> String {
        "SELECT m.name AS table_name, \
                f.\"from\" AS column_name, \
                f.\"table\" AS referenced_table, \
                f.\"to\" AS referenced_column \
         FROM sqlite_master m \
         JOIN pragma_foreign_key_list(m.name) f \
         WHERE m.type = 'table'"
            .to_string()
    }

    fn table_stats_sql(&self) -> String {
        "SELECT name AS table_name \
         FROM sqlite_master \
         WHERE type = 'table' AND name NOT LIKE 'sqlite_%' \
         ORDER BY name"
            .to_string()
    }

    fn index_usage_sql(&self) -> Option<String> {
        None
    }

    fn row_estimate_sql(&self, table: &str) -> String {
        format!("SELECT COUNT(*) AS row_estimate FROM {}", self.quote_ident(table))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sea_orm::RuntimeErr;

    #[test]
    fn test_parse_scan_and_search() {
        let scan = SqliteAdapter::parse_detail("SCAN orders").expect("scan row");
        assert_eq!(scan.table.as_deref(), Some("orders"));
        assert_eq!(scan.access_type.as_deref(), Some("ALL"));
        assert_eq!(scan.key, None);

        let legacy = SqliteAdapter::parse_detail("SCAN TABLE orders").expect("legacy scan row");
        assert_eq!(legacy.table.as_deref(), Some("orders"));

        let search = SqliteAdapter::parse_detail("SEARCH orders USING INDEX idx_orders_user (user_id=?)")
            .expect("search row");
        assert_eq!(search.access_type.as_deref(), Some("ref"));
        assert_eq!(search.key.as_deref(), Some("idx_orders_user"));

        let pk = SqliteAdapter::parse_detail("SEARCH users USING INTEGER PRIMARY KEY (rowid=?)").expect("pk row");
        assert_eq!(pk.access_type.as_deref(), Some("const"));
    }

    #[test]
    fn test_parse_temp_btree() {
        let order = SqliteAdapter::parse_detail("USE TEMP B-TREE FOR ORDER BY").expect("temp row");
        assert_eq!(order.extra.as_deref(), Some("Using filesort"));

        let group = SqliteAdapter::parse_detail("USE TEMP B-TREE FOR GROUP BY").expect("temp row");
        assert_eq!(group.extra.as_deref(), Some("Using temporary"));

        assert!(SqliteAdapter::parse_detail("CORRELATED SCALAR SUBQUERY 1").is_none());
    }

    #[test]
    fn test_translate_busy() {
        let err = DbErr::Exec(RuntimeErr::Internal("(code: 5) database is locked".to_string()));
        assert!(SqliteAdapter.translate_error(&err).is_some());
    }
}
