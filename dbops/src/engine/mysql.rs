// Copyright (c) 2025 Kirky.X
//
// Licensed under the MIT License
// See LICENSE file in the project root for full license information.

//! MySQL / InnoDB 适配器

use sea_orm::{DbBackend, DbErr};

use super::{DeadlockSource, EngineAdapter, quote_literal, row};
use crate::analyzer::plan::PlanRow;
use crate::concurrency::ConcurrencyError;

/// MySQL 适配器
#[derive(Debug, Clone, Copy, Default)]
pub struct MySqlAdapter;

impl EngineAdapter for MySqlAdapter {
    fn name(&self) -> &'static str {
        "mysql"
    }

    fn backend(&self) -> DbBackend {
        DbBackend::MySql
    }

    fn translate_error(&self, err: &DbErr) -> Option<ConcurrencyError> {
        let message = err.to_string();
        let lower = message.to_lowercase();

        // ER_LOCK_DEADLOCK
        if lower.contains("1213 (40001)") || lower.contains("deadlock found") {
            return Some(ConcurrencyError::deadlock(message));
        }
        // ER_LOCK_WAIT_TIMEOUT
        if lower.contains("1205 (hy000)") || lower.contains("lock wait timeout exceeded") {
            return Some(ConcurrencyError::lock_timeout(message));
        }
        None
    }

    fn quote_ident(&self, ident: &str) -> String {
        format!("`{}`", ident.replace('`', "``"))
    }

    fn active_transactions_sql(&self) -> Option<String> {
        Some(
            "SELECT t.trx_id AS id, \
                    t.trx_mysql_thread_id AS thread_id, \
                    p.USER AS user, \
                    DATE_FORMAT(t.trx_started, '%Y-%m-%dT%H:%i:%s') AS start_time, \
                    t.trx_state AS state, \
                    CAST(TIMESTAMPDIFF(SECOND, t.trx_started, NOW()) AS SIGNED) AS duration_sec, \
                    t.trx_rows_locked AS lock_count, \
                    IF(t.trx_state = 'LOCK WAIT', 1, 0) AS waiting_for_lock, \
                    t.trx_query AS query \
             FROM information_schema.innodb_trx t \
             LEFT JOIN information_schema.PROCESSLIST p ON p.ID = t.trx_mysql_thread_id \
             ORDER BY t.trx_started"
                .to_string(),
        )
    }

    fn lock_waits_sql(&self) -> Option<String> {
        Some(
            "SELECT w.waiting_trx_id AS requesting_trx_id, \
                    w.waiting_pid AS requesting_thread_id, \
                    w.waiting_query AS requesting_query, \
                    CAST(w.wait_age_secs AS SIGNED) AS wait_time_sec, \
                    w.blocking_trx_id AS blocking_trx_id, \
                    w.blocking_pid AS blocking_thread_id, \
                    CAST(TIME_TO_SEC(w.blocking_trx_age) AS SIGNED) AS blocking_trx_age_sec, \
                    w.blocking_query AS blocking_query, \
                    w.locked_table AS lock_table \
             FROM sys.innodb_lock_waits w \
             ORDER BY w.wait_age_secs DESC"
                .to_string(),
        )
    }

    fn deadlock_source(&self) -> Option<DeadlockSource> {
        Some(DeadlockSource::StatusText {
            sql: "SHOW ENGINE INNODB STATUS".to_string(),
            column: "Status",
            clock_sql: "SELECT DATE_FORMAT(NOW(), '%Y-%m-%d %H:%i:%s') AS server_now".to_string(),
        })
    }

    fn kill_sql(&self, thread_id: i64) -> Option<String> {
        Some(format!("KILL {}", thread_id))
    }

    fn explain_sql(&self, query: &str) -> String {
        format!("EXPLAIN {}", query)
    }

    fn parse_plan(&self, rows: &[serde_json::Value]) -> Vec<PlanRow> {
        rows.iter()
            .map(|r| PlanRow {
                table: row::str(r, "table"),
                access_type: row::str(r, "type"),
                possible_keys: row::str(r, "possible_keys"),
                key: row::str(r, "key"),
                rows: row::i64(r, "rows"),
                extra: row::str(r, "Extra"),
            })
            .collect()
    }

    fn slow_log_sql(&self, limit: usize) -> Option<String> {
        Some(format!(
            "SELECT CAST(thread_id AS CHAR) AS id, \
                    DATE_FORMAT(start_time, '%Y-%m-%dT%H:%i:%s') AS start_time, \
                    CAST(TIME_TO_SEC(query_time) AS DOUBLE) AS query_time_sec, \
                    CAST(TIME_TO_SEC(lock_time) AS DOUBLE) AS lock_time_sec, \
                    rows_examined, \
                    rows_sent, \
                    user_host, \
                    db AS schema_name, \
                    CONVERT(sql_text USING utf8mb4) AS query_text \
             FROM mysql.slow_log \
             ORDER BY query_time DESC \
             LIMIT {}",
            limit
        ))
    }

    fn indexes_sql(&self) -> String {
        // INNODB_INDEXES.INDEX_ID grows with creation order; non-InnoDB tables fall back to name order
        "SELECT s.TABLE_NAME AS table_name, \
                s.INDEX_NAME AS index_name, \
                s.COLUMN_NAME AS column_name, \
                IF(s.NON_UNIQUE = 0, 1, 0) AS is_unique, \
                IF(s.INDEX_NAME = 'PRIMARY', 1, 0) AS is_primary, \
                s.SEQ_IN_INDEX AS seq_in_index \
         FROM information_schema.STATISTICS s \
         LEFT JOIN information_schema.INNODB_TABLES it \
           ON it.NAME = CONCAT(s.TABLE_SCHEMA, '/', s.TABLE_NAME) \
         LEFT JOIN information_schema.INNODB_INDEXES ii \
           ON ii.TABLE_ID = it.TABLE_ID AND ii.NAME = s.INDEX_NAME \
         WHERE s.TABLE_SCHEMA = DATABASE() \
         ORDER BY s.TABLE_NAME, ii.INDEX_ID, s.INDEX_NAME, s.SEQ_IN_INDEX"
            .to_string()
    }

    fn foreign_keys_sql(&self) -> String {
        "SELECT k.TABLE_NAME AS table_name, \
                k.COLUMN_NAME AS column_name, \
                k.REFERENCED_TABLE_NAME AS referenced_table, \
                k.REFERENCED_COLUMN_NAME AS referenced_column, \
                t.TABLE_ROWS AS table_row_estimate \
         FROM information_schema.KEY_COLUMN_USAGE k \
         JOIN information_schema.TABLES t \
           ON t.TABLE_SCHEMA = k.TABLE_SCHEMA AND t.TABLE_NAME = k.TABLE_NAME \
         WHERE k.TABLE_SCHEMA = DATABASE() AND k.REFERENCED_TABLE_NAME IS NOT NULL"
            .to_string()
    }

    fn table_stats_sql(&self) -> String {
        "SELECT TABLE_NAME AS table_name, \
                TABLE_ROWS AS row_count, \
                DATA_LENGTH AS data_size, \
                INDEX_LENGTH AS index_size \
         FROM information_schema.TABLES \
         WHERE TABLE_SCHEMA = DATABASE() AND TABLE_TYPE = 'BASE TABLE' \
         ORDER BY DATA_LENGTH DESC"
            .to_string()
    }

    fn index_usage_sql(&self) -> Option<String> {
        Some(
            "SELECT OBJECT_NAME AS table_name, \
                    INDEX_NAME AS index_name, \
                    COUNT_STAR AS usage_count \
             FROM performance_schema.table_io_waits_summary_by_index_usage \
             WHERE OBJECT_SCHEMA = DATABASE() AND INDEX_NAME IS NOT NULL"
                .to_string(),
        )
    }

    fn row_estimate_sql(&self, table: &str) -> String {
        format!(
            "SELECT TABLE_ROWS AS row_estimate FROM information_schema.TABLES \
             WHERE TABLE_SCHEMA = DATABASE() AND TABLE_NAME = {}",
            quote_literal(table)
        )
    }

    fn drop_index_ddl(&self, table: &str, index_name: &str) -> String {
        format!("DROP INDEX {} ON {}", self.quote_ident(index_name), self.quote_ident(table))
    }
}
