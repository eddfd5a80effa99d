// Copyright (c) 2025 Kirky.X
//
// Licensed under the MIT License
// See LICENSE file in the project root for full license information.

//! PostgreSQL 适配器

use sea_orm::{DbBackend, DbErr};
use serde_json::Value;

use super::{DeadlockSource, EngineAdapter, quote_literal};
use crate::analyzer::plan::PlanRow;
use crate::concurrency::ConcurrencyError;

/// PostgreSQL 适配器
#[derive(Debug, Clone, Copy, Default)]
pub struct PostgresAdapter;

impl PostgresAdapter {
    /// 递归展开 `EXPLAIN (FORMAT JSON)` 的计划树
    fn flatten_plan(node: &Value, out: &mut Vec<PlanRow>) {
        let node_type = node.get("Node Type").and_then(Value::as_str).unwrap_or_default();
        let relation = node.get("Relation Name").and_then(Value::as_str).map(str::to_string);
        let index = node.get("Index Name").and_then(Value::as_str).map(str::to_string);
        let rows = node.get("Plan Rows").and_then(Value::as_f64).map(|r| r as i64);

        let (access_type, extra) = match node_type {
            "Seq Scan" => (Some("ALL"), None),
            "Index Scan" | "Index Only Scan" => (Some("ref"), None),
            "Bitmap Heap Scan" | "Bitmap Index Scan" => (Some("range"), None),
            "Sort" | "Incremental Sort" => (None, Some("Using filesort")),
            "HashAggregate" | "Materialize" | "Unique" | "SetOp" => (None, Some("Using temporary")),
            _ => (None, None),
        };

        if access_type.is_some() || extra.is_some() {
            out.push(PlanRow {
                table: relation,
                access_type: access_type.map(str::to_string),
                possible_keys: index.clone(),
                key: index,
                rows,
                extra: extra.map(str::to_string),
            });
        }

        if let Some(children) = node.get("Plans").and_then(Value::as_array) {
            for child in children {
                Self::flatten_plan(child, out);
            }
        }
    }
}

impl EngineAdapter for PostgresAdapter {
    fn name(&self) -> &'static str {
        "postgres"
    }

    fn backend(&self) -> DbBackend {
        DbBackend::Postgres
    }

    fn translate_error(&self, err: &DbErr) -> Option<ConcurrencyError> {
        let message = err.to_string();
        let lower = message.to_lowercase();

        if lower.contains("40p01") || lower.contains("deadlock detected") {
            return Some(ConcurrencyError::deadlock(message));
        }
        if lower.contains("40001") || lower.contains("could not serialize access") {
            return Some(ConcurrencyError::deadlock(message));
        }
        if lower.contains("55p03") || lower.contains("lock timeout") || lower.contains("could not obtain lock") {
            return Some(ConcurrencyError::lock_timeout(message));
        }
        None
    }

    fn placeholder(&self, index: usize) -> String {
        format!("${}", index)
    }

    fn active_transactions_sql(&self) -> Option<String> {
        Some(
            "SELECT COALESCE(a.backend_xid::text, a.pid::text) AS id, \
                    a.pid AS thread_id, \
                    a.usename AS user, \
                    to_char(a.xact_start, 'YYYY-MM-DD\"T\"HH24:MI:SS') AS start_time, \
                    a.state AS state, \
                    EXTRACT(EPOCH FROM (now() - a.xact_start))::bigint AS duration_sec, \
                    (SELECT count(*) FROM pg_locks l WHERE l.pid = a.pid) AS lock_count, \
                    (a.wait_event_type = 'Lock') AS waiting_for_lock, \
                    a.query AS query \
             FROM pg_stat_activity a \
             WHERE a.xact_start IS NOT NULL AND a.pid <> pg_backend_pid() \
             ORDER BY a.xact_start"
                .to_string(),
        )
    }

    fn lock_waits_sql(&self) -> Option<String> {
        Some(
            "SELECT COALESCE(w.backend_xid::text, w.pid::text) AS requesting_trx_id, \
                    w.pid AS requesting_thread_id, \
                    w.query AS requesting_query, \
                    EXTRACT(EPOCH FROM (now() - w.state_change))::bigint AS wait_time_sec, \
                    COALESCE(b.backend_xid::text, b.pid::text) AS blocking_trx_id, \
                    b.pid AS blocking_thread_id, \
                    EXTRACT(EPOCH FROM (now() - b.xact_start))::bigint AS blocking_trx_age_sec, \
                    b.query AS blocking_query, \
                    (SELECT l.relation::regclass::text FROM pg_locks l \
                      WHERE l.pid = w.pid AND NOT l.granted AND l.relation IS NOT NULL LIMIT 1) AS lock_table \
             FROM pg_stat_activity w \
             JOIN pg_stat_activity b ON b.pid = ANY(pg_blocking_pids(w.pid)) \
             ORDER BY w.state_change"
                .to_string(),
        )
    }

    fn deadlock_source(&self) -> Option<DeadlockSource> {
        Some(DeadlockSource::Counter {
            sql: "SELECT deadlocks FROM pg_stat_database WHERE datname = current_database()".to_string(),
        })
    }

    fn kill_sql(&self, thread_id: i64) -> Option<String> {
        Some(format!("SELECT pg_terminate_backend({})", thread_id))
    }

    fn explain_sql(&self, query: &str) -> String {
        format!("EXPLAIN (FORMAT JSON) {}", query)
    }

    fn parse_plan(&self, rows: &[Value]) -> Vec<PlanRow> {
        let mut out = Vec::new();
        for r in rows {
            let Some(raw) = r.get("QUERY PLAN") else {
                continue;
            };
            // 部分驱动以字符串形式返回 json 列
            let parsed = match raw {
                Value::String(s) => serde_json::from_str::<Value>(s).unwrap_or(Value::Null),
                other => other.clone(),
            };
            if let Some(items) = parsed.as_array() {
                for item in items {
                    if let Some(plan) = item.get("Plan") {
                        Self::flatten_plan(plan, &mut out);
                    }
                }
            }
        }
        out
    }

    fn slow_log_sql(&self, limit: usize) -> Option<String> {
        Some(format!(
            "SELECT queryid::text AS id, \
                    NULL AS start_time, \
                    (mean_exec_time / 1000.0)::float8 AS query_time_sec, \
                    0.0::float8 AS lock_time_sec, \
                    rows AS rows_examined, \
                    (rows / GREATEST(calls, 1)) AS rows_sent, \
                    userid::regrole::text AS user_host, \
                    current_database() AS schema_name, \
                    query AS query_text \
             FROM pg_stat_statements \
             ORDER BY mean_exec_time DESC \
             LIMIT {}",
            limit
        ))
    }

    fn indexes_sql(&self) -> String {
        "SELECT t.relname AS table_name, \
                i.relname AS index_name, \
                a.attname AS column_name, \
                ix.indisunique AS is_unique, \
                ix.indisprimary AS is_primary, \
                k.ord AS seq_in_index \
         FROM pg_index ix \
         JOIN pg_class t ON t.oid = ix.indrelid \
         JOIN pg_class i ON i.oid = ix.indexrelid \
         JOIN pg_namespace n ON n.oid = t.relnamespace \
         CROSS JOIN LATERAL unnest(ix.indkey::int2[]) WITH ORDINALITY AS k(attnum, ord) \
         JOIN pg_attribute a ON a.attrelid = t.oid AND a.attnum = k.attnum \
         WHERE n.nspname = current_schema() \
         ORDER BY t.relname, i.oid, k.ord"
            .to_string()
    }

    fn foreign_keys_sql(&self) -> String {
        "SELECT tc.table_name AS table_name, \
                kcu.column_name AS column_name, \
                ccu.table_name AS referenced_table, \
                ccu.column_name AS referenced_column, \
                c.reltuples::bigint AS table_row_estimate \
         FROM information_schema.table_constraints tc \
         JOIN information_schema.key_column_usage kcu \
           ON kcu.constraint_name = tc.constraint_name AND kcu.table_schema = tc.table_schema \
         JOIN information_schema.constraint_column_usage ccu \
           ON ccu.constraint_name = tc.constraint_name AND ccu.table_schema = tc.table_schema \
         JOIN pg_class c ON c.relname = tc.table_name \
         WHERE tc.constraint_type = 'FOREIGN KEY' AND tc.table_schema = current_schema()"
            .to_string()
    }

    fn table_stats_sql(&self) -> String {
        "SELECT relname AS table_name, \
                n_live_tup AS row_count, \
                pg_table_size(relid) AS data_size, \
                pg_indexes_size(relid) AS index_size \
         FROM pg_stat_user_tables \
         ORDER BY pg_table_size(relid) DESC"
            .to_string()
    }

    fn index_usage_sql(&self) -> Option<String> {
        Some(
            "SELECT relname AS table_name, \
                    indexrelname AS index_name, \
                    idx_scan AS usage_count \
             FROM pg_stat_user_indexes"
                .to_string(),
        )
    }

    fn row_estimate_sql(&self, table: &str) -> String {
        format!(
            "SELECT reltuples::bigint AS row_estimate FROM pg_class WHERE relname = {}",
            quote_literal(table)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::concurrency::LockTimeoutKind;
    use sea_orm::RuntimeErr;
    use serde_json::json;

    #[test]
    fn test_translate_errors() {
        let adapter = PostgresAdapter;
        let deadlock = DbErr::Exec(RuntimeErr::Internal("deadlock detected".to_string()));
        let timeout = DbErr::Exec(RuntimeErr::Internal(
            "canceling statement due to lock timeout".to_string(),
        ));

        assert_eq!(
            adapter.translate_error(&deadlock).and_then(|e| e.lock_timeout_kind()),
            Some(LockTimeoutKind::Deadlock)
        );
        assert_eq!(
            adapter.translate_error(&timeout).and_then(|e| e.lock_timeout_kind()),
            Some(LockTimeoutKind::LockWaitTimeout)
        );
    }

    #[test]
    fn test_parse_json_plan_tree() {
        let rows = vec![json!({
            "QUERY PLAN": [{
                "Plan": {
                    "Node Type": "Sort",
                    "Plan Rows": 100,
                    "Plans": [{
                        "Node Type": "Seq Scan",
                        "Relation Name": "orders",
                        "Plan Rows": 100
                    }]
                }
            }]
        })];

        let plan = PostgresAdapter.parse_plan(&rows);
        assert_eq!(plan.len(), 2);
        assert_eq!(plan[0].extra.as_deref(), Some("Using filesort"));
        assert_eq!(plan[1].table.as_deref(), Some("orders"));
        assert_eq!(plan[1].access_type.as_deref(), Some("ALL"));
    }

    #[test]
    fn test_placeholder_is_positional() {
        assert_eq!(PostgresAdapter.placeholder(2), "$2");
    }
}
