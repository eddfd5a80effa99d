// Copyright (c) 2025 Kirky.X
//
// Licensed under the MIT License
// See LICENSE file in the project root for full license information.

//! 慢查询分析集成测试

use dbops::analyzer::{FileSlowLogSource, SlowQueryAnalyzer, SlowQueryPattern, SlowQueryRecord};
use dbops::optimizer::{FindOptions, QueryOptimizer};
use dbops::recommendation::{Priority, RecommendationKind};
use std::sync::Arc;
mod common;

async fn setup_orders(slow_query_threshold_ms: u64) -> common::TestDb {
    let db = common::setup_with(|config| config.monitoring.slow_query_threshold_ms = slow_query_threshold_ms).await;
    common::exec_all(
        &db.pool,
        &[
            "CREATE TABLE orders (id INTEGER PRIMARY KEY, customer_id INTEGER, status TEXT, total INTEGER)",
            "CREATE INDEX idx_orders_customer ON orders (customer_id)",
            "INSERT INTO orders (id, customer_id, status, total) VALUES (1, 1, 'open', 10), (2, 1, 'paid', 20), (3, 2, 'open', 30)",
        ],
    )
    .await;
    db
}

/// TEST-AN-001: SQLite 全表扫描识别为全表扫描与缺失索引
#[tokio::test]
async fn test_full_scan_on_sqlite() {
    let db = setup_orders(1000).await;
    let analyzer = SlowQueryAnalyzer::new(db.pool.clone());

    let analysis = analyzer
        .analyze_record(SlowQueryRecord {
            id: "q1".to_string(),
            query_time_sec: 2.0,
            query_text: "SELECT * FROM orders WHERE status = 'open'".to_string(),
            ..SlowQueryRecord::default()
        })
        .await
        .expect("Analysis should succeed");

    assert!(analysis.patterns.contains(&SlowQueryPattern::FullTableScan));
    assert!(analysis.patterns.contains(&SlowQueryPattern::MissingIndex));

    let create = analysis
        .recommendations
        .iter()
        .find(|r| r.kind == RecommendationKind::Create && r.priority == Priority::High)
        .expect("High priority CREATE INDEX");
    assert_eq!(
        create.suggested_ddl.as_deref(),
        Some("CREATE INDEX \"idx_orders_status\" ON \"orders\" (\"status\")")
    );
}

/// TEST-AN-002: 走索引的查询不报告全表扫描
#[tokio::test]
async fn test_indexed_lookup_has_no_scan_pattern() {
    let db = setup_orders(1000).await;
    let analyzer = SlowQueryAnalyzer::new(db.pool.clone());

    let analysis = analyzer
        .analyze_record(SlowQueryRecord {
            query_text: "SELECT * FROM orders WHERE customer_id = 1".to_string(),
            ..SlowQueryRecord::default()
        })
        .await
        .expect("Analysis should succeed");

    assert!(!analysis.patterns.contains(&SlowQueryPattern::FullTableScan));
    assert!(!analysis.patterns.contains(&SlowQueryPattern::MissingIndex));
}

/// TEST-AN-003: 分析本库写入的慢查询日志
#[tokio::test]
async fn test_analyze_instrumentation_log() {
    let db = setup_orders(0).await;
    let optimizer = QueryOptimizer::new(db.pool.clone());
    for _ in 0..3 {
        optimizer
            .optimized_find_all("orders", FindOptions::default().filter("status", "open"))
            .await
            .expect("Query should succeed");
    }

    let analyzer = SlowQueryAnalyzer::new(db.pool.clone());
    let report = analyzer.analyze().await.expect("Analysis should succeed");
    assert_eq!(report.analyses.len(), 3);
    assert_eq!(report.skipped, 0);
    assert!(report
        .analyses
        .iter()
        .all(|a| a.patterns.contains(&SlowQueryPattern::FullTableScan)));

    let stats = analyzer.get_slow_query_stats().await.expect("Stats should succeed");
    assert_eq!(stats.by_table.get("orders"), Some(&3));
    assert_eq!(stats.by_pattern.get("FULL_TABLE_SCAN"), Some(&3));

    let query_stats = analyzer.get_query_stats().await.expect("Query stats should succeed");
    assert_eq!(query_stats.distribution.select, 3);
    assert_eq!(query_stats.top_slow_queries.len(), 3);
    assert_eq!(query_stats.metrics.total_queries, 3);
    assert_eq!(query_stats.metrics.slow_queries, 3);
}

/// TEST-AN-004: 窗口限制分析数量
#[tokio::test]
async fn test_analysis_window() {
    let db = setup_orders(0).await;
    let optimizer = QueryOptimizer::new(db.pool.clone());
    for _ in 0..5 {
        optimizer
            .optimized_find_all("orders", FindOptions::default())
            .await
            .expect("Query should succeed");
    }

    let report = SlowQueryAnalyzer::new(db.pool.clone())
        .with_window(2)
        .analyze()
        .await
        .expect("Analysis should succeed");
    assert_eq!(report.analyses.len(), 2);
}

/// TEST-AN-005: MySQL 慢日志文件中无法分析的记录被跳过并计数
#[tokio::test]
async fn test_mysql_log_file_with_unanalyzable_entry() {
    let db = setup_orders(1000).await;
    let path = db.dir.path().join("mysql-slow.log");
    std::fs::write(
        &path,
        "# Time: 2025-03-01T10:00:00.000000Z
# User@Host: app[app] @ localhost [127.0.0.1]  Id:    12
# Query_time: 2.500000  Lock_time: 0.000100 Rows_sent: 1  Rows_examined: 5000
SET timestamp=1740823200;
SELECT * FROM orders WHERE total > 10;
# User@Host: app[app] @ localhost [127.0.0.1]  Id:    13
# Query_time: 1.500000  Lock_time: 0.000000 Rows_sent: 1  Rows_examined: 1
SET timestamp=1740823201;
SELECT * FROM missing_table WHERE id = 1;
",
    )
    .expect("Failed to write log");

    let analyzer = SlowQueryAnalyzer::with_source(db.pool.clone(), Arc::new(FileSlowLogSource::mysql(&path)));
    let report = analyzer.analyze().await.expect("Analysis should succeed");

    assert_eq!(report.analyses.len(), 1);
    assert_eq!(report.skipped, 1);
    let analysis = &report.analyses[0];
    assert!(analysis.patterns.contains(&SlowQueryPattern::LargeResultSet));
    assert!(analysis.patterns.contains(&SlowQueryPattern::FullTableScan));
    assert!(report.recommendations.first().is_some_and(|r| r.priority == Priority::High));
}

/// TEST-AN-006: 日志文件不存在时返回空报告
#[tokio::test]
async fn test_missing_log_file() {
    let db = setup_orders(1000).await;
    let report = SlowQueryAnalyzer::new(db.pool.clone())
        .analyze()
        .await
        .expect("Analysis should succeed");
    assert!(report.analyses.is_empty());
    assert!(report.recommendations.is_empty());
}

/// TEST-AN-007: 来源无法读取时返回空报告
#[tokio::test]
async fn test_unreadable_source_degrades_to_empty_report() {
    let db = setup_orders(1000).await;
    let analyzer = SlowQueryAnalyzer::with_source(db.pool.clone(), Arc::new(FileSlowLogSource::mysql(db.dir.path())));

    let report = analyzer.analyze().await.expect("Analysis should degrade instead of failing");
    assert!(report.analyses.is_empty());
    assert!(report.recommendations.is_empty());

    let stats = analyzer.get_slow_query_stats().await.expect("Stats should degrade instead of failing");
    assert_eq!(stats.total, 0);
}
