// Copyright (c) 2025 Kirky.X
//
// Licensed under the MIT License
// See LICENSE file in the project root for full license information.

//! 测试辅助模块
//!
//! 每个测试使用独立的临时 SQLite 文件数据库，日志目录位于同一临时目录下

use dbops::DbPool;
use dbops::config::DbConfig;
use dbops::orm::ConnectionTrait;
use tempfile::TempDir;

/// 测试数据库及其临时目录（目录在 drop 时删除）
pub struct TestDb {
    pub pool: DbPool,
    pub dir: TempDir,
}

/// 创建测试配置
///
/// 设置 `TEST_DATABASE_URL` 时使用该连接，否则使用临时 SQLite 文件
pub fn test_config(dir: &TempDir) -> DbConfig {
    let url = std::env::var("TEST_DATABASE_URL")
        .unwrap_or_else(|_| format!("sqlite://{}?mode=rwc", dir.path().join("test.db").display()));

    let mut config = DbConfig::with_url(url);
    config.max_connections = 5;
    config.min_connections = 1;
    config.monitoring.log_dir = dir.path().join("logs");
    config
}

/// 使用默认测试配置创建数据库
#[allow(dead_code)]
pub async fn setup() -> TestDb {
    setup_with(|_| {}).await
}

/// 创建数据库，允许调整配置
pub async fn setup_with(adjust: impl FnOnce(&mut DbConfig)) -> TestDb {
    let dir = TempDir::new().expect("Failed to create temp dir");
    let mut config = test_config(&dir);
    adjust(&mut config);
    let pool = DbPool::with_config(config).await.expect("Failed to create pool");
    TestDb { pool, dir }
}

/// 依次执行 DDL / DML
#[allow(dead_code)]
pub async fn exec_all(pool: &DbPool, statements: &[&str]) {
    for sql in statements {
        pool.connection()
            .execute_unprepared(sql)
            .await
            .unwrap_or_else(|e| panic!("Failed to execute `{}`: {}", sql, e));
    }
}

/// 读取单个整数值
#[allow(dead_code)]
pub async fn scalar_i64(pool: &DbPool, sql: &str) -> i64 {
    use dbops::orm::{FromQueryResult, JsonValue, Statement};

    let conn = pool.connection();
    let row = JsonValue::find_by_statement(Statement::from_string(conn.get_database_backend(), sql.to_string()))
        .one(conn)
        .await
        .expect("Query failed")
        .expect("Query returned no rows");
    row.as_object()
        .and_then(|o| o.values().next())
        .and_then(|v| v.as_i64())
        .expect("First column is not an integer")
}
