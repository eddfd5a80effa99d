// Copyright (c) 2025 Kirky.X
//
// Licensed under the MIT License
// See LICENSE file in the project root for full license information.

//! CLI 集成测试
//!
//! 测试 CLI 工具的各个命令：health、indexes、monitor

#![allow(deprecated)]

use assert_cmd::Command;
use dbops::DbPool;
use dbops::orm::ConnectionTrait;
use predicates::prelude::*;
use tempfile::TempDir;

fn database_url(dir: &TempDir) -> String {
    format!("sqlite://{}?mode=rwc", dir.path().join("cli.db").display())
}

async fn seed(url: &str) {
    let pool = DbPool::new(url).await.expect("Failed to create pool");
    for sql in [
        "CREATE TABLE users (id INTEGER PRIMARY KEY, name TEXT NOT NULL)",
        "CREATE TABLE orders (id INTEGER PRIMARY KEY, user_id INTEGER NOT NULL REFERENCES users(id), status TEXT)",
    ] {
        pool.connection().execute_unprepared(sql).await.expect("Failed to seed schema");
    }
}

fn cli(dir: &TempDir) -> Command {
    let mut cmd = Command::cargo_bin("dbops-cli").expect("Failed to find CLI binary");
    cmd.env_remove("DATABASE_URL")
        .arg("--database-url")
        .arg(database_url(dir))
        .arg("--log-dir")
        .arg(dir.path().join("logs"));
    cmd
}

/// TEST-CLI-001: 帮助命令
#[test]
fn test_cli_help() {
    let mut cmd = Command::cargo_bin("dbops-cli").expect("Failed to find CLI binary");

    cmd.arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("Usage").and(predicate::str::contains("health")));
}

/// TEST-CLI-002: 缺少连接字符串时失败
#[test]
fn test_cli_requires_database_url() {
    let mut cmd = Command::cargo_bin("dbops-cli").expect("Failed to find CLI binary");

    cmd.env_remove("DATABASE_URL")
        .arg("health")
        .assert()
        .failure()
        .stderr(predicate::str::contains("DATABASE_URL"));
}

/// TEST-CLI-003: SQLite 上的健康报告
#[tokio::test]
async fn test_cli_health_on_sqlite() {
    let dir = TempDir::new().expect("Failed to create temp dir");
    seed(&database_url(&dir)).await;

    cli(&dir)
        .arg("health")
        .assert()
        .success()
        .stdout(predicate::str::contains("\"status\": \"healthy\""));
}

/// TEST-CLI-004: 索引分析报告缺失的外键索引，执行后不再报告
#[tokio::test]
async fn test_cli_indexes_and_apply() {
    let dir = TempDir::new().expect("Failed to create temp dir");
    seed(&database_url(&dir)).await;

    cli(&dir)
        .arg("indexes")
        .assert()
        .success()
        .stdout(predicate::str::contains("idx_orders_user_id").and(predicate::str::contains("\"missingIndexes\": 1")));

    cli(&dir)
        .args(["indexes", "--apply", "1"])
        .assert()
        .success()
        .stdout(predicate::str::contains("\"success\": true"));

    cli(&dir)
        .arg("indexes")
        .assert()
        .success()
        .stdout(predicate::str::contains("\"missingIndexes\": 0"));
}

/// TEST-CLI-005: 不存在的建议序号
#[tokio::test]
async fn test_cli_apply_out_of_range() {
    let dir = TempDir::new().expect("Failed to create temp dir");
    seed(&database_url(&dir)).await;

    cli(&dir)
        .args(["indexes", "--apply", "9"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("does not exist"));
}

/// TEST-CLI-006: 限时运行监控并输出指标
#[tokio::test]
async fn test_cli_monitor_runs_for_duration() {
    let dir = TempDir::new().expect("Failed to create temp dir");
    seed(&database_url(&dir)).await;

    cli(&dir)
        .args(["monitor", "--interval-ms", "200", "--duration-secs", "1"])
        .assert()
        .success()
        .stdout(predicate::str::contains("totalQueries"));

    assert!(dir.path().join("logs").join("performance-metrics.log").exists());
}

/// TEST-CLI-007: 未给出连接字符串时使用工作目录中的配置文件
#[tokio::test]
async fn test_cli_uses_discovered_config_file() {
    let dir = TempDir::new().expect("Failed to create temp dir");
    seed(&database_url(&dir)).await;
    std::fs::write(
        dir.path().join("dbops.yaml"),
        format!("database:\n  url: \"{}\"\n  max_connections: 2\n", database_url(&dir)),
    )
    .expect("Failed to write config");

    let mut cmd = Command::cargo_bin("dbops-cli").expect("Failed to find CLI binary");
    cmd.env_remove("DATABASE_URL")
        .current_dir(dir.path())
        .arg("indexes")
        .assert()
        .success()
        .stdout(predicate::str::contains("\"missingIndexes\": 1"));
}
