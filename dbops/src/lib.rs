//! DBOps - 数据库运维控制面
//!
//! 基于 Sea-ORM 的查询计时、事务安全、锁监控与索引建议
//!
//! # 功能特性
//!
//! - **查询计时**: 延迟、慢查询与错误计数，慢查询写入 `slow-queries.log`
//! - **事务工具**: 隔离级别与超时、悲观锁、乐观锁、可重试冲突的退避重试
//! - **事务监控**: 活跃事务、长事务、锁等待、最近死锁与健康判定
//! - **慢查询分析**: 执行计划模式分类与优化建议
//! - **索引优化**: 重复索引、未使用索引、缺失外键索引
//! - **监控指标**: Prometheus 文本导出
//!
//! # 快速开始
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use dbops::DbPool;
//! use dbops::monitor::{MonitorService, TransactionMonitor};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let pool = DbPool::new("sqlite://app.db?mode=rwc").await?;
//!     let monitor = Arc::new(TransactionMonitor::new(pool.clone()));
//!     let handle = MonitorService::new(monitor.clone()).start();
//!
//!     let health = monitor.get_transaction_health().await;
//!     println!("{:?}", health.status);
//!
//!     handle.shutdown().await;
//!     Ok(())
//! }
//! ```

#![doc(html_root_url = "https://docs.rs/dbops/0.1")]
#![deny(missing_docs)]
#![forbid(unsafe_code)]

#[cfg(not(any(feature = "sqlite", feature = "postgres", feature = "mysql")))]
compile_error!("Must enable at least one database feature: 'sqlite', 'postgres', or 'mysql'");

/// 慢查询分析模块
pub mod analyzer;
/// 事务并发工具模块
pub mod concurrency;
/// 配置管理模块
pub mod config;
/// 数据库引擎适配模块
pub mod engine;
/// 索引优化模块
pub mod index;
/// 查询计时模块
pub mod instrument;
/// 指标收集模块
pub mod metrics;
/// 事务监控模块
pub mod monitor;
/// 查询优化门面模块
pub mod optimizer;
/// 连接池管理模块
pub mod pool;
/// 优化建议模块
pub mod recommendation;

/// 错误类型定义
pub use crate::config::{DbError, DbResult};

/// Sea-ORM 类型重导出
pub use sea_orm as orm;

pub use crate::pool::DbPool;
