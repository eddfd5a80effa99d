//! DBOps 命令行工具
//!
//! 查看事务健康、锁等待、死锁，分析索引与慢查询，结果以 JSON 输出到标准输出

use anyhow::{Context, bail};
use clap::{Parser, Subcommand};
use dbops::DbPool;
use dbops::analyzer::{FileSlowLogSource, SlowQueryAnalyzer};
use dbops::config::DbConfig;
use dbops::index::IndexOptimizer;
use dbops::monitor::{MonitorService, TransactionMonitor};
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "dbops-cli")]
#[command(about = "DBOps 数据库运维工具", long_about = None)]
struct Cli {
    /// 数据库连接字符串
    #[arg(short, long, env = "DATABASE_URL")]
    database_url: Option<String>,

    /// 配置文件路径（.yaml / .yml / .toml）
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// 日志目录，覆盖配置中的 log_dir
    #[arg(long)]
    log_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// 事务健康报告
    Health,

    /// 活跃事务
    Transactions {
        /// 只显示持续时间超过该秒数的事务
        #[arg(long)]
        long_running: Option<u64>,
    },

    /// 锁等待
    LockWaits,

    /// 最近一次死锁
    Deadlock,

    /// 索引分析
    Indexes {
        /// 只分析指定表
        #[arg(long)]
        table: Option<String>,

        /// 执行第 N 条建议（从 1 开始）
        #[arg(long)]
        apply: Option<usize>,
    },

    /// 慢查询分析
    SlowQueries {
        /// 读取 MySQL 慢查询日志文件
        #[arg(long)]
        mysql_log: Option<PathBuf>,

        /// 只输出统计
        #[arg(long)]
        stats: bool,
    },

    /// 指标快照
    Metrics {
        /// 以 Prometheus 文本格式输出
        #[arg(long)]
        prometheus: bool,
    },

    /// 运行周期监控，直到 Ctrl-C 或达到运行时长
    Monitor {
        /// 采集间隔（毫秒）
        #[arg(long)]
        interval_ms: Option<u64>,

        /// 运行时长（秒）
        #[arg(long)]
        duration_secs: Option<u64>,
    },
}

fn load_config(cli: &Cli) -> anyhow::Result<DbConfig> {
    let mut config = match (&cli.config, &cli.database_url) {
        (Some(path), _) => load_config_file(path)?,
        (None, Some(url)) => {
            let mut config = DbConfig::with_url(url.clone());
            config.monitoring = config.monitoring.with_env_overrides()?;
            config
        }
        (None, None) => {
            let path = DbConfig::discover_config_file(&std::env::current_dir()?).context(
                "--database-url or DATABASE_URL is required when no config file is given or found",
            )?;
            load_config_file(&path)?
        }
    };

    if let Some(url) = &cli.database_url {
        config.url = url.clone();
    }
    if let Some(dir) = &cli.log_dir {
        config.monitoring.log_dir = dir.clone();
    }
    Ok(config)
}

fn load_config_file(path: &Path) -> anyhow::Result<DbConfig> {
    tracing::info!(path = %path.display(), "Loading configuration");
    DbConfig::from_file(path).with_context(|| format!("failed to load config from {}", path.display()))
}

fn print_json<T: Serialize>(value: &T) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")))
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let mut config = load_config(&cli)?;
    if let Commands::Monitor {
        interval_ms: Some(ms), ..
    } = &cli.command
    {
        config.monitoring.collection_interval_ms = *ms;
    }

    let pool = DbPool::with_config(config).await.context("failed to connect")?;
    let monitor = Arc::new(TransactionMonitor::new(pool.clone()));

    match &cli.command {
        Commands::Health => {
            print_json(&monitor.get_transaction_health().await)?;
        }
        Commands::Transactions { long_running } => {
            let transactions = match long_running {
                Some(secs) => monitor.get_long_running_transactions(*secs).await?,
                None => monitor.get_active_transactions().await?,
            };
            print_json(&transactions)?;
        }
        Commands::LockWaits => {
            print_json(&monitor.get_transaction_lock_waits().await?)?;
        }
        Commands::Deadlock => {
            print_json(&monitor.get_deadlock_info().await?)?;
        }
        Commands::Indexes { table, apply } => {
            let optimizer = IndexOptimizer::new(pool.clone());
            let report = optimizer.analyze_indexes(table.as_deref()).await?;
            match apply {
                None => print_json(&report)?,
                Some(n) => {
                    let Some(rec) = n.checked_sub(1).and_then(|i| report.recommendations.get(i)) else {
                        bail!(
                            "recommendation {} does not exist ({} available)",
                            n,
                            report.recommendations.len()
                        );
                    };
                    let outcome = optimizer.execute_index_optimization(rec).await?;
                    print_json(&outcome)?;
                    if !outcome.success {
                        bail!("index optimization failed");
                    }
                }
            }
        }
        Commands::SlowQueries { mysql_log, stats } => {
            let analyzer = match mysql_log {
                Some(path) => SlowQueryAnalyzer::with_source(pool.clone(), Arc::new(FileSlowLogSource::mysql(path))),
                None => SlowQueryAnalyzer::new(pool.clone()),
            };
            if *stats {
                print_json(&analyzer.get_slow_query_stats().await?)?;
            } else {
                print_json(&analyzer.analyze().await?)?;
            }
        }
        Commands::Metrics { prometheus } => {
            let snapshot = pool.instrumentation().get_performance_metrics();
            if *prometheus {
                print!("{}", pool.metrics().export_prometheus()?);
            } else {
                print_json(&snapshot)?;
            }
        }
        Commands::Monitor { duration_secs, .. } => {
            let handle = MonitorService::new(monitor.clone()).start();
            match duration_secs {
                Some(secs) => tokio::time::sleep(Duration::from_secs(*secs)).await,
                None => tokio::signal::ctrl_c().await?,
            }
            handle.shutdown().await;
            print_json(&pool.instrumentation().get_performance_metrics())?;
        }
    }

    Ok(())
}
