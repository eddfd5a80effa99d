// Copyright (c) 2025 Kirky.X
//
// Licensed under the MIT License
// See LICENSE file in the project root for full license information.

//! 配置管理模块
//!
//! 提供数据库与监控配置的加载、验证和自动修正功能

mod monitoring;

pub use monitoring::{HealthThresholds, MonitoringConfig};

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

use crate::concurrency::ConcurrencyError;

/// 数据库类型枚举
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DatabaseType {
    /// PostgreSQL
    Postgres,
    /// MySQL
    MySql,
    /// SQLite
    Sqlite,
}

impl DatabaseType {
    /// 从连接 URL 或类型名解析数据库类型
    pub fn parse_database_type(s: &str) -> Self {
        let lower = s.to_lowercase();
        if lower.starts_with("postgres") {
            DatabaseType::Postgres
        } else if lower.starts_with("mysql") || lower.starts_with("mariadb") {
            DatabaseType::MySql
        } else {
            DatabaseType::Sqlite
        }
    }

    /// 获取数据库类型的显示名称
    pub fn as_str(&self) -> &'static str {
        match self {
            DatabaseType::Postgres => "postgres",
            DatabaseType::MySql => "mysql",
            DatabaseType::Sqlite => "sqlite",
        }
    }
}

impl std::fmt::Display for DatabaseType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// 配置加载错误
#[derive(Debug, Error)]
pub enum ConfigError {
    /// 文件未找到
    #[error("File not found: {0}")]
    FileNotFound(String),

    /// 格式无效
    #[error("Invalid format: {0}")]
    InvalidFormat(String),

    /// 缺少必填字段
    #[error("Missing required field: {0}")]
    MissingField(String),

    /// 环境变量错误
    #[error("Environment variable error: {0}")]
    EnvVarError(#[from] std::env::VarError),

    /// IO错误
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),
}

/// 数据库配置
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct DbConfig {
    /// 数据库连接 URL
    #[serde(default)]
    pub url: String,

    /// 最大连接数
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,

    /// 最小连接数
    #[serde(default = "default_min_connections")]
    pub min_connections: u32,

    /// 空闲连接超时（秒）
    #[serde(default = "default_idle_timeout")]
    pub idle_timeout: u64,

    /// 连接获取超时（毫秒）
    #[serde(default = "default_acquire_timeout")]
    pub acquire_timeout: u64,

    /// 监控配置
    #[serde(default)]
    pub monitoring: MonitoringConfig,
}

fn default_max_connections() -> u32 {
    20
}

fn default_min_connections() -> u32 {
    5
}

fn default_idle_timeout() -> u64 {
    300
}

fn default_acquire_timeout() -> u64 {
    5000
}

fn env_or<T: std::str::FromStr>(name: &str, default: T) -> Result<T, ConfigError> {
    match std::env::var(name) {
        Ok(raw) => raw
            .parse()
            .map_err(|_| ConfigError::InvalidFormat(format!("{} has an invalid value: {}", name, raw))),
        Err(_) => Ok(default),
    }
}

impl DbConfig {
    /// 使用 URL 和默认值创建配置
    pub fn with_url(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            max_connections: default_max_connections(),
            min_connections: default_min_connections(),
            idle_timeout: default_idle_timeout(),
            acquire_timeout: default_acquire_timeout(),
            monitoring: MonitoringConfig::default(),
        }
    }

    /// 从环境变量创建配置
    ///
    /// # Errors
    ///
    /// 如果必需的环境变量缺失或格式错误，返回错误
    pub fn from_env() -> Result<Self, ConfigError> {
        let url = std::env::var("DATABASE_URL").map_err(|_| ConfigError::MissingField("DATABASE_URL".to_string()))?;

        let config = Self {
            url,
            max_connections: env_or("DB_MAX_CONNECTIONS", default_max_connections())?,
            min_connections: env_or("DB_MIN_CONNECTIONS", default_min_connections())?,
            idle_timeout: env_or("DB_IDLE_TIMEOUT", default_idle_timeout())?,
            acquire_timeout: env_or("DB_ACQUIRE_TIMEOUT", default_acquire_timeout())?,
            monitoring: MonitoringConfig::default().with_env_overrides()?,
        };

        Ok(config)
    }

    /// 从 YAML 文件加载配置
    ///
    /// 支持以下格式：
    /// ```yaml
    /// database:
    ///   url: "sqlite::memory:"
    ///   max_connections: 20
    ///   monitoring:
    ///     slow_query_threshold_ms: 500
    ///     auto_kill_enabled: false
    /// ```
    ///
    /// # Errors
    ///
    /// 如果文件不存在或格式错误，返回错误
    pub fn from_yaml_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path.as_ref())?;
        Self::from_yaml_str(&content)
    }

    /// 从 TOML 文件加载配置
    ///
    /// 支持以下格式：
    /// ```toml
    /// [database]
    /// url = "sqlite::memory:"
    /// max_connections = 20
    ///
    /// [database.monitoring]
    /// slow_query_threshold_ms = 500
    /// ```
    ///
    /// # Errors
    ///
    /// 如果文件不存在或格式错误，返回错误
    pub fn from_toml_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path.as_ref())?;
        Self::from_toml_str(&content)
    }

    /// 从 YAML 字符串加载配置（支持带 `database` 前缀的格式）
    ///
    /// # Errors
    ///
    /// 如果格式错误，返回错误
    pub fn from_yaml_str(yaml: &str) -> Result<Self, ConfigError> {
        #[derive(Debug, Deserialize)]
        struct ConfigWrapper {
            database: DbConfig,
        }

        let config = match serde_yaml::from_str::<ConfigWrapper>(yaml) {
            Ok(wrapper) => wrapper.database,
            Err(_) => serde_yaml::from_str::<DbConfig>(yaml).map_err(|e| ConfigError::InvalidFormat(e.to_string()))?,
        };

        config.validate()?;
        Ok(config)
    }

    /// 从 TOML 字符串加载配置（支持带 `[database]` 前缀的格式）
    ///
    /// # Errors
    ///
    /// 如果格式错误，返回错误
    pub fn from_toml_str(toml_str: &str) -> Result<Self, ConfigError> {
        #[derive(Debug, Deserialize)]
        struct ConfigWrapper {
            database: DbConfig,
        }

        let config = match toml::from_str::<ConfigWrapper>(toml_str) {
            Ok(wrapper) => wrapper.database,
            Err(_) => toml::from_str::<DbConfig>(toml_str).map_err(|e| ConfigError::InvalidFormat(e.to_string()))?,
        };

        config.validate()?;
        Ok(config)
    }

    /// 验证配置必填字段
    ///
    /// # Errors
    ///
    /// 如果缺少必填字段，返回错误
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.url.is_empty() {
            return Err(ConfigError::MissingField("url".to_string()));
        }

        if self.max_connections == 0 {
            return Err(ConfigError::MissingField("max_connections".to_string()));
        }

        if self.min_connections > self.max_connections {
            return Err(ConfigError::InvalidFormat(
                "min_connections cannot be greater than max_connections".to_string(),
            ));
        }

        self.monitoring.validate()
    }

    /// 获取数据库类型
    pub fn database_type(&self) -> DatabaseType {
        DatabaseType::parse_database_type(&self.url)
    }

    /// 获取空闲超时 Duration
    pub fn idle_timeout_duration(&self) -> Duration {
        Duration::from_secs(self.idle_timeout)
    }

    /// 获取获取超时 Duration
    pub fn acquire_timeout_duration(&self) -> Duration {
        Duration::from_millis(self.acquire_timeout)
    }

    /// 按扩展名加载配置文件，`.toml` 按 TOML 解析，其余按 YAML 解析
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        match path.extension().and_then(|ext| ext.to_str()) {
            Some("toml") => Self::from_toml_file(path),
            _ => Self::from_yaml_file(path),
        }
    }

    /// 查找配置文件
    ///
    /// 依次检查 `base` 下的 `dbops.yaml`、`dbops.toml`、`config/dbops.yaml`、
    /// `config/dbops.toml`，然后是 `~/.config/dbops/config.yaml` 与 `~/.dbops/config.toml`
    pub fn discover_config_file(base: &Path) -> Option<PathBuf> {
        let local = CONFIG_FILE_CANDIDATES.iter().map(|candidate| base.join(candidate));
        let user = home::home_dir().into_iter().flat_map(|home| {
            [
                home.join(".config").join("dbops").join("config.yaml"),
                home.join(".dbops").join("config.toml"),
            ]
        });
        local.chain(user).find(|path| path.is_file())
    }
}

const CONFIG_FILE_CANDIDATES: [&str; 4] = ["dbops.yaml", "dbops.toml", "config/dbops.yaml", "config/dbops.toml"];

/// 配置自动修正器
#[derive(Debug, Clone)]
pub struct ConfigCorrector;

impl ConfigCorrector {
    /// 自动修正数据库配置
    pub fn auto_correct(mut config: DbConfig) -> DbConfig {
        if config.min_connections > config.max_connections {
            tracing::warn!(
                "Correcting min_connections ({}) > max_connections ({}), setting min to max",
                config.min_connections,
                config.max_connections
            );
            config.min_connections = config.max_connections;
        }

        if config.min_connections == 0 {
            config.min_connections = 1;
            tracing::warn!("Correcting min_connections from 0 to 1");
        }

        if config.max_connections == 0 {
            config.max_connections = 10;
            tracing::warn!("Correcting max_connections from 0 to 10");
        }

        if config.acquire_timeout == 0 {
            config.acquire_timeout = 5000;
        } else if config.acquire_timeout < 1000 {
            tracing::warn!(
                "Adjusting acquire_timeout from {}ms to minimum 1000ms",
                config.acquire_timeout
            );
            config.acquire_timeout = 1000;
        } else if config.acquire_timeout > 60000 {
            tracing::warn!(
                "Adjusting acquire_timeout from {}ms to maximum 60000ms",
                config.acquire_timeout
            );
            config.acquire_timeout = 60000;
        }

        if config.idle_timeout == 0 {
            config.idle_timeout = 300;
        } else if config.idle_timeout < 30 {
            tracing::warn!("Adjusting idle_timeout from {}s to minimum 30s", config.idle_timeout);
            config.idle_timeout = 30;
        } else if config.idle_timeout > 3600 {
            tracing::warn!("Adjusting idle_timeout from {}s to maximum 3600s", config.idle_timeout);
            config.idle_timeout = 3600;
        }

        config.monitoring = ConfigCorrector::auto_correct_monitoring(config.monitoring);
        config
    }

    /// 自动修正监控配置
    ///
    /// 自动终止阈值不得低于长事务阈值，批量上限与采集间隔不得为 0。
    pub fn auto_correct_monitoring(mut monitoring: MonitoringConfig) -> MonitoringConfig {
        if monitoring.bulk_operation_limit == 0 {
            tracing::warn!("Correcting bulk_operation_limit from 0 to 1000");
            monitoring.bulk_operation_limit = 1000;
        }

        if monitoring.collection_interval_ms == 0 {
            tracing::warn!("Correcting collection_interval_ms from 0 to 60000");
            monitoring.collection_interval_ms = 60_000;
        }

        if monitoring.auto_kill_threshold_sec < monitoring.long_running_threshold_sec {
            tracing::warn!(
                "Correcting auto_kill_threshold_sec ({}) below long_running_threshold_sec ({})",
                monitoring.auto_kill_threshold_sec,
                monitoring.long_running_threshold_sec
            );
            monitoring.auto_kill_threshold_sec = monitoring.long_running_threshold_sec;
        }

        monitoring
    }
}

/// 数据库操作结果类型
pub type DbResult<T> = Result<T, DbError>;

/// 数据库错误
#[derive(Debug, Error)]
pub enum DbError {
    /// 连接或执行错误（引擎原生错误，未被翻译）
    #[error("Connection error: {0}")]
    Connection(#[from] sea_orm::DbErr),

    /// 配置错误
    #[error("Configuration error: {0}")]
    Config(String),

    /// 事务错误
    #[error("Transaction error: {0}")]
    Transaction(String),

    /// 并发冲突（可重试分类见 [`ConcurrencyError::retryable`]）
    #[error(transparent)]
    Concurrency(#[from] ConcurrencyError),

    /// 业务规则错误（越界、库存/余额不足、唯一性冲突），永不重试
    #[error("Business rule violated: {0}")]
    Business(String),

    /// 分析错误（EXPLAIN 失败、日志解析失败）
    #[error("Analysis error: {0}")]
    Analysis(String),

    /// IO错误
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl DbError {
    /// 是否可以重试
    pub fn is_retryable(&self) -> bool {
        matches!(self, DbError::Concurrency(e) if e.retryable())
    }

    /// 构造业务错误
    pub fn business(message: impl Into<String>) -> Self {
        DbError::Business(message.into())
    }
}

impl From<ConfigError> for DbError {
    fn from(err: ConfigError) -> Self {
        DbError::Config(err.to_string())
    }
}
