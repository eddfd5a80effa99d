// Copyright (c) 2025 Kirky.X
//
// Licensed under the MIT License
// See LICENSE file in the project root for full license information.

//! 追加写日志文件
//!
//! 超过 `max_bytes` 时先将当前文件重命名为 `<name>.<timestamp>` 再写入新文件。

use parking_lot::Mutex;
use std::fs::{self, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use time::macros::format_description;

/// 带轮转的追加写日志
#[derive(Debug)]
pub struct AppendLog {
    path: PathBuf,
    max_bytes: u64,
    write_lock: Mutex<()>,
}

impl AppendLog {
    /// 创建日志句柄（不会立即创建文件）
    pub fn new(path: impl Into<PathBuf>, max_bytes: u64) -> Self {
        Self {
            path: path.into(),
            max_bytes,
            write_lock: Mutex::new(()),
        }
    }

    /// 日志路径
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// 追加一段文本
    pub fn append(&self, entry: &str) -> io::Result<()> {
        let _guard = self.write_lock.lock();

        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }

        if self.max_bytes > 0 {
            let current = fs::metadata(&self.path).map(|m| m.len()).unwrap_or(0);
            if current > 0 && current + entry.len() as u64 > self.max_bytes {
                self.rotate()?;
            }
        }

        let mut file = OpenOptions::new().create(true).append(true).open(&self.path)?;
        file.write_all(entry.as_bytes())
    }

    /// 读取全部内容，文件不存在时返回空串
    pub fn read_to_string(&self) -> io::Result<String> {
        match fs::read_to_string(&self.path) {
            Ok(content) => Ok(content),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(String::new()),
            Err(e) => Err(e),
        }
    }

    fn rotate(&self) -> io::Result<()> {
        let stamp = time::OffsetDateTime::now_utc()
            .format(format_description!(
                "[year][month][day]T[hour][minute][second][subsecond digits:3]"
            ))
            .map_err(|e| io::Error::other(e.to_string()))?;

        let mut rotated = self.path.clone().into_os_string();
        rotated.push(".");
        rotated.push(stamp);
        fs::rename(&self.path, PathBuf::from(&rotated))?;

        tracing::info!(
            from = %self.path.display(),
            to = %PathBuf::from(rotated).display(),
            "Rotated log file"
        );
        Ok(())
    }
}

/// 慢查询日志
///
/// 条目格式：
/// ```text
/// [2025-01-01T00:00:00Z] elapsed: 1532ms
/// SELECT * FROM orders WHERE status = 'open'
///
/// ```
#[derive(Debug)]
pub struct SlowQueryLog {
    log: AppendLog,
}

impl SlowQueryLog {
    /// 创建慢查询日志
    pub fn new(path: impl Into<PathBuf>, max_bytes: u64) -> Self {
        Self {
            log: AppendLog::new(path, max_bytes),
        }
    }

    /// 追加一条慢查询
    pub fn append(&self, timestamp: &str, elapsed_ms: f64, query: &str) -> io::Result<()> {
        self.log
            .append(&format!("[{}] elapsed: {}ms\n{}\n\n", timestamp, elapsed_ms.round() as u64, query))
    }

    /// 读取全部内容
    pub fn read_to_string(&self) -> io::Result<String> {
        self.log.read_to_string()
    }

    /// 日志路径
    pub fn path(&self) -> &Path {
        self.log.path()
    }
}

/// 性能指标日志，每行 `[timestamp] {json}`
#[derive(Debug)]
pub struct PerformanceLog {
    log: AppendLog,
}

impl PerformanceLog {
    /// 创建性能指标日志
    pub fn new(path: impl Into<PathBuf>, max_bytes: u64) -> Self {
        Self {
            log: AppendLog::new(path, max_bytes),
        }
    }

    /// 追加一行 JSON
    pub fn append<T: serde::Serialize>(&self, timestamp: &str, value: &T) -> io::Result<()> {
        let json = serde_json::to_string(value).map_err(io::Error::other)?;
        self.log.append(&format!("[{}] {}\n", timestamp, json))
    }

    /// 读取全部内容
    pub fn read_to_string(&self) -> io::Result<String> {
        self.log.read_to_string()
    }
}
