// Copyright (c) 2025 Kirky.X
//
// Licensed under the MIT License
// See LICENSE file in the project root for full license information.

//! 慢查询日志解析
//!
//! 支持两种格式：
//! - 本库自身写入的 `slow-queries.log`（`[时间] elapsed: Nms` 后跟语句，条目之间空行分隔）
//! - MySQL 慢查询日志文件（`# Time:` / `# User@Host:` / `# Query_time:` 头部）

use regex::Regex;
use serde::Serialize;
use std::sync::OnceLock;

/// 单条慢查询记录
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SlowQueryRecord {
    /// 记录标识
    pub id: String,
    /// 开始时间
    pub start_time: Option<String>,
    /// 执行时间（秒）
    pub query_time_sec: f64,
    /// 锁等待时间（秒）
    pub lock_time_sec: f64,
    /// 扫描行数
    pub rows_examined: i64,
    /// 返回行数
    pub rows_sent: i64,
    /// 用户
    pub user: Option<String>,
    /// 主机
    pub host: Option<String>,
    /// 默认库
    pub schema: Option<String>,
    /// 语句文本
    pub query_text: String,
}

/// 解析结果
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ParsedSlowLog {
    /// 成功解析的记录
    pub records: Vec<SlowQueryRecord>,
    /// 无法解析而跳过的条目数
    pub skipped: usize,
}

/// 慢查询日志解析器
pub trait SlowLogParser: Send + Sync + std::fmt::Debug {
    /// 解析日志全文
    fn parse(&self, content: &str) -> ParsedSlowLog;
}

fn elapsed_header() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?m)^\[([^\]]+)\] elapsed: ([0-9.]+)ms$").expect("valid regex"))
}

/// 本库慢查询日志解析器
#[derive(Debug, Clone, Copy, Default)]
pub struct InstrumentationLogParser;

impl SlowLogParser for InstrumentationLogParser {
    fn parse(&self, content: &str) -> ParsedSlowLog {
        let mut parsed = ParsedSlowLog::default();

        // (header start, body start, timestamp, elapsed)
        let headers: Vec<(usize, usize, &str, &str)> = elapsed_header()
            .captures_iter(content)
            .filter_map(|caps| {
                let whole = caps.get(0)?;
                Some((whole.start(), whole.end(), caps.get(1)?.as_str(), caps.get(2)?.as_str()))
            })
            .collect();

        let first_header = headers.first().map_or(content.len(), |header| header.0);
        if !content[..first_header].trim().is_empty() {
            parsed.skipped += 1;
        }

        for (n, &(_, body_start, timestamp, elapsed)) in headers.iter().enumerate() {
            let body_end = headers.get(n + 1).map_or(content.len(), |next| next.0);
            let query = content[body_start..body_end].trim();
            let Ok(elapsed_ms) = elapsed.parse::<f64>() else {
                parsed.skipped += 1;
                continue;
            };
            if query.is_empty() {
                parsed.skipped += 1;
                continue;
            }

            parsed.records.push(SlowQueryRecord {
                id: format!("log-{}", n + 1),
                start_time: Some(timestamp.to_string()),
                query_time_sec: elapsed_ms / 1000.0,
                query_text: query.to_string(),
                ..SlowQueryRecord::default()
            });
        }

        parsed
    }
}

fn query_time_line() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(
            r"#\s*Query_time:\s*([0-9.]+)\s+Lock_time:\s*([0-9.]+)\s+Rows_sent:\s*(\d+)\s+Rows_examined:\s*(\d+)",
        )
        .expect("valid regex")
    })
}

fn use_database_line() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?i)^use\s+`?([^`\s;]+)`?;?$").expect("valid regex"))
}

fn user_host_line() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"#\s*User@Host:\s*([^\[\s]*)\[[^\]]*\]\s*@\s*(\S*)\s*\[([^\]]*)\]").expect("valid regex"))
}

/// MySQL 慢查询日志文件解析器
#[derive(Debug, Clone, Copy, Default)]
pub struct MySqlSlowLogParser;

#[derive(Default)]
struct PendingEntry {
    started: bool,
    start_time: Option<String>,
    user: Option<String>,
    host: Option<String>,
    timing: Option<(f64, f64, i64, i64)>,
    query: Vec<String>,
}

impl PendingEntry {
    fn finish(self, n: usize, schema: &Option<String>, parsed: &mut ParsedSlowLog) {
        if !self.started {
            return;
        }
        let query = self.query.join("\n").trim().to_string();
        let Some((query_time, lock_time, rows_sent, rows_examined)) = self.timing else {
            parsed.skipped += 1;
            return;
        };
        if query.is_empty() {
            parsed.skipped += 1;
            return;
        }
        parsed.records.push(SlowQueryRecord {
            id: format!("slowlog-{}", n),
            start_time: self.start_time,
            query_time_sec: query_time,
            lock_time_sec: lock_time,
            rows_examined,
            rows_sent,
            user: self.user,
            host: self.host,
            schema: schema.clone(),
            query_text: query,
        });
    }
}

impl SlowLogParser for MySqlSlowLogParser {
    fn parse(&self, content: &str) -> ParsedSlowLog {
        let mut parsed = ParsedSlowLog::default();
        let mut schema: Option<String> = None;
        let mut last_time: Option<String> = None;
        let mut current = PendingEntry::default();
        let mut count = 0usize;

        for line in content.lines() {
            let trimmed = line.trim();

            if let Some(ts) = trimmed.strip_prefix("# Time:") {
                last_time = Some(ts.trim().to_string());
                if current.started && current.timing.is_some() {
                    count += 1;
                    std::mem::take(&mut current).finish(count, &schema, &mut parsed);
                }
                continue;
            }

            if trimmed.starts_with("# User@Host:") {
                if current.started {
                    count += 1;
                    std::mem::take(&mut current).finish(count, &schema, &mut parsed);
                }
                current.started = true;
                current.start_time = last_time.clone();
                if let Some(caps) = user_host_line().captures(trimmed) {
                    current.user = Some(caps[1].to_string()).filter(|s| !s.is_empty());
                    let host = if caps[2].is_empty() { &caps[3] } else { &caps[2] };
                    current.host = Some(host.to_string()).filter(|s| !s.is_empty());
                }
                continue;
            }

            if trimmed.starts_with("# Query_time:") {
                if !current.started {
                    current.started = true;
                    current.start_time = last_time.clone();
                }
                current.timing = query_time_line().captures(trimmed).and_then(|caps| {
                    Some((
                        caps[1].parse().ok()?,
                        caps[2].parse().ok()?,
                        caps[3].parse().ok()?,
                        caps[4].parse().ok()?,
                    ))
                });
                continue;
            }

            if trimmed.starts_with('#')
                || trimmed.is_empty()
                || trimmed.starts_with("SET timestamp=")
                || trimmed.starts_with("Tcp port:")
                || trimmed.starts_with("Time ")
                || trimmed.ends_with("started with:")
            {
                continue;
            }

            if let Some(caps) = use_database_line().captures(trimmed) {
                schema = Some(caps[1].to_string());
                continue;
            }

            if current.started {
                current.query.push(line.to_string());
            }
        }

        count += 1;
        current.finish(count, &schema, &mut parsed);
        parsed
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_instrumentation_log() {
        let content = "garbage entry\n\n\
                       [2025-03-01T10:00:00Z] elapsed: 1500.5ms\nSELECT * FROM orders\n\n\
                       [2025-03-01T10:00:01Z] elapsed: 2000ms\nUPDATE users\nSET name = 'x'\n\n";
        let parsed = InstrumentationLogParser.parse(content);

        assert_eq!(parsed.records.len(), 2);
        assert_eq!(parsed.skipped, 1);
        assert!((parsed.records[0].query_time_sec - 1.5005).abs() < 1e-9);
        assert_eq!(parsed.records[1].query_text, "UPDATE users\nSET name = 'x'");
        assert_eq!(parsed.records[1].start_time.as_deref(), Some("2025-03-01T10:00:01Z"));
    }

    #[test]
    fn test_instrumentation_query_with_blank_line() {
        let content = "[2025-03-01T10:00:00Z] elapsed: 1200ms\nSELECT id\n\nFROM orders\n\n\n\
                       [2025-03-01T10:00:01Z] elapsed: 0ms\n\n\
                       [2025-03-01T10:00:02Z] elapsed: 3000ms\nDELETE FROM sessions\n\n";
        let parsed = InstrumentationLogParser.parse(content);

        assert_eq!(parsed.records.len(), 2);
        assert_eq!(parsed.skipped, 1);
        assert_eq!(parsed.records[0].query_text, "SELECT id\n\nFROM orders");
        assert_eq!(parsed.records[1].id, "log-3");
        assert_eq!(parsed.records[1].query_text, "DELETE FROM sessions");
    }

    #[test]
    fn test_parse_mysql_slow_log() {
        let content = "/usr/sbin/mysqld, Version: 8.0.36. started with:
Tcp port: 3306  Unix socket: /var/run/mysqld/mysqld.sock
Time                 Id Command    Argument
# Time: 2025-03-01T10:00:00.123456Z
# User@Host: app[app] @ localhost [127.0.0.1]  Id:    12
# Query_time: 2.500000  Lock_time: 0.000100 Rows_sent: 10  Rows_examined: 50000
use shop;
SET timestamp=1740823200;
SELECT * FROM orders
WHERE status = 'open';
# User@Host: report[report] @  [10.0.0.5]  Id:    13
# Query_time: 1.200000  Lock_time: 1.500000 Rows_sent: 1  Rows_examined: 1
SET timestamp=1740823201;
UPDATE accounts SET balance = 0 WHERE id = 1;
";
        let parsed = MySqlSlowLogParser.parse(content);

        assert_eq!(parsed.skipped, 0);
        assert_eq!(parsed.records.len(), 2);

        let first = &parsed.records[0];
        assert_eq!(first.start_time.as_deref(), Some("2025-03-01T10:00:00.123456Z"));
        assert_eq!(first.user.as_deref(), Some("app"));
        assert_eq!(first.host.as_deref(), Some("localhost"));
        assert_eq!(first.schema.as_deref(), Some("shop"));
        assert_eq!(first.rows_examined, 50000);
        assert_eq!(first.query_text, "SELECT * FROM orders\nWHERE status = 'open';");

        let second = &parsed.records[1];
        assert_eq!(second.host.as_deref(), Some("10.0.0.5"));
        assert!((second.lock_time_sec - 1.5).abs() < 1e-9);
    }

    #[test]
    fn test_mysql_entry_without_timing_is_skipped() {
        let content = "# User@Host: app[app] @ localhost []\nSELECT 1;\n";
        let parsed = MySqlSlowLogParser.parse(content);
        assert!(parsed.records.is_empty());
        assert_eq!(parsed.skipped, 1);
    }

    #[test]
    fn test_mysql_use_index_hint_stays_in_query() {
        let content = "# User@Host: app[app] @ localhost [127.0.0.1]  Id:    12
# Query_time: 1.000000  Lock_time: 0.000000 Rows_sent: 1  Rows_examined: 9000
USE `shop`;
SELECT * FROM orders
USE INDEX (idx_orders_status)
WHERE status = 'open';
";
        let parsed = MySqlSlowLogParser.parse(content);

        assert_eq!(parsed.records.len(), 1);
        let record = &parsed.records[0];
        assert_eq!(record.schema.as_deref(), Some("shop"));
        assert_eq!(
            record.query_text,
            "SELECT * FROM orders\nUSE INDEX (idx_orders_status)\nWHERE status = 'open';"
        );
    }
}
