// Copyright (c) 2025 Kirky.X
//
// Licensed under the MIT License
// See LICENSE file in the project root for full license information.

//! 死锁诊断文本解析

use regex::Regex;
use serde::Serialize;
use std::sync::OnceLock;
use time::macros::format_description;
use time::PrimitiveDateTime;

/// 解析后的死锁报告
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DeadlockReport {
    /// 报告中的时间戳（原样）
    pub timestamp: Option<String>,
    /// 参与死锁的事务摘要，每个事务一行
    pub transactions: Vec<String>,
    /// 被回滚的事务序号
    pub victim: Option<u32>,
}

/// 解析 `YYYY-MM-DD HH:MM:SS` 开头的服务器时间，不带时区
pub fn parse_server_time(raw: &str) -> Option<PrimitiveDateTime> {
    let head = raw.trim().get(..19)?;
    PrimitiveDateTime::parse(head, format_description!("[year]-[month]-[day] [hour]:[minute]:[second]")).ok()
}

impl DeadlockReport {
    /// 死锁距 `server_now` 的秒数；时间戳缺失或无法解析时为 `None`
    ///
    /// InnoDB 报告使用服务器本地时间，`server_now` 必须取自同一台服务器的时钟。
    pub fn age_sec(&self, server_now: PrimitiveDateTime) -> Option<i64> {
        let occurred = parse_server_time(self.timestamp.as_deref()?)?;
        Some((server_now - occurred).whole_seconds())
    }
}

/// 死锁诊断文本解析器
pub trait DeadlockParser: Send + Sync + std::fmt::Debug {
    /// 解析诊断文本，没有死锁段落或无法识别时返回 `None`
    fn parse(&self, raw: &str) -> Option<DeadlockReport>;
}

/// InnoDB 状态报告解析器
///
/// 读取 `LATEST DETECTED DEADLOCK` 段落。
#[derive(Debug, Clone, Copy, Default)]
pub struct InnoDbDeadlockParser;

fn victim_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"WE ROLL BACK TRANSACTION \((\d+)\)").expect("valid regex"))
}

impl DeadlockParser for InnoDbDeadlockParser {
    fn parse(&self, raw: &str) -> Option<DeadlockReport> {
        let start = raw.find("LATEST DETECTED DEADLOCK")?;
        let section = &raw[start..];
        let section = match section.find("\nTRANSACTIONS\n") {
            Some(end) => &section[..end],
            None => section,
        };

        let mut lines = section.lines().skip(1).filter(|l| !l.trim().is_empty());
        let timestamp = lines
            .find(|l| !l.trim_start().starts_with('-'))
            .map(|l| l.trim().to_string())
            .filter(|l| l.chars().next().is_some_and(|c| c.is_ascii_digit()));

        let mut transactions = Vec::new();
        let mut take_next = false;
        for line in section.lines() {
            if take_next {
                transactions.push(line.trim().to_string());
                take_next = false;
            }
            if line.starts_with("*** (") && line.trim_end().ends_with("TRANSACTION:") {
                take_next = true;
            }
        }

        let victim = victim_pattern()
            .captures(section)
            .and_then(|c| c.get(1))
            .and_then(|m| m.as_str().parse().ok());

        Some(DeadlockReport {
            timestamp,
            transactions,
            victim,
        })
    }
}
