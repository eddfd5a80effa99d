// Copyright (c) 2025 Kirky.X
//
// Licensed under the MIT License
// See LICENSE file in the project root for full license information.

//! 执行计划行
//!
//! 各引擎的 `EXPLAIN` 输出统一映射为 MySQL 风格的字段：访问类型 `ALL`
//! 表示全表扫描，`extra` 中的 `Using filesort` / `Using temporary` 表示额外排序或临时表。

use serde::Serialize;

/// 单个执行计划节点
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PlanRow {
    /// 访问的表
    pub table: Option<String>,
    /// 访问类型（`ALL`、`index`、`range`、`ref`、`const` 等）
    pub access_type: Option<String>,
    /// 候选索引
    pub possible_keys: Option<String>,
    /// 实际使用的索引
    pub key: Option<String>,
    /// 预估扫描行数
    pub rows: Option<i64>,
    /// 附加信息
    pub extra: Option<String>,
}

impl PlanRow {
    /// 是否为全表扫描
    pub fn is_full_scan(&self) -> bool {
        self.access_type.as_deref() == Some("ALL")
    }

    /// 是否有访问类型但未使用索引
    pub fn lacks_index(&self) -> bool {
        self.access_type.is_some() && self.key.is_none()
    }

    /// 附加信息中是否包含指定标记
    pub fn extra_contains(&self, needle: &str) -> bool {
        self.extra.as_deref().is_some_and(|e| e.contains(needle))
    }
}
