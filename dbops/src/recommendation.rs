// Copyright (c) 2025 Kirky.X
//
// Licensed under the MIT License
// See LICENSE file in the project root for full license information.

//! 优化建议
//!
//! 慢查询分析器与索引优化器的共同输出。建议本身不会被执行，
//! 应用 DDL 需要显式调用 [`IndexOptimizer::execute_index_optimization`](crate::index::IndexOptimizer::execute_index_optimization)。

use serde::{Deserialize, Serialize};

/// 建议类型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum RecommendationKind {
    /// 新建索引
    Create,
    /// 删除索引
    Drop,
    /// 修改查询或配置
    Modify,
}

/// 建议优先级
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Priority {
    /// 高
    High,
    /// 中
    Medium,
    /// 低
    Low,
}

/// 单条优化建议
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Recommendation {
    /// 目标表
    pub table_name: String,
    /// 目标列（复合索引以逗号分隔）
    pub column_name: String,
    /// 建议类型
    pub kind: RecommendationKind,
    /// 原因说明
    pub reason: String,
    /// 优先级
    pub priority: Priority,
    /// 建议的 DDL 语句
    #[serde(skip_serializing_if = "Option::is_none")]
    pub suggested_ddl: Option<String>,
}

impl Recommendation {
    /// 创建建议
    pub fn new(
        table_name: impl Into<String>,
        column_name: impl Into<String>,
        kind: RecommendationKind,
        priority: Priority,
        reason: impl Into<String>,
    ) -> Self {
        Self {
            table_name: table_name.into(),
            column_name: column_name.into(),
            kind,
            reason: reason.into(),
            priority,
            suggested_ddl: None,
        }
    }

    /// 附加 DDL
    pub fn with_ddl(mut self, ddl: impl Into<String>) -> Self {
        self.suggested_ddl = Some(ddl.into());
        self
    }
}

/// 按优先级（高在前）稳定排序
pub fn sort_by_priority(recommendations: &mut [Recommendation]) {
    recommendations.sort_by_key(|r| r.priority);
}
