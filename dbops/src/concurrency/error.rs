// Copyright (c) 2025 Kirky.X
//
// Licensed under the MIT License
// See LICENSE file in the project root for full license information.

//! 并发冲突错误

use serde::Serialize;
use thiserror::Error;

/// 锁超时的具体成因
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LockTimeoutKind {
    /// 引擎检测到死锁并选择当前事务为牺牲者
    Deadlock,
    /// 等待行锁超时
    LockWaitTimeout,
    /// 事务整体超出调用方设定的时限
    TransactionTimeout,
}

/// 并发冲突错误
#[derive(Debug, Clone, Error)]
pub enum ConcurrencyError {
    /// 版本号校验失败：期望版本的行不存在或已被其他事务修改
    #[error("Optimistic lock conflict on {table} id={id}: expected version {expected_version}")]
    OptimisticLock {
        /// 表名
        table: String,
        /// 主键值
        id: String,
        /// 期望的版本号
        expected_version: i64,
        /// 是否可以重试
        retryable: bool,
    },

    /// 死锁、锁等待超时或事务超时
    #[error("Lock timeout ({kind:?}): {reason}")]
    LockTimeout {
        /// 引擎返回或内部生成的原因描述
        reason: String,
        /// 成因
        kind: LockTimeoutKind,
        /// 是否可以重试
        retryable: bool,
    },
}

impl ConcurrencyError {
    /// 构造乐观锁冲突
    pub fn optimistic_lock(table: impl Into<String>, id: impl ToString, expected_version: i64) -> Self {
        ConcurrencyError::OptimisticLock {
            table: table.into(),
            id: id.to_string(),
            expected_version,
            retryable: true,
        }
    }

    /// 构造死锁
    pub fn deadlock(reason: impl Into<String>) -> Self {
        ConcurrencyError::LockTimeout {
            reason: reason.into(),
            kind: LockTimeoutKind::Deadlock,
            retryable: true,
        }
    }

    /// 构造锁等待超时
    pub fn lock_timeout(reason: impl Into<String>) -> Self {
        ConcurrencyError::LockTimeout {
            reason: reason.into(),
            kind: LockTimeoutKind::LockWaitTimeout,
            retryable: true,
        }
    }

    /// 构造事务超时
    pub fn transaction_timeout(timeout_ms: u128) -> Self {
        ConcurrencyError::LockTimeout {
            reason: format!("transaction exceeded {}ms", timeout_ms),
            kind: LockTimeoutKind::TransactionTimeout,
            retryable: true,
        }
    }

    /// 是否可以重试
    pub fn retryable(&self) -> bool {
        match self {
            ConcurrencyError::OptimisticLock { retryable, .. } => *retryable,
            ConcurrencyError::LockTimeout { retryable, .. } => *retryable,
        }
    }

    /// 锁超时成因，乐观锁冲突返回 `None`
    pub fn lock_timeout_kind(&self) -> Option<LockTimeoutKind> {
        match self {
            ConcurrencyError::LockTimeout { kind, .. } => Some(*kind),
            ConcurrencyError::OptimisticLock { .. } => None,
        }
    }
}
