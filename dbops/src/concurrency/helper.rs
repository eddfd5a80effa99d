// Copyright (c) 2025 Kirky.X
//
// Licensed under the MIT License
// See LICENSE file in the project root for full license information.

//! 常见并发更新模式
//!
//! 每个操作都是独立的事务，内部使用悲观锁并按重试策略处理并发冲突。
//! 违反业务规则（越界、库存不足、余额不足、唯一值冲突）返回 [`DbError::Business`]，不会重试。

use sea_orm::{ConnectionTrait, DatabaseTransaction, Statement, Value};

use super::{RetryPolicy, TableRef, TransactionOptions, TransactionToolkit};
use crate::config::{DbError, DbResult};
use crate::engine::row;

/// 数值上下界
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Bounds {
    /// 下界（含）
    pub min: Option<i64>,
    /// 上界（含）
    pub max: Option<i64>,
}

impl Bounds {
    /// 无界
    pub fn none() -> Self {
        Self::default()
    }

    /// 仅下界
    pub fn at_least(min: i64) -> Self {
        Self { min: Some(min), max: None }
    }

    /// 仅上界
    pub fn at_most(max: i64) -> Self {
        Self { min: None, max: Some(max) }
    }

    /// 上下界
    pub fn between(min: i64, max: i64) -> Self {
        Self {
            min: Some(min),
            max: Some(max),
        }
    }

    fn check(&self, column: &str, value: i64) -> DbResult<()> {
        if let Some(min) = self.min {
            if value < min {
                return Err(DbError::business(format!(
                    "{} would become {} which is below the minimum {}",
                    column, value, min
                )));
            }
        }
        if let Some(max) = self.max {
            if value > max {
                return Err(DbError::business(format!(
                    "{} would become {} which is above the maximum {}",
                    column, value, max
                )));
            }
        }
        Ok(())
    }
}

/// 并发更新助手
#[derive(Debug, Clone)]
pub struct ConcurrentUpdateHelper {
    toolkit: TransactionToolkit,
    options: TransactionOptions,
    policy: RetryPolicy,
}

impl ConcurrentUpdateHelper {
    /// 使用默认事务选项与重试策略
    pub fn new(toolkit: TransactionToolkit) -> Self {
        Self {
            toolkit,
            options: TransactionOptions::default(),
            policy: RetryPolicy::default(),
        }
    }

    /// 指定重试策略
    pub fn with_policy(mut self, policy: RetryPolicy) -> Self {
        self.policy = policy;
        self
    }

    /// 指定事务选项
    pub fn with_options(mut self, options: TransactionOptions) -> Self {
        self.options = options;
        self
    }

    fn options_for(&self, label: &str) -> TransactionOptions {
        self.options.clone().label(label)
    }

    /// 加锁读取数值列
    async fn locked_value(
        toolkit: &TransactionToolkit,
        txn: &DatabaseTransaction,
        table: &TableRef,
        column: &str,
        id: i64,
    ) -> DbResult<i64> {
        let locked = toolkit
            .lock_for_update(txn, table, id)
            .await?
            .ok_or_else(|| DbError::business(format!("{} id={} not found", table.name, id)))?;
        row::i64(&locked, column)
            .ok_or_else(|| DbError::business(format!("{}.{} is not a numeric column", table.name, column)))
    }

    /// 写入单列
    async fn write_value(
        toolkit: &TransactionToolkit,
        txn: &DatabaseTransaction,
        table: &TableRef,
        column: &str,
        id: i64,
        value: Value,
    ) -> DbResult<u64> {
        let engine = toolkit.pool().engine();
        let sql = format!(
            "UPDATE {} SET {} = {} WHERE {} = {}",
            engine.quote_ident(&table.name),
            engine.quote_ident(column),
            engine.placeholder(1),
            engine.quote_ident(&table.primary_key),
            engine.placeholder(2)
        );
        let stmt = Statement::from_sql_and_values(txn.get_database_backend(), sql, vec![value, id.into()]);
        Ok(txn.execute_raw(stmt).await?.rows_affected())
    }

    /// 原子增加数值列，返回新值
    pub async fn increment(&self, table: &TableRef, column: &str, id: i64, amount: i64, bounds: Bounds) -> DbResult<i64> {
        let toolkit = self.toolkit.clone();
        let table = table.clone();
        let column = column.to_string();

        self.toolkit
            .with_transaction_retry(self.options_for("increment"), self.policy.clone(), move |txn| {
                let toolkit = toolkit.clone();
                let table = table.clone();
                let column = column.clone();
                Box::pin(async move {
                    let current = Self::locked_value(&toolkit, txn, &table, &column, id).await?;
                    let next = current
                        .checked_add(amount)
                        .ok_or_else(|| DbError::business(format!("{} overflow", column)))?;
                    bounds.check(&column, next)?;
                    Self::write_value(&toolkit, txn, &table, &column, id, next.into()).await?;
                    Ok(next)
                })
            })
            .await
    }

    /// 原子减少数值列，返回新值
    pub async fn decrement(&self, table: &TableRef, column: &str, id: i64, amount: i64, bounds: Bounds) -> DbResult<i64> {
        let negated = amount
            .checked_neg()
            .ok_or_else(|| DbError::business(format!("invalid decrement amount {}", amount)))?;
        self.increment(table, column, id, negated, bounds).await
    }

    /// 扣减库存，库存不足时立即失败，返回剩余库存
    pub async fn decrease_stock(&self, table: &TableRef, column: &str, id: i64, quantity: i64) -> DbResult<i64> {
        if quantity <= 0 {
            return Err(DbError::business(format!("quantity must be positive, got {}", quantity)));
        }

        let toolkit = self.toolkit.clone();
        let table = table.clone();
        let column = column.to_string();

        self.toolkit
            .with_transaction_retry(self.options_for("decrease_stock"), self.policy.clone(), move |txn| {
                let toolkit = toolkit.clone();
                let table = table.clone();
                let column = column.clone();
                Box::pin(async move {
                    let available = Self::locked_value(&toolkit, txn, &table, &column, id).await?;
                    if available < quantity {
                        return Err(DbError::business(format!(
                            "insufficient stock for {} id={}: available {}, requested {}",
                            table.name, id, available, quantity
                        )));
                    }
                    let remaining = available - quantity;
                    Self::write_value(&toolkit, txn, &table, &column, id, remaining.into()).await?;
                    Ok(remaining)
                })
            })
            .await
    }

    /// 转账
    ///
    /// 按主键升序锁定两行，余额不足时失败。返回 `(转出方余额, 转入方余额)`。
    pub async fn transfer_balance(
        &self,
        table: &TableRef,
        column: &str,
        from_id: i64,
        to_id: i64,
        amount: i64,
    ) -> DbResult<(i64, i64)> {
        if from_id == to_id {
            return Err(DbError::business("cannot transfer to the same account"));
        }
        if amount <= 0 {
            return Err(DbError::business(format!("transfer amount must be positive, got {}", amount)));
        }

        let toolkit = self.toolkit.clone();
        let table = table.clone();
        let column = column.to_string();

        self.toolkit
            .with_transaction_retry(self.options_for("transfer_balance"), self.policy.clone(), move |txn| {
                let toolkit = toolkit.clone();
                let table = table.clone();
                let column = column.clone();
                Box::pin(async move {
                    let (first, second) = if from_id < to_id { (from_id, to_id) } else { (to_id, from_id) };
                    let first_balance = Self::locked_value(&toolkit, txn, &table, &column, first).await?;
                    let second_balance = Self::locked_value(&toolkit, txn, &table, &column, second).await?;
                    let (from_balance, to_balance) = if first == from_id {
                        (first_balance, second_balance)
                    } else {
                        (second_balance, first_balance)
                    };

                    if from_balance < amount {
                        return Err(DbError::business(format!(
                            "insufficient balance in {} id={}: available {}, requested {}",
                            table.name, from_id, from_balance, amount
                        )));
                    }
                    let to_next = to_balance
                        .checked_add(amount)
                        .ok_or_else(|| DbError::business(format!("{} overflow", column)))?;
                    let from_next = from_balance - amount;

                    Self::write_value(&toolkit, txn, &table, &column, from_id, from_next.into()).await?;
                    Self::write_value(&toolkit, txn, &table, &column, to_id, to_next.into()).await?;
                    Ok((from_next, to_next))
                })
            })
            .await
    }

    /// 更新唯一字段
    ///
    /// 在同一事务内确认没有其他行持有该值后再写入。
    pub async fn update_unique_field(&self, table: &TableRef, column: &str, id: i64, value: &str) -> DbResult<()> {
        let toolkit = self.toolkit.clone();
        let table = table.clone();
        let column = column.to_string();
        let value = value.to_string();

        self.toolkit
            .with_transaction_retry(self.options_for("update_unique_field"), self.policy.clone(), move |txn| {
                let toolkit = toolkit.clone();
                let table = table.clone();
                let column = column.clone();
                let value = value.clone();
                Box::pin(async move {
                    let engine = toolkit.pool().engine();
                    let where_clause = format!(
                        "{} = {} AND {} <> {}",
                        engine.quote_ident(&column),
                        engine.placeholder(1),
                        engine.quote_ident(&table.primary_key),
                        engine.placeholder(2)
                    );
                    let holders = toolkit
                        .lock_for_update_all(txn, &table, &where_clause, vec![value.clone().into(), id.into()])
                        .await?;
                    if !holders.is_empty() {
                        return Err(DbError::business(format!(
                            "{}.{} value '{}' is already in use",
                            table.name, column, value
                        )));
                    }

                    let updated = Self::write_value(&toolkit, txn, &table, &column, id, value.clone().into()).await?;
                    if updated == 0 {
                        return Err(DbError::business(format!("{} id={} not found", table.name, id)));
                    }
                    Ok(())
                })
            })
            .await
    }
}
