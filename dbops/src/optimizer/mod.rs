// Copyright (c) 2025 Kirky.X
//
// Licensed under the MIT License
// See LICENSE file in the project root for full license information.

//! 查询优化门面
//!
//! 对常见读写操作做统一的形状约束，所有语句都经过查询计时：
//! - **分页**: 行查询与计数并发执行，大表可用行数估算代替 `COUNT(*)`
//! - **批量写入**: 按 `bulk_operation_limit` 分批，全部批次在同一事务内
//! - **关联读取**: 仅加载模型声明过的关联，多对多的中间表字段默认不返回
//!
//! # 示例
//!
//! ```rust,ignore
//! use dbops::optimizer::{FindOptions, PageRequest, QueryOptimizer};
//!
//! let optimizer = QueryOptimizer::new(pool.clone());
//! let page = optimizer
//!     .optimized_paginate("orders", FindOptions::default(), PageRequest::new(1, 20))
//!     .await?;
//! println!("{} / {}", page.rows.len(), page.total);
//! ```

use sea_orm::{ConnectionTrait, DatabaseTransaction, FromQueryResult, JsonValue, Statement, Value};
use serde::Serialize;
use serde_json::Map;
use std::collections::{HashMap, HashSet};
use tracing::{debug, warn};

use crate::concurrency::{TableRef, TransactionOptions, TransactionToolkit};
use crate::config::{DbError, DbResult};
use crate::engine::{EngineAdapter, row};
use crate::instrument::QueryInstrumentation;
use crate::pool::DbPool;

/// 排序方向
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum SortOrder {
    /// 升序
    #[default]
    Asc,
    /// 降序
    Desc,
}

/// 查询条件与形状
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FindOptions {
    /// 返回的列，空表示全部
    pub columns: Vec<String>,
    /// 等值条件，以 AND 连接
    pub filters: Vec<(String, Value)>,
    /// 排序
    pub order_by: Vec<(String, SortOrder)>,
    /// 行数上限
    pub limit: Option<u64>,
    /// 偏移
    pub offset: Option<u64>,
}

impl FindOptions {
    /// 指定返回的列
    pub fn columns<I, S>(mut self, columns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.columns = columns.into_iter().map(Into::into).collect();
        self
    }

    /// 追加等值条件
    pub fn filter(mut self, column: impl Into<String>, value: impl Into<Value>) -> Self {
        self.filters.push((column.into(), value.into()));
        self
    }

    /// 追加排序
    pub fn order_by(mut self, column: impl Into<String>, order: SortOrder) -> Self {
        self.order_by.push((column.into(), order));
        self
    }

    /// 行数上限
    pub fn limit(mut self, limit: u64) -> Self {
        self.limit = Some(limit);
        self
    }
}

/// 分页请求
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageRequest {
    /// 页码，从 1 开始
    pub page: u64,
    /// 每页行数
    pub page_size: u64,
    /// 大表使用行数估算
    pub use_count_estimation: bool,
}

impl PageRequest {
    /// 创建分页请求
    pub fn new(page: u64, page_size: u64) -> Self {
        Self {
            page: page.max(1),
            page_size,
            use_count_estimation: false,
        }
    }

    /// 启用行数估算
    pub fn with_count_estimation(mut self) -> Self {
        self.use_count_estimation = true;
        self
    }
}

/// 分页结果
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Page {
    /// 当前页数据
    pub rows: Vec<JsonValue>,
    /// 总行数
    pub total: u64,
    /// 页码
    pub page: u64,
    /// 每页行数
    pub page_size: u64,
    /// 总页数
    pub total_pages: u64,
    /// 是否还有下一页
    pub has_more: bool,
    /// 总行数是否为估算值
    pub estimated: bool,
}

/// 每条 INSERT 的行数，受批量上限与绑定参数上限共同约束
fn rows_per_statement(limit: usize, columns: usize, max_params: usize) -> usize {
    limit.min(max_params / columns.max(1)).max(1)
}

fn total_pages(total: u64, page_size: u64) -> u64 {
    if page_size == 0 { 0 } else { total.div_ceil(page_size) }
}

/// 按主键更新一行
#[derive(Debug, Clone, PartialEq)]
pub struct RowUpdate {
    /// 主键
    pub id: i64,
    /// 列与新值
    pub values: Vec<(String, Value)>,
}

/// 关联类型
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AssociationKind {
    /// 本表外键指向目标表主键
    BelongsTo {
        /// 本表外键列
        foreign_key: String,
    },
    /// 目标表外键指向本表主键，至多一行
    HasOne {
        /// 目标表外键列
        foreign_key: String,
    },
    /// 目标表外键指向本表主键
    HasMany {
        /// 目标表外键列
        foreign_key: String,
    },
    /// 经中间表关联
    ManyToMany {
        /// 中间表
        through: String,
        /// 中间表中指向本表的列
        source_key: String,
        /// 中间表中指向目标表的列
        target_key: String,
    },
}

/// 模型声明的一个关联
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Association {
    /// 关联名，同时是结果中的字段名
    pub name: String,
    /// 目标表
    pub target: TableRef,
    /// 关联类型
    pub kind: AssociationKind,
}

impl Association {
    /// 创建关联
    pub fn new(name: impl Into<String>, target: TableRef, kind: AssociationKind) -> Self {
        Self {
            name: name.into(),
            target,
            kind,
        }
    }
}

/// 声明了关联的模型
pub trait ModelAssociations {
    /// 模型对应的表
    fn table() -> TableRef;

    /// 声明的关联
    fn associations() -> Vec<Association>;
}

/// 请求加载的关联
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AssociationRequest {
    /// 关联名
    pub name: String,
    /// 多对多时是否返回中间表字段
    pub include_through: bool,
}

impl AssociationRequest {
    /// 同时返回中间表字段
    pub fn with_through(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            include_through: true,
        }
    }
}

impl From<&str> for AssociationRequest {
    fn from(name: &str) -> Self {
        Self {
            name: name.to_string(),
            include_through: false,
        }
    }
}

/// 过滤掉模型未声明的关联，每个无效名称记录一条警告
pub fn validate_associations(
    declared: &[Association],
    requested: &[AssociationRequest],
) -> Vec<(Association, bool)> {
    let mut seen = HashSet::new();
    requested
        .iter()
        .filter_map(|req| match declared.iter().find(|a| a.name == req.name) {
            Some(assoc) if seen.insert(req.name.clone()) => Some((assoc.clone(), req.include_through)),
            Some(_) => None,
            None => {
                warn!(association = %req.name, "Ignoring undeclared association");
                None
            }
        })
        .collect()
}

fn key_string(value: &JsonValue, column: &str) -> Option<String> {
    row::str(value, column)
}

fn key_value(value: &JsonValue, column: &str) -> Option<Value> {
    match value.get(column)? {
        JsonValue::Number(n) => n.as_i64().map(Value::from),
        JsonValue::String(s) => Some(Value::from(s.clone())),
        _ => None,
    }
}

fn distinct_keys(rows: &[JsonValue], column: &str) -> Vec<Value> {
    let mut seen = HashSet::new();
    rows.iter()
        .filter(|r| key_string(r, column).is_some_and(|k| seen.insert(k)))
        .filter_map(|r| key_value(r, column))
        .collect()
}

/// 查询优化门面
#[derive(Debug, Clone)]
pub struct QueryOptimizer {
    pool: DbPool,
    toolkit: TransactionToolkit,
}

impl QueryOptimizer {
    /// 创建门面
    pub fn new(pool: DbPool) -> Self {
        let toolkit = TransactionToolkit::new(pool.clone());
        Self { pool, toolkit }
    }

    fn engine(&self) -> std::sync::Arc<dyn EngineAdapter> {
        self.pool.engine()
    }

    fn select_sql(&self, table: &str, options: &FindOptions, values: &mut Vec<Value>) -> String {
        let engine = self.engine();
        let columns = if options.columns.is_empty() {
            "*".to_string()
        } else {
            options
                .columns
                .iter()
                .map(|c| engine.quote_ident(c))
                .collect::<Vec<_>>()
                .join(", ")
        };

        let mut sql = format!("SELECT {} FROM {}", columns, engine.quote_ident(table));
        sql.push_str(&self.where_sql(options, values));

        if !options.order_by.is_empty() {
            let order: Vec<String> = options
                .order_by
                .iter()
                .map(|(c, o)| {
                    let dir = match o {
                        SortOrder::Asc => "ASC",
                        SortOrder::Desc => "DESC",
                    };
                    format!("{} {}", engine.quote_ident(c), dir)
                })
                .collect();
            sql.push_str(&format!(" ORDER BY {}", order.join(", ")));
        }
        if let Some(limit) = options.limit {
            sql.push_str(&format!(" LIMIT {}", limit));
        }
        if let Some(offset) = options.offset {
            if options.limit.is_none() && engine.name() != "postgres" {
                sql.push_str(&format!(" LIMIT {}", i64::MAX));
            }
            sql.push_str(&format!(" OFFSET {}", offset));
        }
        sql
    }

    fn where_sql(&self, options: &FindOptions, values: &mut Vec<Value>) -> String {
        if options.filters.is_empty() {
            return String::new();
        }
        let engine = self.engine();
        let conditions: Vec<String> = options
            .filters
            .iter()
            .map(|(column, value)| {
                values.push(value.clone());
                format!("{} = {}", engine.quote_ident(column), engine.placeholder(values.len()))
            })
            .collect();
        format!(" WHERE {}", conditions.join(" AND "))
    }

    fn in_sql(&self, table: &str, column: &str, keys: &[Value]) -> String {
        let engine = self.engine();
        let placeholders: Vec<String> = (1..=keys.len()).map(|i| engine.placeholder(i)).collect();
        format!(
            "SELECT * FROM {} WHERE {} IN ({})",
            engine.quote_ident(table),
            engine.quote_ident(column),
            placeholders.join(", ")
        )
    }

    async fn query_all(&self, sql: String, values: Vec<Value>) -> DbResult<Vec<JsonValue>> {
        let conn = self.pool.connection();
        let stmt = Statement::from_sql_and_values(conn.get_database_backend(), sql, values);
        let label = stmt.to_string();
        Ok(self
            .pool
            .instrumentation()
            .instrument(&label, JsonValue::find_by_statement(stmt).all(conn))
            .await?)
    }

    async fn execute_in(
        instrumentation: &QueryInstrumentation,
        txn: &DatabaseTransaction,
        sql: String,
        values: Vec<Value>,
    ) -> DbResult<u64> {
        let stmt = Statement::from_sql_and_values(txn.get_database_backend(), sql, values);
        let label = stmt.to_string();
        let result = instrumentation.instrument(&label, txn.execute_raw(stmt)).await?;
        Ok(result.rows_affected())
    }

    /// 按条件读取
    pub async fn optimized_find_all(&self, table: &str, options: FindOptions) -> DbResult<Vec<JsonValue>> {
        let mut values = Vec::new();
        let sql = self.select_sql(table, &options, &mut values);
        self.query_all(sql, values).await
    }

    async fn count(&self, table: &str, options: &FindOptions) -> DbResult<u64> {
        let mut values = Vec::new();
        let sql = format!(
            "SELECT COUNT(*) AS total FROM {}{}",
            self.engine().quote_ident(table),
            self.where_sql(options, &mut values)
        );
        let rows = self.query_all(sql, values).await?;
        Ok(rows
            .first()
            .and_then(|r| row::i64(r, "total"))
            .map(|n| n.max(0) as u64)
            .unwrap_or(0))
    }

    async fn estimate(&self, table: &str) -> DbResult<Option<u64>> {
        let rows = self.query_all(self.engine().row_estimate_sql(table), Vec::new()).await?;
        Ok(rows
            .first()
            .and_then(|r| row::i64(r, "row_estimate"))
            .map(|n| n.max(0) as u64))
    }

    /// 分页读取
    ///
    /// 无过滤条件且请求了估算时，估算值超过 `count_estimation_threshold` 则不再执行 `COUNT(*)`。
    pub async fn optimized_paginate(&self, table: &str, options: FindOptions, request: PageRequest) -> DbResult<Page> {
        if request.page_size == 0 {
            return Err(DbError::business("page_size must be positive"));
        }
        let page = request.page.max(1);
        let paged = FindOptions {
            limit: Some(request.page_size),
            offset: Some((page - 1).saturating_mul(request.page_size)),
            ..options.clone()
        };

        let threshold = self.pool.config().monitoring.count_estimation_threshold;
        let estimate = if request.use_count_estimation && options.filters.is_empty() {
            self.estimate(table).await?.filter(|n| *n > threshold)
        } else {
            None
        };

        let (rows, total, estimated) = match estimate {
            Some(total) => {
                debug!(table = table, estimate = total, "Using row estimate for pagination");
                (self.optimized_find_all(table, paged).await?, total, true)
            }
            None => {
                let (rows, total) =
                    futures::future::try_join(self.optimized_find_all(table, paged), self.count(table, &options))
                        .await?;
                (rows, total, false)
            }
        };

        let total_pages = total_pages(total, request.page_size);
        Ok(Page {
            rows,
            total,
            page,
            page_size: request.page_size,
            total_pages,
            has_more: page < total_pages,
            estimated,
        })
    }

    /// 批量插入，返回插入行数
    ///
    /// 每批最多 `bulk_operation_limit` 行且不超过引擎的绑定参数上限，
    /// 所有批次在同一事务内提交或回滚。
    pub async fn optimized_bulk_create(&self, table: &str, columns: &[&str], rows: Vec<Vec<Value>>) -> DbResult<u64> {
        if rows.is_empty() {
            return Ok(0);
        }
        if columns.is_empty() {
            return Err(DbError::business("bulk insert requires at least one column"));
        }
        if let Some(bad) = rows.iter().position(|r| r.len() != columns.len()) {
            return Err(DbError::business(format!(
                "row {} has {} values but {} columns were given",
                bad,
                rows[bad].len(),
                columns.len()
            )));
        }

        let engine = self.engine();
        let limit = rows_per_statement(
            self.pool.config().monitoring.bulk_operation_limit,
            columns.len(),
            engine.max_bind_params(),
        );
        let column_list = columns
            .iter()
            .map(|c| engine.quote_ident(c))
            .collect::<Vec<_>>()
            .join(", ");

        let mut batches: Vec<(String, Vec<Value>)> = Vec::new();
        for chunk in rows.chunks(limit) {
            let mut values = Vec::with_capacity(chunk.len() * columns.len());
            let mut tuples = Vec::with_capacity(chunk.len());
            for r in chunk {
                let mut placeholders = Vec::with_capacity(r.len());
                for v in r {
                    values.push(v.clone());
                    placeholders.push(engine.placeholder(values.len()));
                }
                tuples.push(format!("({})", placeholders.join(", ")));
            }
            let sql = format!(
                "INSERT INTO {} ({}) VALUES {}",
                engine.quote_ident(table),
                column_list,
                tuples.join(", ")
            );
            batches.push((sql, values));
        }

        debug!(table = table, rows = rows.len(), batches = batches.len(), "Bulk insert");
        let instrumentation = self.pool.instrumentation().clone();
        let options = TransactionOptions::default().label(format!("bulk_create:{}", table));
        self.toolkit
            .with_transaction(options, move |txn| {
                Box::pin(async move {
                    let mut inserted = 0;
                    for (sql, values) in batches {
                        inserted += Self::execute_in(&instrumentation, txn, sql, values).await?;
                    }
                    Ok(inserted)
                })
            })
            .await
    }

    /// 按主键批量更新，返回受影响行数
    pub async fn optimized_bulk_update(&self, table: &TableRef, updates: Vec<RowUpdate>) -> DbResult<u64> {
        let engine = self.engine();
        let mut statements: Vec<(String, Vec<Value>)> = Vec::with_capacity(updates.len());
        for update in updates.into_iter().filter(|u| !u.values.is_empty()) {
            let mut values = Vec::with_capacity(update.values.len() + 1);
            let mut assignments = Vec::with_capacity(update.values.len());
            for (column, value) in update.values {
                values.push(value);
                assignments.push(format!("{} = {}", engine.quote_ident(&column), engine.placeholder(values.len())));
            }
            values.push(update.id.into());
            let sql = format!(
                "UPDATE {} SET {} WHERE {} = {}",
                engine.quote_ident(&table.name),
                assignments.join(", "),
                engine.quote_ident(&table.primary_key),
                engine.placeholder(values.len())
            );
            statements.push((sql, values));
        }
        if statements.is_empty() {
            return Ok(0);
        }

        let limit = self.pool.config().monitoring.bulk_operation_limit.max(1);
        let batches: Vec<Vec<(String, Vec<Value>)>> = statements.chunks(limit).map(<[_]>::to_vec).collect();
        debug!(table = %table.name, batches = batches.len(), "Bulk update");

        let instrumentation = self.pool.instrumentation().clone();
        let options = TransactionOptions::default().label(format!("bulk_update:{}", table.name));
        self.toolkit
            .with_transaction(options, move |txn| {
                Box::pin(async move {
                    let mut affected = 0;
                    for batch in batches {
                        for (sql, values) in batch {
                            affected += Self::execute_in(&instrumentation, txn, sql, values).await?;
                        }
                    }
                    Ok(affected)
                })
            })
            .await
    }

    /// 读取并附加关联
    ///
    /// 每个关联以一条 `IN` 查询批量加载，结果以关联名作为字段附加到每一行。
    pub async fn optimized_find_with_associations<M: ModelAssociations>(
        &self,
        options: FindOptions,
        include: &[AssociationRequest],
    ) -> DbResult<Vec<JsonValue>> {
        let base = M::table();
        let associations = validate_associations(&M::associations(), include);
        let mut rows = self.optimized_find_all(&base.name, options).await?;

        for (assoc, include_through) in associations {
            match &assoc.kind {
                AssociationKind::BelongsTo { foreign_key } => {
                    let targets = self.load_by(&assoc.target.name, &assoc.target.primary_key, &rows, foreign_key).await?;
                    let by_key = index_rows(targets, &assoc.target.primary_key);
                    for r in rows.iter_mut() {
                        let related = key_string(r, foreign_key)
                            .and_then(|k| by_key.get(&k).and_then(|v| v.first().cloned()))
                            .unwrap_or(JsonValue::Null);
                        attach(r, &assoc.name, related);
                    }
                }
                AssociationKind::HasOne { foreign_key } | AssociationKind::HasMany { foreign_key } => {
                    let targets = self.load_by(&assoc.target.name, foreign_key, &rows, &base.primary_key).await?;
                    let by_key = index_rows(targets, foreign_key);
                    let many = matches!(assoc.kind, AssociationKind::HasMany { .. });
                    for r in rows.iter_mut() {
                        let related = key_string(r, &base.primary_key)
                            .and_then(|k| by_key.get(&k).cloned())
                            .unwrap_or_default();
                        let value = if many {
                            JsonValue::Array(related)
                        } else {
                            related.into_iter().next().unwrap_or(JsonValue::Null)
                        };
                        attach(r, &assoc.name, value);
                    }
                }
                AssociationKind::ManyToMany {
                    through,
                    source_key,
                    target_key,
                } => {
                    let links = self.load_by(through, source_key, &rows, &base.primary_key).await?;
                    let targets = self.load_by(&assoc.target.name, &assoc.target.primary_key, &links, target_key).await?;
                    let targets = index_rows(targets, &assoc.target.primary_key);
                    let links = index_rows(links, source_key);

                    for r in rows.iter_mut() {
                        let related: Vec<JsonValue> = key_string(r, &base.primary_key)
                            .and_then(|k| links.get(&k))
                            .map(|link_rows| {
                                link_rows
                                    .iter()
                                    .filter_map(|link| {
                                        let target = key_string(link, target_key)
                                            .and_then(|k| targets.get(&k))
                                            .and_then(|t| t.first())?;
                                        let mut target = target.clone();
                                        if include_through {
                                            attach(&mut target, through, link.clone());
                                        }
                                        Some(target)
                                    })
                                    .collect()
                            })
                            .unwrap_or_default();
                        attach(r, &assoc.name, JsonValue::Array(related));
                    }
                }
            }
        }

        Ok(rows)
    }

    async fn load_by(
        &self,
        table: &str,
        column: &str,
        source_rows: &[JsonValue],
        source_column: &str,
    ) -> DbResult<Vec<JsonValue>> {
        let keys = distinct_keys(source_rows, source_column);
        let mut rows = Vec::new();
        for chunk in keys.chunks(self.engine().max_bind_params()) {
            let sql = self.in_sql(table, column, chunk);
            rows.extend(self.query_all(sql, chunk.to_vec()).await?);
        }
        Ok(rows)
    }
}

fn index_rows(rows: Vec<JsonValue>, column: &str) -> HashMap<String, Vec<JsonValue>> {
    let mut map: HashMap<String, Vec<JsonValue>> = HashMap::new();
    for r in rows {
        if let Some(key) = key_string(&r, column) {
            map.entry(key).or_default().push(r);
        }
    }
    map
}

fn attach(row: &mut JsonValue, name: &str, value: JsonValue) {
    if let JsonValue::Object(map) = row {
        map.insert(name.to_string(), value);
    } else {
        let mut map = Map::new();
        map.insert(name.to_string(), value);
        *row = JsonValue::Object(map);
    }
}
