// Copyright (c) 2025 Kirky.X
//
// Licensed under the MIT License
// See LICENSE file in the project root for full license information.

//! 查询优化门面集成测试
//!
//! 覆盖分页、批量写入与关联预加载

use dbops::concurrency::TableRef;
use dbops::optimizer::{
    Association, AssociationKind, AssociationRequest, FindOptions, ModelAssociations, PageRequest, QueryOptimizer,
    RowUpdate, SortOrder,
};
use dbops::orm::Value;
mod common;

struct Post;

impl ModelAssociations for Post {
    fn table() -> TableRef {
        TableRef::new("posts")
    }

    fn associations() -> Vec<Association> {
        vec![
            Association::new(
                "author",
                TableRef::new("users"),
                AssociationKind::BelongsTo {
                    foreign_key: "user_id".to_string(),
                },
            ),
            Association::new(
                "comments",
                TableRef::new("comments"),
                AssociationKind::HasMany {
                    foreign_key: "post_id".to_string(),
                },
            ),
            Association::new(
                "tags",
                TableRef::new("tags"),
                AssociationKind::ManyToMany {
                    through: "post_tags".to_string(),
                    source_key: "post_id".to_string(),
                    target_key: "tag_id".to_string(),
                },
            ),
        ]
    }
}

async fn setup_blog(adjust: impl FnOnce(&mut dbops::config::DbConfig)) -> common::TestDb {
    let db = common::setup_with(adjust).await;
    common::exec_all(
        &db.pool,
        &[
            "CREATE TABLE users (id INTEGER PRIMARY KEY, name TEXT NOT NULL)",
            "CREATE TABLE posts (id INTEGER PRIMARY KEY, user_id INTEGER NOT NULL, title TEXT NOT NULL)",
            "CREATE TABLE comments (id INTEGER PRIMARY KEY, post_id INTEGER NOT NULL, body TEXT)",
            "CREATE TABLE tags (id INTEGER PRIMARY KEY, label TEXT NOT NULL)",
            "CREATE TABLE post_tags (post_id INTEGER NOT NULL, tag_id INTEGER NOT NULL, weight INTEGER)",
            "INSERT INTO users (id, name) VALUES (1, 'ann'), (2, 'bob')",
            "INSERT INTO posts (id, user_id, title) VALUES (1, 1, 'first'), (2, 2, 'second'), (3, 1, 'third')",
            "INSERT INTO comments (id, post_id, body) VALUES (1, 1, 'nice'), (2, 1, 'agreed'), (3, 2, 'hm')",
            "INSERT INTO tags (id, label) VALUES (1, 'rust'), (2, 'db')",
            "INSERT INTO post_tags (post_id, tag_id, weight) VALUES (1, 1, 5), (1, 2, 3), (2, 2, 1)",
        ],
    )
    .await;
    db
}

fn rows(n: i64) -> Vec<Vec<Value>> {
    (1..=n)
        .map(|i| vec![Value::from(i), Value::from(format!("item-{}", i)), Value::from(i * 10)])
        .collect()
}

/// TEST-OPT-001: 分页返回总数、总页数与是否有下一页
#[tokio::test]
async fn test_paginate() {
    let db = setup_blog(|_| {}).await;
    let optimizer = QueryOptimizer::new(db.pool.clone());
    let options = FindOptions::default().order_by("id", SortOrder::Asc);

    let first = optimizer
        .optimized_paginate("posts", options.clone(), PageRequest::new(1, 2))
        .await
        .expect("Paginate should succeed");
    assert_eq!(first.rows.len(), 2);
    assert_eq!(first.total, 3);
    assert_eq!(first.total_pages, 2);
    assert!(first.has_more);
    assert!(!first.estimated);

    let last = optimizer
        .optimized_paginate("posts", options, PageRequest::new(2, 2))
        .await
        .expect("Paginate should succeed");
    assert_eq!(last.rows.len(), 1);
    assert_eq!(last.rows[0]["title"], "third");
    assert!(!last.has_more);

    let filtered = optimizer
        .optimized_paginate("posts", FindOptions::default().filter("user_id", 1), PageRequest::new(1, 10))
        .await
        .expect("Paginate should succeed");
    assert_eq!(filtered.total, 2);
    assert_eq!(filtered.total_pages, 1);

    assert!(optimizer
        .optimized_paginate("posts", FindOptions::default(), PageRequest::new(1, 0))
        .await
        .is_err());
}

/// TEST-OPT-002: 超过阈值时使用行数估算，带过滤条件时仍精确计数
#[tokio::test]
async fn test_paginate_with_count_estimation() {
    let db = setup_blog(|config| config.monitoring.count_estimation_threshold = 2).await;
    let optimizer = QueryOptimizer::new(db.pool.clone());

    let page = optimizer
        .optimized_paginate("posts", FindOptions::default(), PageRequest::new(1, 2).with_count_estimation())
        .await
        .expect("Paginate should succeed");
    assert!(page.estimated);
    assert_eq!(page.total, 3);

    let filtered = optimizer
        .optimized_paginate(
            "posts",
            FindOptions::default().filter("user_id", 2),
            PageRequest::new(1, 2).with_count_estimation(),
        )
        .await
        .expect("Paginate should succeed");
    assert!(!filtered.estimated);
    assert_eq!(filtered.total, 1);
}

/// TEST-OPT-003: 批量插入按上限分批，全部在一个事务中完成
#[tokio::test]
async fn test_bulk_create_in_batches() {
    let db = setup_blog(|config| config.monitoring.bulk_operation_limit = 2).await;
    common::exec_all(&db.pool, &["CREATE TABLE items (id INTEGER PRIMARY KEY, name TEXT, price INTEGER)"]).await;
    let optimizer = QueryOptimizer::new(db.pool.clone());

    let inserted = optimizer
        .optimized_bulk_create("items", &["id", "name", "price"], rows(5))
        .await
        .expect("Bulk insert should succeed");

    assert_eq!(inserted, 5);
    assert_eq!(common::scalar_i64(&db.pool, "SELECT COUNT(*) FROM items").await, 5);

    let snapshot = db.pool.instrumentation().get_performance_metrics();
    assert_eq!(snapshot.total_queries, 3);
    assert_eq!(snapshot.transaction_stats.completed, 1);
}

/// TEST-OPT-004: 任一批次失败时整体回滚
#[tokio::test]
async fn test_bulk_create_rolls_back_on_failure() {
    let db = setup_blog(|config| config.monitoring.bulk_operation_limit = 2).await;
    common::exec_all(&db.pool, &["CREATE TABLE items (id INTEGER PRIMARY KEY, name TEXT, price INTEGER)"]).await;
    let optimizer = QueryOptimizer::new(db.pool.clone());

    let mut data = rows(4);
    data[3][0] = Value::from(1i64);
    assert!(optimizer
        .optimized_bulk_create("items", &["id", "name", "price"], data)
        .await
        .is_err());
    assert_eq!(common::scalar_i64(&db.pool, "SELECT COUNT(*) FROM items").await, 0);

    let bad_shape = vec![vec![Value::from(1i64)]];
    assert!(optimizer
        .optimized_bulk_create("items", &["id", "name", "price"], bad_shape)
        .await
        .is_err());
}

/// TEST-OPT-005: 按主键批量更新
#[tokio::test]
async fn test_bulk_update() {
    let db = setup_blog(|_| {}).await;
    let optimizer = QueryOptimizer::new(db.pool.clone());

    let affected = optimizer
        .optimized_bulk_update(
            &TableRef::new("posts"),
            vec![
                RowUpdate {
                    id: 1,
                    values: vec![("title".to_string(), "first (edited)".into())],
                },
                RowUpdate {
                    id: 3,
                    values: vec![("title".to_string(), "third (edited)".into()), ("user_id".to_string(), 2i64.into())],
                },
                RowUpdate { id: 2, values: vec![] },
                RowUpdate {
                    id: 99,
                    values: vec![("title".to_string(), "missing".into())],
                },
            ],
        )
        .await
        .expect("Bulk update should succeed");

    assert_eq!(affected, 2);
    assert_eq!(common::scalar_i64(&db.pool, "SELECT user_id FROM posts WHERE id = 3").await, 2);
    assert_eq!(
        common::scalar_i64(&db.pool, "SELECT COUNT(*) FROM posts WHERE title LIKE '%(edited)'").await,
        2
    );
}

/// TEST-OPT-006: 关联预加载，每个关联一次批量查询
#[tokio::test]
async fn test_find_with_associations() {
    let db = setup_blog(|_| {}).await;
    let optimizer = QueryOptimizer::new(db.pool.clone());

    let posts = optimizer
        .optimized_find_with_associations::<Post>(
            FindOptions::default().order_by("id", SortOrder::Asc),
            &["author".into(), "comments".into(), "tags".into(), "unknown".into()],
        )
        .await
        .expect("Find should succeed");

    assert_eq!(posts.len(), 3);
    assert_eq!(posts[0]["author"]["name"], "ann");
    assert_eq!(posts[1]["author"]["name"], "bob");
    assert!(posts[0].get("unknown").is_none());

    assert_eq!(posts[0]["comments"].as_array().map(Vec::len), Some(2));
    assert_eq!(posts[2]["comments"].as_array().map(Vec::len), Some(0));

    let mut labels: Vec<_> = posts[0]["tags"]
        .as_array()
        .expect("tags array")
        .iter()
        .filter_map(|t| t["label"].as_str())
        .collect();
    labels.sort();
    assert_eq!(labels, vec!["db", "rust"]);
    assert!(posts[0]["tags"][0].get("post_tags").is_none());

    // posts + users + comments + post_tags + tags
    assert_eq!(db.pool.instrumentation().get_performance_metrics().total_queries, 5);
}

/// TEST-OPT-007: 请求中间表字段时附加到目标行
#[tokio::test]
async fn test_many_to_many_with_through() {
    let db = setup_blog(|_| {}).await;
    let optimizer = QueryOptimizer::new(db.pool.clone());

    let posts = optimizer
        .optimized_find_with_associations::<Post>(
            FindOptions::default().filter("id", 2),
            &[AssociationRequest::with_through("tags")],
        )
        .await
        .expect("Find should succeed");

    assert_eq!(posts.len(), 1);
    let tags = posts[0]["tags"].as_array().expect("tags array");
    assert_eq!(tags.len(), 1);
    assert_eq!(tags[0]["label"], "db");
    assert_eq!(tags[0]["post_tags"]["weight"], 1);
    assert!(posts[0].get("author").is_none());
}

/// TEST-OPT-008: 单批行数受绑定参数上限约束
#[tokio::test]
async fn test_bulk_create_splits_at_bind_parameter_limit() {
    let db = setup_blog(|config| config.monitoring.bulk_operation_limit = 20_000).await;
    common::exec_all(&db.pool, &["CREATE TABLE items (id INTEGER PRIMARY KEY, name TEXT, price INTEGER)"]).await;
    let optimizer = QueryOptimizer::new(db.pool.clone());

    let inserted = optimizer
        .optimized_bulk_create("items", &["id", "name", "price"], rows(12_000))
        .await
        .expect("Bulk insert should succeed");

    assert_eq!(inserted, 12_000);
    assert_eq!(common::scalar_i64(&db.pool, "SELECT COUNT(*) FROM items").await, 12_000);
    // 32766 / 3 = 10922 行一批
    assert_eq!(db.pool.instrumentation().get_performance_metrics().total_queries, 2);
}
