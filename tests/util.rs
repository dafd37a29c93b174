#![allow(dead_code, clippy::unwrap_used, clippy::expect_used)]

use std::sync::Arc;

use softcascade::{Collector, Schema};
use sqlx::{sqlite::SqlitePoolOptions, SqlitePool};

pub async fn temp_pool() -> SqlitePool {
    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .connect("sqlite::memory:")
        .await
        .expect("connect sqlite::memory:");
    sqlx::query("PRAGMA foreign_keys=ON;")
        .execute(&pool)
        .await
        .unwrap();
    pool
}

/// author <- post <- comment <- reaction, plus a protected invoice, a
/// nullable bookmark, an auto-created revision log and a post/tag link table.
pub const BLOG_SCHEMA: &str = r#"{
    "models": [
        {"name": "author", "table": "author", "soft_delete": {}},
        {"name": "post", "table": "post", "soft_delete": {}},
        {"name": "comment", "table": "comment"},
        {"name": "reaction", "table": "reaction", "soft_delete": {}},
        {"name": "invoice", "table": "invoice"},
        {"name": "bookmark", "table": "bookmark"},
        {"name": "revision", "table": "revision", "auto_created": true},
        {"name": "tag", "table": "tag"}
    ],
    "relations": [
        {"model": "post", "column": "author_id", "target": "author"},
        {"model": "comment", "column": "post_id", "target": "post"},
        {"model": "reaction", "column": "comment_id", "target": "comment"},
        {"model": "invoice", "column": "author_id", "target": "author", "on_delete": "protect"},
        {"model": "bookmark", "column": "post_id", "target": "post", "on_delete": "set_null"},
        {"model": "revision", "column": "post_id", "target": "post"}
    ],
    "associations": [
        {
            "table": "post_tag",
            "left": {"model": "post", "column": "post_id"},
            "right": {"model": "tag", "column": "tag_id"}
        }
    ]
}"#;

pub const BLOG_DDL: &[&str] = &[
    "CREATE TABLE author (id INTEGER PRIMARY KEY, name TEXT NOT NULL, deleted_at INTEGER)",
    "CREATE TABLE post (id INTEGER PRIMARY KEY, author_id INTEGER NOT NULL REFERENCES author(id), title TEXT NOT NULL, deleted_at INTEGER)",
    "CREATE TABLE comment (id INTEGER PRIMARY KEY, post_id INTEGER NOT NULL REFERENCES post(id), body TEXT)",
    "CREATE TABLE reaction (id INTEGER PRIMARY KEY, comment_id INTEGER NOT NULL REFERENCES comment(id), deleted_at INTEGER)",
    "CREATE TABLE invoice (id INTEGER PRIMARY KEY, author_id INTEGER NOT NULL REFERENCES author(id))",
    "CREATE TABLE bookmark (id INTEGER PRIMARY KEY, post_id INTEGER REFERENCES post(id))",
    "CREATE TABLE revision (id INTEGER PRIMARY KEY, post_id INTEGER NOT NULL REFERENCES post(id))",
    "CREATE TABLE tag (id INTEGER PRIMARY KEY, label TEXT)",
    "CREATE TABLE post_tag (post_id INTEGER NOT NULL REFERENCES post(id), tag_id INTEGER NOT NULL REFERENCES tag(id))",
];

pub const BLOG_SEED: &[&str] = &[
    "INSERT INTO author (id, name) VALUES (1, 'ada'), (2, 'grace')",
    "INSERT INTO post (id, author_id, title) VALUES (1, 1, 'first'), (2, 1, 'second'), (3, 2, 'third')",
    "INSERT INTO comment (id, post_id, body) VALUES (10, 1, 'nice'), (11, 1, 'meh'), (12, 2, 'ok')",
    "INSERT INTO reaction (id, comment_id) VALUES (100, 10)",
    "INSERT INTO invoice (id, author_id) VALUES (1, 2)",
    "INSERT INTO bookmark (id, post_id) VALUES (7, 1)",
    "INSERT INTO revision (id, post_id) VALUES (50, 1)",
    "INSERT INTO tag (id, label) VALUES (5, 'rust')",
    "INSERT INTO post_tag (post_id, tag_id) VALUES (1, 5), (2, 5)",
];

pub fn blog_schema() -> Arc<Schema> {
    Arc::new(Schema::from_json(BLOG_SCHEMA).expect("blog schema"))
}

pub async fn exec_all(pool: &SqlitePool, statements: &[&str]) {
    for sql in statements {
        sqlx::query(sql).execute(pool).await.unwrap();
    }
}

pub async fn blog_pool() -> SqlitePool {
    let pool = temp_pool().await;
    exec_all(&pool, BLOG_DDL).await;
    exec_all(&pool, BLOG_SEED).await;
    pool
}

pub async fn blog_collector() -> Collector {
    Collector::new(blog_pool().await, blog_schema())
}

/// `None` when the row is gone, otherwise its deletion timestamp.
pub async fn deleted_at(pool: &SqlitePool, table: &str, id: i64) -> Option<Option<i64>> {
    let sql = format!("SELECT deleted_at FROM {table} WHERE id = ?");
    sqlx::query_scalar::<_, Option<i64>>(&sql)
        .bind(id)
        .fetch_optional(pool)
        .await
        .unwrap()
}

pub async fn exists(pool: &SqlitePool, table: &str, id: i64) -> bool {
    let sql = format!("SELECT COUNT(*) FROM {table} WHERE id = ?");
    let count: i64 = sqlx::query_scalar(&sql)
        .bind(id)
        .fetch_one(pool)
        .await
        .unwrap();
    count == 1
}

pub async fn count(pool: &SqlitePool, sql: &str) -> i64 {
    sqlx::query_scalar(sql).fetch_one(pool).await.unwrap()
}
