//! Bulk statements used by the collector.
//!
//! Every function takes a bare connection so it can run inside the caller's
//! transaction. Table and column names come from a validated [`Schema`]
//! (see [`crate::schema::is_identifier`]); values are always bound.
//!
//! [`Schema`]: crate::schema::Schema

use serde_json::{Map, Value};
use sqlx::sqlite::{SqliteArguments, SqliteRow};
use sqlx::{Column, Row, Sqlite, SqliteConnection, TypeInfo, ValueRef};

pub(crate) type SqliteQuery<'q> = sqlx::query::Query<'q, Sqlite, SqliteArguments<'q>>;

fn placeholders(count: usize) -> String {
    vec!["?"; count].join(",")
}

/// Rows of `table` whose `column` references one of `targets`, as
/// `(primary key, referenced key, deleted)` triples ordered by primary key
/// per chunk. `deleted` reads `deleted_at_column` when given and is `false`
/// otherwise.
pub async fn fetch_referencing(
    conn: &mut SqliteConnection,
    table: &str,
    pk_column: &str,
    column: &str,
    targets: &[i64],
    deleted_at_column: Option<&str>,
    batch_size: usize,
) -> Result<Vec<(i64, i64, bool)>, sqlx::Error> {
    let deleted = deleted_at_column
        .map(|deleted_at| format!("{deleted_at} IS NOT NULL"))
        .unwrap_or_else(|| "0".to_string());
    let mut found = Vec::new();
    for chunk in targets.chunks(batch_size.max(1)) {
        let sql = format!(
            "SELECT {pk_column}, {column}, {deleted} FROM {table} WHERE {column} IN ({}) ORDER BY {pk_column}",
            placeholders(chunk.len())
        );
        let mut query = sqlx::query_as::<_, (i64, i64, bool)>(&sql);
        for pk in chunk {
            query = query.bind(*pk);
        }
        found.extend(query.fetch_all(&mut *conn).await?);
    }
    Ok(found)
}

/// Physically removes rows of `table` whose `column` is in `values`.
pub async fn delete_where_in(
    conn: &mut SqliteConnection,
    table: &str,
    column: &str,
    values: &[i64],
    batch_size: usize,
) -> Result<u64, sqlx::Error> {
    let mut affected = 0;
    for chunk in values.chunks(batch_size.max(1)) {
        let sql = format!(
            "DELETE FROM {table} WHERE {column} IN ({})",
            placeholders(chunk.len())
        );
        let mut query = sqlx::query(&sql);
        for value in chunk {
            query = query.bind(*value);
        }
        affected += query.execute(&mut *conn).await?.rows_affected();
    }
    Ok(affected)
}

/// Stamps the shared deletion timestamp onto every listed row.
pub async fn mark_deleted(
    conn: &mut SqliteConnection,
    table: &str,
    pk_column: &str,
    deleted_at_column: &str,
    pks: &[i64],
    deleted_at: i64,
    batch_size: usize,
) -> Result<u64, sqlx::Error> {
    let mut affected = 0;
    for chunk in pks.chunks(batch_size.max(1)) {
        let sql = format!(
            "UPDATE {table} SET {deleted_at_column} = ? WHERE {pk_column} IN ({})",
            placeholders(chunk.len())
        );
        let mut query = sqlx::query(&sql).bind(deleted_at);
        for pk in chunk {
            query = query.bind(*pk);
        }
        affected += query.execute(&mut *conn).await?.rows_affected();
    }
    Ok(affected)
}

/// Removes the deletion timestamp from the listed rows.
pub async fn clear_deleted(
    conn: &mut SqliteConnection,
    table: &str,
    pk_column: &str,
    deleted_at_column: &str,
    pks: &[i64],
    batch_size: usize,
) -> Result<u64, sqlx::Error> {
    let mut affected = 0;
    for chunk in pks.chunks(batch_size.max(1)) {
        let sql = format!(
            "UPDATE {table} SET {deleted_at_column} = NULL WHERE {pk_column} IN ({}) AND {deleted_at_column} IS NOT NULL",
            placeholders(chunk.len())
        );
        let mut query = sqlx::query(&sql);
        for pk in chunk {
            query = query.bind(*pk);
        }
        affected += query.execute(&mut *conn).await?.rows_affected();
    }
    Ok(affected)
}

/// Nulls `column` on rows that reference any of `targets`.
pub async fn clear_references(
    conn: &mut SqliteConnection,
    table: &str,
    column: &str,
    targets: &[i64],
    batch_size: usize,
) -> Result<u64, sqlx::Error> {
    let mut affected = 0;
    for chunk in targets.chunks(batch_size.max(1)) {
        let sql = format!(
            "UPDATE {table} SET {column} = NULL WHERE {column} IN ({})",
            placeholders(chunk.len())
        );
        let mut query = sqlx::query(&sql);
        for target in chunk {
            query = query.bind(*target);
        }
        affected += query.execute(&mut *conn).await?.rows_affected();
    }
    Ok(affected)
}

pub(crate) fn bind_value<'q>(query: SqliteQuery<'q>, value: &Value) -> SqliteQuery<'q> {
    match value {
        Value::Null => query.bind(Option::<i64>::None),
        Value::Number(n) => {
            if let Some(i) = n.as_i64() {
                query.bind(i)
            } else if let Some(f) = n.as_f64() {
                query.bind(f)
            } else {
                query.bind(Option::<i64>::None)
            }
        }
        Value::Bool(b) => query.bind(*b as i64),
        Value::String(s) => query.bind(s.clone()),
        _ => query.bind(value.to_string()),
    }
}

pub(crate) fn row_to_map(row: &SqliteRow) -> Map<String, Value> {
    let mut map = Map::new();
    for col in row.columns() {
        let idx = col.ordinal();
        let val = match row.try_get_raw(idx).ok() {
            Some(raw) if !raw.is_null() => match raw.type_info().name() {
                "INTEGER" => row
                    .try_get::<i64, _>(idx)
                    .map(Value::from)
                    .unwrap_or(Value::Null),
                "REAL" => row
                    .try_get::<f64, _>(idx)
                    .map(Value::from)
                    .unwrap_or(Value::Null),
                _ => row
                    .try_get::<String, _>(idx)
                    .map(Value::from)
                    .unwrap_or(Value::Null),
            },
            _ => Value::Null,
        };
        map.insert(col.name().to_string(), val);
    }
    map
}
