//! Row access that respects deletion timestamps.
//!
//! A [`Query`] starts on the active view (`deleted_at IS NULL`). Looking a
//! row up by primary key always sees it, deleted or not.

use serde_json::Value;
use sqlx::Row;
use tracing::info;

use crate::collector::{Collector, DeleteError, DeletionReport, Mode};
use crate::config::PolicyOverrides;
use crate::db::finish_tx;
use crate::permissions::Action;
use crate::record::{Record, RecordKey};
use crate::schema::{is_identifier, ModelDef};
use crate::store::{bind_value, row_to_map};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum View {
    Active,
    Everything,
    OnlyDeleted,
}

#[derive(Debug, Clone)]
pub struct Query<'c> {
    collector: &'c Collector,
    model: &'c ModelDef,
    view: View,
    filters: Vec<(String, Value)>,
    ordering: Vec<(String, bool)>,
    limit: Option<i64>,
    offset: Option<i64>,
    invalid: Option<String>,
}

impl<'c> Query<'c> {
    pub(crate) fn new(collector: &'c Collector, model: &'c ModelDef) -> Self {
        Self {
            collector,
            model,
            view: View::Active,
            filters: Vec::new(),
            ordering: Vec::new(),
            limit: None,
            offset: None,
            invalid: None,
        }
    }

    pub fn view(&self) -> View {
        self.view
    }

    pub fn everything(mut self) -> Self {
        self.view = View::Everything;
        self
    }

    pub fn only_deleted(mut self) -> Self {
        if !self.model.is_soft_deletable() {
            self.reject(format!("{} has no deletion timestamp", self.model.name));
        }
        self.view = View::OnlyDeleted;
        self
    }

    /// Equality filter; `Value::Null` matches `IS NULL`. Filtering on the
    /// primary key of an active query widens it to every row.
    pub fn filter(mut self, column: &str, value: impl Into<Value>) -> Self {
        if !is_identifier(column) {
            self.reject(format!("invalid filter column {column:?}"));
            return self;
        }
        if column == self.model.pk_column && self.view == View::Active {
            self.view = View::Everything;
        }
        self.filters.push((column.to_string(), value.into()));
        self
    }

    pub fn filter_pk(self, pk: i64) -> Self {
        let column = self.model.pk_column.clone();
        self.filter(&column, pk)
    }

    /// `"-column"` sorts descending.
    pub fn order_by(mut self, column: &str) -> Self {
        let (name, descending) = match column.strip_prefix('-') {
            Some(name) => (name, true),
            None => (column, false),
        };
        if is_identifier(name) {
            self.ordering.push((name.to_string(), descending));
        } else {
            self.reject(format!("invalid ordering column {column:?}"));
        }
        self
    }

    pub fn limit(mut self, limit: i64) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn offset(mut self, offset: i64) -> Self {
        self.offset = Some(offset);
        self
    }

    fn reject(&mut self, message: String) {
        self.invalid.get_or_insert(message);
    }

    fn ensure_valid(&self) -> Result<(), DeleteError> {
        match &self.invalid {
            Some(message) => Err(DeleteError::invalid(message.clone())),
            None => Ok(()),
        }
    }

    fn ensure_unsliced(&self, operation: &str) -> Result<(), DeleteError> {
        if self.limit.is_some() || self.offset.is_some() {
            return Err(DeleteError::invalid(format!(
                "cannot {operation} a sliced query"
            )));
        }
        Ok(())
    }

    fn where_clause(&self) -> (String, Vec<Value>) {
        let mut clauses = Vec::new();
        let mut binds = Vec::new();
        if self.model.is_soft_deletable() {
            match self.view {
                View::Active => clauses.push(format!("{} IS NULL", self.model.deleted_at_column)),
                View::OnlyDeleted => {
                    clauses.push(format!("{} IS NOT NULL", self.model.deleted_at_column))
                }
                View::Everything => {}
            }
        }
        for (column, value) in &self.filters {
            if value.is_null() {
                clauses.push(format!("{column} IS NULL"));
            } else {
                clauses.push(format!("{column} = ?"));
                binds.push(value.clone());
            }
        }
        if clauses.is_empty() {
            (String::new(), binds)
        } else {
            (format!(" WHERE {}", clauses.join(" AND ")), binds)
        }
    }

    fn select_sql(&self, columns: &str) -> (String, Vec<Value>) {
        let (where_sql, mut binds) = self.where_clause();
        let mut sql = format!("SELECT {columns} FROM {}{where_sql}", self.model.table);
        if self.ordering.is_empty() {
            sql.push_str(&format!(" ORDER BY {}", self.model.pk_column));
        } else {
            let terms: Vec<String> = self
                .ordering
                .iter()
                .map(|(column, descending)| {
                    format!("{column} {}", if *descending { "DESC" } else { "ASC" })
                })
                .collect();
            sql.push_str(&format!(" ORDER BY {}", terms.join(", ")));
        }
        if self.limit.is_some() || self.offset.is_some() {
            sql.push_str(" LIMIT ? OFFSET ?");
            binds.push(Value::from(self.limit.unwrap_or(-1)));
            binds.push(Value::from(self.offset.unwrap_or(0)));
        }
        (sql, binds)
    }

    fn to_record(&self, row: &sqlx::sqlite::SqliteRow) -> Record {
        let values = row_to_map(row);
        let pk = values.get(&self.model.pk_column).and_then(Value::as_i64);
        let deleted_at = if self.model.is_soft_deletable() {
            values
                .get(&self.model.deleted_at_column)
                .and_then(Value::as_i64)
        } else {
            None
        };
        Record {
            model: self.model.name.clone(),
            pk,
            deleted_at,
            values,
        }
    }

    pub async fn fetch(&self) -> Result<Vec<Record>, DeleteError> {
        self.ensure_valid()?;
        let (sql, binds) = self.select_sql("*");
        let mut query = sqlx::query(&sql);
        for value in &binds {
            query = bind_value(query, value);
        }
        let rows = query.fetch_all(self.collector.pool()).await?;
        Ok(rows.iter().map(|row| self.to_record(row)).collect())
    }

    pub async fn count(&self) -> Result<i64, DeleteError> {
        self.ensure_valid()?;
        let (where_sql, binds) = self.where_clause();
        let sql = format!("SELECT COUNT(*) FROM {}{where_sql}", self.model.table);
        let mut query = sqlx::query(&sql);
        for value in &binds {
            query = bind_value(query, value);
        }
        let row = query.fetch_one(self.collector.pool()).await?;
        Ok(row.try_get::<i64, _>(0)?)
    }

    /// Fetches one row by primary key regardless of its deletion state.
    pub async fn get(&self, pk: i64) -> Result<Option<Record>, DeleteError> {
        let query = Query {
            view: View::Everything,
            limit: None,
            offset: None,
            ..self.clone()
        };
        Ok(query.filter_pk(pk).fetch().await?.into_iter().next())
    }

    async fn keys(&self) -> Result<Vec<RecordKey>, DeleteError> {
        self.ensure_valid()?;
        let (sql, binds) = self.select_sql(&self.model.pk_column);
        let mut query = sqlx::query(&sql);
        for value in &binds {
            query = bind_value(query, value);
        }
        let rows = query.fetch_all(self.collector.pool()).await?;
        rows.iter()
            .map(|row| -> Result<RecordKey, DeleteError> {
                let pk: i64 = row.try_get(0)?;
                Ok(RecordKey::new(self.model.name.clone(), pk))
            })
            .collect()
    }

    /// Runs a cascading logical deletion over every matched row.
    pub async fn delete(&self) -> Result<DeletionReport, DeleteError> {
        self.delete_with(&PolicyOverrides::default()).await
    }

    pub async fn delete_with(&self, overrides: &PolicyOverrides) -> Result<DeletionReport, DeleteError> {
        self.ensure_unsliced("delete")?;
        let roots = self.keys().await?;
        self.collector.run(roots, Mode::Logical, overrides).await
    }

    /// Physically removes every matched row and its cascade.
    pub async fn remove(&self) -> Result<DeletionReport, DeleteError> {
        self.ensure_unsliced("remove")?;
        let roots = self.keys().await?;
        self.collector
            .run(roots, Mode::Purge, &PolicyOverrides::default())
            .await
    }

    /// Clears the deletion timestamp of the matched rows in one statement.
    /// Rows deleted by the same cascade are not touched.
    pub async fn undelete(&self) -> Result<u64, DeleteError> {
        self.ensure_valid()?;
        self.ensure_unsliced("undelete")?;
        if !self.model.is_soft_deletable() {
            return Err(DeleteError::invalid(format!(
                "{} has no deletion timestamp to clear",
                self.model.name
            )));
        }
        self.collector.check(Action::Undelete, self.model)?;

        let (where_sql, binds) = self.where_clause();
        let column = &self.model.deleted_at_column;
        let sql = if where_sql.is_empty() {
            format!("UPDATE {} SET {column} = NULL WHERE {column} IS NOT NULL", self.model.table)
        } else {
            format!(
                "UPDATE {} SET {column} = NULL{where_sql} AND {column} IS NOT NULL",
                self.model.table
            )
        };

        let mut tx = self.collector.pool().begin().await?;
        info!(target: "softcascade", event = "db_tx_begin");
        let mut query = sqlx::query(&sql);
        for value in &binds {
            query = bind_value(query, value);
        }
        let result = query
            .execute(&mut *tx)
            .await
            .map(|done| done.rows_affected())
            .map_err(DeleteError::from);
        let restored = finish_tx(tx, result).await?;
        info!(
            target: "softcascade",
            event = "undelete",
            model = self.model.name.as_str(),
            records = restored
        );
        Ok(restored)
    }
}
