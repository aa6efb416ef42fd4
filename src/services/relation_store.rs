//! Relation side-table: which (oid, fileId) pairs live in the object store.
//!
//! A record exists iff the object is believed present in the store; skip
//! checks consult this table only and never query the object store.
//! Writes are upserts on (oid, fileId), so concurrent writers resolve as
//! last-writer-wins.

use crate::models::relation::{RelationMetadata, RelationRecord};
use chrono::{DateTime, Utc};
use sqlx::{
    SqlitePool,
    sqlite::{SqliteConnectOptions, SqlitePoolOptions},
    types::Json,
};
use std::{str::FromStr, sync::Arc};
use thiserror::Error;
use tracing::debug;
use uuid::Uuid;

const SCHEMA_TEMPLATE: &str = include_str!("../../migrations/0001_init.sql");

#[derive(Debug, Error)]
pub enum RelationError {
    #[error("invalid relation table name `{0}`")]
    InvalidTable(String),
    #[error(transparent)]
    Sqlx(#[from] sqlx::Error),
}

pub type RelationResult<T> = Result<T, RelationError>;

#[derive(Clone)]
pub struct RelationStore {
    /// Shared SQLite connection pool.
    pub db: Arc<SqlitePool>,
    table: String,
}

impl RelationStore {
    pub fn new(db: Arc<SqlitePool>, table: &str) -> RelationResult<Self> {
        ensure_identifier(table)?;
        Ok(Self {
            db,
            table: table.to_string(),
        })
    }

    /// Open (creating if missing) the database at `url` and bootstrap the table.
    pub async fn connect(url: &str, table: &str) -> RelationResult<Self> {
        debug!("Connecting to relation db => {}", url);
        let options = SqliteConnectOptions::from_str(url)?.create_if_missing(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await?;
        let store = Self::new(Arc::new(pool), table)?;
        store.ensure_schema().await?;
        Ok(store)
    }

    /// Create the table and its indices. Safe to run on every start.
    pub async fn ensure_schema(&self) -> RelationResult<()> {
        let sql = SCHEMA_TEMPLATE.replace("{table}", &self.table);
        let statements = sql
            .split(';')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .collect::<Vec<_>>();

        debug!("Running {} schema statements for `{}`", statements.len(), self.table);
        for stmt in statements {
            sqlx::query(stmt).execute(&*self.db).await?;
        }
        Ok(())
    }

    pub async fn find(&self, oid: &str, file_id: &str) -> RelationResult<Option<RelationRecord>> {
        let sql = format!(
            "SELECT id, redbox_oid, upload_date, metadata, date_created, last_save_date
             FROM {} WHERE redbox_oid = ? AND file_id = ?",
            self.table
        );
        Ok(sqlx::query_as::<_, RelationRecord>(&sql)
            .bind(oid)
            .bind(file_id)
            .fetch_optional(&*self.db)
            .await?)
    }

    /// All records of one owner, optionally narrowed to a single fileId.
    pub async fn list(&self, oid: &str, file_id: Option<&str>) -> RelationResult<Vec<RelationRecord>> {
        let mut sql = format!(
            "SELECT id, redbox_oid, upload_date, metadata, date_created, last_save_date
             FROM {} WHERE redbox_oid = ?",
            self.table
        );
        if file_id.is_some() {
            sql.push_str(" AND file_id = ?");
        }
        sql.push_str(" ORDER BY date_created ASC, rowid ASC");

        let mut query = sqlx::query_as::<_, RelationRecord>(&sql).bind(oid);
        if let Some(file_id) = file_id {
            query = query.bind(file_id);
        }
        Ok(query.fetch_all(&*self.db).await?)
    }

    /// Insert or replace the record for (`oid`, `metadata.file_id`).
    ///
    /// `date_created` and the internal id survive a replace.
    pub async fn upsert(
        &self,
        oid: &str,
        upload_date: Option<DateTime<Utc>>,
        metadata: &RelationMetadata,
    ) -> RelationResult<RelationRecord> {
        let now = Utc::now();
        let sql = format!(
            r#"
            INSERT INTO {} (
                id, redbox_oid, file_id, upload_date, metadata, date_created, last_save_date
            ) VALUES (?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(redbox_oid, file_id) DO UPDATE SET
                upload_date = excluded.upload_date,
                metadata = excluded.metadata,
                last_save_date = excluded.last_save_date
            RETURNING id, redbox_oid, upload_date, metadata, date_created, last_save_date
            "#,
            self.table
        );
        Ok(sqlx::query_as::<_, RelationRecord>(&sql)
            .bind(Uuid::new_v4())
            .bind(oid)
            .bind(&metadata.file_id)
            .bind(upload_date)
            .bind(Json(metadata))
            .bind(now)
            .bind(now)
            .fetch_one(&*self.db)
            .await?)
    }

    /// Remove the record. Returns whether one existed; absence is not an error.
    pub async fn delete(&self, oid: &str, file_id: &str) -> RelationResult<bool> {
        let sql = format!("DELETE FROM {} WHERE redbox_oid = ? AND file_id = ?", self.table);
        let result = sqlx::query(&sql)
            .bind(oid)
            .bind(file_id)
            .execute(&*self.db)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    pub async fn ping(&self) -> RelationResult<()> {
        sqlx::query_scalar::<_, i64>("SELECT 1")
            .fetch_one(&*self.db)
            .await?;
        Ok(())
    }

    pub async fn close(&self) {
        self.db.close().await;
    }
}

/// Whether an existing record lets the source object go untransferred.
///
/// Requires a record whose size matches, and whose digest matches when both
/// sides know one. Any mismatch forces a re-transfer.
pub fn should_skip(existing: Option<&RelationRecord>, source_size: u64, source_digest: Option<&str>) -> bool {
    let Some(existing) = existing else {
        return false;
    };
    if existing.metadata.size != source_size {
        return false;
    }
    match (existing.metadata.digest.as_deref(), source_digest) {
        (Some(stored), Some(current)) => stored.eq_ignore_ascii_case(current),
        _ => true,
    }
}

fn ensure_identifier(name: &str) -> RelationResult<()> {
    let mut chars = name.chars();
    let valid = matches!(chars.next(), Some(c) if c.is_ascii_alphabetic() || c == '_')
        && chars.all(|c| c.is_ascii_alphanumeric() || c == '_');
    if valid {
        Ok(())
    } else {
        Err(RelationError::InvalidTable(name.to_string()))
    }
}
