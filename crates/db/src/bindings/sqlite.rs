//! SQLite binding.

use std::str::FromStr;

use async_trait::async_trait;
use querylens_core::sql::{Dialect, SqlValue};
use sqlx::query::Query;
use sqlx::sqlite::{SqliteArguments, SqliteConnectOptions, SqlitePool, SqlitePoolOptions, SqliteRow};
use sqlx::{Column, Row as _, Sqlite, TypeInfo, ValueRef};

use super::decode_error;
use crate::backend::{Backend, Row};
use crate::DbResult;

pub struct SqliteBackend {
    pool: SqlitePool,
}

impl SqliteBackend {
    /// Open a pool holding exactly one connection that never expires, so an
    /// in-memory database lives for the whole job.
    pub async fn connect(url: &str) -> DbResult<Self> {
        let options = SqliteConnectOptions::from_str(url)?
            .create_if_missing(true)
            .foreign_keys(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(options)
            .await?;
        tracing::debug!("SQLite connection opened");
        Ok(Self { pool })
    }
}

#[async_trait]
impl Backend for SqliteBackend {
    fn dialect(&self) -> Dialect {
        Dialect::Sqlite
    }

    fn name(&self) -> &'static str {
        "sqlite"
    }

    async fn fetch(&self, sql: &str, params: &[SqlValue]) -> DbResult<Vec<Row>> {
        let rows = bind_all(sqlx::query(sql), params)
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(decode_row).collect()
    }

    async fn execute(&self, sql: &str, params: &[SqlValue]) -> DbResult<u64> {
        let done = bind_all(sqlx::query(sql), params)
            .execute(&self.pool)
            .await?;
        Ok(done.rows_affected())
    }

    async fn execute_batch(&self, statements: &[String]) -> DbResult<()> {
        let mut tx = self.pool.begin().await?;
        for statement in statements {
            sqlx::query(statement).execute(&mut *tx).await?;
        }
        tx.commit().await?;
        Ok(())
    }

    async fn close(&self) {
        self.pool.close().await;
    }
}

fn bind_all<'q>(
    mut query: Query<'q, Sqlite, SqliteArguments<'q>>,
    params: &'q [SqlValue],
) -> Query<'q, Sqlite, SqliteArguments<'q>> {
    for param in params {
        query = match param {
            SqlValue::Null => query.bind(None::<String>),
            SqlValue::Bool(b) => query.bind(*b),
            SqlValue::Int(i) => query.bind(*i),
            SqlValue::BigInt(b) => match i64::try_from(b) {
                Ok(i) => query.bind(i),
                Err(_) => query.bind(b.to_string()),
            },
            SqlValue::Float(f) => query.bind(*f),
            SqlValue::Text(s) | SqlValue::Json(s) => query.bind(s.as_str()),
            SqlValue::Bytes(b) => query.bind(b.as_slice()),
        };
    }
    query
}

/// Decode by storage class, using the declared column type only to tell
/// booleans apart from plain integers.
fn decode_row(row: &SqliteRow) -> DbResult<Row> {
    let mut out = Row::with_capacity(row.len());
    for (index, column) in row.columns().iter().enumerate() {
        let name = column.name();
        let declared = column.type_info().name().to_ascii_uppercase();
        let storage = {
            let raw = row.try_get_raw(index)?;
            if raw.is_null() {
                None
            } else {
                Some(raw.type_info().name().to_ascii_uppercase())
            }
        };

        let value = match storage.as_deref() {
            None => SqlValue::Null,
            Some(s) if s.contains("INT") => {
                let i: i64 = row
                    .try_get_unchecked(index)
                    .map_err(|e| decode_error(name, e))?;
                if declared.starts_with("BOOL") {
                    SqlValue::Bool(i != 0)
                } else {
                    SqlValue::Int(i)
                }
            }
            Some("REAL" | "FLOAT" | "DOUBLE") => SqlValue::Float(
                row.try_get_unchecked(index)
                    .map_err(|e| decode_error(name, e))?,
            ),
            Some("BLOB") => SqlValue::Bytes(
                row.try_get_unchecked(index)
                    .map_err(|e| decode_error(name, e))?,
            ),
            Some(_) => SqlValue::Text(
                row.try_get_unchecked(index)
                    .map_err(|e| decode_error(name, e))?,
            ),
        };
        out.insert(name.to_string(), value);
    }
    Ok(out)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    async fn backend() -> SqliteBackend {
        SqliteBackend::connect("sqlite::memory:").await.unwrap()
    }

    #[tokio::test]
    async fn round_trips_storage_classes() {
        let db = backend().await;
        db.execute_batch(&[
            "CREATE TABLE t (i INTEGER, r REAL, s TEXT, b BLOB, f BOOLEAN, j JSON)".to_string(),
        ])
        .await
        .unwrap();

        let affected = db
            .execute(
                "INSERT INTO t VALUES (?, ?, ?, ?, ?, ?)",
                &[
                    SqlValue::Int(7),
                    SqlValue::Float(1.5),
                    SqlValue::Text("Lewis".into()),
                    SqlValue::Bytes(vec![1, 2]),
                    SqlValue::Bool(true),
                    SqlValue::Json("[1,2]".into()),
                ],
            )
            .await
            .unwrap();
        assert_eq!(affected, 1);

        let rows = db.fetch("SELECT * FROM t", &[]).await.unwrap();
        let row = &rows[0];
        assert_eq!(row["i"], SqlValue::Int(7));
        assert_eq!(row["r"], SqlValue::Float(1.5));
        assert_eq!(row["s"], SqlValue::Text("Lewis".into()));
        assert_eq!(row["b"], SqlValue::Bytes(vec![1, 2]));
        assert_eq!(row["f"], SqlValue::Bool(true));
        assert_eq!(row["j"], SqlValue::Text("[1,2]".into()));
    }

    #[tokio::test]
    async fn nulls_decode_as_null() {
        let db = backend().await;
        let rows = db.fetch("SELECT NULL AS nothing", &[]).await.unwrap();
        assert_eq!(rows[0]["nothing"], SqlValue::Null);
    }

    #[tokio::test]
    async fn failed_batch_rolls_back() {
        let db = backend().await;
        let result = db
            .execute_batch(&[
                "CREATE TABLE a (id INTEGER)".to_string(),
                "CREATE TABLE a (id INTEGER)".to_string(),
            ])
            .await;
        assert!(result.is_err());

        let rows = db
            .fetch("SELECT name FROM sqlite_master WHERE type = 'table'", &[])
            .await
            .unwrap();
        assert!(rows.is_empty());
    }

    #[tokio::test]
    async fn single_connection_keeps_memory_database() {
        let db = backend().await;
        db.execute("CREATE TABLE kept (id INTEGER)", &[]).await.unwrap();
        for _ in 0..3 {
            db.execute("INSERT INTO kept VALUES (1)", &[]).await.unwrap();
        }
        let rows = db.fetch("SELECT COUNT(*) AS n FROM kept", &[]).await.unwrap();
        assert_eq!(rows[0]["n"], SqlValue::Int(3));
    }
}
