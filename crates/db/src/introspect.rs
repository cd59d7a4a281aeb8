//! Read back the tables and columns that exist in the database.

use std::collections::BTreeMap;

use querylens_core::query::CallStack;
use querylens_core::schema::Schema;
use querylens_core::sql::{quote_ident, quote_literal, Dialect, SqlValue};

use crate::ddl::MIGRATIONS_TABLE;
use crate::{Connection, DbResult, Row};

/// One existing column.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ColumnInfo {
    pub name: String,
    /// Declared type as reported by the database.
    pub data_type: String,
    pub nullable: bool,
}

/// Tables and columns present at the time of capture. The bookkeeping
/// table is excluded.
#[derive(Debug, Clone, Default)]
pub struct Snapshot {
    tables: BTreeMap<String, Vec<ColumnInfo>>,
}

impl Snapshot {
    pub async fn capture(conn: &Connection) -> DbResult<Self> {
        let mut tables = BTreeMap::new();
        for table in list_tables(conn).await? {
            if table == MIGRATIONS_TABLE {
                continue;
            }
            let columns = table_columns(conn, &table).await?;
            tables.insert(table, columns);
        }
        Ok(Self { tables })
    }

    pub fn table_names(&self) -> impl Iterator<Item = &str> {
        self.tables.keys().map(String::as_str)
    }

    pub fn columns(&self, table: &str) -> Option<&[ColumnInfo]> {
        self.tables.get(table).map(Vec::as_slice)
    }

    pub fn column(&self, table: &str, column: &str) -> Option<&ColumnInfo> {
        self.columns(table)?.iter().find(|c| c.name == column)
    }

    /// Every declared table and column exists.
    pub fn satisfies(&self, schema: &Schema) -> bool {
        schema.models.iter().all(|model| {
            model
                .columns()
                .all(|field| self.column(model.table_name(), field.column_name()).is_some())
        })
    }
}

async fn list_tables(conn: &Connection) -> DbResult<Vec<String>> {
    let sql = match conn.dialect() {
        Dialect::Sqlite => {
            "SELECT name FROM sqlite_master WHERE type = 'table' AND name NOT LIKE 'sqlite_%' ORDER BY name"
        }
        Dialect::Postgres => {
            "SELECT table_name::text AS name FROM information_schema.tables \
             WHERE table_schema = current_schema() AND table_type = 'BASE TABLE' ORDER BY table_name"
        }
    };
    let rows = conn.fetch(sql, &[], CallStack::empty()).await?;
    Ok(rows.iter().filter_map(|row| text(row, "name")).collect())
}

async fn table_columns(conn: &Connection, table: &str) -> DbResult<Vec<ColumnInfo>> {
    let rows = match conn.dialect() {
        Dialect::Sqlite => {
            let sql = format!(
                "SELECT name, type, \"notnull\" AS not_null FROM pragma_table_info({})",
                quote_literal(table)
            );
            conn.fetch(&sql, &[], CallStack::empty()).await?
        }
        Dialect::Postgres => {
            let sql = "SELECT column_name::text AS name, data_type::text AS type, \
                       (is_nullable = 'NO') AS not_null FROM information_schema.columns \
                       WHERE table_schema = current_schema() AND table_name = $1 \
                       ORDER BY ordinal_position";
            conn.fetch(sql, &[SqlValue::Text(table.to_string())], CallStack::empty())
                .await?
        }
    };

    Ok(rows
        .iter()
        .filter_map(|row| {
            let not_null = match row.get("not_null") {
                Some(SqlValue::Bool(b)) => *b,
                Some(SqlValue::Int(i)) => *i != 0,
                _ => false,
            };
            Some(ColumnInfo {
                name: text(row, "name")?,
                data_type: text(row, "type").unwrap_or_default(),
                nullable: !not_null,
            })
        })
        .collect())
}

/// Number of rows currently in `table`.
pub async fn row_count(conn: &Connection, table: &str) -> DbResult<i64> {
    let sql = format!("SELECT COUNT(*) AS n FROM {}", quote_ident(table));
    let rows = conn.fetch(&sql, &[], CallStack::empty()).await?;
    Ok(match rows.first().and_then(|row| row.get("n")) {
        Some(SqlValue::Int(n)) => *n,
        _ => 0,
    })
}

fn text(row: &Row, column: &str) -> Option<String> {
    match row.get(column)? {
        SqlValue::Text(s) => Some(s.clone()),
        _ => None,
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
