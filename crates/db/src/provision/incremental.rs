//! Built-in incremental migrator.
//!
//! Applies only additive changes: missing tables are created and missing
//! columns added, all inside one transaction together with the checksum
//! record. Anything else is a conflict left to the fallback path.

use querylens_core::query::CallStack;
use querylens_core::schema::{Arity, Schema};

use super::{ProvisionError, ProvisionOutcome};
use crate::introspect::{self, Snapshot};
use crate::{ddl, Connection};

pub async fn migrate(
    conn: &Connection,
    schema: &Schema,
    source: &str,
) -> Result<ProvisionOutcome, ProvisionError> {
    let dialect = conn.dialect();
    let checksum = Schema::checksum(source);

    conn.execute(&ddl::create_migrations_table(dialect), &[], CallStack::empty())
        .await?;
    let applied = conn
        .fetch(&ddl::checksum_lookup(&checksum), &[], CallStack::empty())
        .await?;
    if !applied.is_empty() {
        return Ok(ProvisionOutcome::UpToDate);
    }

    let snapshot = Snapshot::capture(conn).await?;
    let mut statements = plan(conn, schema, &snapshot).await?;
    let changed = statements.len();
    statements.push(ddl::record_checksum(&checksum));
    conn.execute_batch(&statements).await?;

    Ok(ProvisionOutcome::Migrated { statements: changed })
}

/// Statements that bring `snapshot` up to `schema`, in dependency order.
async fn plan(
    conn: &Connection,
    schema: &Schema,
    snapshot: &Snapshot,
) -> Result<Vec<String>, ProvisionError> {
    let dialect = conn.dialect();
    let mut statements = Vec::new();

    for model in schema.creation_order() {
        let table = model.table_name();
        if snapshot.columns(table).is_none() {
            statements.push(ddl::create_table(model, schema, dialect));
            continue;
        }

        for field in model.columns() {
            let column = field.column_name();
            if let Some(existing) = snapshot.column(table, column) {
                if !ddl::same_family(field, &existing.data_type, dialect) {
                    return Err(ProvisionError::conflict(
                        table,
                        column,
                        format!(
                            "existing type {} is incompatible with {}",
                            existing.data_type,
                            field.type_name()
                        ),
                    ));
                }
                continue;
            }

            ddl::can_add_column(model, field, dialect)
                .map_err(|reason| ProvisionError::conflict(table, column, reason))?;
            let required = field.arity != Arity::Optional && ddl::default_clause(field).is_none();
            if required && introspect::row_count(conn, table).await? > 0 {
                return Err(ProvisionError::conflict(
                    table,
                    column,
                    "required column without a default on a populated table",
                ));
            }
            statements.push(ddl::add_column(model, field, schema, dialect));
        }
    }
    Ok(statements)
}
