//! Force synchronisation: drop every user table and recreate the schema.

use querylens_core::query::CallStack;
use querylens_core::schema::Schema;
use querylens_core::sql::Dialect;

use super::{ProvisionError, ProvisionOutcome};
use crate::ddl::{self, MIGRATIONS_TABLE};
use crate::introspect::Snapshot;
use crate::Connection;

pub async fn force_sync(
    conn: &Connection,
    schema: &Schema,
    source: &str,
) -> Result<ProvisionOutcome, ProvisionError> {
    let dialect = conn.dialect();
    let snapshot = Snapshot::capture(conn).await?;
    let order = schema.creation_order();

    let mut statements: Vec<String> = snapshot
        .table_names()
        .map(|table| ddl::drop_table(table, dialect))
        .collect();
    statements.push(ddl::drop_table(MIGRATIONS_TABLE, dialect));
    statements.extend(order.iter().map(|model| ddl::create_table(model, schema, dialect)));
    statements.push(ddl::create_migrations_table(dialect));
    statements.push(ddl::record_checksum(&Schema::checksum(source)));

    // SQLite checks foreign keys on DROP; the pragma is a no-op inside a
    // transaction, so it brackets the batch.
    if dialect == Dialect::Sqlite {
        conn.execute("PRAGMA foreign_keys = OFF", &[], CallStack::empty())
            .await?;
    }
    let result = conn.execute_batch(&statements).await;
    if dialect == Dialect::Sqlite {
        if let Err(e) = conn
            .execute("PRAGMA foreign_keys = ON", &[], CallStack::empty())
            .await
        {
            tracing::warn!(error = %e, "Failed to re-enable foreign keys");
        }
    }
    result?;

    Ok(ProvisionOutcome::ForceSynced {
        tables: order.len(),
    })
}
