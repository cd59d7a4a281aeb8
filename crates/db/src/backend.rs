//! The seam between the harness and a concrete database driver.

use async_trait::async_trait;
use indexmap::IndexMap;
use querylens_core::sql::{Dialect, SqlValue};

use crate::DbResult;

/// One result row, columns in select order.
pub type Row = IndexMap<String, SqlValue>;

/// A database binding: one exclusive connection speaking one dialect.
///
/// Bindings only execute; timing and event emission happen in
/// [`Connection`](crate::Connection) so every binding reports queries the
/// same way.
#[async_trait]
pub trait Backend: Send + Sync {
    fn dialect(&self) -> Dialect;

    /// Short binding name reported with each query event.
    fn name(&self) -> &'static str;

    /// Run a statement and decode every returned row.
    async fn fetch(&self, sql: &str, params: &[SqlValue]) -> DbResult<Vec<Row>>;

    /// Run a statement and return the number of affected rows.
    async fn execute(&self, sql: &str, params: &[SqlValue]) -> DbResult<u64>;

    /// Run parameterless statements in order inside one transaction.
    async fn execute_batch(&self, statements: &[String]) -> DbResult<()>;

    /// Release the connection. Safe to call more than once.
    async fn close(&self);
}
