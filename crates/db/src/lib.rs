//! Database access for the querylens harness.
//!
//! - [`Backend`] is the seam every database binding implements; the
//!   SQLite and PostgreSQL bindings live in [`bindings`].
//! - [`Connection`] wraps a binding and reports every statement to the
//!   [`QueryBus`](querylens_events::QueryBus).
//! - [`provision`] brings a database in line with a parsed schema.

pub mod backend;
pub mod bindings;
pub mod connection;
pub mod ddl;
pub mod introspect;
pub mod provision;

use std::sync::Arc;

pub use backend::{Backend, Row};
pub use connection::Connection;

/// Errors raised by the database layer.
#[derive(Debug, thiserror::Error)]
pub enum DbError {
    #[error("Unsupported database URL '{0}' (expected sqlite: or postgres://)")]
    UnsupportedUrl(String),

    #[error("Cannot decode column '{column}': {message}")]
    Decode { column: String, message: String },

    #[error(transparent)]
    Sqlx(#[from] sqlx::Error),
}

pub type DbResult<T> = Result<T, DbError>;

/// Open a single-connection binding for `url`, picked by its scheme.
pub async fn connect(url: &str) -> DbResult<Arc<dyn Backend>> {
    if url.starts_with("sqlite:") {
        let backend = bindings::sqlite::SqliteBackend::connect(url).await?;
        Ok(Arc::new(backend))
    } else if url.starts_with("postgres://") || url.starts_with("postgresql://") {
        let backend = bindings::postgres::PostgresBackend::connect(url).await?;
        Ok(Arc::new(backend))
    } else {
        Err(DbError::UnsupportedUrl(redact(url)))
    }
}

/// Strip credentials from a URL before it lands in an error message.
pub fn redact(url: &str) -> String {
    match (url.find("://"), url.rfind('@')) {
        (Some(scheme_end), Some(at)) if at > scheme_end => {
            format!("{}://***{}", &url[..scheme_end], &url[at..])
        }
        _ => url.to_string(),
    }
}
