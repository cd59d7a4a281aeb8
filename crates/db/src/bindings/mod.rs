//! Concrete [`Backend`](crate::Backend) implementations on `sqlx`.

pub mod postgres;
pub mod sqlite;

use crate::DbError;

fn decode_error(column: &str, err: impl std::fmt::Display) -> DbError {
    DbError::Decode {
        column: column.to_string(),
        message: err.to_string(),
    }
}
