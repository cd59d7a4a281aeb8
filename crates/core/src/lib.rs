//! Domain logic for the querylens execution harness.
//!
//! Everything here is free of database and runtime dependencies:
//!
//! - [`schema`] parses the ORM model DSL.
//! - [`erd`] turns a schema into an encoded entity-relationship diagram.
//! - [`query`] and [`attribution`] model query events and attribute them to
//!   transaction source lines.
//! - [`serializer`] encodes an [`ExecutionResult`](result::ExecutionResult)
//!   without ever failing.

pub mod attribution;
pub mod erd;
pub mod error;
pub mod output;
pub mod query;
pub mod result;
pub mod schema;
pub mod serializer;
pub mod sql;
pub mod value;
