//! Dialect-specific DDL generation from a parsed schema.

use querylens_core::schema::{Arity, DefaultValue, Field, FieldType, Model, ScalarType, Schema};
use querylens_core::sql::{quote_ident, quote_literal, Dialect};

/// Bookkeeping table holding the checksums of applied schemas.
pub const MIGRATIONS_TABLE: &str = "_querylens_migrations";

/// Storage type of a column, without constraints.
pub fn column_type(field: &Field, dialect: Dialect) -> &'static str {
    if field.arity == Arity::List {
        return match dialect {
            Dialect::Sqlite => "JSON",
            Dialect::Postgres => "JSONB",
        };
    }
    let scalar = match &field.ty {
        FieldType::Scalar(scalar) => *scalar,
        FieldType::Enum(_) | FieldType::Model(_) => return "TEXT",
    };
    match (scalar, dialect) {
        (ScalarType::Int, _) => "INTEGER",
        (ScalarType::BigInt, _) => "BIGINT",
        (ScalarType::Float, Dialect::Sqlite) => "REAL",
        (ScalarType::Float, Dialect::Postgres) => "DOUBLE PRECISION",
        (ScalarType::Decimal, _) => "NUMERIC",
        (ScalarType::String, _) => "TEXT",
        (ScalarType::Boolean, _) => "BOOLEAN",
        (ScalarType::DateTime, Dialect::Sqlite) => "DATETIME",
        (ScalarType::DateTime, Dialect::Postgres) => "TIMESTAMP(3)",
        (ScalarType::Json, Dialect::Sqlite) => "JSON",
        (ScalarType::Json, Dialect::Postgres) => "JSONB",
        (ScalarType::Bytes, Dialect::Sqlite) => "BLOB",
        (ScalarType::Bytes, Dialect::Postgres) => "BYTEA",
    }
}

/// Placeholder for a value written to or compared with `field`.
///
/// PostgreSQL gets an explicit cast so parameters bound as text land in
/// typed columns; SQLite is dynamically typed and takes bare `?`.
pub fn typed_placeholder(dialect: Dialect, index: usize, field: Option<&Field>) -> String {
    match (dialect, field) {
        (Dialect::Postgres, Some(field)) => {
            format!("{}::{}", dialect.placeholder(index), column_type(field, dialect))
        }
        _ => dialect.placeholder(index),
    }
}

/// Whether `field` is an auto-incrementing single-column primary key,
/// rendered inline as the table's rowid / serial column.
fn is_serial_key(model: &Model, field: &Field) -> bool {
    field.default == Some(DefaultValue::AutoIncrement)
        && model.primary_key() == [field.name.as_str()]
        && matches!(
            field.ty,
            FieldType::Scalar(ScalarType::Int | ScalarType::BigInt)
        )
}

/// Column definition as used in `CREATE TABLE` and `ADD COLUMN`.
fn column_definition(model: &Model, field: &Field, schema: &Schema, dialect: Dialect) -> String {
    let name = quote_ident(field.column_name());

    if is_serial_key(model, field) {
        return match (dialect, &field.ty) {
            (Dialect::Sqlite, _) => format!("{name} INTEGER PRIMARY KEY AUTOINCREMENT"),
            (Dialect::Postgres, FieldType::Scalar(ScalarType::BigInt)) => {
                format!("{name} BIGSERIAL PRIMARY KEY")
            }
            (Dialect::Postgres, _) => format!("{name} SERIAL PRIMARY KEY"),
        };
    }

    let mut def = format!("{name} {}", column_type(field, dialect));
    if field.arity != Arity::Optional {
        def.push_str(" NOT NULL");
    }
    if let Some(default) = default_clause(field) {
        def.push_str(" DEFAULT ");
        def.push_str(&default);
    }
    if field.is_unique && !field.is_id {
        def.push_str(" UNIQUE");
    }
    if let (FieldType::Enum(enum_name), Arity::Required | Arity::Optional) =
        (&field.ty, field.arity)
    {
        if let Some(def_enum) = schema.enum_def(enum_name) {
            let values: Vec<String> = def_enum.values.iter().map(|v| quote_literal(v)).collect();
            def.push_str(&format!(" CHECK ({name} IN ({}))", values.join(", ")));
        }
    }
    def
}

pub fn default_clause(field: &Field) -> Option<String> {
    match field.default.as_ref()? {
        DefaultValue::Now => Some("CURRENT_TIMESTAMP".to_string()),
        DefaultValue::Literal(sql) => Some(sql.clone()),
        // Generated by the client at insert time.
        DefaultValue::AutoIncrement | DefaultValue::Generated(_) => None,
    }
}

/// `CREATE TABLE` for `model`, including its primary key, unique sets and
/// foreign keys.
pub fn create_table(model: &Model, schema: &Schema, dialect: Dialect) -> String {
    let mut parts: Vec<String> = model
        .columns()
        .map(|field| column_definition(model, field, schema, dialect))
        .collect();

    let inline_key = model.columns().any(|f| is_serial_key(model, f));
    let primary_key = model.primary_key();
    if !inline_key && !primary_key.is_empty() {
        parts.push(format!("PRIMARY KEY ({})", column_list(model, &primary_key)));
    }

    for set in &model.unique_sets {
        let names: Vec<&str> = set.iter().map(String::as_str).collect();
        parts.push(format!("UNIQUE ({})", column_list(model, &names)));
    }

    for field in &model.fields {
        let (FieldType::Model(target_name), Some(relation)) = (&field.ty, &field.relation) else {
            continue;
        };
        if relation.fields.is_empty() {
            continue;
        }
        let Some(target) = schema.model(target_name) else {
            continue;
        };
        let local: Vec<&str> = relation.fields.iter().map(String::as_str).collect();
        let remote: Vec<&str> = relation.references.iter().map(String::as_str).collect();
        let optional = local
            .iter()
            .filter_map(|name| model.field(name))
            .any(Field::is_optional);
        let on_delete = if optional { "SET NULL" } else { "RESTRICT" };
        parts.push(format!(
            "FOREIGN KEY ({}) REFERENCES {} ({}) ON DELETE {on_delete} ON UPDATE CASCADE",
            column_list(model, &local),
            quote_ident(target.table_name()),
            column_list(target, &remote),
        ));
    }

    format!(
        "CREATE TABLE {} (\n    {}\n)",
        quote_ident(model.table_name()),
        parts.join(",\n    ")
    )
}

/// Quoted, comma-separated column names for the given field names.
fn column_list(model: &Model, names: &[&str]) -> String {
    names
        .iter()
        .map(|name| quote_ident(model.column_for(name).unwrap_or(name)))
        .collect::<Vec<_>>()
        .join(", ")
}

/// `ALTER TABLE .. ADD COLUMN` for a field missing from an existing table.
pub fn add_column(model: &Model, field: &Field, schema: &Schema, dialect: Dialect) -> String {
    format!(
        "ALTER TABLE {} ADD COLUMN {}",
        quote_ident(model.table_name()),
        column_definition(model, field, schema, dialect)
    )
}

pub fn drop_table(table: &str, dialect: Dialect) -> String {
    match dialect {
        Dialect::Sqlite => format!("DROP TABLE IF EXISTS {}", quote_ident(table)),
        Dialect::Postgres => format!("DROP TABLE IF EXISTS {} CASCADE", quote_ident(table)),
    }
}

pub fn create_migrations_table(dialect: Dialect) -> String {
    let applied_at = match dialect {
        Dialect::Sqlite => "DATETIME",
        Dialect::Postgres => "TIMESTAMP(3)",
    };
    format!(
        "CREATE TABLE IF NOT EXISTS {} (checksum TEXT PRIMARY KEY, applied_at {applied_at} NOT NULL DEFAULT CURRENT_TIMESTAMP)",
        quote_ident(MIGRATIONS_TABLE)
    )
}

pub fn record_checksum(checksum: &str) -> String {
    format!(
        "INSERT INTO {} (checksum) VALUES ({}) ON CONFLICT DO NOTHING",
        quote_ident(MIGRATIONS_TABLE),
        quote_literal(checksum)
    )
}

pub fn checksum_lookup(checksum: &str) -> String {
    format!(
        "SELECT checksum FROM {} WHERE checksum = {}",
        quote_ident(MIGRATIONS_TABLE),
        quote_literal(checksum)
    )
}

/// Whether a field can be added to an existing table with `ADD COLUMN`.
/// Keys, foreign keys and (on SQLite) non-constant defaults or required
/// columns without a default need a table rebuild instead.
pub fn can_add_column(model: &Model, field: &Field, dialect: Dialect) -> Result<(), String> {
    if model.primary_key().contains(&field.name.as_str()) {
        return Err("primary key columns cannot be added".to_string());
    }
    let is_foreign_key = model
        .fields
        .iter()
        .filter_map(|f| f.relation.as_ref())
        .any(|rel| rel.fields.contains(&field.name));
    if is_foreign_key {
        return Err("foreign key columns cannot be added".to_string());
    }
    if dialect == Dialect::Sqlite {
        if field.default == Some(DefaultValue::Now) {
            return Err("SQLite cannot add a column with a non-constant default".to_string());
        }
        if field.is_unique {
            return Err("SQLite cannot add a UNIQUE column".to_string());
        }
        if field.arity != Arity::Optional && default_clause(field).is_none() {
            return Err("SQLite cannot add a required column without a default".to_string());
        }
    }
    Ok(())
}

/// Declared field type and existing column type belong to the same family.
pub fn same_family(field: &Field, existing: &str, dialect: Dialect) -> bool {
    match (type_family(column_type(field, dialect)), type_family(existing)) {
        (Some(declared), Some(actual)) => declared == actual,
        // Unknown spellings are not treated as conflicts.
        _ => true,
    }
}

#[derive(Debug, PartialEq, Eq)]
enum Family {
    Integer,
    Real,
    Numeric,
    Text,
    Boolean,
    Temporal,
    Json,
    Binary,
}

fn type_family(type_name: &str) -> Option<Family> {
    let t = type_name.to_ascii_lowercase();
    let family = if t.contains("bool") {
        Family::Boolean
    } else if t.contains("int") || t.contains("serial") {
        Family::Integer
    } else if t.contains("real") || t.contains("double") || t.contains("float") {
        Family::Real
    } else if t.contains("numeric") || t.contains("decimal") {
        Family::Numeric
    } else if t.contains("json") {
        Family::Json
    } else if t.contains("time") || t.contains("date") {
        Family::Temporal
    } else if t.contains("char") || t.contains("text") || t.contains("clob") || t == "user-defined" {
        Family::Text
    } else if t.contains("blob") || t.contains("bytea") {
        Family::Binary
    } else {
        return None;
    };
    Some(family)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
