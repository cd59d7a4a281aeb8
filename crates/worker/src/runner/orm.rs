//! The database API exposed to transaction scripts.
//!
//! Scripts receive a `Db` handle (as the entry point's parameter or from
//! the global `db()` function) with raw SQL access and model-level helpers
//! driven by the parsed schema:
//!
//! ```text
//! db.query(sql [, params])          -> array of maps
//! db.execute(sql [, params])        -> affected rows
//! db.create(model, data)            -> created row
//! db.create_many(model, rows)       -> affected rows
//! db.find_many(model [, where [, options]]) -> array of maps
//! db.find_first(model [, where])    -> map or ()
//! db.update(model, where, data)     -> affected rows
//! db.delete(model, where)           -> affected rows
//! db.count(model [, where])         -> integer
//! ```
//!
//! Scripts run on a blocking thread; every call blocks on the async
//! [`Connection`] through the captured runtime handle. The issuing script
//! position is captured from the call context and travels with the query
//! event, which is what line attribution reads.

use std::future::Future;
use std::sync::Arc;

use querylens_core::query::{CallFrame, CallStack};
use querylens_core::schema::{Arity, DefaultValue, Field, FieldType, Model, ScalarType, Schema};
use querylens_core::sql::{quote_ident, Dialect, SqlValue};
use querylens_db::{ddl, Connection, Row};
use rhai::{Array, Dynamic, Engine, EvalAltResult, Map, NativeCallContext};
use tokio::runtime::Handle;

use super::convert;

type ScriptResult<T> = Result<T, Box<EvalAltResult>>;

#[derive(Clone)]
pub struct DbHandle {
    inner: Arc<Inner>,
}

struct Inner {
    /// `Err` holds the reason the database cannot be reached; every call
    /// then raises it as a script error.
    conn: Result<Connection, String>,
    schema: Option<Schema>,
    runtime: Handle,
}

impl DbHandle {
    pub fn new(conn: Connection, schema: Option<Schema>, runtime: Handle) -> Self {
        Self {
            inner: Arc::new(Inner {
                conn: Ok(conn),
                schema,
                runtime,
            }),
        }
    }

    /// A handle for a job whose database could not be reached.
    pub fn unavailable(reason: impl Into<String>, schema: Option<Schema>, runtime: Handle) -> Self {
        Self {
            inner: Arc::new(Inner {
                conn: Err(reason.into()),
                schema,
                runtime,
            }),
        }
    }

    fn block_on<F: Future>(&self, future: F) -> F::Output {
        self.inner.runtime.block_on(future)
    }

    fn conn(&self, ctx: &NativeCallContext) -> ScriptResult<&Connection> {
        self.inner
            .conn
            .as_ref()
            .map_err(|reason| script_error(ctx, reason.clone()))
    }

    /// Placeholder style only; an unavailable handle fails before binding.
    fn dialect(&self) -> Dialect {
        self.inner
            .conn
            .as_ref()
            .map_or(Dialect::Sqlite, Connection::dialect)
    }

    /// Native frame on top, then the script position that made the call.
    /// Without a known source only the native frame is reported.
    fn stack(&self, ctx: &NativeCallContext) -> CallStack {
        let mut frames = vec![CallFrame::native("orm")];
        let source = ctx
            .source()
            .or_else(|| ctx.global_runtime_state().source());
        if let Some(source) = source {
            frames.push(CallFrame::new(source, ctx.position().line()));
        }
        CallStack::new(frames)
    }

    fn fetch(&self, ctx: &NativeCallContext, sql: &str, params: &[SqlValue]) -> ScriptResult<Vec<Row>> {
        let conn = self.conn(ctx)?;
        let stack = self.stack(ctx);
        self.block_on(conn.fetch(sql, params, stack))
            .map_err(|e| script_error(ctx, e.to_string()))
    }

    fn execute(&self, ctx: &NativeCallContext, sql: &str, params: &[SqlValue]) -> ScriptResult<u64> {
        let conn = self.conn(ctx)?;
        let stack = self.stack(ctx);
        self.block_on(conn.execute(sql, params, stack))
            .map_err(|e| script_error(ctx, e.to_string()))
    }

    fn target(&self, ctx: &NativeCallContext, name: &str) -> ScriptResult<Target<'_>> {
        match &self.inner.schema {
            Some(schema) => schema
                .model(name)
                .map(|model| Target {
                    table: model.table_name().to_string(),
                    model: Some(model),
                })
                .ok_or_else(|| script_error(ctx, format!("Unknown model '{name}'"))),
            // Without a parsed schema, model names are taken as table names.
            None => Ok(Target {
                table: name.to_string(),
                model: None,
            }),
        }
    }

    // ---- Raw SQL ----

    fn query(&self, ctx: &NativeCallContext, sql: &str, params: &Array) -> ScriptResult<Dynamic> {
        let params = params_to_sql(ctx, params)?;
        let rows = self.fetch(ctx, sql, &params)?;
        Ok(rows_to_array(&rows, None))
    }

    fn execute_raw(&self, ctx: &NativeCallContext, sql: &str, params: &Array) -> ScriptResult<i64> {
        let params = params_to_sql(ctx, params)?;
        self.execute(ctx, sql, &params).map(to_count)
    }

    // ---- Model API ----

    fn create(&self, ctx: &NativeCallContext, model: &str, data: &Map) -> ScriptResult<Dynamic> {
        let target = self.target(ctx, model)?;
        let values = target.row_values(data).map_err(|e| script_error(ctx, e))?;
        let rows = self.insert(ctx, &target, values)?;
        Ok(rows
            .first()
            .map(|row| row_to_dynamic(row, target.model))
            .unwrap_or(Dynamic::UNIT))
    }

    fn create_many(&self, ctx: &NativeCallContext, model: &str, rows: &Array) -> ScriptResult<i64> {
        let target = self.target(ctx, model)?;
        let mut prepared = Vec::with_capacity(rows.len());
        for row in rows {
            let map = row
                .read_lock::<Map>()
                .ok_or_else(|| script_error(ctx, "create_many expects an array of maps"))?;
            prepared.push(target.row_values(&map).map_err(|e| script_error(ctx, e))?);
        }
        if prepared.is_empty() {
            return Ok(0);
        }

        // One multi-row INSERT when every row sets the same columns.
        let same_shape = prepared.windows(2).all(|pair| {
            pair[0].iter().map(|(c, ..)| c).eq(pair[1].iter().map(|(c, ..)| c))
        });
        if !same_shape || prepared[0].is_empty() {
            let mut total = 0;
            for values in prepared {
                total += self.insert(ctx, &target, values)?.len() as i64;
            }
            return Ok(total);
        }

        let columns: Vec<String> = prepared[0].iter().map(|(c, ..)| quote_ident(c)).collect();
        let mut stmt = Statement::new(self.dialect());
        let tuples: Vec<String> = prepared
            .into_iter()
            .map(|values| {
                let placeholders: Vec<String> = values
                    .into_iter()
                    .map(|(_, value, field)| stmt.push(value, field))
                    .collect();
                format!("({})", placeholders.join(", "))
            })
            .collect();
        let sql = format!(
            "INSERT INTO {} ({}) VALUES {}",
            quote_ident(&target.table),
            columns.join(", "),
            tuples.join(", ")
        );
        self.execute(ctx, &sql, &stmt.params).map(to_count)
    }

    /// Insert one row and return it as stored.
    fn insert(
        &self,
        ctx: &NativeCallContext,
        target: &Target<'_>,
        values: Vec<ColumnValue<'_>>,
    ) -> ScriptResult<Vec<Row>> {
        let table = quote_ident(&target.table);
        if values.is_empty() {
            let sql = format!("INSERT INTO {table} DEFAULT VALUES RETURNING *");
            return self.fetch(ctx, &sql, &[]);
        }

        let mut stmt = Statement::new(self.dialect());
        let columns: Vec<String> = values.iter().map(|(c, ..)| quote_ident(c)).collect();
        let placeholders: Vec<String> = values
            .into_iter()
            .map(|(_, value, field)| stmt.push(value, field))
            .collect();
        let sql = format!(
            "INSERT INTO {table} ({}) VALUES ({}) RETURNING *",
            columns.join(", "),
            placeholders.join(", ")
        );
        self.fetch(ctx, &sql, &stmt.params)
    }

    fn find_many(
        &self,
        ctx: &NativeCallContext,
        model: &str,
        filter: &Map,
        options: &Map,
    ) -> ScriptResult<Dynamic> {
        let target = self.target(ctx, model)?;
        let mut stmt = Statement::new(self.dialect());
        let mut sql = format!("SELECT * FROM {}", quote_ident(&target.table));
        sql.push_str(&stmt.where_clause(&target, filter).map_err(|e| script_error(ctx, e))?);
        sql.push_str(&target.query_options(options, self.dialect()).map_err(|e| script_error(ctx, e))?);

        let rows = self.fetch(ctx, &sql, &stmt.params)?;
        Ok(rows_to_array(&rows, target.model))
    }

    fn find_first(&self, ctx: &NativeCallContext, model: &str, filter: &Map) -> ScriptResult<Dynamic> {
        let mut options = Map::new();
        options.insert("take".into(), Dynamic::from(1_i64));
        let rows = self.find_many(ctx, model, filter, &options)?;
        let first = rows
            .read_lock::<Array>()
            .and_then(|rows| rows.first().cloned());
        Ok(first.unwrap_or(Dynamic::UNIT))
    }

    fn update(&self, ctx: &NativeCallContext, model: &str, filter: &Map, data: &Map) -> ScriptResult<i64> {
        let target = self.target(ctx, model)?;
        let values = target.row_values(data).map_err(|e| script_error(ctx, e))?;
        if values.is_empty() {
            return Err(script_error(ctx, "update needs at least one field to set"));
        }

        let mut stmt = Statement::new(self.dialect());
        let assignments: Vec<String> = values
            .into_iter()
            .map(|(column, value, field)| format!("{} = {}", quote_ident(&column), stmt.push(value, field)))
            .collect();
        let mut sql = format!(
            "UPDATE {} SET {}",
            quote_ident(&target.table),
            assignments.join(", ")
        );
        sql.push_str(&stmt.where_clause(&target, filter).map_err(|e| script_error(ctx, e))?);
        self.execute(ctx, &sql, &stmt.params).map(to_count)
    }

    fn delete(&self, ctx: &NativeCallContext, model: &str, filter: &Map) -> ScriptResult<i64> {
        let target = self.target(ctx, model)?;
        let mut stmt = Statement::new(self.dialect());
        let mut sql = format!("DELETE FROM {}", quote_ident(&target.table));
        sql.push_str(&stmt.where_clause(&target, filter).map_err(|e| script_error(ctx, e))?);
        self.execute(ctx, &sql, &stmt.params).map(to_count)
    }

    fn count(&self, ctx: &NativeCallContext, model: &str, filter: &Map) -> ScriptResult<i64> {
        let target = self.target(ctx, model)?;
        let mut stmt = Statement::new(self.dialect());
        let mut sql = format!("SELECT COUNT(*) AS count FROM {}", quote_ident(&target.table));
        sql.push_str(&stmt.where_clause(&target, filter).map_err(|e| script_error(ctx, e))?);
        let rows = self.fetch(ctx, &sql, &stmt.params)?;
        Ok(match rows.first().and_then(|row| row.get("count")) {
            Some(SqlValue::Int(n)) => *n,
            _ => 0,
        })
    }
}

/// Register the `Db` type, its methods and the global `db()` accessor.
pub fn register(engine: &mut Engine, handle: DbHandle) {
    engine
        .register_type_with_name::<DbHandle>("Db")
        .register_fn("db", move || handle.clone());

    engine
        .register_fn("query", |ctx: NativeCallContext, db: &mut DbHandle, sql: &str| {
            db.query(&ctx, sql, &Array::new())
        })
        .register_fn(
            "query",
            |ctx: NativeCallContext, db: &mut DbHandle, sql: &str, params: Array| {
                db.query(&ctx, sql, &params)
            },
        )
        .register_fn("execute", |ctx: NativeCallContext, db: &mut DbHandle, sql: &str| {
            db.execute_raw(&ctx, sql, &Array::new())
        })
        .register_fn(
            "execute",
            |ctx: NativeCallContext, db: &mut DbHandle, sql: &str, params: Array| {
                db.execute_raw(&ctx, sql, &params)
            },
        );

    engine
        .register_fn(
            "create",
            |ctx: NativeCallContext, db: &mut DbHandle, model: &str, data: Map| {
                db.create(&ctx, model, &data)
            },
        )
        .register_fn(
            "create_many",
            |ctx: NativeCallContext, db: &mut DbHandle, model: &str, rows: Array| {
                db.create_many(&ctx, model, &rows)
            },
        )
        .register_fn("find_many", |ctx: NativeCallContext, db: &mut DbHandle, model: &str| {
            db.find_many(&ctx, model, &Map::new(), &Map::new())
        })
        .register_fn(
            "find_many",
            |ctx: NativeCallContext, db: &mut DbHandle, model: &str, filter: Map| {
                db.find_many(&ctx, model, &filter, &Map::new())
            },
        )
        .register_fn(
            "find_many",
            |ctx: NativeCallContext, db: &mut DbHandle, model: &str, filter: Map, options: Map| {
                db.find_many(&ctx, model, &filter, &options)
            },
        )
        .register_fn("find_first", |ctx: NativeCallContext, db: &mut DbHandle, model: &str| {
            db.find_first(&ctx, model, &Map::new())
        })
        .register_fn(
            "find_first",
            |ctx: NativeCallContext, db: &mut DbHandle, model: &str, filter: Map| {
                db.find_first(&ctx, model, &filter)
            },
        )
        .register_fn(
            "update",
            |ctx: NativeCallContext, db: &mut DbHandle, model: &str, filter: Map, data: Map| {
                db.update(&ctx, model, &filter, &data)
            },
        )
        .register_fn(
            "delete",
            |ctx: NativeCallContext, db: &mut DbHandle, model: &str, filter: Map| {
                db.delete(&ctx, model, &filter)
            },
        )
        .register_fn("count", |ctx: NativeCallContext, db: &mut DbHandle, model: &str| {
            db.count(&ctx, model, &Map::new())
        })
        .register_fn(
            "count",
            |ctx: NativeCallContext, db: &mut DbHandle, model: &str, filter: Map| {
                db.count(&ctx, model, &filter)
            },
        );
}

/// Resolved write/read target: a table and, with a schema, its model.
struct Target<'a> {
    table: String,
    model: Option<&'a Model>,
}

/// Column name, bound value and declaring field (when known).
type ColumnValue<'a> = (String, SqlValue, Option<&'a Field>);

impl<'a> Target<'a> {
    fn column(&self, key: &str) -> Result<(String, Option<&'a Field>), String> {
        let Some(model) = self.model else {
            return Ok((key.to_string(), None));
        };
        let field = model
            .columns()
            .find(|f| f.name == key || f.db_name.as_deref() == Some(key));
        match field {
            Some(field) => Ok((field.column_name().to_string(), Some(field))),
            None if model.field(key).is_some() => Err(format!(
                "Nested writes through relation field '{key}' are not supported"
            )),
            None => Err(format!("Unknown field '{key}' on model '{}'", model.name)),
        }
    }

    /// Columns and values for an insert or update, with client-generated
    /// ids filled in for inserts that leave them out.
    fn row_values(&self, data: &Map) -> Result<Vec<ColumnValue<'a>>, String> {
        let mut values = Vec::with_capacity(data.len());
        for (key, value) in data {
            let (column, field) = self.column(key)?;
            values.push((column, convert::to_sql(value)?, field));
        }
        if let Some(model) = self.model {
            for field in model.columns() {
                let Some(DefaultValue::Generated(kind)) = &field.default else {
                    continue;
                };
                if values.iter().any(|(column, ..)| column == field.column_name()) {
                    continue;
                }
                if let Some(id) = generate_id(kind) {
                    values.push((field.column_name().to_string(), SqlValue::Text(id), Some(field)));
                }
            }
        }
        Ok(values)
    }

    /// `ORDER BY` / `LIMIT` / `OFFSET` from `#{ order_by, take, skip }`.
    fn query_options(&self, options: &Map, dialect: Dialect) -> Result<String, String> {
        let mut sql = String::new();

        if let Some(order) = options.get("order_by") {
            let mut terms = Vec::new();
            if let Some(spec) = order.read_lock::<Map>() {
                for (key, direction) in spec.iter() {
                    let (column, _) = self.column(key)?;
                    let direction = direction.to_string().to_ascii_uppercase();
                    if direction != "ASC" && direction != "DESC" {
                        return Err(format!("order_by direction must be asc or desc, got '{direction}'"));
                    }
                    terms.push(format!("{} {direction}", quote_ident(&column)));
                }
            } else {
                let (column, _) = self.column(&order.to_string())?;
                terms.push(format!("{} ASC", quote_ident(&column)));
            }
            if !terms.is_empty() {
                sql.push_str(&format!(" ORDER BY {}", terms.join(", ")));
            }
        }

        let take = int_option(options, "take")?;
        let skip = int_option(options, "skip")?;
        match (take, skip, dialect) {
            (Some(take), _, _) => sql.push_str(&format!(" LIMIT {take}")),
            (None, Some(_), Dialect::Sqlite) => sql.push_str(" LIMIT -1"),
            _ => {}
        }
        if let Some(skip) = skip {
            sql.push_str(&format!(" OFFSET {skip}"));
        }
        Ok(sql)
    }
}

fn int_option(options: &Map, key: &str) -> Result<Option<i64>, String> {
    match options.get(key) {
        None => Ok(None),
        Some(value) => match value.as_int() {
            Ok(n) if n >= 0 => Ok(Some(n)),
            _ => Err(format!("'{key}' must be a non-negative integer")),
        },
    }
}

/// Statement parameters, numbered in the order their placeholders are
/// written.
struct Statement {
    dialect: Dialect,
    params: Vec<SqlValue>,
}

impl Statement {
    fn new(dialect: Dialect) -> Self {
        Self {
            dialect,
            params: Vec::new(),
        }
    }

    fn push(&mut self, value: SqlValue, field: Option<&Field>) -> String {
        self.params.push(value);
        ddl::typed_placeholder(self.dialect, self.params.len(), field)
    }

    /// ` WHERE a = ? AND b IS NULL`, or an empty string for no filter.
    fn where_clause(&mut self, target: &Target<'_>, filter: &Map) -> Result<String, String> {
        let mut conditions = Vec::with_capacity(filter.len());
        for (key, value) in filter {
            let (column, field) = target.column(key)?;
            if value.is_unit() {
                conditions.push(format!("{} IS NULL", quote_ident(&column)));
            } else {
                let placeholder = self.push(convert::to_sql(value)?, field);
                conditions.push(format!("{} = {placeholder}", quote_ident(&column)));
            }
        }
        if conditions.is_empty() {
            return Ok(String::new());
        }
        Ok(format!(" WHERE {}", conditions.join(" AND ")))
    }
}

fn generate_id(kind: &str) -> Option<String> {
    match kind {
        "uuid" => Some(uuid::Uuid::new_v4().to_string()),
        "cuid" => Some(format!("c{}", uuid::Uuid::new_v4().simple())),
        _ => None,
    }
}

fn rows_to_array(rows: &[Row], model: Option<&Model>) -> Dynamic {
    Dynamic::from_array(rows.iter().map(|row| row_to_dynamic(row, model)).collect())
}

/// Decode a row into a map keyed by field name, restoring JSON documents
/// and booleans the database stored in another form.
fn row_to_dynamic(row: &Row, model: Option<&Model>) -> Dynamic {
    let mut map = Map::new();
    for (column, cell) in row {
        let field = model.and_then(|m| m.columns().find(|f| f.column_name() == column));
        let key = field.map_or(column.as_str(), |f| f.name.as_str());
        let value = match (field, cell) {
            (Some(field), SqlValue::Text(text) | SqlValue::Json(text)) if stores_json(field) => {
                convert::from_json_text(text)
            }
            (Some(field), SqlValue::Int(i))
                if field.ty == FieldType::Scalar(ScalarType::Boolean) =>
            {
                Dynamic::from(*i != 0)
            }
            _ => convert::from_sql(cell),
        };
        map.insert(key.into(), value);
    }
    Dynamic::from_map(map)
}

fn stores_json(field: &Field) -> bool {
    field.arity == Arity::List || field.ty == FieldType::Scalar(ScalarType::Json)
}

fn params_to_sql(ctx: &NativeCallContext, params: &Array) -> ScriptResult<Vec<SqlValue>> {
    params
        .iter()
        .map(|value| convert::to_sql(value).map_err(|e| script_error(ctx, e)))
        .collect()
}

fn to_count(rows: u64) -> i64 {
    i64::try_from(rows).unwrap_or(i64::MAX)
}

fn script_error(ctx: &NativeCallContext, message: impl Into<String>) -> Box<EvalAltResult> {
    EvalAltResult::ErrorRuntime(Dynamic::from(message.into()), ctx.position()).into()
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
