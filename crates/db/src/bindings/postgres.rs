//! PostgreSQL binding.

use std::str::FromStr;

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, NaiveDateTime, NaiveTime, Utc};
use num_bigint::BigInt;
use querylens_core::sql::{Dialect, SqlValue};
use sqlx::postgres::types::Oid;
use sqlx::postgres::{PgArguments, PgConnectOptions, PgPool, PgPoolOptions, PgRow, PgValueFormat};
use sqlx::query::Query;
use sqlx::{Column, Postgres, Row as _, TypeInfo, ValueRef};

use super::decode_error;
use crate::backend::{Backend, Row};
use crate::DbResult;

const NUMERIC_NEG: u16 = 0x4000;
const NUMERIC_NAN: u16 = 0xC000;
const NUMERIC_PINF: u16 = 0xD000;
const NUMERIC_NINF: u16 = 0xF000;

pub struct PostgresBackend {
    pool: PgPool,
}

impl PostgresBackend {
    pub async fn connect(url: &str) -> DbResult<Self> {
        let options = PgConnectOptions::from_str(url)?;
        let pool = PgPoolOptions::new()
            .max_connections(1)
            .connect_with(options)
            .await?;
        tracing::debug!("PostgreSQL connection opened");
        Ok(Self { pool })
    }
}

#[async_trait]
impl Backend for PostgresBackend {
    fn dialect(&self) -> Dialect {
        Dialect::Postgres
    }

    fn name(&self) -> &'static str {
        "postgres"
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

/// Bind parameters. Callers that write into typed columns cast the
/// placeholder (`$1::TIMESTAMP(3)`), so text and big integers are bound as
/// text and left to the server to convert.
fn bind_all<'q>(
    mut query: Query<'q, Postgres, PgArguments>,
    params: &'q [SqlValue],
) -> Query<'q, Postgres, PgArguments> {
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

fn decode_row(row: &PgRow) -> DbResult<Row> {
    let mut out = Row::with_capacity(row.len());
    for (index, column) in row.columns().iter().enumerate() {
        let name = column.name();
        let type_name = column.type_info().name().to_string();
        let value = decode_cell(row, index, &type_name).map_err(|e| decode_error(name, e))?;
        out.insert(name.to_string(), value);
    }
    Ok(out)
}

fn decode_cell(row: &PgRow, index: usize, type_name: &str) -> Result<SqlValue, String> {
    let raw = row.try_get_raw(index).map_err(|e| e.to_string())?;
    if raw.is_null() {
        return Ok(SqlValue::Null);
    }

    macro_rules! get {
        ($ty:ty) => {
            row.try_get_unchecked::<$ty, _>(index)
                .map_err(|e| e.to_string())?
        };
    }

    let value = match type_name {
        "BOOL" => SqlValue::Bool(get!(bool)),
        "INT2" => SqlValue::Int(get!(i16).into()),
        "INT4" => SqlValue::Int(get!(i32).into()),
        "INT8" => SqlValue::Int(get!(i64)),
        "OID" => SqlValue::Int(get!(Oid).0.into()),
        "FLOAT4" => SqlValue::Float(get!(f32).into()),
        "FLOAT8" => SqlValue::Float(get!(f64)),
        "NUMERIC" => match raw.format() {
            PgValueFormat::Binary => decode_numeric(raw.as_bytes().map_err(|e| e.to_string())?)?,
            PgValueFormat::Text => SqlValue::Text(get!(String)),
        },
        "JSON" | "JSONB" => SqlValue::Json(get!(serde_json::Value).to_string()),
        "BYTEA" => SqlValue::Bytes(get!(Vec<u8>)),
        "TIMESTAMP" => SqlValue::Text(
            get!(NaiveDateTime)
                .format("%Y-%m-%dT%H:%M:%S%.3f")
                .to_string(),
        ),
        "TIMESTAMPTZ" => SqlValue::Text(get!(DateTime<Utc>).to_rfc3339()),
        "DATE" => SqlValue::Text(get!(NaiveDate).to_string()),
        "TIME" => SqlValue::Text(get!(NaiveTime).to_string()),
        "UUID" => SqlValue::Text(get!(uuid::Uuid).to_string()),
        "VOID" => SqlValue::Null,
        // Text types, enums and anything else with a textual wire form.
        _ => {
            let bytes = raw.as_bytes().map_err(|e| e.to_string())?;
            match std::str::from_utf8(bytes) {
                Ok(text) => SqlValue::Text(text.to_string()),
                Err(_) => SqlValue::Bytes(bytes.to_vec()),
            }
        }
    };
    Ok(value)
}

/// Decode the binary NUMERIC wire format: a header of four big-endian
/// 16-bit words (digit count, weight, sign, display scale) followed by
/// base-10000 digits.
///
/// Integral values come back as integers (`BigInt` when they overflow
/// `i64`); values with a scale come back as exact decimal text.
fn decode_numeric(bytes: &[u8]) -> Result<SqlValue, String> {
    let word = |i: usize| -> Result<u16, String> {
        bytes
            .get(i * 2..i * 2 + 2)
            .map(|b| u16::from_be_bytes([b[0], b[1]]))
            .ok_or_else(|| "truncated NUMERIC value".to_string())
    };

    let ndigits = word(0)? as usize;
    let weight = word(1)? as i16 as i64;
    let sign = word(2)?;
    let dscale = word(3)? as usize;

    match sign {
        NUMERIC_NAN => return Ok(SqlValue::Float(f64::NAN)),
        NUMERIC_PINF => return Ok(SqlValue::Float(f64::INFINITY)),
        NUMERIC_NINF => return Ok(SqlValue::Float(f64::NEG_INFINITY)),
        _ => {}
    }

    let mut mantissa = BigInt::from(0u32);
    for i in 0..ndigits {
        mantissa = mantissa * 10_000u32 + u32::from(word(4 + i)?);
    }

    // value * 10^dscale == mantissa * 10^(4 * exponent + dscale), where
    // exponent is the base-10000 power of the last stored digit.
    let exponent = weight - (ndigits as i64 - 1);
    let shift = 4 * exponent + dscale as i64;
    let ten = BigInt::from(10u32);
    let scaled = if shift >= 0 {
        mantissa * ten.pow(shift as u32)
    } else {
        mantissa / ten.pow((-shift) as u32)
    };
    let negative = sign == NUMERIC_NEG;

    if dscale == 0 {
        let value = if negative { -scaled } else { scaled };
        return Ok(match i64::try_from(&value) {
            Ok(i) => SqlValue::Int(i),
            Err(_) => SqlValue::BigInt(value),
        });
    }

    let digits = scaled.to_string();
    let digits = format!("{digits:0>width$}", width = dscale + 1);
    let (int_part, frac_part) = digits.split_at(digits.len() - dscale);
    let sign = if negative { "-" } else { "" };
    Ok(SqlValue::Text(format!("{sign}{int_part}.{frac_part}")))
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
