//! Conversions between script values and the harness value models.

use std::collections::HashMap;
use std::sync::PoisonError;

use num_bigint::BigInt;
use querylens_core::serializer;
use querylens_core::sql::SqlValue;
use querylens_core::value::{Object, Value};
use rhai::{Array, Blob, Dynamic, Map};

/// Convert a script value into a [`Value`] graph.
///
/// Containers are memoized by address, so a container reachable twice
/// (or from inside itself, through shared closure captures) maps to the
/// same shared node instead of being copied or recursed into forever.
pub fn to_value(value: &Dynamic) -> Value {
    Converter::default().convert(value)
}

#[derive(Default)]
struct Converter {
    seen: HashMap<usize, Value>,
}

impl Converter {
    fn convert(&mut self, value: &Dynamic) -> Value {
        if value.is_unit() {
            return Value::Null;
        }
        if let Ok(b) = value.as_bool() {
            return Value::Bool(b);
        }
        if let Ok(i) = value.as_int() {
            return Value::Int(i);
        }
        if let Ok(f) = value.as_float() {
            return Value::Float(f);
        }
        if let Ok(c) = value.as_char() {
            return Value::String(c.to_string());
        }
        if value.is_string() {
            return Value::String(value.to_string());
        }
        if value.is::<BigInt>() {
            return Value::BigInt(value.clone_cast::<BigInt>());
        }
        if let Some(array) = value.read_lock::<Array>() {
            let address = &*array as *const Array as usize;
            if let Some(existing) = self.seen.get(&address) {
                return existing.clone();
            }
            let node = Value::array(Vec::with_capacity(array.len()));
            self.seen.insert(address, node.clone());
            let items: Vec<Value> = array.iter().map(|item| self.convert(item)).collect();
            if let Value::Array(shared) = &node {
                *shared.write().unwrap_or_else(PoisonError::into_inner) = items;
            }
            return node;
        }
        if let Some(map) = value.read_lock::<Map>() {
            let address = &*map as *const Map as usize;
            if let Some(existing) = self.seen.get(&address) {
                return existing.clone();
            }
            let node = Value::object(Object::new());
            self.seen.insert(address, node.clone());
            let entries: Object = map
                .iter()
                .map(|(key, item)| (key.to_string(), self.convert(item)))
                .collect();
            if let Value::Object(shared) = &node {
                *shared.write().unwrap_or_else(PoisonError::into_inner) = entries;
            }
            return node;
        }
        if let Some(blob) = value.read_lock::<Blob>() {
            return Value::array(blob.iter().map(|b| Value::Int(i64::from(*b))).collect());
        }
        Value::String(display(value))
    }
}

/// Text form of a script value; big integers print their digits.
pub fn display(value: &Dynamic) -> String {
    if value.is::<BigInt>() {
        value.clone_cast::<BigInt>().to_string()
    } else {
        value.to_string()
    }
}

/// Convert a script value into a bound SQL parameter. Arrays and maps are
/// stored as JSON documents.
pub fn to_sql(value: &Dynamic) -> Result<SqlValue, String> {
    if value.is_unit() {
        return Ok(SqlValue::Null);
    }
    if let Ok(b) = value.as_bool() {
        return Ok(SqlValue::Bool(b));
    }
    if let Ok(i) = value.as_int() {
        return Ok(SqlValue::Int(i));
    }
    if let Ok(f) = value.as_float() {
        return Ok(SqlValue::Float(f));
    }
    if value.is::<BigInt>() {
        return Ok(SqlValue::BigInt(value.clone_cast::<BigInt>()));
    }
    if let Some(blob) = value.read_lock::<Blob>() {
        return Ok(SqlValue::Bytes(blob.clone()));
    }
    if value.is_array() || value.is_map() {
        return serializer::serialize_value(&to_value(value))
            .map(SqlValue::Json)
            .map_err(|e| format!("Cannot store value as JSON: {e}"));
    }
    Ok(SqlValue::Text(display(value)))
}

/// Convert a result cell into a script value.
pub fn from_sql(value: &SqlValue) -> Dynamic {
    match value {
        SqlValue::Null => Dynamic::UNIT,
        SqlValue::Bool(b) => Dynamic::from(*b),
        SqlValue::Int(i) => Dynamic::from(*i),
        SqlValue::BigInt(b) => Dynamic::from(b.clone()),
        SqlValue::Float(f) => Dynamic::from(*f),
        SqlValue::Text(s) => Dynamic::from(s.clone()),
        SqlValue::Bytes(b) => Dynamic::from_blob(b.clone()),
        SqlValue::Json(text) => from_json_text(text),
    }
}

/// Parse JSON text into a script value, keeping the text if it does not
/// parse.
pub fn from_json_text(text: &str) -> Dynamic {
    match serde_json::from_str::<serde_json::Value>(text) {
        Ok(json) => from_json(json),
        Err(_) => Dynamic::from(text.to_string()),
    }
}

fn from_json(json: serde_json::Value) -> Dynamic {
    match json {
        serde_json::Value::Null => Dynamic::UNIT,
        serde_json::Value::Bool(b) => Dynamic::from(b),
        serde_json::Value::Number(n) => {
            if let Some(i) = n.as_i64() {
                Dynamic::from(i)
            } else if let Some(u) = n.as_u64() {
                Dynamic::from(BigInt::from(u))
            } else {
                Dynamic::from(n.as_f64().unwrap_or(f64::NAN))
            }
        }
        serde_json::Value::String(s) => Dynamic::from(s),
        serde_json::Value::Array(items) => {
            Dynamic::from_array(items.into_iter().map(from_json).collect())
        }
        serde_json::Value::Object(entries) => {
            let mut map = Map::new();
            for (key, item) in entries {
                map.insert(key.into(), from_json(item));
            }
            Dynamic::from_map(map)
        }
    }
}
