//! Resilient, never-failing serialization of an [`ExecutionResult`].
//!
//! [`serialize_result`] walks the result with a custom value transform:
//! arbitrary-precision integers become decimal strings, non-finite floats
//! become `null`, and any container reached a second time (keyed by pointer
//! identity) is replaced with [`CIRCULAR`]. If serialization still fails, a
//! minimal fallback artifact built only from strings and empty collections
//! is returned instead.

use std::cell::RefCell;
use std::collections::HashSet;

use serde::ser::{Error as _, SerializeMap, SerializeSeq};
use serde::{Serialize, Serializer};

use crate::result::ExecutionResult;
use crate::value::Value;

/// Sentinel written in place of a repeated reference.
pub const CIRCULAR: &str = "[Circular]";

/// Nesting depth beyond which serialization gives up.
pub const MAX_DEPTH: usize = 128;

/// Written by the outermost guard when nothing else could be produced.
pub const LAST_RESORT_ARTIFACT: &str = r#"{"output":"","queries":[],"erd":"","error":"The harness failed before it could produce a result"}"#;

/// Serialize a job result to a single line of JSON. Never fails.
pub fn serialize_result(result: &ExecutionResult) -> String {
    match try_serialize_result(result) {
        Ok(text) => text,
        Err(e) => fallback_artifact(&result.output, &e.to_string()),
    }
}

/// Strict variant of [`serialize_result`] that reports the failure.
pub fn try_serialize_result(result: &ExecutionResult) -> Result<String, serde_json::Error> {
    let state = WalkState::default();
    serde_json::to_string(&ResultView {
        result,
        state: &state,
    })
}

/// Serialize a standalone value with the same cycle and big-integer rules.
pub fn serialize_value(value: &Value) -> Result<String, serde_json::Error> {
    let state = WalkState::default();
    serde_json::to_string(&Node {
        value,
        state: &state,
        depth: 0,
    })
}

/// Build the minimal artifact used when the full result cannot be encoded.
pub fn fallback_artifact(output: &str, message: &str) -> String {
    serde_json::json!({
        "output": output,
        "queries": [],
        "error": format!("Failed to serialize result: {message}"),
    })
    .to_string()
}

#[derive(Default)]
struct WalkState {
    seen: RefCell<HashSet<usize>>,
}

impl WalkState {
    /// Returns `true` the first time an identity is visited.
    fn first_visit(&self, identity: usize) -> bool {
        self.seen.borrow_mut().insert(identity)
    }
}

struct ResultView<'a> {
    result: &'a ExecutionResult,
    state: &'a WalkState,
}

impl Serialize for ResultView<'_> {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let r = self.result;
        let mut map = serializer.serialize_map(None)?;
        map.serialize_entry("output", &r.output)?;
        map.serialize_entry("queries", &r.queries)?;
        map.serialize_entry("erd", &r.erd)?;
        if let Some(returned) = &r.returned {
            map.serialize_entry(
                "returned",
                &Node {
                    value: returned,
                    state: self.state,
                    depth: 0,
                },
            )?;
        }
        if let Some(error) = &r.error {
            map.serialize_entry("error", error)?;
        }
        if let Some(traceback) = &r.traceback {
            map.serialize_entry("traceback", traceback)?;
        }
        if let Some(schema_error) = &r.schema_error {
            map.serialize_entry("schema_error", schema_error)?;
        }
        map.end()
    }
}

struct Node<'a> {
    value: &'a Value,
    state: &'a WalkState,
    depth: usize,
}

impl<'a> Node<'a> {
    fn child(&self, value: &'a Value) -> Node<'a> {
        Node {
            value,
            state: self.state,
            depth: self.depth + 1,
        }
    }
}

impl Serialize for Node<'_> {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        if self.depth > MAX_DEPTH {
            return Err(S::Error::custom(format!(
                "value nested deeper than {MAX_DEPTH} levels"
            )));
        }

        if let Some(identity) = self.value.identity() {
            if !self.state.first_visit(identity) {
                return serializer.serialize_str(CIRCULAR);
            }
        }

        match self.value {
            Value::Null => serializer.serialize_unit(),
            Value::Bool(b) => serializer.serialize_bool(*b),
            Value::Int(i) => serializer.serialize_i64(*i),
            Value::BigInt(b) => serializer.serialize_str(&b.to_string()),
            Value::Float(f) if f.is_finite() => serializer.serialize_f64(*f),
            Value::Float(_) => serializer.serialize_unit(),
            Value::String(s) => serializer.serialize_str(s),
            Value::Array(cell) => {
                let items = cell
                    .read()
                    .map_err(|_| S::Error::custom("array lock poisoned"))?;
                let mut seq = serializer.serialize_seq(Some(items.len()))?;
                for item in items.iter() {
                    seq.serialize_element(&self.child(item))?;
                }
                seq.end()
            }
            Value::Object(cell) => {
                let entries = cell
                    .read()
                    .map_err(|_| S::Error::custom("object lock poisoned"))?;
                let mut map = serializer.serialize_map(Some(entries.len()))?;
                for (key, item) in entries.iter() {
                    map.serialize_entry(key, &self.child(item))?;
                }
                map.end()
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use num_bigint::BigInt;

    use super::*;
    use crate::result::QueryRecord;
    use crate::value::Object;

    fn parse(text: &str) -> serde_json::Value {
        serde_json::from_str(text).expect("artifact must be valid JSON")
    }

    #[test]
    fn cyclic_object_serializes_with_sentinel() {
        let node = Value::object(Object::new());
        if let Value::Object(cell) = &node {
            let mut entries = cell.write().unwrap();
            entries.insert("name".into(), Value::from("loop"));
            entries.insert("me".into(), node.clone());
        }

        let mut result = ExecutionResult::new();
        result.returned = Some(node);
        let text = serialize_result(&result);

        assert!(text.contains("\"[Circular]\""));
        let json = parse(&text);
        assert_eq!(json["returned"]["name"], "loop");
        assert_eq!(json["returned"]["me"], CIRCULAR);
        assert!(json.get("error").is_none());
    }

    #[test]
    fn cycle_through_array_is_broken() {
        let list = Value::array(vec![]);
        if let Value::Array(cell) = &list {
            cell.write().unwrap().push(list.clone());
        }
        let text = serialize_value(&list).unwrap();
        assert_eq!(text, r#"["[Circular]"]"#);
    }

    #[test]
    fn bigint_keeps_exact_digits() {
        let big: BigInt = "123456789012345678901234567890".parse().unwrap();
        let mut entries = Object::new();
        entries.insert("total".into(), Value::BigInt(big));

        let mut result = ExecutionResult::new();
        result.returned = Some(Value::object(entries));
        let json = parse(&serialize_result(&result));

        assert_eq!(json["returned"]["total"], "123456789012345678901234567890");
    }

    #[test]
    fn non_finite_float_becomes_null() {
        let text = serialize_value(&Value::array(vec![
            Value::Float(f64::NAN),
            Value::Float(1.5),
        ]))
        .unwrap();
        assert_eq!(text, "[null,1.5]");
    }

    #[test]
    fn optional_fields_are_omitted() {
        let mut result = ExecutionResult::new();
        result.output = "hello".into();
        result.queries.push(QueryRecord {
            sql: "SELECT 1".into(),
            template: "SELECT ?".into(),
            time: 0.0,
            line_number: Some(2),
            source_context: Some("db.query(\"SELECT 1\");".into()),
        });

        let json = parse(&serialize_result(&result));
        assert_eq!(json["output"], "hello");
        assert_eq!(json["queries"][0]["line_number"], 2);
        assert!(json.get("returned").is_none());
        assert!(json.get("error").is_none());
        assert!(json.get("traceback").is_none());
        assert!(json.get("schema_error").is_none());
    }

    #[test]
    fn excessive_depth_falls_back() {
        let mut value = Value::Int(0);
        for _ in 0..(MAX_DEPTH + 10) {
            value = Value::array(vec![value]);
        }
        let mut result = ExecutionResult::new();
        result.output = "partial".into();
        result.returned = Some(value);

        let json = parse(&serialize_result(&result));
        assert_eq!(json["output"], "partial");
        assert_eq!(json["queries"], serde_json::json!([]));
        let error = json["error"].as_str().unwrap();
        assert!(error.starts_with("Failed to serialize result:"), "{error}");
    }

    #[test]
    fn poisoned_lock_falls_back() {
        let node = Value::array(vec![Value::Int(1)]);
        if let Value::Array(cell) = &node {
            let cell = Arc::clone(cell);
            let _ = std::thread::spawn(move || {
                let _guard = cell.write().unwrap();
                panic!("poison the lock");
            })
            .join();
        }
        let mut result = ExecutionResult::new();
        result.returned = Some(node);

        assert!(try_serialize_result(&result).is_err());
        let json = parse(&serialize_result(&result));
        assert!(json["error"].as_str().unwrap().contains("poisoned"));
    }

    #[test]
    fn last_resort_artifact_is_valid_json() {
        let json = parse(LAST_RESORT_ARTIFACT);
        assert_eq!(json["queries"], serde_json::json!([]));
        assert!(json["error"].is_string());
    }
}
