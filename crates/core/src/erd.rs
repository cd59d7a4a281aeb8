//! Entity-relationship diagram synthesis.
//!
//! Builds a Mermaid `erDiagram` from schema source and packs it in the
//! `pako:` form understood by the Mermaid live editor: a JSON editor state,
//! zlib-compressed, URL-safe base64 without padding. Synthesis never fails;
//! an unparsable schema yields an empty string.

use std::fmt::Write as _;
use std::io::{Read, Write};

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use flate2::read::ZlibDecoder;
use flate2::write::ZlibEncoder;
use flate2::Compression;

use crate::error::{CoreError, CoreResult};
use crate::schema::{Arity, Field, FieldType, Model, Schema};

const PAKO_PREFIX: &str = "pako:";

/// Parse `schema_source` and return the encoded diagram, or `""`.
pub fn synthesize(schema_source: &str) -> String {
    let Ok(schema) = Schema::parse(schema_source) else {
        return String::new();
    };
    encode(&render_mermaid(&schema)).unwrap_or_default()
}

/// Render the Mermaid source for a parsed schema.
pub fn render_mermaid(schema: &Schema) -> String {
    let mut out = String::from("erDiagram\n");

    for model in &schema.models {
        let foreign_keys = foreign_key_fields(model);
        let _ = writeln!(out, "  {} {{", entity_name(&model.name));
        for field in model.columns() {
            let mut keys = Vec::new();
            if field.is_id || model.compound_id.contains(&field.name) {
                keys.push("PK");
            }
            if foreign_keys.contains(&field.name.as_str()) {
                keys.push("FK");
            }
            if field.is_unique {
                keys.push("UK");
            }
            let ty = match field.arity {
                Arity::List => format!("{}[]", field.type_name()),
                _ => field.type_name().to_string(),
            };
            let _ = write!(out, "    {ty} {}", field.name);
            if !keys.is_empty() {
                let _ = write!(out, " {}", keys.join(", "));
            }
            if field.is_optional() {
                out.push_str(" \"nullable\"");
            }
            out.push('\n');
        }
        out.push_str("  }\n");
    }

    for model in &schema.models {
        for field in &model.fields {
            let (FieldType::Model(target), Some(relation)) = (&field.ty, &field.relation) else {
                continue;
            };
            if relation.fields.is_empty() {
                continue;
            }
            let parent = if field.is_optional() { "|o" } else { "||" };
            let child = if fk_is_unique(model, &relation.fields) { "o|" } else { "o{" };
            let _ = writeln!(
                out,
                "  {} {parent}--{child} {} : \"{}\"",
                entity_name(target),
                entity_name(&model.name),
                field.name
            );
        }
    }
    out
}

/// Compress a diagram into the `pako:` transport form.
pub fn encode(diagram: &str) -> CoreResult<String> {
    let state = serde_json::json!({
        "code": diagram,
        "mermaid": { "theme": "default" },
    });
    let mut encoder = ZlibEncoder::new(Vec::new(), Compression::best());
    encoder
        .write_all(state.to_string().as_bytes())
        .map_err(|e| CoreError::Encoding(e.to_string()))?;
    let compressed = encoder
        .finish()
        .map_err(|e| CoreError::Encoding(e.to_string()))?;
    Ok(format!("{PAKO_PREFIX}{}", URL_SAFE_NO_PAD.encode(compressed)))
}

/// Recover the Mermaid source from an encoded diagram.
pub fn decode(encoded: &str) -> CoreResult<String> {
    let payload = encoded.strip_prefix(PAKO_PREFIX).unwrap_or(encoded);
    let compressed = URL_SAFE_NO_PAD
        .decode(payload)
        .map_err(|e| CoreError::Encoding(e.to_string()))?;
    let mut json = String::new();
    ZlibDecoder::new(compressed.as_slice())
        .read_to_string(&mut json)
        .map_err(|e| CoreError::Encoding(e.to_string()))?;
    let state: serde_json::Value =
        serde_json::from_str(&json).map_err(|e| CoreError::Encoding(e.to_string()))?;
    state["code"]
        .as_str()
        .map(str::to_string)
        .ok_or_else(|| CoreError::Encoding("missing diagram code".into()))
}

fn foreign_key_fields(model: &Model) -> Vec<&str> {
    model
        .fields
        .iter()
        .filter_map(|f| f.relation.as_ref())
        .flat_map(|r| r.fields.iter().map(String::as_str))
        .collect()
}

fn fk_is_unique(model: &Model, fk: &[String]) -> bool {
    if let [single] = fk {
        if model.field(single).is_some_and(|f: &Field| f.is_unique || f.is_id) {
            return true;
        }
    }
    model.unique_sets.iter().any(|set| set.as_slice() == fk)
}

fn entity_name(name: &str) -> String {
    name.chars()
        .map(|c| if c.is_alphanumeric() || c == '_' { c } else { '_' })
        .collect()
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
