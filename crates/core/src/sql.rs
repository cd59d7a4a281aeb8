//! SQL text helpers shared by the database bindings and the script API.
//!
//! Statements are built with dialect placeholders (`?` for SQLite, `$n` for
//! PostgreSQL). [`render`] inlines bound parameters as SQL literals to
//! produce the text reported for a query, and [`generalize`] does the
//! reverse for hand-written statements, replacing literal values with `?`
//! so near-duplicate queries group together.

use std::fmt;
use std::sync::LazyLock;

use num_bigint::BigInt;
use regex::Regex;

/// SQL dialect spoken by a database binding.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dialect {
    Sqlite,
    Postgres,
}

impl Dialect {
    /// Placeholder for the 1-based parameter `index`.
    pub fn placeholder(self, index: usize) -> String {
        match self {
            Self::Sqlite => "?".to_string(),
            Self::Postgres => format!("${index}"),
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            Self::Sqlite => "sqlite",
            Self::Postgres => "postgres",
        }
    }
}

impl fmt::Display for Dialect {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// A bound parameter or a decoded result cell.
#[derive(Debug, Clone, PartialEq)]
pub enum SqlValue {
    Null,
    Bool(bool),
    Int(i64),
    BigInt(BigInt),
    Float(f64),
    Text(String),
    Bytes(Vec<u8>),
    /// JSON document text.
    Json(String),
}

impl SqlValue {
    /// Render as a SQL literal for display.
    pub fn to_literal(&self) -> String {
        match self {
            Self::Null => "NULL".to_string(),
            Self::Bool(true) => "TRUE".to_string(),
            Self::Bool(false) => "FALSE".to_string(),
            Self::Int(i) => i.to_string(),
            Self::BigInt(b) => b.to_string(),
            Self::Float(f) if f.is_finite() => f.to_string(),
            Self::Float(_) => "NULL".to_string(),
            Self::Text(s) | Self::Json(s) => quote_literal(s),
            Self::Bytes(b) => {
                let hex: String = b.iter().map(|byte| format!("{byte:02x}")).collect();
                format!("X'{hex}'")
            }
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Self::Null)
    }
}

/// Quote an identifier with double quotes, doubling embedded quotes.
pub fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

/// Quote a string literal with single quotes, doubling embedded quotes.
pub fn quote_literal(value: &str) -> String {
    format!("'{}'", value.replace('\'', "''"))
}

/// Inline `params` into `template`, replacing placeholders outside quoted
/// regions. Placeholders without a matching parameter are left as-is.
pub fn render(template: &str, params: &[SqlValue], dialect: Dialect) -> String {
    if params.is_empty() {
        return template.to_string();
    }

    let chars: Vec<char> = template.chars().collect();
    let mut out = String::with_capacity(template.len() + params.len() * 8);
    let mut next_positional = 0usize;
    let mut quote: Option<char> = None;
    let mut i = 0;

    while i < chars.len() {
        let c = chars[i];
        if let Some(q) = quote {
            out.push(c);
            if c == q {
                quote = None;
            }
            i += 1;
            continue;
        }
        match c {
            '\'' | '"' => {
                quote = Some(c);
                out.push(c);
                i += 1;
            }
            '?' if dialect == Dialect::Sqlite => {
                let (digits, end) = digits_after(&chars, i + 1);
                let index = match digits.parse::<usize>() {
                    Ok(n) => n.checked_sub(1),
                    Err(_) => {
                        next_positional += 1;
                        Some(next_positional - 1)
                    }
                };
                match index.and_then(|idx| params.get(idx)) {
                    Some(p) => out.push_str(&p.to_literal()),
                    None => out.extend(&chars[i..end]),
                }
                i = end;
            }
            '$' if dialect == Dialect::Postgres => {
                let (digits, end) = digits_after(&chars, i + 1);
                match digits.parse::<usize>().ok().and_then(|n| n.checked_sub(1)) {
                    Some(index) if index < params.len() => {
                        out.push_str(&params[index].to_literal());
                        i = end;
                    }
                    _ => {
                        out.push(c);
                        i += 1;
                    }
                }
            }
            _ => {
                out.push(c);
                i += 1;
            }
        }
    }
    out
}

fn digits_after(chars: &[char], start: usize) -> (String, usize) {
    let mut end = start;
    while end < chars.len() && chars[end].is_ascii_digit() {
        end += 1;
    }
    (chars[start..end].iter().collect(), end)
}

static LITERAL_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r#"(?x)
        (?P<string>'(?:[^']|'')*')
      | (?P<ident>"(?:[^"]|"")*")
      | (?P<word>[A-Za-z_][A-Za-z0-9_$]*)
      | (?P<param>\$[0-9]+|\?[0-9]*)
      | (?P<number>\b[0-9]+(?:\.[0-9]+)?(?:[eE][+-]?[0-9]+)?\b)
    "#,
    )
    .expect("literal pattern is valid")
});

/// Replace string and numeric literals with `?`.
///
/// Quoted identifiers, keywords, identifiers containing digits and existing
/// placeholders are preserved. A leading `-` is never part of the literal,
/// as it cannot be told apart from subtraction.
pub fn generalize(sql: &str) -> String {
    LITERAL_RE
        .replace_all(sql, |caps: &regex::Captures<'_>| {
            if caps.name("string").is_some() || caps.name("number").is_some() {
                "?".to_string()
            } else {
                caps[0].to_string()
            }
        })
        .into_owned()
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
