//! Runtime value graph for script return values.
//!
//! Arrays and objects are reference-counted and shared, so a [`Value`] can
//! describe what a dynamic runtime can produce: the same container reachable
//! from two places, or a container that (indirectly) contains itself. The
//! [`serializer`](crate::serializer) is responsible for turning such graphs
//! into finite JSON.

use std::sync::{Arc, RwLock};

use indexmap::IndexMap;
use num_bigint::BigInt;

/// Interior-mutable, reference-counted container cell.
pub type Shared<T> = Arc<RwLock<T>>;

/// Ordered string-keyed object body.
pub type Object = IndexMap<String, Value>;

#[derive(Debug, Clone)]
pub enum Value {
    Null,
    Bool(bool),
    Int(i64),
    /// Arbitrary-precision integer; serialized as its decimal string.
    BigInt(BigInt),
    Float(f64),
    String(String),
    Array(Shared<Vec<Value>>),
    Object(Shared<Object>),
}

impl Value {
    /// Wrap a vector into a fresh shared array node.
    pub fn array(items: Vec<Value>) -> Self {
        Self::Array(Arc::new(RwLock::new(items)))
    }

    /// Wrap a map into a fresh shared object node.
    pub fn object(entries: Object) -> Self {
        Self::Object(Arc::new(RwLock::new(entries)))
    }

    pub fn is_container(&self) -> bool {
        matches!(self, Self::Array(_) | Self::Object(_))
    }

    /// Pointer identity of a container node, `None` for scalars.
    pub fn identity(&self) -> Option<usize> {
        match self {
            Self::Array(cell) => Some(Arc::as_ptr(cell) as *const () as usize),
            Self::Object(cell) => Some(Arc::as_ptr(cell) as *const () as usize),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::String(s) => Some(s),
            _ => None,
        }
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Self::String(s.to_string())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Self::String(s)
    }
}

impl From<i64> for Value {
    fn from(i: i64) -> Self {
        Self::Int(i)
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Self::Bool(b)
    }
}

impl From<f64> for Value {
    fn from(f: f64) -> Self {
        Self::Float(f)
    }
}

impl From<BigInt> for Value {
    fn from(b: BigInt) -> Self {
        Self::BigInt(b)
    }
}
