//! Dynamically typed command and query arguments.
//!
//! Values arrive untyped from the front end and are read by handlers through
//! typed accessors, which fail with [`ArgumentError::TypeMismatch`] when the
//! stored value has a different type.

use std::collections::BTreeMap;
use std::fmt;

use thiserror::Error;

/// Argument access errors.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ArgumentError {
    #[error("argument not found: {0}")]
    NotFound(String),

    #[error("{found} value is not {expected}")]
    TypeMismatch {
        expected: &'static str,
        found: &'static str,
    },
}

/// A single argument or query result value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Value {
    Int(i64),
    Str(String),
    List(Vec<String>),
}

impl Value {
    fn kind(&self) -> &'static str {
        match self {
            Value::Int(_) => "an int",
            Value::Str(_) => "a string",
            Value::List(_) => "a string list",
        }
    }

    pub fn as_int(&self) -> Result<i64, ArgumentError> {
        match self {
            Value::Int(v) => Ok(*v),
            other => Err(other.mismatch("an int")),
        }
    }

    pub fn as_str(&self) -> Result<&str, ArgumentError> {
        match self {
            Value::Str(v) => Ok(v),
            other => Err(other.mismatch("a string")),
        }
    }

    pub fn as_list(&self) -> Result<&[String], ArgumentError> {
        match self {
            Value::List(v) => Ok(v),
            other => Err(other.mismatch("a string list")),
        }
    }

    fn mismatch(&self, expected: &'static str) -> ArgumentError {
        ArgumentError::TypeMismatch {
            expected,
            found: self.kind(),
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Int(v) => write!(f, "{v}"),
            Value::Str(v) => f.write_str(v),
            Value::List(v) => write!(f, "[{}]", v.join(" ")),
        }
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Value::Int(v)
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Value::Str(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::Str(v.to_string())
    }
}

impl From<Vec<String>> for Value {
    fn from(v: Vec<String>) -> Self {
        Value::List(v)
    }
}

/// Named arguments of a command or query. Immutable once built.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Arguments {
    values: BTreeMap<String, Value>,
}

impl Arguments {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder-style insert, replacing any previous value for `name`.
    pub fn with(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.values.insert(name.into(), value.into());
        self
    }

    pub fn get(&self, name: &str) -> Result<&Value, ArgumentError> {
        self.values
            .get(name)
            .ok_or_else(|| ArgumentError::NotFound(name.to_string()))
    }

    pub fn get_int(&self, name: &str) -> Result<i64, ArgumentError> {
        self.get(name)?.as_int()
    }

    pub fn get_str(&self, name: &str) -> Result<&str, ArgumentError> {
        self.get(name)?.as_str()
    }

    pub fn get_list(&self, name: &str) -> Result<&[String], ArgumentError> {
        self.get(name)?.as_list()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.values.contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

impl<K, V> FromIterator<(K, V)> for Arguments
where
    K: Into<String>,
    V: Into<Value>,
{
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        Self {
            values: iter
                .into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        }
    }
}
