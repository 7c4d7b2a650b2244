//! Dynamically typed values flowing between operations.

use std::any::Any;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use crate::error::Error;

/// A value produced or consumed by an operation.
///
/// Definitions carry a `primitive` tag describing what they expect; the value
/// itself is a tagged union over the primitive set, plus [`Value::Opaque`] for
/// implementation-specific payloads which never cross the descriptor boundary.
/// Implementations downcast opaque handles at their edge.
#[derive(Clone, Default)]
pub enum Value {
    #[default]
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
    List(Vec<Value>),
    Map(BTreeMap<String, Value>),
    Opaque(Arc<dyn Any + Send + Sync>),
}

impl Value {
    /// Wrap an implementation-specific payload.
    pub fn opaque<T: Any + Send + Sync>(value: T) -> Self {
        Value::Opaque(Arc::new(value))
    }

    /// Truthiness, used by condition gating. Empty containers, empty strings,
    /// zero, `false`, and `Null` are falsy. Opaque handles are truthy.
    pub fn is_truthy(&self) -> bool {
        match self {
            Value::Null => false,
            Value::Bool(b) => *b,
            Value::Int(i) => *i != 0,
            Value::Float(f) => *f != 0.0,
            Value::Str(s) => !s.is_empty(),
            Value::List(l) => !l.is_empty(),
            Value::Map(m) => !m.is_empty(),
            Value::Opaque(_) => true,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Str(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_list(&self) -> Option<&[Value]> {
        match self {
            Value::List(l) => Some(l),
            _ => None,
        }
    }

    pub fn as_map(&self) -> Option<&BTreeMap<String, Value>> {
        match self {
            Value::Map(m) => Some(m),
            _ => None,
        }
    }

    /// Downcast an opaque handle to its concrete type.
    pub fn downcast_ref<T: Any + Send + Sync>(&self) -> Option<&T> {
        match self {
            Value::Opaque(any) => any.downcast_ref(),
            _ => None,
        }
    }

    /// Convert to a JSON value for the descriptor boundary. Opaque handles
    /// have no wire form and refuse to export.
    pub fn to_json(&self) -> Result<serde_json::Value, Error> {
        Ok(match self {
            Value::Null => serde_json::Value::Null,
            Value::Bool(b) => serde_json::Value::Bool(*b),
            Value::Int(i) => serde_json::Value::from(*i),
            Value::Float(f) => serde_json::Number::from_f64(*f)
                .map(serde_json::Value::Number)
                .ok_or_else(|| Error::Export(format!("non-finite float {f}")))?,
            Value::Str(s) => serde_json::Value::String(s.clone()),
            Value::List(l) => serde_json::Value::Array(
                l.iter().map(Value::to_json).collect::<Result<_, _>>()?,
            ),
            Value::Map(m) => serde_json::Value::Object(
                m.iter()
                    .map(|(k, v)| Ok((k.clone(), v.to_json()?)))
                    .collect::<Result<_, Error>>()?,
            ),
            Value::Opaque(_) => {
                return Err(Error::Export("opaque values have no wire form".into()));
            }
        })
    }

    /// Convert from a JSON value at the descriptor boundary. Integral numbers
    /// become [`Value::Int`], everything else numeric becomes [`Value::Float`].
    pub fn from_json(json: serde_json::Value) -> Self {
        match json {
            serde_json::Value::Null => Value::Null,
            serde_json::Value::Bool(b) => Value::Bool(b),
            serde_json::Value::Number(n) => match n.as_i64() {
                Some(i) => Value::Int(i),
                None => Value::Float(n.as_f64().unwrap_or(f64::NAN)),
            },
            serde_json::Value::String(s) => Value::Str(s),
            serde_json::Value::Array(a) => {
                Value::List(a.into_iter().map(Value::from_json).collect())
            }
            serde_json::Value::Object(o) => Value::Map(
                o.into_iter().map(|(k, v)| (k, Value::from_json(v))).collect(),
            ),
        }
    }
}

impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Value::Null, Value::Null) => true,
            (Value::Bool(a), Value::Bool(b)) => a == b,
            (Value::Int(a), Value::Int(b)) => a == b,
            (Value::Float(a), Value::Float(b)) => a == b,
            (Value::Str(a), Value::Str(b)) => a == b,
            (Value::List(a), Value::List(b)) => a == b,
            (Value::Map(a), Value::Map(b)) => a == b,
            // Opaque handles compare by identity.
            (Value::Opaque(a), Value::Opaque(b)) => Arc::ptr_eq(a, b),
            _ => false,
        }
    }
}

impl fmt::Debug for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Null => f.write_str("Null"),
            Value::Bool(b) => write!(f, "Bool({b})"),
            Value::Int(i) => write!(f, "Int({i})"),
            Value::Float(x) => write!(f, "Float({x})"),
            Value::Str(s) => write!(f, "Str({s:?})"),
            Value::List(l) => f.debug_tuple("List").field(l).finish(),
            Value::Map(m) => f.debug_tuple("Map").field(m).finish(),
            Value::Opaque(_) => f.write_str("Opaque(..)"),
        }
    }
}

impl From<bool> for Value {
    fn from(value: bool) -> Self {
        Value::Bool(value)
    }
}
impl From<i64> for Value {
    fn from(value: i64) -> Self {
        Value::Int(value)
    }
}
impl From<f64> for Value {
    fn from(value: f64) -> Self {
        Value::Float(value)
    }
}
impl From<&str> for Value {
    fn from(value: &str) -> Self {
        Value::Str(value.to_owned())
    }
}
impl From<String> for Value {
    fn from(value: String) -> Self {
        Value::Str(value)
    }
}
impl<T: Into<Value>> From<Vec<T>> for Value {
    fn from(value: Vec<T>) -> Self {
        Value::List(value.into_iter().map(Into::into).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn truthiness() {
        assert!(!Value::Null.is_truthy());
        assert!(!Value::from(false).is_truthy());
        assert!(!Value::from(0_i64).is_truthy());
        assert!(!Value::from("").is_truthy());
        assert!(!Value::List(vec![]).is_truthy());
        assert!(Value::from(true).is_truthy());
        assert!(Value::from("x").is_truthy());
        assert!(Value::opaque(()).is_truthy());
    }

    #[test]
    fn json_round_trip() {
        let value = Value::Map(
            [
                ("n".to_owned(), Value::Int(3)),
                ("s".to_owned(), Value::from("hi")),
                ("l".to_owned(), Value::from(vec![1_i64, 2])),
            ]
            .into_iter()
            .collect(),
        );
        let json = value.to_json().unwrap();
        assert_eq!(Value::from_json(json), value);
    }

    #[test]
    fn opaque_refuses_export() {
        assert!(Value::opaque(3_u8).to_json().is_err());
    }
}
