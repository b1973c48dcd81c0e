use std::time::{SystemTime, UNIX_EPOCH};

use bytes::Bytes;

use crate::proto::proto;
use crate::{Error, ProtocolError, Result};

/// Largest integer magnitude that survives a round trip through an IEEE-754
/// double without loss.
const MAX_SAFE_INTEGER: i64 = (1 << 53) - 1;

/// A SQL value passed to or returned from the server.
#[derive(Clone, Debug, PartialEq)]
pub enum Value {
    Null,
    Integer(i64),
    Real(f64),
    Text(String),
    Blob(Vec<u8>),
}

/// How 64-bit integers returned by the server are represented.
///
/// The mode is selected per stream and applies to all results decoded on
/// that stream.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Default)]
pub enum IntMode {
    /// Exact 64-bit integers; the default.
    #[default]
    Integer,
    /// IEEE-754 doubles. Decoding fails with a range error for values that
    /// do not fit into the 53-bit mantissa.
    Real,
    /// Decimal strings, for callers that pass integers through verbatim.
    Text,
}

impl Value {
    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    pub fn as_integer(&self) -> Option<i64> {
        match self {
            Value::Integer(value) => Some(*value),
            _ => None,
        }
    }

    pub fn as_real(&self) -> Option<f64> {
        match self {
            Value::Real(value) => Some(*value),
            _ => None,
        }
    }

    pub fn as_text(&self) -> Option<&str> {
        match self {
            Value::Text(value) => Some(value),
            _ => None,
        }
    }

    pub fn as_blob(&self) -> Option<&[u8]> {
        match self {
            Value::Blob(value) => Some(value),
            _ => None,
        }
    }
}

impl From<bool> for Value {
    fn from(value: bool) -> Value {
        Value::Integer(value as i64)
    }
}

impl From<i32> for Value {
    fn from(value: i32) -> Value {
        Value::Integer(value as i64)
    }
}

impl From<u32> for Value {
    fn from(value: u32) -> Value {
        Value::Integer(value as i64)
    }
}

impl From<i64> for Value {
    fn from(value: i64) -> Value {
        Value::Integer(value)
    }
}

impl TryFrom<u64> for Value {
    type Error = Error;

    fn try_from(value: u64) -> Result<Value> {
        let value = i64::try_from(value)
            .map_err(|_| Error::Range(format!("integer {value} does not fit into 64 bits")))?;
        Ok(Value::Integer(value))
    }
}

impl From<f64> for Value {
    fn from(value: f64) -> Value {
        Value::Real(value)
    }
}

impl From<&str> for Value {
    fn from(value: &str) -> Value {
        Value::Text(value.into())
    }
}

impl From<String> for Value {
    fn from(value: String) -> Value {
        Value::Text(value)
    }
}

impl From<&[u8]> for Value {
    fn from(value: &[u8]) -> Value {
        Value::Blob(value.to_vec())
    }
}

impl From<Vec<u8>> for Value {
    fn from(value: Vec<u8>) -> Value {
        Value::Blob(value)
    }
}

impl From<SystemTime> for Value {
    fn from(value: SystemTime) -> Value {
        let millis = match value.duration_since(UNIX_EPOCH) {
            Ok(duration) => duration.as_secs_f64() * 1000.0,
            Err(err) => -err.duration().as_secs_f64() * 1000.0,
        };
        Value::Real(millis)
    }
}

impl<T: Into<Value>> From<Option<T>> for Value {
    fn from(value: Option<T>) -> Value {
        match value {
            Some(value) => value.into(),
            None => Value::Null,
        }
    }
}

impl Value {
    /// Coerces any printable value into a text value.
    pub fn from_display(value: impl std::fmt::Display) -> Value {
        Value::Text(value.to_string())
    }
}

/// Converts a value into its wire form. Non-finite floats are rejected
/// here, before anything is sent to the server.
pub(crate) fn into_proto(value: Value) -> Result<proto::Value> {
    Ok(match value {
        Value::Null => proto::Value::Null,
        Value::Integer(value) => proto::Value::Integer { value },
        Value::Real(value) => {
            if !value.is_finite() {
                return Err(Error::Range(format!(
                    "float {value} cannot be sent to the server"
                )));
            }
            proto::Value::Float { value }
        }
        Value::Text(value) => proto::Value::Text {
            value: value.into(),
        },
        Value::Blob(value) => proto::Value::Blob {
            value: Bytes::from(value),
        },
    })
}

/// Converts a wire value into its client form, applying the stream's
/// integer mode.
pub(crate) fn from_proto(value: proto::Value, int_mode: IntMode) -> Result<Value> {
    Ok(match value {
        proto::Value::None => return Err(ProtocolError::NoneValue.into()),
        proto::Value::Null => Value::Null,
        proto::Value::Integer { value } => match int_mode {
            IntMode::Integer => Value::Integer(value),
            IntMode::Real => {
                if !(-MAX_SAFE_INTEGER..=MAX_SAFE_INTEGER).contains(&value) {
                    return Err(Error::Range(format!(
                        "integer {value} cannot be represented as a double"
                    )));
                }
                Value::Real(value as f64)
            }
            IntMode::Text => Value::Text(value.to_string()),
        },
        proto::Value::Float { value } => Value::Real(value),
        proto::Value::Text { value } => Value::Text(value.to_string()),
        proto::Value::Blob { value } => Value::Blob(value.to_vec()),
    })
}

/// Conversion from a [`Value`] into a concrete Rust type, used by the typed
/// row getters.
pub trait FromValue: Sized {
    fn from_value(value: Value) -> Result<Self>;
}

impl FromValue for Value {
    fn from_value(value: Value) -> Result<Self> {
        Ok(value)
    }
}

impl FromValue for i64 {
    fn from_value(value: Value) -> Result<Self> {
        match value {
            Value::Integer(value) => Ok(value),
            other => Err(type_mismatch("integer", &other)),
        }
    }
}

impl FromValue for f64 {
    fn from_value(value: Value) -> Result<Self> {
        match value {
            Value::Real(value) => Ok(value),
            Value::Integer(value) => Ok(value as f64),
            other => Err(type_mismatch("float", &other)),
        }
    }
}

impl FromValue for String {
    fn from_value(value: Value) -> Result<Self> {
        match value {
            Value::Text(value) => Ok(value),
            other => Err(type_mismatch("text", &other)),
        }
    }
}

impl FromValue for Vec<u8> {
    fn from_value(value: Value) -> Result<Self> {
        match value {
            Value::Blob(value) => Ok(value),
            other => Err(type_mismatch("blob", &other)),
        }
    }
}

impl FromValue for bool {
    fn from_value(value: Value) -> Result<Self> {
        match value {
            Value::Integer(value) => Ok(value != 0),
            other => Err(type_mismatch("integer", &other)),
        }
    }
}

impl<T: FromValue> FromValue for Option<T> {
    fn from_value(value: Value) -> Result<Self> {
        match value {
            Value::Null => Ok(None),
            other => T::from_value(other).map(Some),
        }
    }
}

fn type_mismatch(expected: &str, got: &Value) -> Error {
    Error::Misuse(format!("expected a {expected} value, got {got:?}"))
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn int_modes() {
        let wire = proto::Value::Integer { value: 42 };
        assert_eq!(
            from_proto(wire.clone(), IntMode::Integer).unwrap(),
            Value::Integer(42)
        );
        assert_eq!(
            from_proto(wire.clone(), IntMode::Real).unwrap(),
            Value::Real(42.0)
        );
        assert_eq!(
            from_proto(wire, IntMode::Text).unwrap(),
            Value::Text("42".into())
        );
    }

    #[test]
    fn real_mode_range_check() {
        let max_safe = proto::Value::Integer {
            value: MAX_SAFE_INTEGER,
        };
        assert_eq!(
            from_proto(max_safe, IntMode::Real).unwrap(),
            Value::Real(9007199254740991.0)
        );

        let too_big = proto::Value::Integer {
            value: MAX_SAFE_INTEGER + 1,
        };
        assert!(matches!(
            from_proto(too_big, IntMode::Real),
            Err(Error::Range(_))
        ));

        let max = proto::Value::Integer { value: i64::MAX };
        assert!(matches!(from_proto(max, IntMode::Real), Err(Error::Range(_))));
        let max = proto::Value::Integer { value: i64::MAX };
        assert_eq!(
            from_proto(max, IntMode::Integer).unwrap(),
            Value::Integer(i64::MAX)
        );
    }

    #[test]
    fn non_finite_floats_are_rejected() {
        assert!(matches!(
            into_proto(Value::Real(f64::NAN)),
            Err(Error::Range(_))
        ));
        assert!(matches!(
            into_proto(Value::Real(f64::INFINITY)),
            Err(Error::Range(_))
        ));
        assert!(into_proto(Value::Real(1.5)).is_ok());
    }

    #[test]
    fn input_coercions() {
        assert_eq!(Value::from(true), Value::Integer(1));
        assert_eq!(Value::from(false), Value::Integer(0));
        assert_eq!(Value::from(&b"ab"[..]), Value::Blob(vec![b'a', b'b']));
        assert_eq!(Value::from(None::<i64>), Value::Null);
        assert!(Value::try_from(u64::MAX).is_err());
        assert_eq!(
            Value::try_from(42u64).unwrap(),
            Value::Integer(42)
        );

        let epoch_plus_second = UNIX_EPOCH + std::time::Duration::from_secs(1);
        assert_eq!(Value::from(epoch_plus_second), Value::Real(1000.0));
    }

    #[test]
    fn unknown_wire_value_is_rejected() {
        assert!(matches!(
            from_proto(proto::Value::None, IntMode::Integer),
            Err(Error::Protocol(ProtocolError::NoneValue))
        ));
    }
}
