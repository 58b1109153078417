//! Value conversion between the JSON intermediate representation and host types
//!
//! Script values cross the engine boundary as JSON. [`FromScript`] is the
//! casting side: it turns a decoded [`Value`] into a concrete host type, with
//! numeric coercions and a descriptive error when the conversion is not
//! possible. [`IntoScript`] is the encoding side: it turns a host value back
//! into a JSON fragment for the engine.

use std::collections::HashMap;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::value::RawValue;
use serde_json::Value;

use crate::error::{Error, Result};

/// JSON type name of a value, used in cast diagnostics
pub(crate) fn kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

/// Conversion from a decoded script value to a host type.
///
/// The set of implementations is the set of acceptable bound-function
/// parameter types; an unsupported parameter type fails to compile.
pub trait FromScript: Sized {
    /// Cast `value` to `Self`, or fail with a `cannot cast A to B` error.
    fn from_value(value: Value) -> Result<Self>;
}

macro_rules! int_from_script {
    ($($t:ty),* $(,)?) => {$(
        impl FromScript for $t {
            fn from_value(value: Value) -> Result<Self> {
                let Value::Number(number) = &value else {
                    return Err(Error::Cast { from: kind(&value), to: stringify!($t) });
                };
                if let Some(signed) = number.as_i64() {
                    return <$t>::try_from(signed)
                        .map_err(|_| Error::Cast { from: "number", to: stringify!($t) });
                }
                if let Some(unsigned) = number.as_u64() {
                    return <$t>::try_from(unsigned)
                        .map_err(|_| Error::Cast { from: "number", to: stringify!($t) });
                }
                match number.as_f64() {
                    Some(float)
                        if float.is_finite()
                            && float.trunc() >= <$t>::MIN as f64
                            && float.trunc() <= <$t>::MAX as f64 =>
                    {
                        Ok(float.trunc() as $t)
                    }
                    _ => Err(Error::Cast { from: "number", to: stringify!($t) }),
                }
            }
        }
    )*};
}

int_from_script!(i8, i16, i32, i64, isize, u8, u16, u32, u64, usize);

impl FromScript for f64 {
    fn from_value(value: Value) -> Result<Self> {
        match &value {
            Value::Number(number) => number.as_f64().ok_or(Error::Cast {
                from: "number",
                to: "f64",
            }),
            _ => Err(Error::Cast {
                from: kind(&value),
                to: "f64",
            }),
        }
    }
}

impl FromScript for f32 {
    fn from_value(value: Value) -> Result<Self> {
        f64::from_value(value).map(|float| float as f32)
    }
}

impl FromScript for bool {
    fn from_value(value: Value) -> Result<Self> {
        match value {
            Value::Bool(flag) => Ok(flag),
            other => Err(Error::Cast {
                from: kind(&other),
                to: "bool",
            }),
        }
    }
}

impl FromScript for String {
    fn from_value(value: Value) -> Result<Self> {
        match value {
            Value::String(text) => Ok(text),
            other => Err(Error::Cast {
                from: kind(&other),
                to: "string",
            }),
        }
    }
}

impl FromScript for Value {
    fn from_value(value: Value) -> Result<Self> {
        Ok(value)
    }
}

impl<T: FromScript> FromScript for Vec<T> {
    fn from_value(value: Value) -> Result<Self> {
        match value {
            Value::Array(items) => items.into_iter().map(T::from_value).collect(),
            other => Err(Error::Cast {
                from: kind(&other),
                to: "array",
            }),
        }
    }
}

impl<T: FromScript> FromScript for HashMap<String, T> {
    fn from_value(value: Value) -> Result<Self> {
        match value {
            Value::Object(entries) => entries
                .into_iter()
                .map(|(key, item)| Ok((key, T::from_value(item)?)))
                .collect(),
            other => Err(Error::Cast {
                from: kind(&other),
                to: "object",
            }),
        }
    }
}

impl<T: FromScript> FromScript for Option<T> {
    fn from_value(value: Value) -> Result<Self> {
        match value {
            Value::Null => Ok(None),
            other => T::from_value(other).map(Some),
        }
    }
}

/// Conversion from a host value to its JSON encoding
pub trait IntoScript {
    /// Encode `self` as a JSON fragment.
    fn encode(self) -> Result<String>;
}

macro_rules! serde_into_script {
    ($($t:ty),* $(,)?) => {$(
        impl IntoScript for $t {
            fn encode(self) -> Result<String> {
                Ok(serde_json::to_string(&self)?)
            }
        }
    )*};
}

serde_into_script!(
    bool, i8, i16, i32, i64, isize, u8, u16, u32, u64, usize, f32, f64, String
);

impl IntoScript for &str {
    fn encode(self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }
}

impl IntoScript for Value {
    fn encode(self) -> Result<String> {
        Ok(self.to_string())
    }
}

impl<T: Serialize> IntoScript for Vec<T> {
    fn encode(self) -> Result<String> {
        Ok(serde_json::to_string(&self)?)
    }
}

impl<T: Serialize> IntoScript for HashMap<String, T> {
    fn encode(self) -> Result<String> {
        Ok(serde_json::to_string(&self)?)
    }
}

impl<T: IntoScript> IntoScript for Option<T> {
    fn encode(self) -> Result<String> {
        match self {
            Some(inner) => inner.encode(),
            None => Ok("null".to_string()),
        }
    }
}

/// Raw passthrough JSON.
///
/// As a bound function's return type the contained text is inserted into the
/// outgoing JSON verbatim, with no further encoding. As an eval target it
/// receives the exact JSON text of the evaluated result.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Raw(pub String);

impl IntoScript for Raw {
    fn encode(self) -> Result<String> {
        Ok(self.0)
    }
}

impl<'de> Deserialize<'de> for Raw {
    fn deserialize<D>(deserializer: D) -> std::result::Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let raw = Box::<RawValue>::deserialize(deserializer)?;
        Ok(Raw(raw.get().to_string()))
    }
}

impl From<&str> for Raw {
    fn from(text: &str) -> Self {
        Raw(text.to_string())
    }
}

impl std::fmt::Display for Raw {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Serde bridge for structured arguments and returns.
///
/// Wraps any `Serialize`/`DeserializeOwned` type so script objects can flow
/// into and out of bound functions as whole structs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Json<T>(pub T);

impl<T: DeserializeOwned> FromScript for Json<T> {
    fn from_value(value: Value) -> Result<Self> {
        let found = kind(&value);
        serde_json::from_value(value).map(Json).map_err(|_| Error::Cast {
            from: found,
            to: std::any::type_name::<T>(),
        })
    }
}

impl<T: Serialize> IntoScript for Json<T> {
    fn encode(self) -> Result<String> {
        Ok(serde_json::to_string(&self.0)?)
    }
}

/// Marker for a variadic tail parameter.
///
/// When used as the last parameter of a bound function, every trailing script
/// argument is cast to `T` and collected here.
#[derive(Debug, Clone, Default)]
pub struct Variadic<T>(pub Vec<T>);

impl<T> std::ops::Deref for Variadic<T> {
    type Target = Vec<T>;

    fn deref(&self) -> &Vec<T> {
        &self.0
    }
}

impl<T> std::ops::DerefMut for Variadic<T> {
    fn deref_mut(&mut self) -> &mut Vec<T> {
        &mut self.0
    }
}

impl<T> IntoIterator for Variadic<T> {
    type Item = T;
    type IntoIter = std::vec::IntoIter<T>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.into_iter()
    }
}

impl<T> FromIterator<T> for Variadic<T> {
    fn from_iter<I: IntoIterator<Item = T>>(iter: I) -> Self {
        Variadic(iter.into_iter().collect())
    }
}

/// Cast `incoming` so it matches the JSON kind of `current`.
///
/// Used by property sets: the current field value fixes the target kind.
/// `Null` currents accept anything, numbers keep their integer/float shape.
pub(crate) fn cast_to_kind(incoming: Value, current: &Value) -> Result<Value> {
    match current {
        Value::Null => Ok(incoming),
        Value::Bool(_) => bool::from_value(incoming).map(Value::Bool),
        Value::Number(number) if number.is_f64() => {
            f64::from_value(incoming).map(|float| serde_json::json!(float))
        }
        Value::Number(_) => i64::from_value(incoming).map(Value::from),
        Value::String(_) => String::from_value(incoming).map(Value::String),
        Value::Array(_) => match incoming {
            Value::Array(items) => Ok(Value::Array(items)),
            other => Err(Error::Cast {
                from: kind(&other),
                to: "array",
            }),
        },
        Value::Object(_) => match incoming {
            Value::Object(entries) => Ok(Value::Object(entries)),
            other => Err(Error::Cast {
                from: kind(&other),
                to: "object",
            }),
        },
    }
}
