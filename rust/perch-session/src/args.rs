//! Typed access to decoded argument lists.

use perch_codec::{Value, ValueMap};

use crate::RemoteError;

/// Conversion out of a decoded [`Value`].
///
/// On mismatch, returns a short description of what was expected.
pub trait FromValue: Sized {
    fn from_value(value: Value) -> Result<Self, &'static str>;
}

impl FromValue for Value {
    fn from_value(value: Value) -> Result<Self, &'static str> {
        Ok(value)
    }
}

impl FromValue for bool {
    fn from_value(value: Value) -> Result<Self, &'static str> {
        value.as_bool().ok_or("bool")
    }
}

impl FromValue for i64 {
    fn from_value(value: Value) -> Result<Self, &'static str> {
        value.as_int().ok_or("int")
    }
}

impl FromValue for i32 {
    fn from_value(value: Value) -> Result<Self, &'static str> {
        value
            .as_int()
            .and_then(|i| i32::try_from(i).ok())
            .ok_or("32-bit int")
    }
}

impl FromValue for f64 {
    fn from_value(value: Value) -> Result<Self, &'static str> {
        value.as_float().ok_or("double")
    }
}

impl FromValue for String {
    fn from_value(value: Value) -> Result<Self, &'static str> {
        match value {
            Value::String(s) => Ok(s),
            _ => Err("string"),
        }
    }
}

impl FromValue for Vec<u8> {
    fn from_value(value: Value) -> Result<Self, &'static str> {
        match value {
            Value::Bytes(b) => Ok(b),
            _ => Err("bytes"),
        }
    }
}

impl FromValue for Vec<Value> {
    fn from_value(value: Value) -> Result<Self, &'static str> {
        match value {
            Value::List(l) => Ok(l),
            _ => Err("list"),
        }
    }
}

impl FromValue for ValueMap {
    fn from_value(value: Value) -> Result<Self, &'static str> {
        match value {
            Value::Map(m) => Ok(m),
            _ => Err("map"),
        }
    }
}

impl<T: FromValue> FromValue for Option<T> {
    fn from_value(value: Value) -> Result<Self, &'static str> {
        match value {
            Value::Null => Ok(None),
            other => T::from_value(other).map(Some),
        }
    }
}

/// The decoded argument list of one request.
///
/// Missing trailing arguments read as null, so nullable parameters may be
/// omitted by the caller.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Args {
    values: Vec<Value>,
}

impl Args {
    pub fn new(values: Vec<Value>) -> Self {
        Self { values }
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Raw value at `index`.
    pub fn raw(&self, index: usize) -> &Value {
        self.values.get(index).unwrap_or(&Value::Null)
    }

    /// Argument `index` converted to `T`.
    pub fn get<T: FromValue>(&self, index: usize) -> Result<T, RemoteError> {
        convert(index, self.raw(index).clone())
    }

    /// Like [`Args::get`], but moves the value out, leaving null behind.
    pub fn take<T: FromValue>(&mut self, index: usize) -> Result<T, RemoteError> {
        let value = match self.values.get_mut(index) {
            Some(slot) => std::mem::replace(slot, Value::Null),
            None => Value::Null,
        };
        convert(index, value)
    }

    pub fn into_vec(self) -> Vec<Value> {
        self.values
    }

    pub fn iter(&self) -> std::slice::Iter<'_, Value> {
        self.values.iter()
    }
}

fn convert<T: FromValue>(index: usize, value: Value) -> Result<T, RemoteError> {
    let kind = value.kind();
    T::from_value(value).map_err(|expected| {
        RemoteError::argument(format!("argument {index}: expected {expected}, got {kind}"))
    })
}

impl From<Vec<Value>> for Args {
    fn from(values: Vec<Value>) -> Self {
        Self::new(values)
    }
}
