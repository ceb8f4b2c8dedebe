// Copyright 2025 Kore Ledger, SL
// SPDX-License-Identifier: Apache-2.0

//! # Values
//!
//! Payloads travel between actors as already materialized `Value`s. The runtime never sees
//! bytes: turning a network frame into a `Value` is the job of a serialization layer, which
//! is why the type derives `Serialize` and `Deserialize`.
//!

use crate::Error;

use serde::{Deserialize, Serialize};

use std::collections::BTreeMap;

/// In-memory payload of an envelope, a pipe item or a query result.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub enum Value {
    #[default]
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
    List(Vec<Value>),
    Map(BTreeMap<String, Value>),
}

impl Value {
    pub fn as_int(&self) -> Option<i64> {
        match self {
            Value::Int(value) => Some(*value),
            _ => None,
        }
    }

    /// Integers widen to floats.
    pub fn as_float(&self) -> Option<f64> {
        match self {
            Value::Float(value) => Some(*value),
            Value::Int(value) => Some(*value as f64),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(value) => Some(*value),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Str(value) => Some(value),
            _ => None,
        }
    }

    pub fn as_list(&self) -> Option<&[Value]> {
        match self {
            Value::List(values) => Some(values),
            _ => None,
        }
    }

    pub fn as_map(&self) -> Option<&BTreeMap<String, Value>> {
        match self {
            Value::Map(map) => Some(map),
            _ => None,
        }
    }

    /// Entry of a map value.
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.as_map().and_then(|map| map.get(key))
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }
}

impl From<()> for Value {
    fn from(_: ()) -> Self {
        Value::Null
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

impl From<i32> for Value {
    fn from(value: i32) -> Self {
        Value::Int(value.into())
    }
}

impl From<u32> for Value {
    fn from(value: u32) -> Self {
        Value::Int(value.into())
    }
}

impl From<usize> for Value {
    fn from(value: usize) -> Self {
        Value::Int(value as i64)
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
    fn from(values: Vec<T>) -> Self {
        Value::List(values.into_iter().map(Into::into).collect())
    }
}

impl From<BTreeMap<String, Value>> for Value {
    fn from(map: BTreeMap<String, Value>) -> Self {
        Value::Map(map)
    }
}

/// Owned argument list of an envelope.
///
/// The list moves into the envelope on send, so the caller cannot touch the values once the
/// target owns them.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Args(Vec<Value>);

impl Args {
    pub fn new() -> Self {
        Self(Vec::new())
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> std::slice::Iter<'_, Value> {
        self.0.iter()
    }

    /// Argument at `index`, failing with `Error::Argument` when missing.
    pub fn get(&self, index: usize) -> Result<&Value, Error> {
        self.0
            .get(index)
            .ok_or_else(|| Error::Argument(index, "a value".to_owned()))
    }

    pub fn int(&self, index: usize) -> Result<i64, Error> {
        self.get(index)?
            .as_int()
            .ok_or_else(|| Error::Argument(index, "an integer".to_owned()))
    }

    pub fn float(&self, index: usize) -> Result<f64, Error> {
        self.get(index)?
            .as_float()
            .ok_or_else(|| Error::Argument(index, "a number".to_owned()))
    }

    pub fn bool(&self, index: usize) -> Result<bool, Error> {
        self.get(index)?
            .as_bool()
            .ok_or_else(|| Error::Argument(index, "a boolean".to_owned()))
    }

    pub fn str(&self, index: usize) -> Result<&str, Error> {
        self.get(index)?
            .as_str()
            .ok_or_else(|| Error::Argument(index, "a string".to_owned()))
    }

    /// Moves the first argument out, or `Value::Null` when there is none.
    pub fn into_first(self) -> Value {
        self.0.into_iter().next().unwrap_or_default()
    }

    pub fn into_inner(self) -> Vec<Value> {
        self.0
    }
}

impl From<Vec<Value>> for Args {
    fn from(values: Vec<Value>) -> Self {
        Self(values)
    }
}

impl From<Value> for Args {
    fn from(value: Value) -> Self {
        Self(vec![value])
    }
}

impl FromIterator<Value> for Args {
    fn from_iter<I: IntoIterator<Item = Value>>(iter: I) -> Self {
        Self(iter.into_iter().collect())
    }
}

impl IntoIterator for Args {
    type Item = Value;
    type IntoIter = std::vec::IntoIter<Value>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.into_iter()
    }
}

/// Builds an [`Args`] list, converting each expression with `Value::from`.
///
/// ```ignore
/// calc.method("add").send(&outbox, args![2, 3])?;
/// ```
#[macro_export]
macro_rules! args {
    () => {
        $crate::Args::new()
    };
    ($($value:expr),+ $(,)?) => {
        $crate::Args::from(vec![$($crate::Value::from($value)),+])
    };
}
