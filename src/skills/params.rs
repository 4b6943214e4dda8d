//! Parameter values flowing from a model proposal to a capability.
//!
//! [`BoundParams`] are the raw arguments a model proposed; the policy engine
//! inspects them as-is. [`ValidatedParams`] can only be produced by schema
//! validation in the executor, so a capability never sees unchecked input.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::executor::ValidationError;

use super::ActionDescriptor;

/// Placeholder written in place of sensitive values.
pub const REDACTED: &str = "<REDACTED>";

/// Arguments as proposed, before any schema check.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct BoundParams(Map<String, Value>);

impl BoundParams {
    pub fn new(map: Map<String, Value>) -> Self {
        Self(map)
    }

    /// Parse the JSON argument string of a tool call. An empty string means
    /// no arguments; anything other than a JSON object is malformed.
    pub fn parse(raw: &str) -> Result<Self, ValidationError> {
        if raw.trim().is_empty() {
            return Ok(Self::default());
        }
        match serde_json::from_str::<Value>(raw) {
            Ok(Value::Object(map)) => Ok(Self(map)),
            Ok(other) => Err(ValidationError::MalformedArguments {
                message: format!("expected a JSON object, got {}", json_kind(&other)),
            }),
            Err(e) => Err(ValidationError::MalformedArguments {
                message: e.to_string(),
            }),
        }
    }

    /// Builder-style insert.
    pub fn with(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.0.insert(name.into(), value.into());
        self
    }

    pub fn get(&self, name: &str) -> Option<&Value> {
        self.0.get(name)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &Value)> {
        self.0.iter()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn as_map(&self) -> &Map<String, Value> {
        &self.0
    }

    /// Visit every string reachable from the arguments, including strings
    /// nested in arrays and objects and the keys of nested objects.
    pub fn visit_strings<'a>(&'a self, mut visit: impl FnMut(&'a str)) {
        for value in self.0.values() {
            visit_value(value, &mut visit);
        }
    }

    /// Copy with every parameter the action marks sensitive replaced by
    /// [`REDACTED`]. Unknown parameters are kept as proposed.
    pub fn redacted(&self, action: &ActionDescriptor) -> Map<String, Value> {
        self.0
            .iter()
            .map(|(name, value)| {
                let value = if action.is_sensitive(name) {
                    Value::String(REDACTED.into())
                } else {
                    value.clone()
                };
                (name.clone(), value)
            })
            .collect()
    }
}

fn visit_value<'a>(value: &'a Value, visit: &mut impl FnMut(&'a str)) {
    match value {
        Value::String(s) => visit(s),
        Value::Array(items) => items.iter().for_each(|v| visit_value(v, visit)),
        Value::Object(map) => {
            for (key, v) in map {
                visit(key);
                visit_value(v, visit);
            }
        }
        _ => {}
    }
}

pub(crate) fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

/// Parameters that passed schema validation, with defaults filled in.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ValidatedParams(BTreeMap<String, Value>);

impl ValidatedParams {
    pub(crate) fn new(values: BTreeMap<String, Value>) -> Self {
        Self(values)
    }

    pub fn get(&self, name: &str) -> Option<&Value> {
        self.0.get(name)
    }

    pub fn str(&self, name: &str) -> Option<&str> {
        self.0.get(name).and_then(Value::as_str)
    }

    pub fn i64(&self, name: &str) -> Option<i64> {
        self.0.get(name).and_then(Value::as_i64)
    }

    pub fn bool(&self, name: &str) -> Option<bool> {
        self.0.get(name).and_then(Value::as_bool)
    }

    /// Textual form for templating: strings verbatim, absent or null as
    /// the empty string, everything else as compact JSON.
    pub fn render(&self, name: &str) -> String {
        match self.0.get(name) {
            None | Some(Value::Null) => String::new(),
            Some(Value::String(s)) => s.clone(),
            Some(other) => other.to_string(),
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &Value)> {
        self.0.iter()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}
