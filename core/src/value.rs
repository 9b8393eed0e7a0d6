//! Dynamically typed command payloads.
//!
//! Payloads are JSON-shaped but may carry raw binary values anywhere inside
//! maps and sequences. The wire codec lifts those binary values out of the
//! metadata; in-process links hand them over as reference-counted [`Bytes`].

use std::collections::BTreeMap;
use std::fmt;

use bytes::Bytes;
use serde_json::Number;

use crate::address::Address;

/// Reserved payload keys.
pub mod keys {
    /// Command name; the only mandatory key.
    pub const COMMAND: &str = "command";
    /// Correlation id stamped by `chain`.
    pub const REQ_ID: &str = "reqId";
    /// Error flag on synthesized responses.
    pub const ERROR: &str = "error";
    /// Human readable error detail.
    pub const DETAILS: &str = "details";
    /// Command-specific body.
    pub const DATA: &str = "data";
}

#[derive(Debug, Clone, PartialEq, Default)]
pub enum Value {
    #[default]
    Null,
    Bool(bool),
    Number(Number),
    String(String),
    Bytes(Bytes),
    Array(Vec<Value>),
    Object(BTreeMap<String, Value>),
}

impl Value {
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_u64(&self) -> Option<u64> {
        match self {
            Value::Number(n) => n.as_u64(),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_bytes(&self) -> Option<&Bytes> {
        match self {
            Value::Bytes(b) => Some(b),
            _ => None,
        }
    }

    pub fn as_array(&self) -> Option<&[Value]> {
        match self {
            Value::Array(items) => Some(items),
            _ => None,
        }
    }

    pub fn as_object(&self) -> Option<&BTreeMap<String, Value>> {
        match self {
            Value::Object(map) => Some(map),
            _ => None,
        }
    }

    /// Looks a key up when `self` is an object.
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.as_object().and_then(|map| map.get(key))
    }

    /// Reads an array of strings as an [`Address`].
    pub fn as_address(&self) -> Option<Address> {
        let segments = self
            .as_array()?
            .iter()
            .map(|v| v.as_str().map(str::to_string))
            .collect::<Option<Vec<_>>>()?;
        Address::new(segments).ok()
    }

    /// Depth-first, in encounter order.
    pub(crate) fn collect_bytes(&self, out: &mut Vec<Bytes>) {
        match self {
            Value::Bytes(b) => out.push(b.clone()),
            Value::Array(items) => items.iter().for_each(|v| v.collect_bytes(out)),
            Value::Object(map) => map.values().for_each(|v| v.collect_bytes(out)),
            _ => {}
        }
    }

    /// JSON rendering for logs; binary values become `"<N bytes>"`.
    pub fn to_json_lossy(&self) -> serde_json::Value {
        match self {
            Value::Null => serde_json::Value::Null,
            Value::Bool(b) => serde_json::Value::Bool(*b),
            Value::Number(n) => serde_json::Value::Number(n.clone()),
            Value::String(s) => serde_json::Value::String(s.clone()),
            Value::Bytes(b) => serde_json::Value::String(format!("<{} bytes>", b.len())),
            Value::Array(items) => items.iter().map(Value::to_json_lossy).collect(),
            Value::Object(map) => serde_json::Value::Object(
                map.iter()
                    .map(|(k, v)| (k.clone(), v.to_json_lossy()))
                    .collect(),
            ),
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_json_lossy())
    }
}

impl From<serde_json::Value> for Value {
    fn from(json: serde_json::Value) -> Self {
        match json {
            serde_json::Value::Null => Value::Null,
            serde_json::Value::Bool(b) => Value::Bool(b),
            serde_json::Value::Number(n) => Value::Number(n),
            serde_json::Value::String(s) => Value::String(s),
            serde_json::Value::Array(items) => {
                Value::Array(items.into_iter().map(Value::from).collect())
            }
            serde_json::Value::Object(map) => {
                Value::Object(map.into_iter().map(|(k, v)| (k, Value::from(v))).collect())
            }
        }
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::Bool(b)
    }
}

impl From<u64> for Value {
    fn from(n: u64) -> Self {
        Value::Number(n.into())
    }
}

impl From<u32> for Value {
    fn from(n: u32) -> Self {
        Value::Number(n.into())
    }
}

impl From<i64> for Value {
    fn from(n: i64) -> Self {
        Value::Number(n.into())
    }
}

impl From<f64> for Value {
    fn from(n: f64) -> Self {
        Number::from_f64(n).map(Value::Number).unwrap_or(Value::Null)
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::String(s.to_string())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::String(s)
    }
}

impl From<Bytes> for Value {
    fn from(b: Bytes) -> Self {
        Value::Bytes(b)
    }
}

impl From<Vec<u8>> for Value {
    fn from(b: Vec<u8>) -> Self {
        Value::Bytes(Bytes::from(b))
    }
}

impl From<Vec<Value>> for Value {
    fn from(items: Vec<Value>) -> Self {
        Value::Array(items)
    }
}

impl From<BTreeMap<String, Value>> for Value {
    fn from(map: BTreeMap<String, Value>) -> Self {
        Value::Object(map)
    }
}

impl From<&Address> for Value {
    fn from(address: &Address) -> Self {
        Value::Array(
            address
                .segments()
                .iter()
                .map(|s| Value::String(s.clone()))
                .collect(),
        )
    }
}

impl From<Payload> for Value {
    fn from(payload: Payload) -> Self {
        Value::Object(payload.0)
    }
}

/// Command payload carried by every event.
///
/// A payload is an object whose `command` key names the command. Everything
/// else is free-form; `reqId`, `error` and `details` have protocol meaning.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Payload(BTreeMap<String, Value>);

impl Payload {
    pub fn new(command: impl Into<String>) -> Self {
        let mut map = BTreeMap::new();
        map.insert(keys::COMMAND.to_string(), Value::String(command.into()));
        Self(map)
    }

    /// Wraps a raw map; no command is required here, `Event::new` validates.
    pub fn from_map(map: BTreeMap<String, Value>) -> Self {
        Self(map)
    }

    /// Converts a JSON object; non-object JSON yields an empty payload.
    pub fn from_json(json: serde_json::Value) -> Self {
        match Value::from(json) {
            Value::Object(map) => Self(map),
            _ => Self::default(),
        }
    }

    /// `<command>Response` error payload.
    pub fn error(command: &str, details: impl Into<String>) -> Self {
        Self::new(format!("{command}Response"))
            .with(keys::ERROR, true)
            .with(keys::DETAILS, details.into())
    }

    /// The command name, when present and a non-empty string.
    pub fn command(&self) -> Option<&str> {
        self.0
            .get(keys::COMMAND)
            .and_then(Value::as_str)
            .filter(|c| !c.is_empty())
    }

    pub fn with(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.0.insert(key.into(), value.into());
        self
    }

    /// Sets the command-specific body under `data`.
    pub fn with_data(self, data: impl Into<Value>) -> Self {
        self.with(keys::DATA, data)
    }

    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<Value>) -> Option<Value> {
        self.0.insert(key.into(), value.into())
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.0.get(key)
    }

    pub fn data(&self) -> Option<&Value> {
        self.0.get(keys::DATA)
    }

    pub fn req_id(&self) -> Option<u64> {
        self.0.get(keys::REQ_ID).and_then(Value::as_u64)
    }

    pub fn set_req_id(&mut self, id: u64) {
        self.0.insert(keys::REQ_ID.to_string(), id.into());
    }

    pub fn is_error(&self) -> bool {
        self.0
            .get(keys::ERROR)
            .and_then(Value::as_bool)
            .unwrap_or(false)
    }

    pub fn details(&self) -> Option<&str> {
        self.0.get(keys::DETAILS).and_then(Value::as_str)
    }

    pub fn as_map(&self) -> &BTreeMap<String, Value> {
        &self.0
    }

    pub fn into_map(self) -> BTreeMap<String, Value> {
        self.0
    }

    pub(crate) fn collect_bytes(&self, out: &mut Vec<Bytes>) {
        self.0.values().for_each(|v| v.collect_bytes(out));
    }
}

impl fmt::Display for Payload {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let lossy: serde_json::Map<String, serde_json::Value> = self
            .0
            .iter()
            .map(|(k, v)| (k.clone(), v.to_json_lossy()))
            .collect();
        write!(f, "{}", serde_json::Value::Object(lossy))
    }
}
