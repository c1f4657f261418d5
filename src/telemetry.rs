use bytes::Bytes;
use chrono::{DateTime, SecondsFormat, Utc};
use serde_json::json;
use std::collections::BTreeMap;

/// Engineering or raw value carried by a telemetry parameter.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
    Time(DateTime<Utc>),
    Bytes(Bytes),
    Struct(BTreeMap<String, Value>),
}

impl Value {
    pub fn empty_struct() -> Self {
        Value::Struct(BTreeMap::new())
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        match self {
            Value::Struct(fields) => fields.get(key),
            _ => None,
        }
    }

    pub fn get_path(&self, path: &[&str]) -> Option<&Value> {
        path.iter().try_fold(self, |value, key| value.get(key))
    }

    pub fn as_struct(&self) -> Option<&BTreeMap<String, Value>> {
        match self {
            Value::Struct(fields) => Some(fields),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Text(text) => Some(text.as_str()),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Value::Int(value) => Some(*value),
            Value::Float(value) if value.fract() == 0.0 => Some(*value as i64),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Int(value) => Some(*value as f64),
            Value::Float(value) => Some(*value),
            _ => None,
        }
    }

    pub fn as_bytes(&self) -> Option<&Bytes> {
        match self {
            Value::Bytes(bytes) => Some(bytes),
            _ => None,
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    /// Inserts `value` at a nested `path`, creating intermediate structs.
    /// A non-struct value sitting on the path is replaced.
    pub fn insert_path(&mut self, path: &[&str], value: Value) {
        let Some((head, rest)) = path.split_first() else {
            *self = value;
            return;
        };
        if !matches!(self, Value::Struct(_)) {
            *self = Value::empty_struct();
        }
        if let Value::Struct(fields) = self {
            fields
                .entry((*head).to_string())
                .or_insert(Value::Null)
                .insert_path(rest, value);
        }
    }

    /// JSON rendering used for labels and logs. Byte payloads are summarized by length.
    pub fn to_json(&self) -> serde_json::Value {
        match self {
            Value::Null => serde_json::Value::Null,
            Value::Bool(value) => json!(value),
            Value::Int(value) => json!(value),
            Value::Float(value) => json!(value),
            Value::Text(value) => json!(value),
            Value::Time(value) => json!(value.to_rfc3339_opts(SecondsFormat::Micros, false)),
            Value::Bytes(bytes) => json!({ "bytes": bytes.len() }),
            Value::Struct(fields) => serde_json::Value::Object(
                fields
                    .iter()
                    .map(|(key, value)| (key.clone(), value.to_json()))
                    .collect(),
            ),
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
        Value::Text(value.to_string())
    }
}

impl From<String> for Value {
    fn from(value: String) -> Self {
        Value::Text(value)
    }
}

impl From<DateTime<Utc>> for Value {
    fn from(value: DateTime<Utc>) -> Self {
        Value::Time(value)
    }
}

impl From<Bytes> for Value {
    fn from(value: Bytes) -> Self {
        Value::Bytes(value)
    }
}

impl From<Vec<u8>> for Value {
    fn from(value: Vec<u8>) -> Self {
        Value::Bytes(Bytes::from(value))
    }
}

/// One published value of a named telemetry parameter.
#[derive(Debug, Clone, PartialEq)]
pub struct TelemetrySample {
    pub name: String,
    pub generation_time: DateTime<Utc>,
    pub reception_time: Option<DateTime<Utc>>,
    /// Engineering value.
    pub value: Value,
    pub raw_value: Option<Value>,
    /// Remaining top-level fields recorded alongside the value.
    pub fields: BTreeMap<String, Value>,
}

impl TelemetrySample {
    pub fn new(name: impl Into<String>, generation_time: DateTime<Utc>, value: Value) -> Self {
        Self {
            name: name.into(),
            generation_time,
            reception_time: None,
            value,
            raw_value: None,
            fields: BTreeMap::new(),
        }
    }

    pub fn with_reception_time(mut self, reception_time: DateTime<Utc>) -> Self {
        self.reception_time = Some(reception_time);
        self
    }

    pub fn with_field(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.fields.insert(key.into(), value.into());
        self
    }

    /// Last path segment of the parameter name (`/A/B/Navcam_left_icer` -> `Navcam_left_icer`).
    pub fn short_name(&self) -> &str {
        self.name.rsplit('/').next().unwrap_or(self.name.as_str())
    }
}
