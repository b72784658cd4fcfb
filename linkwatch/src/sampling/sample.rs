//! Samples and the parser capability that produces their payloads.

use std::collections::BTreeMap;

use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Number, Value};

use crate::error::ParseError;

/// One timestamped observation of a polled metric.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Sample {
    pub timestamp: DateTime<Utc>,
    /// Which worker or scan loop produced the sample.
    pub source_id: String,
    pub payload: Value,
    /// Free-form context such as the command and host.
    #[serde(default)]
    pub metadata: BTreeMap<String, String>,
}

impl Sample {
    /// Create a sample stamped with the current time.
    pub fn new(source_id: impl Into<String>, payload: Value) -> Self {
        Self {
            timestamp: Utc::now(),
            source_id: source_id.into(),
            payload,
            metadata: BTreeMap::new(),
        }
    }

    /// Attach one metadata entry.
    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    /// `<rfc3339 timestamp> <compact JSON payload>`, as written to log streams.
    pub fn to_log_line(&self) -> String {
        format!(
            "{} {}",
            self.timestamp.to_rfc3339_opts(SecondsFormat::Millis, true),
            self.payload
        )
    }
}

/// Turns raw command output into a structured payload.
///
/// Closures of the form `Fn(&str) -> Result<Value, ParseError>` are parsers
/// too.
pub trait Parser: Send + Sync {
    fn parse(&self, raw: &str) -> Result<Value, ParseError>;

    /// Parse output collected by `source_id`.
    ///
    /// Workers call this, so one parser can be shared between sources.
    /// Stateful parsers keep their state per source here.
    fn parse_from(&self, source_id: &str, raw: &str) -> Result<Value, ParseError> {
        let _ = source_id;
        self.parse(raw)
    }
}

impl<F> Parser for F
where
    F: Fn(&str) -> Result<Value, ParseError> + Send + Sync,
{
    fn parse(&self, raw: &str) -> Result<Value, ParseError> {
        self(raw)
    }
}

/// Payload for a worker without a parser: the raw text.
pub fn raw_payload(raw: &str) -> Value {
    Value::String(raw.to_string())
}

/// Parses `key: value` lines into a JSON object.
///
/// Values that look numeric become JSON numbers. Lines without a separator
/// or without a value (section headers) are skipped.
#[derive(Debug, Clone)]
pub struct KeyValueParser {
    separator: char,
}

impl Default for KeyValueParser {
    fn default() -> Self {
        Self { separator: ':' }
    }
}

impl KeyValueParser {
    /// Parser for `key<separator>value` lines.
    pub fn with_separator(separator: char) -> Self {
        Self { separator }
    }
}

impl Parser for KeyValueParser {
    fn parse(&self, raw: &str) -> Result<Value, ParseError> {
        let mut object = Map::new();

        for line in raw.lines() {
            let Some((key, value)) = line.split_once(self.separator) else {
                continue;
            };
            let (key, value) = (key.trim(), value.trim());
            if key.is_empty() || value.is_empty() {
                continue;
            }
            object.insert(key.to_string(), scalar(value));
        }

        if object.is_empty() {
            return Err(ParseError::new("no key/value pairs in output"));
        }
        Ok(Value::Object(object))
    }
}

fn scalar(value: &str) -> Value {
    if let Ok(int) = value.parse::<i64>() {
        return Value::Number(int.into());
    }
    value
        .parse::<f64>()
        .ok()
        .and_then(Number::from_f64)
        .map_or_else(|| Value::String(value.to_string()), Value::Number)
}
