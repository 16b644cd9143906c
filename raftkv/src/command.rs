//! Command records replicated through the raft log.
//!
//! A [`CommandPayload`] is what the write path proposes and what the state machine applies.
//! It travels as JSON: `{"operation": "SET", "key": "foo", "value": <any JSON>}`.

use std::fmt;
use std::str::FromStr;

use serde::de::{self, Deserializer};
use serde::ser::Serializer;
use serde_derive::{Deserialize, Serialize};
use serde_json::value::RawValue;

use crate::error::{Error, Result};

/// Operation carried by a command.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Operation {
    Set,
    Get,
    Delete,
}

impl Operation {
    pub fn as_str(&self) -> &'static str {
        match self {
            Operation::Set => "SET",
            Operation::Get => "GET",
            Operation::Delete => "DELETE",
        }
    }
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Operation {
    type Err = String;

    /// Operation names are matched after trimming, case-insensitively.
    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "SET" => Ok(Operation::Set),
            "GET" => Ok(Operation::Get),
            "DELETE" => Ok(Operation::Delete),
            other => Err(format!("unknown operation {:?}", other)),
        }
    }
}

impl serde::Serialize for Operation {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> serde::Deserialize<'de> for Operation {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let name = <String as serde::Deserialize>::deserialize(deserializer)?;
        name.parse().map_err(de::Error::custom)
    }
}

/// An opaque client value: the raw JSON text exactly as the client sent it.
///
/// The bytes are replicated unchanged, so every node stores the same encoding for a key.
/// JSON `null` stands for "no value".
#[derive(Clone, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Value(Box<RawValue>);

impl Value {
    pub fn null() -> Self {
        Value(RawValue::NULL.to_owned())
    }

    /// Wraps a JSON document. Fails if `json` is not a single valid JSON value.
    pub fn from_json(json: &str) -> Result<Self> {
        Ok(Value(RawValue::from_string(json.to_string())?))
    }

    /// Wraps stored bytes read back from the storage engine.
    pub fn from_slice(bytes: &[u8]) -> Result<Self> {
        Ok(Value(serde_json::from_slice(bytes)?))
    }

    pub fn as_json(&self) -> &str {
        self.0.get()
    }

    pub fn as_bytes(&self) -> &[u8] {
        self.0.get().as_bytes()
    }

    pub fn is_null(&self) -> bool {
        self.0.get().trim() == "null"
    }
}

impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        self.as_json() == other.as_json()
    }
}

impl Eq for Value {}

impl fmt::Debug for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Value({})", self.as_json())
    }
}

impl Default for Value {
    fn default() -> Self {
        Value::null()
    }
}

/// A single replicated operation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandPayload {
    pub operation: Operation,
    pub key: String,
    #[serde(default)]
    pub value: Value,
}

impl CommandPayload {
    pub fn new(operation: Operation, key: impl Into<String>, value: Value) -> Self {
        CommandPayload {
            operation,
            key: key.into(),
            value,
        }
    }

    pub fn set(key: impl Into<String>, value: Value) -> Self {
        Self::new(Operation::Set, key, value)
    }

    pub fn get(key: impl Into<String>) -> Self {
        Self::new(Operation::Get, key, Value::null())
    }

    pub fn delete(key: impl Into<String>) -> Self {
        Self::new(Operation::Delete, key, Value::null())
    }

    pub fn encode(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self> {
        serde_json::from_slice(bytes).map_err(Error::Encoding)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_round_trip() {
        let payloads = vec![
            CommandPayload::set("foo", Value::from_json(r#""bar""#).unwrap()),
            CommandPayload::set("obj", Value::from_json(r#"{"a":[1,2,{"b":null}]}"#).unwrap()),
            CommandPayload::set("n", Value::from_json("42").unwrap()),
            CommandPayload::get("foo"),
            CommandPayload::delete("foo"),
        ];
        for payload in payloads {
            let bytes = payload.encode().unwrap();
            assert_eq!(CommandPayload::decode(&bytes).unwrap(), payload);
        }
    }

    #[test]
    fn test_wire_format() {
        let payload = CommandPayload::set("foo", Value::from_json(r#""bar""#).unwrap());
        let bytes = payload.encode().unwrap();
        assert_eq!(
            String::from_utf8(bytes).unwrap(),
            r#"{"operation":"SET","key":"foo","value":"bar"}"#
        );
    }

    #[test]
    fn test_decode_is_lenient_on_operation_case() {
        let payload = CommandPayload::decode(br#"{"operation":" delete ","key":"k"}"#).unwrap();
        assert_eq!(payload.operation, Operation::Delete);
        assert!(payload.value.is_null());
    }

    #[test]
    fn test_decode_rejects_unknown_operation() {
        let err = CommandPayload::decode(br#"{"operation":"INCR","key":"k","value":1}"#);
        assert!(matches!(err, Err(Error::Encoding(_))));
    }

    #[test]
    fn test_decode_rejects_malformed_input() {
        assert!(matches!(
            CommandPayload::decode(b"not json"),
            Err(Error::Encoding(_))
        ));
        assert!(matches!(
            CommandPayload::decode(br#"{"key":"k"}"#),
            Err(Error::Encoding(_))
        ));
    }

    #[test]
    fn test_value_bytes_preserved() {
        let value = Value::from_json(r#"{"z":1,"a":2}"#).unwrap();
        let stored = value.as_bytes().to_vec();
        assert_eq!(Value::from_slice(&stored).unwrap(), value);
        assert!(Value::from_slice(b"{broken").is_err());
    }
}
