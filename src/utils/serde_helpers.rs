//! Lenient field decoders for remote payloads. Sources disagree on whether ids
//! are strings or numbers and whether flags are booleans or 0/1.

use serde::de::{Deserializer, Error};
use serde::Deserialize;
use serde_json::Value;

/// `"440"`, `440` and `null` all decode; `null` becomes an empty id.
pub fn string_or_number<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    match Value::deserialize(deserializer)? {
        Value::String(value) => Ok(value),
        Value::Number(value) => Ok(value.to_string()),
        Value::Null => Ok(String::new()),
        other => Err(D::Error::custom(format!("expected string or number id, got {other}"))),
    }
}

/// `true`/`false` or `1`/`0`.
pub fn bool_or_int<'de, D>(deserializer: D) -> Result<bool, D::Error>
where
    D: Deserializer<'de>,
{
    match Value::deserialize(deserializer)? {
        Value::Bool(value) => Ok(value),
        Value::Number(value) => match value.as_i64() {
            Some(0) => Ok(false),
            Some(1) => Ok(true),
            _ => Err(D::Error::custom(format!("expected 0 or 1, got {value}"))),
        },
        Value::Null => Ok(false),
        other => Err(D::Error::custom(format!("expected boolean flag, got {other}"))),
    }
}
