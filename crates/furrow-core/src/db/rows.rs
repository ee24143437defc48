//! Column decoding helpers shared by the repositories

use libsql::{Row, Value};
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::error::{Error, Result};

pub fn text(row: &Row, idx: i32) -> Result<String> {
    Ok(row.get::<String>(idx)?)
}

pub fn integer(row: &Row, idx: i32) -> Result<i64> {
    Ok(row.get::<i64>(idx)?)
}

pub fn optional_text(row: &Row, idx: i32) -> Result<Option<String>> {
    match row.get_value(idx)? {
        Value::Null => Ok(None),
        Value::Text(value) => Ok(Some(value)),
        other => Err(Error::Database(format!(
            "expected TEXT or NULL in column {idx}, got {other:?}"
        ))),
    }
}

pub fn optional_integer(row: &Row, idx: i32) -> Result<Option<i64>> {
    match row.get_value(idx)? {
        Value::Null => Ok(None),
        Value::Integer(value) => Ok(Some(value)),
        other => Err(Error::Database(format!(
            "expected INTEGER or NULL in column {idx}, got {other:?}"
        ))),
    }
}

/// Decode a JSON-encoded TEXT column.
pub fn json<T: DeserializeOwned>(row: &Row, idx: i32) -> Result<T> {
    Ok(serde_json::from_str(&text(row, idx)?)?)
}

pub fn optional_json<T: DeserializeOwned>(row: &Row, idx: i32) -> Result<Option<T>> {
    optional_text(row, idx)?
        .map(|raw| serde_json::from_str(&raw))
        .transpose()
        .map_err(Into::into)
}

/// Parse a TEXT column through `FromStr` (status enums and friends).
pub fn parsed<T>(row: &Row, idx: i32) -> Result<T>
where
    T: std::str::FromStr<Err = String>,
{
    text(row, idx)?.parse().map_err(Error::Database)
}

pub fn optional_parsed<T>(row: &Row, idx: i32) -> Result<Option<T>>
where
    T: std::str::FromStr<Err = String>,
{
    optional_text(row, idx)?
        .map(|raw| raw.parse().map_err(Error::Database))
        .transpose()
}

/// Bind an optional string as TEXT or NULL.
pub fn nullable_text(value: Option<&str>) -> Value {
    value.map_or(Value::Null, |value| Value::Text(value.to_string()))
}

pub fn nullable_integer(value: Option<i64>) -> Value {
    value.map_or(Value::Null, Value::Integer)
}

/// Bind a value as JSON TEXT.
pub fn json_text<T: Serialize + ?Sized>(value: &T) -> Result<Value> {
    Ok(Value::Text(serde_json::to_string(value)?))
}

pub fn nullable_json<T: Serialize>(value: Option<&T>) -> Result<Value> {
    value.map_or(Ok(Value::Null), json_text)
}
