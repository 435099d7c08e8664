//! Canonical encodings for non-scalar fields, and coercion of stored values
//! back into the shape a field expects.

use crate::db::value::Value;
use crate::error::TickError;
use crate::orm::column::{FieldDef, FieldKind};
use serde::Serialize;
use serde::de::DeserializeOwned;

/// Encode a structured field as canonical JSON.
pub fn structured<S: Serialize>(value: &S) -> Result<Value, TickError> {
    Ok(Value::Json(serde_json::to_value(value)?))
}

pub fn from_structured<D: DeserializeOwned>(value: Value) -> Result<D, TickError> {
    let json = match value {
        Value::Json(json) => json,
        Value::Text(text) => serde_json::from_str(&text)?,
        Value::Blob(bytes) => serde_json::from_slice(&bytes)?,
        Value::Null => serde_json::Value::Null,
        Value::Bool(b) => serde_json::Value::Bool(b),
        Value::Int(i) => serde_json::Value::from(i),
        Value::Float(f) => serde_json::Value::from(f),
    };
    Ok(serde_json::from_value(json)?)
}

/// Encode an opaque field as a binary blob.
pub fn opaque<S: Serialize>(value: &S) -> Result<Value, TickError> {
    Ok(Value::Blob(bincode::serialize(value)?))
}

pub fn from_opaque<D: DeserializeOwned>(value: Value) -> Result<D, TickError> {
    let bytes = match value {
        Value::Blob(bytes) => bytes,
        Value::Text(text) => text.into_bytes(),
        other => {
            return Err(TickError::invalid_value(
                "<opaque>",
                format!("expected blob, got {other:?}"),
            ));
        }
    };
    Ok(bincode::deserialize(&bytes)?)
}

/// The value actually bound when writing a field.
pub(crate) fn encode_for_write(value: Value) -> Value {
    match value {
        Value::Json(json) => Value::Text(json.to_string()),
        other => other,
    }
}

/// Turn a stored value (or its absence) into what `field`'s setter receives.
///
/// Missing and NULL values fall back to the field default first. After that
/// booleans come from 0/1, numbers default to zero, text defaults to empty
/// and structured values are decoded. Nullable fields keep NULL.
pub(crate) fn coerce(field: &FieldDef, stored: Option<Value>) -> Result<Value, TickError> {
    let value = match stored {
        None | Some(Value::Null) => field.default.clone().unwrap_or(Value::Null),
        Some(v) => v,
    };
    if value.is_null() && field.nullable {
        return Ok(Value::Null);
    }

    let bad = |v: &Value| {
        TickError::invalid_value(&field.name, format!("cannot read {v:?} as {:?}", field.kind))
    };

    Ok(match field.kind {
        FieldKind::Bool => match &value {
            Value::Null => Value::Bool(false),
            Value::Bool(b) => Value::Bool(*b),
            Value::Int(i) => Value::Bool(*i == 1),
            Value::Float(f) => Value::Bool(*f == 1.0),
            Value::Text(s) => Value::Bool(matches!(s.trim(), "1" | "true" | "TRUE")),
            other => return Err(bad(other)),
        },
        FieldKind::Integer => match &value {
            Value::Null => Value::Int(0),
            Value::Int(i) => Value::Int(*i),
            Value::Bool(b) => Value::Int(i64::from(*b)),
            Value::Float(f) => Value::Int(*f as i64),
            Value::Text(s) => Value::Int(s.trim().parse().map_err(|_| bad(&value))?),
            other => return Err(bad(other)),
        },
        FieldKind::Float => match &value {
            Value::Null => Value::Float(0.0),
            Value::Float(f) => Value::Float(*f),
            Value::Int(i) => Value::Float(*i as f64),
            Value::Text(s) => Value::Float(s.trim().parse().map_err(|_| bad(&value))?),
            other => return Err(bad(other)),
        },
        FieldKind::Text => match value {
            Value::Null => Value::Text(String::new()),
            Value::Json(json) => Value::Text(json.to_string()),
            Value::Bool(b) => Value::Text(b.to_string()),
            other => match other.into_string() {
                Some(s) => Value::Text(s),
                None => return Err(TickError::invalid_value(&field.name, "not valid text")),
            },
        },
        FieldKind::Structured => match value {
            Value::Null => Value::Json(serde_json::Value::Array(Vec::new())),
            Value::Json(json) => Value::Json(json),
            Value::Text(text) if text.trim().is_empty() => {
                Value::Json(serde_json::Value::Array(Vec::new()))
            }
            Value::Text(text) => Value::Json(serde_json::from_str(&text)?),
            Value::Blob(bytes) => Value::Json(serde_json::from_slice(&bytes)?),
            other => return Err(bad(&other)),
        },
        FieldKind::Opaque => match value {
            Value::Text(text) => Value::Blob(text.into_bytes()),
            other => other,
        },
    })
}
