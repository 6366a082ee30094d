//! Request body validation against declared field kinds.

use crate::config::{EntityDescriptor, FieldInfo, FieldKind};
use crate::error::AppError;
use crate::query::grammar;
use crate::service::Record;
use chrono::NaiveDate;
use serde_json::Value;

const MANAGED_TIMESTAMPS: [&str; 2] = ["created_at", "updated_at"];

pub struct RequestValidator;

impl RequestValidator {
    /// Validate a create body. Every key must be a declared field; a missing body is empty.
    pub fn validate(entity: &EntityDescriptor, body: &Value) -> Result<Record, AppError> {
        Self::check(entity, body, false)
    }

    /// Validate an update body. The primary key is not writable and is dropped.
    pub fn validate_partial(entity: &EntityDescriptor, body: &Value) -> Result<Record, AppError> {
        Self::check(entity, body, true)
    }

    fn check(entity: &EntityDescriptor, body: &Value, partial: bool) -> Result<Record, AppError> {
        let map = match body {
            Value::Null => return Ok(Record::new()),
            Value::Object(m) => m,
            _ => return Err(AppError::BadRequest("body must be a JSON object".into())),
        };
        let mut out = Record::new();
        for (key, value) in map {
            if partial && *key == entity.primary_key {
                continue;
            }
            if entity.timestamps && MANAGED_TIMESTAMPS.contains(&key.as_str()) {
                continue;
            }
            let field = entity
                .field(key)
                .ok_or_else(|| AppError::Validation(format!("unknown field '{}' on {}", key, entity.name)))?;
            out.insert(key.clone(), validate_field(field, value)?);
        }
        Ok(out)
    }
}

/// Check one value against its field kind; timestamps come back normalized.
fn validate_field(field: &FieldInfo, v: &Value) -> Result<Value, AppError> {
    if v.is_null() {
        return Ok(Value::Null);
    }
    let mismatch = |expected: &str| AppError::Validation(format!("{} must be {}", field.name, expected));
    match field.kind {
        FieldKind::Integer => {
            if v.as_i64().is_none() {
                return Err(mismatch("an integer"));
            }
        }
        FieldKind::Float => {
            if !v.is_number() {
                return Err(mismatch("a number"));
            }
        }
        FieldKind::Bool => {
            if !v.is_boolean() {
                return Err(mismatch("a boolean"));
            }
        }
        FieldKind::Text => {
            if !v.is_string() {
                return Err(mismatch("a string"));
            }
        }
        FieldKind::Timestamp => {
            let s = v.as_str().ok_or_else(|| mismatch("a timestamp string"))?;
            let ts = grammar::parse_timestamp(s).map_err(|_| mismatch("a valid timestamp"))?;
            return Ok(Value::String(ts.to_rfc3339_opts(chrono::SecondsFormat::AutoSi, true)));
        }
        FieldKind::Date => {
            let s = v.as_str().ok_or_else(|| mismatch("a date string"))?;
            if NaiveDate::parse_from_str(s, "%Y-%m-%d").is_err() {
                return Err(mismatch("a YYYY-MM-DD date"));
            }
        }
        FieldKind::Json => {}
    }
    Ok(v.clone())
}
