//! Identifier types and lenient parsing of numeric fields at the wire boundary.

use serde_json::Value;

/// Task identifier, assigned by the persistence layer.
pub type TaskId = i64;

/// Tenant identifiers (company and sales channel).
pub type TenantId = i64;

/// Queue key, `"{company}_{channel}_{shop}"` unless set explicitly.
pub type QueueId = String;

/// Worker identifier, assigned when a worker connects.
pub type WorkerId = uuid::Uuid;

/// Allocate a fresh worker id.
pub fn new_worker_id() -> WorkerId {
    uuid::Uuid::new_v4()
}

/// Parse an integer carried either as a JSON number or as a numeric string.
///
/// Returns a human readable message naming `field` when the value is missing
/// or not an integer.
pub fn parse_int(value: Option<&Value>, field: &str) -> Result<i64, String> {
    match value {
        Some(Value::Number(n)) => n
            .as_i64()
            .ok_or_else(|| format!("{field} is not an integer: {n}")),
        Some(Value::String(s)) => s
            .trim()
            .parse::<i64>()
            .map_err(|_| format!("{field} is not a number: {s}")),
        Some(other) => Err(format!("{field} is not a number: {other}")),
        None => Err(format!("{field} is not a number: undefined")),
    }
}

/// Like [`parse_int`] but `None`/`null` yields `Ok(None)`.
pub fn parse_opt_int(value: Option<&Value>, field: &str) -> Result<Option<i64>, String> {
    match value {
        None | Some(Value::Null) => Ok(None),
        some => parse_int(some, field).map(Some),
    }
}
