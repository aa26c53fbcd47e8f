use chrono::NaiveDate;
use rusqlite::{Connection, OptionalExtension};
use serde::de::DeserializeOwned;
use serde_json::{json, Value};

use crate::academic;
use crate::db;
use crate::ipc::error::{err, ok};
use crate::ipc::types::{AppState, Request};
use crate::model::SchoolClass;

#[derive(Debug)]
pub struct HandlerErr {
    pub code: &'static str,
    pub message: String,
    pub details: Option<Value>,
}

impl HandlerErr {
    pub fn new(code: &'static str, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            details: None,
        }
    }

    pub fn bad_params(message: impl Into<String>) -> Self {
        Self::new("bad_params", message)
    }

    pub fn not_found(what: &str) -> Self {
        Self::new("not_found", format!("{} not found", what))
    }

    /// A business rule rejected the request.
    pub fn validation(e: impl std::fmt::Display) -> Self {
        Self::new("validation_failed", e.to_string())
    }

    pub fn query(e: impl std::fmt::Display) -> Self {
        Self::new("db_query_failed", e.to_string())
    }

    pub fn table(code: &'static str, e: impl std::fmt::Display, table: &str) -> Self {
        Self {
            code,
            message: e.to_string(),
            details: Some(json!({ "table": table })),
        }
    }

    pub fn response(self, id: &str) -> Value {
        err(id, self.code, self.message, self.details)
    }
}

/// Runs a handler body against the open workspace and wraps its outcome in a
/// protocol response.
pub fn with_conn(
    state: &AppState,
    req: &Request,
    f: impl FnOnce(&Connection, &Value) -> Result<Value, HandlerErr>,
) -> Value {
    let Some(conn) = state.conn() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    match f(conn, &req.params) {
        Ok(result) => ok(&req.id, result),
        Err(error) => {
            tracing::warn!(method = %req.method, code = error.code, message = %error.message, "request failed");
            error.response(&req.id)
        }
    }
}

pub fn get_required_str(params: &Value, key: &str) -> Result<String, HandlerErr> {
    params
        .get(key)
        .and_then(|v| v.as_str())
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .ok_or_else(|| HandlerErr::bad_params(format!("missing {}", key)))
}

/// Trimmed string or `None` when absent, null or blank.
pub fn get_optional_str(params: &Value, key: &str) -> Option<String> {
    params
        .get(key)
        .and_then(|v| v.as_str())
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
}

pub fn get_optional_bool(params: &Value, key: &str) -> Result<Option<bool>, HandlerErr> {
    match params.get(key) {
        None | Some(Value::Null) => Ok(None),
        Some(Value::Bool(b)) => Ok(Some(*b)),
        Some(_) => Err(HandlerErr::bad_params(format!("{} must be a boolean", key))),
    }
}

pub fn get_string_list(params: &Value, key: &str) -> Result<Vec<String>, HandlerErr> {
    match params.get(key) {
        None | Some(Value::Null) => Ok(Vec::new()),
        Some(Value::Array(items)) => items
            .iter()
            .map(|v| {
                v.as_str()
                    .map(|s| s.trim().to_string())
                    .ok_or_else(|| HandlerErr::bad_params(format!("{} must be a list of strings", key)))
            })
            .collect(),
        Some(_) => Err(HandlerErr::bad_params(format!("{} must be a list of strings", key))),
    }
}

/// Course year parameter (1..=3).
pub fn get_school_year(params: &Value, key: &str) -> Result<Option<u8>, HandlerErr> {
    match params.get(key) {
        None | Some(Value::Null) => Ok(None),
        Some(v) => v
            .as_i64()
            .and_then(|n| u8::try_from(n).ok())
            .filter(|n| (1..=3).contains(n))
            .map(Some)
            .ok_or_else(|| HandlerErr::bad_params(format!("{} must be 1, 2 or 3", key))),
    }
}

/// Deserializes a whole params object (or one field of it) into a typed draft.
pub fn parse_params<T: DeserializeOwned>(value: &Value) -> Result<T, HandlerErr> {
    serde_json::from_value(value.clone()).map_err(|e| HandlerErr::bad_params(e.to_string()))
}

/// Reference date for calendar rules: `params.today` when given, otherwise the
/// local date.
pub fn today(params: &Value) -> Result<NaiveDate, HandlerErr> {
    match get_optional_str(params, "today") {
        Some(raw) => academic::parse_date(&raw)
            .ok_or_else(|| HandlerErr::bad_params(format!("invalid today: {}", raw))),
        None => Ok(chrono::Local::now().date_naive()),
    }
}

pub fn class_exists(conn: &Connection, class_id: &str) -> Result<bool, HandlerErr> {
    conn.query_row("SELECT 1 FROM classes WHERE id = ?", [class_id], |r| {
        r.get::<_, i64>(0)
    })
    .optional()
    .map(|v| v.is_some())
    .map_err(HandlerErr::query)
}

pub fn require_class(conn: &Connection, class_id: &str) -> Result<SchoolClass, HandlerErr> {
    db::load_class(conn, class_id)
        .map_err(HandlerErr::query)?
        .ok_or_else(|| HandlerErr::not_found("class"))
}

pub fn row_exists(conn: &Connection, table: &str, id: &str) -> Result<bool, HandlerErr> {
    let sql = format!("SELECT 1 FROM {} WHERE id = ?", table);
    conn.query_row(&sql, [id], |r| r.get::<_, i64>(0))
        .optional()
        .map(|v| v.is_some())
        .map_err(HandlerErr::query)
}

pub fn to_json<T: serde::Serialize>(value: &T) -> Result<Value, HandlerErr> {
    serde_json::to_value(value).map_err(|e| HandlerErr::new("internal", e.to_string()))
}
