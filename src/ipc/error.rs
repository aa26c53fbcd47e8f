use serde_json::{json, Value};

/// `{id, ok: true, result}`
pub fn ok(id: &str, result: Value) -> Value {
    json!({ "id": id, "ok": true, "result": result })
}

/// `{id, ok: false, error: {code, message, details?}}`
pub fn err(id: &str, code: &str, message: impl Into<String>, details: Option<Value>) -> Value {
    let mut error = json!({ "code": code, "message": message.into() });
    if let Some(d) = details {
        error["details"] = d;
    }
    json!({ "id": id, "ok": false, "error": error })
}
