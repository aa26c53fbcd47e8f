use crate::academic;
use crate::db;
use crate::ipc::helpers::{with_conn, HandlerErr};
use crate::ipc::types::{AppState, Request};
use rusqlite::Connection;
use serde_json::{json, Map, Value};

const SCHOOL_KEY: &str = "school.config";

fn default_school() -> Value {
    json!({
        "name": "",
        "address": "",
        "city": "",
        "state": "",
        "director": "",
        "inepCode": null,
        // 1-based here, 0-based in `academic`.
        "academicYearStartMonth": academic::ACADEMIC_YEAR_START_MONTH + 1
    })
}

fn parse_i64_range(v: &Value, key: &str, min: i64, max: i64) -> Result<i64, String> {
    let n = v
        .as_i64()
        .ok_or_else(|| format!("{} must be integer", key))?;
    if !(min..=max).contains(&n) {
        return Err(format!("{} must be in {}..={}", key, min, max));
    }
    Ok(n)
}

fn parse_string_max(v: &Value, key: &str, max_len: usize) -> Result<String, String> {
    let s = v.as_str().ok_or_else(|| format!("{} must be string", key))?;
    let s = s.trim();
    if s.chars().count() > max_len {
        return Err(format!("{} length must be <= {}", key, max_len));
    }
    Ok(s.to_string())
}

fn merge_school_patch(current: &mut Value, patch: &Map<String, Value>) -> Result<(), String> {
    let obj = current
        .as_object_mut()
        .ok_or_else(|| "school config must be a JSON object".to_string())?;
    for (k, v) in patch {
        match k.as_str() {
            "name" | "address" | "city" | "director" => {
                obj.insert(k.clone(), Value::String(parse_string_max(v, k, 160)?));
            }
            "state" => {
                let s = parse_string_max(v, k, 2)?.to_ascii_uppercase();
                if !s.is_empty() && (s.len() != 2 || !s.chars().all(|c| c.is_ascii_alphabetic())) {
                    return Err("state must be a two-letter code".into());
                }
                obj.insert(k.clone(), Value::String(s));
            }
            "inepCode" => {
                if v.is_null() {
                    obj.insert(k.clone(), Value::Null);
                    continue;
                }
                let s = parse_string_max(v, k, 8)?;
                if s.len() != 8 || !s.chars().all(|c| c.is_ascii_digit()) {
                    return Err("inepCode must have 8 digits".into());
                }
                obj.insert(k.clone(), Value::String(s));
            }
            "academicYearStartMonth" => {
                obj.insert(k.clone(), Value::from(parse_i64_range(v, k, 1, 12)?));
            }
            _ => return Err(format!("unknown school field: {}", k)),
        }
    }
    Ok(())
}

fn load_school(conn: &Connection) -> Result<Value, HandlerErr> {
    let mut merged = default_school();
    let saved = db::settings_get_json(conn, SCHOOL_KEY).map_err(HandlerErr::query)?;
    if let (Some(Value::Object(saved)), Some(obj)) = (saved, merged.as_object_mut()) {
        for (k, v) in saved {
            obj.insert(k, v);
        }
    }
    Ok(merged)
}

/// The parts of the school configuration other handlers depend on.
pub struct SchoolSettings {
    pub name: String,
    /// 0-based month in which the academic year starts.
    pub academic_start_month0: u32,
}

pub fn school_settings(conn: &Connection) -> Result<SchoolSettings, HandlerErr> {
    let cfg = load_school(conn)?;
    let name = cfg
        .get("name")
        .and_then(|v| v.as_str())
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .unwrap_or("Escola")
        .to_string();
    let month = cfg
        .get("academicYearStartMonth")
        .and_then(|v| v.as_u64())
        .filter(|m| (1..=12).contains(m))
        .map(|m| (m - 1) as u32)
        .unwrap_or(academic::ACADEMIC_YEAR_START_MONTH);
    Ok(SchoolSettings {
        name,
        academic_start_month0: month,
    })
}

fn school_config_get(conn: &Connection, _params: &Value) -> Result<Value, HandlerErr> {
    Ok(json!({ "config": load_school(conn)? }))
}

fn school_config_update(conn: &Connection, params: &Value) -> Result<Value, HandlerErr> {
    let Some(patch) = params.get("patch").and_then(|v| v.as_object()) else {
        return Err(HandlerErr::bad_params("missing patch"));
    };
    let mut current = load_school(conn)?;
    merge_school_patch(&mut current, patch).map_err(HandlerErr::bad_params)?;
    db::settings_set_json(conn, SCHOOL_KEY, &current)
        .map_err(|e| HandlerErr::new("db_update_failed", e.to_string()))?;
    tracing::info!("school configuration updated");
    Ok(json!({ "ok": true, "config": current }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<Value> {
    match req.method.as_str() {
        "school.config.get" => Some(with_conn(state, req, school_config_get)),
        "school.config.update" => Some(with_conn(state, req, school_config_update)),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn patch(v: Value) -> Map<String, Value> {
        v.as_object().cloned().unwrap()
    }

    #[test]
    fn patch_validates_fields() {
        let mut cfg = default_school();
        merge_school_patch(
            &mut cfg,
            &patch(json!({ "name": " EEEP Modelo ", "state": "ce", "inepCode": "23012345" })),
        )
        .unwrap();
        assert_eq!(cfg["name"], "EEEP Modelo");
        assert_eq!(cfg["state"], "CE");
        assert_eq!(cfg["inepCode"], "23012345");

        assert!(merge_school_patch(&mut cfg, &patch(json!({ "inepCode": "123" }))).is_err());
        assert!(merge_school_patch(&mut cfg, &patch(json!({ "academicYearStartMonth": 13 }))).is_err());
        let e = merge_school_patch(&mut cfg, &patch(json!({ "motto": "x" }))).unwrap_err();
        assert_eq!(e, "unknown school field: motto");
    }
}
