use crate::academic;
use crate::db;
use crate::ipc::helpers::{get_optional_str, get_required_str, parse_params, require_class, with_conn, HandlerErr};
use crate::ipc::types::{AppState, Request};
use crate::model::AttendanceStatus;
use rusqlite::Connection;
use serde::Deserialize;
use serde_json::{json, Value};
use std::collections::{BTreeMap, HashSet};
use uuid::Uuid;

fn attendance_list(conn: &Connection, params: &Value) -> Result<Value, HandlerErr> {
    let class_id = get_required_str(params, "classId")?;
    require_class(conn, &class_id)?;
    let student_id = get_optional_str(params, "studentId");
    let from = get_optional_str(params, "from");
    let to = get_optional_str(params, "to");

    let mut records = db::load_attendance(conn, Some(&class_id)).map_err(HandlerErr::query)?;
    records.retain(|r| {
        student_id.as_deref().map(|s| r.student_id == s).unwrap_or(true)
            && from.as_deref().map(|f| r.date.as_str() >= f).unwrap_or(true)
            && to.as_deref().map(|t| r.date.as_str() <= t).unwrap_or(true)
    });

    let mut by_student: BTreeMap<&str, Vec<&crate::model::AttendanceRecord>> = BTreeMap::new();
    for r in &records {
        by_student.entry(r.student_id.as_str()).or_default().push(r);
    }
    let frequency: BTreeMap<&str, f64> = by_student
        .iter()
        .map(|(id, rows)| (*id, academic::frequency(rows.iter().copied())))
        .collect();

    Ok(json!({ "records": records, "frequency": frequency }))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct AttendanceEntry {
    student_id: String,
    status: String,
}

/// Records one day of attendance for a class, replacing earlier marks for the
/// same student and date.
fn attendance_record(conn: &Connection, params: &Value) -> Result<Value, HandlerErr> {
    let class_id = get_required_str(params, "classId")?;
    require_class(conn, &class_id)?;
    let date = get_required_str(params, "date")?;
    if academic::parse_date(&date).is_none() {
        return Err(HandlerErr::bad_params(format!("invalid date: {}", date)));
    }
    let entries: Vec<AttendanceEntry> = match params.get("records") {
        Some(v) => parse_params(v)?,
        None => return Err(HandlerErr::bad_params("missing records")),
    };

    let roster: HashSet<String> = db::load_students(conn, Some(&class_id))
        .map_err(HandlerErr::query)?
        .into_iter()
        .map(|s| s.id)
        .collect();
    let mut rows = Vec::with_capacity(entries.len());
    for entry in entries {
        let status = AttendanceStatus::parse(entry.status.trim())
            .ok_or_else(|| HandlerErr::bad_params(format!("unknown attendance status: {}", entry.status)))?;
        if !roster.contains(&entry.student_id) {
            return Err(HandlerErr::not_found("student in class"));
        }
        rows.push((entry.student_id, status));
    }

    let tx = conn
        .unchecked_transaction()
        .map_err(|e| HandlerErr::new("db_tx_failed", e.to_string()))?;
    for (student_id, status) in &rows {
        if let Err(e) = tx.execute(
            "INSERT INTO attendance(id, student_id, class_id, date, status) VALUES(?, ?, ?, ?, ?)
             ON CONFLICT(student_id, class_id, date) DO UPDATE SET status = excluded.status",
            (Uuid::new_v4().to_string(), student_id, &class_id, &date, status.as_str()),
        ) {
            let _ = tx.rollback();
            return Err(HandlerErr::table("db_insert_failed", e, "attendance"));
        }
    }
    tx.commit()
        .map_err(|e| HandlerErr::new("db_commit_failed", e.to_string()))?;
    Ok(json!({ "recorded": rows.len() }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<Value> {
    match req.method.as_str() {
        "attendance.list" => Some(with_conn(state, req, attendance_list)),
        "attendance.record" => Some(with_conn(state, req, attendance_record)),
        _ => None,
    }
}
