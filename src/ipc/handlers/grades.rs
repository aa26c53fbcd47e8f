use crate::academic;
use crate::db;
use crate::grade_import;
use crate::ipc::helpers::{
    get_optional_str, get_required_str, get_school_year, parse_params, require_class, row_exists,
    to_json, with_conn, HandlerErr,
};
use crate::ipc::types::{AppState, Request};
use rusqlite::Connection;
use serde::Deserialize;
use serde_json::{json, Value};
use std::collections::HashSet;
use uuid::Uuid;

const UPSERT_GRADE_SQL: &str = "INSERT INTO grades(id, student_id, class_id, subject, quarter, school_year, grade, updated_at)
     VALUES(?, ?, ?, ?, ?, ?, ?, ?)
     ON CONFLICT(student_id, class_id, subject, quarter, school_year)
     DO UPDATE SET grade = excluded.grade, updated_at = excluded.updated_at";

fn check_grade(value: f64) -> Result<f64, HandlerErr> {
    if !value.is_finite() || !(0.0..=10.0).contains(&value) {
        return Err(HandlerErr::bad_params(format!("grade must be between 0 and 10 (got {})", value)));
    }
    Ok(value)
}

fn student_in_class(conn: &Connection, student_id: &str, class_id: &str) -> Result<bool, HandlerErr> {
    let student = db::load_student(conn, student_id).map_err(HandlerErr::query)?;
    Ok(student.map(|s| s.class_id == class_id).unwrap_or(false))
}

fn grades_list(conn: &Connection, params: &Value) -> Result<Value, HandlerErr> {
    let class_id = get_optional_str(params, "classId");
    let student_id = get_optional_str(params, "studentId");
    let subject = get_optional_str(params, "subject");
    let school_year = get_school_year(params, "schoolYear")?;

    let mut grades = db::load_grades(conn, class_id.as_deref()).map_err(HandlerErr::query)?;
    grades.retain(|g| {
        student_id.as_deref().map(|s| g.student_id == s).unwrap_or(true)
            && subject.as_deref().map(|s| g.subject == s).unwrap_or(true)
            && school_year.map(|y| g.school_year == y).unwrap_or(true)
    });
    Ok(json!({ "grades": grades }))
}

fn grades_upsert(conn: &Connection, params: &Value) -> Result<Value, HandlerErr> {
    let student_id = get_required_str(params, "studentId")?;
    let class_id = get_required_str(params, "classId")?;
    let subject = get_required_str(params, "subject")?;
    let quarter = get_required_str(params, "quarter")?;
    if !academic::is_valid_quarter(&quarter) {
        return Err(HandlerErr::bad_params(format!("invalid quarter: {}", quarter)));
    }
    let school_year = get_school_year(params, "schoolYear")?.unwrap_or(1);
    let grade = params
        .get("grade")
        .and_then(|v| v.as_f64())
        .ok_or_else(|| HandlerErr::bad_params("missing grade"))
        .and_then(check_grade)?;
    if !student_in_class(conn, &student_id, &class_id)? {
        return Err(HandlerErr::not_found("student in class"));
    }

    conn.execute(
        UPSERT_GRADE_SQL,
        (
            Uuid::new_v4().to_string(),
            &student_id,
            &class_id,
            &subject,
            &quarter,
            i64::from(school_year),
            grade,
            db::now_rfc3339(),
        ),
    )
    .map_err(|e| HandlerErr::table("db_update_failed", e, "grades"))?;
    let id: String = conn
        .query_row(
            "SELECT id FROM grades
             WHERE student_id = ? AND class_id = ? AND subject = ? AND quarter = ? AND school_year = ?",
            (&student_id, &class_id, &subject, &quarter, i64::from(school_year)),
            |r| r.get(0),
        )
        .map_err(HandlerErr::query)?;
    Ok(json!({ "gradeId": id }))
}

fn grades_delete(conn: &Connection, params: &Value) -> Result<Value, HandlerErr> {
    let grade_id = get_required_str(params, "gradeId")?;
    if !row_exists(conn, "grades", &grade_id)? {
        return Err(HandlerErr::not_found("grade"));
    }
    conn.execute("DELETE FROM grades WHERE id = ?", [&grade_id])
        .map_err(|e| HandlerErr::table("db_delete_failed", e, "grades"))?;
    Ok(json!({ "ok": true }))
}

fn grades_import_preview(conn: &Connection, params: &Value) -> Result<Value, HandlerErr> {
    let class_id = get_required_str(params, "classId")?;
    require_class(conn, &class_id)?;
    let content = params
        .get("content")
        .and_then(|v| v.as_str())
        .ok_or_else(|| HandlerErr::bad_params("missing content"))?;

    let table = grade_import::parse_grade_table(content).map_err(HandlerErr::validation)?;
    let roster = db::load_students(conn, Some(&class_id)).map_err(HandlerErr::query)?;
    let preview = grade_import::build_import_preview(table, &roster);
    tracing::debug!(
        grades = preview.grades.len(),
        unmatched = preview.unmatched_names.len(),
        "grade import preview"
    );
    to_json(&preview)
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ImportItem {
    student_id: String,
    subject: String,
    grade: f64,
    #[serde(default = "selected_by_default")]
    selected: bool,
}

fn selected_by_default() -> bool {
    true
}

/// Writes the selected preview rows, 50 per transaction. A failing chunk is
/// rolled back and reported; the rest of the import still runs.
fn grades_import_apply(conn: &Connection, params: &Value) -> Result<Value, HandlerErr> {
    let class_id = get_required_str(params, "classId")?;
    require_class(conn, &class_id)?;
    let quarter = get_required_str(params, "quarter")?;
    let school_year = get_school_year(params, "schoolYear")?.unwrap_or(1);
    let school_year = grade_import::check_import_target(&quarter, i64::from(school_year))
        .map_err(HandlerErr::validation)?;

    let items: Vec<ImportItem> = match params.get("grades") {
        Some(v) => parse_params(v)?,
        None => return Err(HandlerErr::bad_params("missing grades")),
    };
    let roster: HashSet<String> = db::load_students(conn, Some(&class_id))
        .map_err(HandlerErr::query)?
        .into_iter()
        .map(|s| s.id)
        .collect();

    let mut skipped = 0usize;
    let mut rows: Vec<(String, String, f64)> = Vec::new();
    for item in items.into_iter().filter(|i| i.selected) {
        let subject = grade_import::normalize_subject_name(&item.subject);
        if !roster.contains(&item.student_id) || subject.is_empty() || check_grade(item.grade).is_err() {
            skipped += 1;
            continue;
        }
        rows.push((item.student_id, subject, item.grade));
    }

    let now = db::now_rfc3339();
    let report = grade_import::apply_in_chunks(&rows, |chunk: &[(String, String, f64)]| -> Result<usize, rusqlite::Error> {
        let tx = conn.unchecked_transaction()?;
        for (student_id, subject, grade) in chunk {
            tx.execute(
                UPSERT_GRADE_SQL,
                (
                    Uuid::new_v4().to_string(),
                    student_id,
                    &class_id,
                    subject,
                    &quarter,
                    i64::from(school_year),
                    grade,
                    &now,
                ),
            )?;
        }
        tx.commit()?;
        Ok(chunk.len())
    });
    tracing::info!(
        applied = report.applied,
        failed = report.failed,
        skipped,
        "grade import applied"
    );

    let mut result = to_json(&report)?;
    result["skipped"] = json!(skipped);
    Ok(result)
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<Value> {
    match req.method.as_str() {
        "grades.list" => Some(with_conn(state, req, grades_list)),
        "grades.upsert" => Some(with_conn(state, req, grades_upsert)),
        "grades.delete" => Some(with_conn(state, req, grades_delete)),
        "grades.importPreview" => Some(with_conn(state, req, grades_import_preview)),
        "grades.importApply" => Some(with_conn(state, req, grades_import_apply)),
        _ => None,
    }
}
