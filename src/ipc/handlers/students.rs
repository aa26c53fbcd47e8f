use crate::academic;
use crate::db;
use crate::ipc::helpers::{
    class_exists, get_optional_str, get_required_str, parse_params, with_conn, HandlerErr,
};
use crate::ipc::types::{AppState, Request};
use crate::model::{Student, StudentStatus};
use crate::text;
use rusqlite::Connection;
use serde::Deserialize;
use serde_json::{json, Value};
use uuid::Uuid;

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
struct StudentFields {
    class_id: Option<String>,
    name: Option<String>,
    birth_date: Option<String>,
    gender: Option<String>,
    enrollment: Option<String>,
    census_id: Option<String>,
    status: Option<String>,
}

fn blank_to_none(v: Option<String>) -> Option<String> {
    v.map(|s| s.trim().to_string()).filter(|s| !s.is_empty())
}

fn apply_fields(conn: &Connection, student: &mut Student, fields: StudentFields) -> Result<(), HandlerErr> {
    if let Some(class_id) = blank_to_none(fields.class_id) {
        if !class_exists(conn, &class_id)? {
            return Err(HandlerErr::not_found("class"));
        }
        student.class_id = class_id;
    }
    if let Some(name) = fields.name {
        let name = text::collapse_spaces(&name);
        if name.is_empty() {
            return Err(HandlerErr::bad_params("name must not be empty"));
        }
        student.name = name;
    }
    if fields.birth_date.is_some() {
        let date = blank_to_none(fields.birth_date);
        if let Some(d) = date.as_deref() {
            if academic::parse_date(d).is_none() {
                return Err(HandlerErr::bad_params(format!("invalid birthDate: {}", d)));
            }
        }
        student.birth_date = date;
    }
    if fields.gender.is_some() {
        student.gender = blank_to_none(fields.gender);
    }
    if fields.enrollment.is_some() {
        student.enrollment = blank_to_none(fields.enrollment);
    }
    if fields.census_id.is_some() {
        student.census_id = blank_to_none(fields.census_id);
    }
    if let Some(status) = fields.status {
        student.status = StudentStatus::parse(status.trim())
            .ok_or_else(|| HandlerErr::bad_params(format!("unknown student status: {}", status)))?;
    }
    Ok(())
}

fn students_list(conn: &Connection, params: &Value) -> Result<Value, HandlerErr> {
    let class_id = get_optional_str(params, "classId");
    let status = match get_optional_str(params, "status") {
        Some(s) => Some(
            StudentStatus::parse(&s)
                .ok_or_else(|| HandlerErr::bad_params(format!("unknown student status: {}", s)))?,
        ),
        None => None,
    };
    let mut students = db::load_students(conn, class_id.as_deref()).map_err(HandlerErr::query)?;
    if let Some(status) = status {
        students.retain(|s| s.status == status);
    }
    students.sort_by(|a, b| text::compare_pt(&a.name, &b.name));
    Ok(json!({ "students": students }))
}

fn students_create(conn: &Connection, params: &Value) -> Result<Value, HandlerErr> {
    let class_id = get_required_str(params, "classId")?;
    get_required_str(params, "name")?;
    let fields: StudentFields = parse_params(params)?;
    let mut student = Student {
        id: Uuid::new_v4().to_string(),
        class_id,
        name: String::new(),
        birth_date: None,
        gender: None,
        enrollment: None,
        census_id: None,
        status: StudentStatus::Active,
    };
    apply_fields(conn, &mut student, fields)?;

    let now = db::now_rfc3339();
    conn.execute(
        "INSERT INTO students(id, class_id, name, birth_date, gender, enrollment, census_id,
            status, created_at, updated_at)
         VALUES(?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        (
            &student.id,
            &student.class_id,
            &student.name,
            &student.birth_date,
            &student.gender,
            &student.enrollment,
            &student.census_id,
            student.status.as_str(),
            &now,
            &now,
        ),
    )
    .map_err(|e| HandlerErr::table("db_insert_failed", e, "students"))?;
    Ok(json!({ "studentId": student.id, "student": student }))
}

fn students_update(conn: &Connection, params: &Value) -> Result<Value, HandlerErr> {
    let student_id = get_required_str(params, "studentId")?;
    let mut student = db::load_student(conn, &student_id)
        .map_err(HandlerErr::query)?
        .ok_or_else(|| HandlerErr::not_found("student"))?;
    let fields: StudentFields = match params.get("patch") {
        Some(p) => parse_params(p)?,
        None => return Err(HandlerErr::bad_params("missing patch")),
    };
    apply_fields(conn, &mut student, fields)?;

    conn.execute(
        "UPDATE students SET class_id = ?, name = ?, birth_date = ?, gender = ?, enrollment = ?,
            census_id = ?, status = ?, updated_at = ?
         WHERE id = ?",
        (
            &student.class_id,
            &student.name,
            &student.birth_date,
            &student.gender,
            &student.enrollment,
            &student.census_id,
            student.status.as_str(),
            db::now_rfc3339(),
            &student.id,
        ),
    )
    .map_err(|e| HandlerErr::table("db_update_failed", e, "students"))?;
    Ok(json!({ "student": student }))
}

/// Removes a student with its grades, attendance and external scores. Incidents involving only
/// this student go too; shared incidents just lose the link. Issued
/// certificates keep their name snapshot.
fn students_delete(conn: &Connection, params: &Value) -> Result<Value, HandlerErr> {
    let student_id = get_required_str(params, "studentId")?;
    if db::load_student(conn, &student_id)
        .map_err(HandlerErr::query)?
        .is_none()
    {
        return Err(HandlerErr::not_found("student"));
    }

    let solo_incidents: Vec<String> = {
        let mut stmt = conn
            .prepare(
                "SELECT incident_id FROM incident_students
                 WHERE student_id = ?1
                   AND incident_id NOT IN (
                     SELECT incident_id FROM incident_students WHERE student_id <> ?1
                   )",
            )
            .map_err(HandlerErr::query)?;
        let rows = stmt
            .query_map([&student_id], |r| r.get::<_, String>(0))
            .and_then(|it| it.collect::<Result<Vec<_>, _>>())
            .map_err(HandlerErr::query)?;
        rows
    };

    let tx = conn
        .unchecked_transaction()
        .map_err(|e| HandlerErr::new("db_tx_failed", e.to_string()))?;
    for incident_id in &solo_incidents {
        if let Err(e) = db::delete_incident_rows(&tx, incident_id) {
            let _ = tx.rollback();
            return Err(HandlerErr::table("db_delete_failed", e, "incidents"));
        }
    }
    let steps: [(&str, &str); 7] = [
        ("incident_students", "DELETE FROM incident_students WHERE student_id = ?"),
        ("attendance", "DELETE FROM attendance WHERE student_id = ?"),
        ("grades", "DELETE FROM grades WHERE student_id = ?"),
        ("external_assessments", "DELETE FROM external_assessments WHERE student_id = ?"),
        ("historical_grades", "DELETE FROM historical_grades WHERE student_id = ?"),
        (
            "certificate_event_students",
            "UPDATE certificate_event_students SET student_id = NULL WHERE student_id = ?",
        ),
        ("students", "DELETE FROM students WHERE id = ?"),
    ];
    for (table, sql) in steps {
        if let Err(e) = tx.execute(sql, [&student_id]) {
            let _ = tx.rollback();
            return Err(HandlerErr::table("db_delete_failed", e, table));
        }
    }
    tx.commit()
        .map_err(|e| HandlerErr::new("db_commit_failed", e.to_string()))?;
    Ok(json!({ "ok": true, "deletedIncidents": solo_incidents.len() }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<Value> {
    match req.method.as_str() {
        "students.list" => Some(with_conn(state, req, students_list)),
        "students.create" => Some(with_conn(state, req, students_create)),
        "students.update" => Some(with_conn(state, req, students_update)),
        "students.delete" => Some(with_conn(state, req, students_delete)),
        _ => None,
    }
}
