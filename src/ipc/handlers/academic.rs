use crate::academic::{self, AcademicOutcome};
use crate::db;
use crate::ipc::helpers::{get_required_str, get_school_year, require_class, to_json, with_conn, HandlerErr};
use crate::ipc::types::{AppState, Request};
use crate::model::{AttendanceRecord, Grade, SchoolClass};
use rusqlite::Connection;
use serde_json::{json, Value};

/// Requested course year, else the class's current one, else 1.
fn resolve_school_year(params: &Value, cls: &SchoolClass) -> Result<u8, HandlerErr> {
    Ok(get_school_year(params, "schoolYear")?
        .or(cls.current_year.filter(|y| (1..=3).contains(y)))
        .unwrap_or(1))
}

fn student_report(
    student_id: &str,
    class_id: &str,
    school_year: u8,
    grades: &[Grade],
    attendance: &[AttendanceRecord],
) -> Result<Value, HandlerErr> {
    let status = academic::student_academic_status(grades, student_id, class_id, school_year);
    let own_grades: Vec<&Grade> = grades
        .iter()
        .filter(|g| g.student_id == student_id && g.school_year == school_year)
        .collect();
    let own_attendance: Vec<&AttendanceRecord> =
        attendance.iter().filter(|a| a.student_id == student_id).collect();
    let classification = academic::classify_student(&own_grades, &own_attendance);
    let averages = academic::quarter_averages(own_grades.iter().copied());

    let mut v = to_json(&status)?;
    v["classification"] = to_json(&classification)?;
    v["quarterAverages"] = json!(averages);
    v["trend"] = to_json(&academic::trend(&averages, 0.2))?;
    Ok(v)
}

fn academic_student_status(conn: &Connection, params: &Value) -> Result<Value, HandlerErr> {
    let student_id = get_required_str(params, "studentId")?;
    let student = db::load_student(conn, &student_id)
        .map_err(HandlerErr::query)?
        .ok_or_else(|| HandlerErr::not_found("student"))?;
    let cls = require_class(conn, &student.class_id)?;
    let school_year = resolve_school_year(params, &cls)?;

    let grades = db::load_grades(conn, Some(&cls.id)).map_err(HandlerErr::query)?;
    let attendance = db::load_attendance(conn, Some(&cls.id)).map_err(HandlerErr::query)?;
    student_report(&student.id, &cls.id, school_year, &grades, &attendance)
}

fn academic_class_status(conn: &Connection, params: &Value) -> Result<Value, HandlerErr> {
    let class_id = get_required_str(params, "classId")?;
    let cls = require_class(conn, &class_id)?;
    let school_year = resolve_school_year(params, &cls)?;

    let students = db::load_students(conn, Some(&cls.id)).map_err(HandlerErr::query)?;
    let grades = db::load_grades(conn, Some(&cls.id)).map_err(HandlerErr::query)?;
    let attendance = db::load_attendance(conn, Some(&cls.id)).map_err(HandlerErr::query)?;

    let mut approved = 0usize;
    let mut recovery = 0usize;
    let mut rows = Vec::with_capacity(students.len());
    for student in &students {
        let status = academic::student_academic_status(&grades, &student.id, &cls.id, school_year);
        match status.status {
            AcademicOutcome::Approved => approved += 1,
            AcademicOutcome::Recovery => recovery += 1,
        }
        let mut row = student_report(&student.id, &cls.id, school_year, &grades, &attendance)?;
        row["studentName"] = json!(student.name);
        rows.push(row);
    }

    Ok(json!({
        "classId": cls.id,
        "schoolYear": school_year,
        "students": rows,
        "summary": { "approved": approved, "recovery": recovery, "total": students.len() }
    }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<Value> {
    match req.method.as_str() {
        "academic.studentStatus" => Some(with_conn(state, req, academic_student_status)),
        "academic.classStatus" => Some(with_conn(state, req, academic_class_status)),
        _ => None,
    }
}
