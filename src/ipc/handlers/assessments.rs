use crate::academic;
use crate::db;
use crate::ipc::helpers::{
    get_optional_str, get_required_str, parse_params, row_exists, with_conn, HandlerErr,
};
use crate::ipc::types::{AppState, Request};
use crate::model::{ExternalAssessment, ExternalAssessmentType, HistoricalGrade, SchoolLevel};
use crate::text;
use rusqlite::{Connection, OptionalExtension};
use serde::Deserialize;
use serde_json::{json, Value};
use uuid::Uuid;

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
struct AssessmentFields {
    student_id: Option<String>,
    assessment_type: Option<String>,
    assessment_name: Option<String>,
    subject: Option<String>,
    score: Option<f64>,
    max_score: Option<f64>,
    proficiency_level: Option<String>,
    applied_date: Option<String>,
    school_level: Option<String>,
    grade_year: Option<i64>,
    quarter: Option<String>,
    notes: Option<String>,
}

fn blank_to_none(v: Option<String>) -> Option<String> {
    v.map(|s| s.trim().to_string()).filter(|s| !s.is_empty())
}

fn parse_level(s: &str) -> Result<SchoolLevel, HandlerErr> {
    SchoolLevel::parse(s.trim())
        .ok_or_else(|| HandlerErr::bad_params(format!("unknown schoolLevel: {}", s)))
}

fn check_grade_year(level: SchoolLevel, year: i64) -> Result<u8, HandlerErr> {
    u8::try_from(year)
        .ok()
        .filter(|y| level.accepts_year(*y))
        .ok_or_else(|| {
            HandlerErr::bad_params(format!("gradeYear {} is not valid for {}", year, level.as_str()))
        })
}

fn check_quarter(quarter: Option<String>) -> Result<Option<String>, HandlerErr> {
    let quarter = blank_to_none(quarter);
    if let Some(q) = quarter.as_deref() {
        if !academic::is_valid_quarter(q) {
            return Err(HandlerErr::bad_params(format!("invalid quarter: {}", q)));
        }
    }
    Ok(quarter)
}

fn require_student(conn: &Connection, student_id: &str) -> Result<(), HandlerErr> {
    if row_exists(conn, "students", student_id)? {
        Ok(())
    } else {
        Err(HandlerErr::not_found("student"))
    }
}

/// Applies a create payload or an update patch; absent keys keep the current value.
fn apply_fields(conn: &Connection, a: &mut ExternalAssessment, fields: AssessmentFields) -> Result<(), HandlerErr> {
    if let Some(student_id) = blank_to_none(fields.student_id) {
        require_student(conn, &student_id)?;
        a.student_id = student_id;
    }
    if let Some(kind) = fields.assessment_type {
        a.assessment_type = ExternalAssessmentType::parse(kind.trim())
            .ok_or_else(|| HandlerErr::bad_params(format!("unknown assessmentType: {}", kind)))?;
    }
    if let Some(name) = fields.assessment_name {
        let name = text::collapse_spaces(&name);
        if name.is_empty() {
            return Err(HandlerErr::bad_params("assessmentName must not be empty"));
        }
        a.assessment_name = name;
    }
    if fields.subject.is_some() {
        a.subject = blank_to_none(fields.subject);
    }
    if let Some(score) = fields.score {
        a.score = score;
    }
    if let Some(max) = fields.max_score {
        a.max_score = max;
    }
    if !(a.max_score.is_finite() && a.max_score > 0.0) {
        return Err(HandlerErr::bad_params("maxScore must be greater than zero"));
    }
    if !(a.score.is_finite() && (0.0..=a.max_score).contains(&a.score)) {
        return Err(HandlerErr::bad_params(format!(
            "score must be between 0 and {}",
            a.max_score
        )));
    }
    if fields.proficiency_level.is_some() {
        a.proficiency_level = blank_to_none(fields.proficiency_level);
    }
    if let Some(date) = fields.applied_date {
        let parsed = academic::parse_date(&date)
            .ok_or_else(|| HandlerErr::bad_params(format!("invalid appliedDate: {}", date)))?;
        a.applied_date = parsed.format("%Y-%m-%d").to_string();
    }
    if let Some(level) = fields.school_level {
        a.school_level = parse_level(&level)?;
    }
    let year = fields.grade_year.unwrap_or(i64::from(a.grade_year));
    a.grade_year = check_grade_year(a.school_level, year)?;
    if fields.quarter.is_some() {
        a.quarter = check_quarter(fields.quarter)?;
    }
    if fields.notes.is_some() {
        a.notes = blank_to_none(fields.notes);
    }
    Ok(())
}

fn external_list(conn: &Connection, params: &Value) -> Result<Value, HandlerErr> {
    let student_id = get_optional_str(params, "studentId");
    let assessments =
        db::load_external_assessments(conn, student_id.as_deref()).map_err(HandlerErr::query)?;
    Ok(json!({ "externalAssessments": assessments }))
}

fn external_create(conn: &Connection, params: &Value) -> Result<Value, HandlerErr> {
    get_required_str(params, "studentId")?;
    get_required_str(params, "assessmentName")?;
    get_required_str(params, "appliedDate")?;
    let fields: AssessmentFields = parse_params(params)?;
    if fields.score.is_none() || fields.max_score.is_none() {
        return Err(HandlerErr::bad_params("missing score or maxScore"));
    }
    if fields.school_level.is_none() || fields.grade_year.is_none() {
        return Err(HandlerErr::bad_params("missing schoolLevel or gradeYear"));
    }

    let now = db::now_rfc3339();
    let mut a = ExternalAssessment {
        id: Uuid::new_v4().to_string(),
        student_id: String::new(),
        assessment_type: ExternalAssessmentType::Outro,
        assessment_name: String::new(),
        subject: None,
        score: 0.0,
        max_score: 0.0,
        proficiency_level: None,
        applied_date: String::new(),
        school_level: SchoolLevel::Medio,
        grade_year: 1,
        quarter: None,
        notes: None,
        created_at: now.clone(),
        updated_at: now,
    };
    apply_fields(conn, &mut a, fields)?;

    conn.execute(
        &format!(
            "INSERT INTO external_assessments({})
             VALUES(?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
            db::EXTERNAL_ASSESSMENT_COLUMNS
        ),
        rusqlite::params![
            &a.id,
            &a.student_id,
            a.assessment_type.as_str(),
            &a.assessment_name,
            &a.subject,
            a.score,
            a.max_score,
            &a.proficiency_level,
            &a.applied_date,
            a.school_level.as_str(),
            a.grade_year,
            &a.quarter,
            &a.notes,
            &a.created_at,
            &a.updated_at,
        ],
    )
    .map_err(|e| HandlerErr::table("db_insert_failed", e, "external_assessments"))?;
    tracing::debug!(id = %a.id, student_id = %a.student_id, "external assessment recorded");
    Ok(json!({ "assessmentId": a.id, "externalAssessment": a }))
}

fn external_update(conn: &Connection, params: &Value) -> Result<Value, HandlerErr> {
    let id = get_required_str(params, "assessmentId")?;
    let mut a = db::load_external_assessment(conn, &id)
        .map_err(HandlerErr::query)?
        .ok_or_else(|| HandlerErr::not_found("external assessment"))?;
    let fields: AssessmentFields = match params.get("patch") {
        Some(p) => parse_params(p)?,
        None => return Err(HandlerErr::bad_params("missing patch")),
    };
    apply_fields(conn, &mut a, fields)?;
    a.updated_at = db::now_rfc3339();

    conn.execute(
        "UPDATE external_assessments SET student_id = ?, assessment_type = ?, assessment_name = ?,
            subject = ?, score = ?, max_score = ?, proficiency_level = ?, applied_date = ?,
            school_level = ?, grade_year = ?, quarter = ?, notes = ?, updated_at = ?
         WHERE id = ?",
        rusqlite::params![
            &a.student_id,
            a.assessment_type.as_str(),
            &a.assessment_name,
            &a.subject,
            a.score,
            a.max_score,
            &a.proficiency_level,
            &a.applied_date,
            a.school_level.as_str(),
            a.grade_year,
            &a.quarter,
            &a.notes,
            &a.updated_at,
            &a.id,
        ],
    )
    .map_err(|e| HandlerErr::table("db_update_failed", e, "external_assessments"))?;
    Ok(json!({ "externalAssessment": a }))
}

fn external_delete(conn: &Connection, params: &Value) -> Result<Value, HandlerErr> {
    let id = get_required_str(params, "assessmentId")?;
    let n = conn
        .execute("DELETE FROM external_assessments WHERE id = ?", [&id])
        .map_err(|e| HandlerErr::table("db_delete_failed", e, "external_assessments"))?;
    if n == 0 {
        return Err(HandlerErr::not_found("external assessment"));
    }
    Ok(json!({ "ok": true }))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct HistoricalGradeInput {
    student_id: String,
    school_level: String,
    grade_year: i64,
    subject: String,
    #[serde(default)]
    quarter: Option<String>,
    /// Number or text; text may use a decimal comma.
    grade: Value,
    #[serde(default)]
    school_name: Option<String>,
    #[serde(default)]
    calendar_year: Option<i32>,
}

fn parse_historical_grade(v: &Value) -> Result<f64, HandlerErr> {
    let grade = match v {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().replace(',', ".").parse::<f64>().ok(),
        _ => None,
    }
    .ok_or_else(|| HandlerErr::bad_params("grade must be a number"))?;
    if !(0.0..=10.0).contains(&grade) {
        return Err(HandlerErr::bad_params("grade must be between 0 and 10"));
    }
    Ok(grade)
}

fn historical_list(conn: &Connection, params: &Value) -> Result<Value, HandlerErr> {
    let student_id = get_optional_str(params, "studentId");
    let grades = db::load_historical_grades(conn, student_id.as_deref()).map_err(HandlerErr::query)?;
    Ok(json!({ "historicalGrades": grades }))
}

/// Inserts or replaces the grade for the same student, level, year, subject,
/// quarter and calendar year.
fn historical_upsert(conn: &Connection, params: &Value) -> Result<Value, HandlerErr> {
    let input: HistoricalGradeInput = parse_params(params)?;
    require_student(conn, &input.student_id)?;
    let school_level = parse_level(&input.school_level)?;
    let grade_year = check_grade_year(school_level, input.grade_year)?;
    let subject = text::collapse_spaces(&input.subject);
    if subject.is_empty() {
        return Err(HandlerErr::bad_params("subject must not be empty"));
    }
    let quarter = check_quarter(input.quarter)?;
    let grade = parse_historical_grade(&input.grade)?;
    let school_name = blank_to_none(input.school_name);
    let now = db::now_rfc3339();

    let existing: Option<String> = conn
        .query_row(
            "SELECT id FROM historical_grades
             WHERE student_id = ? AND school_level = ? AND grade_year = ? AND subject = ?
               AND quarter IS ? AND calendar_year IS ?",
            rusqlite::params![
                &input.student_id,
                school_level.as_str(),
                grade_year,
                &subject,
                &quarter,
                input.calendar_year,
            ],
            |r| r.get(0),
        )
        .optional()
        .map_err(HandlerErr::query)?;

    let id = match existing {
        Some(id) => {
            conn.execute(
                "UPDATE historical_grades SET grade = ?, school_name = ?, updated_at = ? WHERE id = ?",
                (grade, &school_name, &now, &id),
            )
            .map_err(|e| HandlerErr::table("db_update_failed", e, "historical_grades"))?;
            id
        }
        None => {
            let id = Uuid::new_v4().to_string();
            conn.execute(
                "INSERT INTO historical_grades(id, student_id, school_level, grade_year, subject,
                    quarter, grade, school_name, calendar_year, updated_at)
                 VALUES(?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
                rusqlite::params![
                    &id,
                    &input.student_id,
                    school_level.as_str(),
                    grade_year,
                    &subject,
                    &quarter,
                    grade,
                    &school_name,
                    input.calendar_year,
                    &now,
                ],
            )
            .map_err(|e| HandlerErr::table("db_insert_failed", e, "historical_grades"))?;
            id
        }
    };

    let record = HistoricalGrade {
        id,
        student_id: input.student_id,
        school_level,
        grade_year,
        subject,
        quarter,
        grade,
        school_name,
        calendar_year: input.calendar_year,
    };
    Ok(json!({ "historicalGrade": record }))
}

fn historical_delete(conn: &Connection, params: &Value) -> Result<Value, HandlerErr> {
    let id = get_required_str(params, "historicalGradeId")?;
    let n = conn
        .execute("DELETE FROM historical_grades WHERE id = ?", [&id])
        .map_err(|e| HandlerErr::table("db_delete_failed", e, "historical_grades"))?;
    if n == 0 {
        return Err(HandlerErr::not_found("historical grade"));
    }
    Ok(json!({ "ok": true }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<Value> {
    match req.method.as_str() {
        "externalAssessments.list" => Some(with_conn(state, req, external_list)),
        "externalAssessments.create" => Some(with_conn(state, req, external_create)),
        "externalAssessments.update" => Some(with_conn(state, req, external_update)),
        "externalAssessments.delete" => Some(with_conn(state, req, external_delete)),
        "historicalGrades.list" => Some(with_conn(state, req, historical_list)),
        "historicalGrades.upsert" => Some(with_conn(state, req, historical_upsert)),
        "historicalGrades.delete" => Some(with_conn(state, req, historical_delete)),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn grade_year_depends_on_level() {
        assert_eq!(check_grade_year(SchoolLevel::Fundamental, 9).unwrap(), 9);
        assert!(check_grade_year(SchoolLevel::Fundamental, 3).is_err());
        assert_eq!(check_grade_year(SchoolLevel::Medio, 3).unwrap(), 3);
        assert!(check_grade_year(SchoolLevel::Medio, 6).is_err());
        assert!(check_grade_year(SchoolLevel::Medio, -1).is_err());
    }

    #[test]
    fn historical_grade_accepts_decimal_comma() {
        assert_eq!(parse_historical_grade(&json!("7,5")).unwrap(), 7.5);
        assert_eq!(parse_historical_grade(&json!(8)).unwrap(), 8.0);
        assert!(parse_historical_grade(&json!("10,5")).is_err());
        assert!(parse_historical_grade(&json!("n/a")).is_err());
    }
}
