use crate::academic;
use crate::db;
use crate::ipc::handlers::config::school_settings;
use crate::ipc::helpers::{
    get_optional_bool, get_optional_str, get_required_str, parse_params, require_class, row_exists,
    to_json, today, with_conn, HandlerErr,
};
use crate::ipc::types::{AppState, Request};
use crate::model::SchoolClass;
use chrono::{Datelike, NaiveDate};
use rusqlite::{params, Connection};
use serde::Deserialize;
use serde_json::{json, Value};
use uuid::Uuid;

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
struct ClassFields {
    name: Option<String>,
    series: Option<String>,
    letter: Option<String>,
    course: Option<String>,
    active: Option<bool>,
    start_year: Option<i64>,
    start_year_date: Option<String>,
    template_id: Option<String>,
}

fn blank_to_none(v: Option<String>) -> Option<String> {
    v.map(|s| s.trim().to_string()).filter(|s| !s.is_empty())
}

/// Applies `fields` over `cls`. Blank optional strings clear the field.
fn apply_fields(cls: &mut SchoolClass, fields: ClassFields) -> Result<(), HandlerErr> {
    if let Some(name) = fields.name {
        let name = name.trim().to_string();
        if name.is_empty() {
            return Err(HandlerErr::bad_params("name must not be empty"));
        }
        cls.name = name;
    }
    if let Some(series) = fields.series {
        let series = series.trim().to_string();
        if series.is_empty() {
            return Err(HandlerErr::bad_params("series must not be empty"));
        }
        cls.series = series;
    }
    if fields.letter.is_some() {
        cls.letter = blank_to_none(fields.letter).map(|l| l.to_uppercase());
    }
    if fields.course.is_some() {
        cls.course = blank_to_none(fields.course);
    }
    if let Some(active) = fields.active {
        cls.active = active;
    }
    if let Some(y) = fields.start_year {
        let y = u8::try_from(y)
            .ok()
            .filter(|y| (1..=3).contains(y))
            .ok_or_else(|| HandlerErr::bad_params("startYear must be 1, 2 or 3"))?;
        cls.start_year = Some(y);
    }
    if fields.start_year_date.is_some() {
        let date = blank_to_none(fields.start_year_date);
        if let Some(d) = date.as_deref() {
            if academic::parse_date(d).is_none() {
                return Err(HandlerErr::bad_params(format!("invalid startYearDate: {}", d)));
            }
        }
        cls.start_year_date = date;
    }
    if fields.template_id.is_some() {
        cls.template_id = blank_to_none(fields.template_id);
    }
    Ok(())
}

fn check_template(conn: &Connection, cls: &SchoolClass) -> Result<(), HandlerErr> {
    match cls.template_id.as_deref() {
        Some(id) if !row_exists(conn, "subject_templates", id)? => Err(HandlerErr::not_found("template")),
        _ => Ok(()),
    }
}

/// Recomputes the calendar fields that follow from the start date and course year.
fn derive_calendar(cls: &mut SchoolClass, academic_start_month0: u32, today: NaiveDate) {
    let start_year = cls.start_year.unwrap_or(1);
    match cls.start_year_date.as_deref().and_then(academic::parse_date) {
        Some(date) => {
            let first = date.year() - (i32::from(start_year) - 1);
            cls.start_calendar_year = Some(first);
            cls.end_calendar_year = Some(first + 2);
            cls.current_year = Some(academic::current_year_from_date(
                date,
                start_year,
                academic_start_month0,
                today,
            ));
        }
        None => {
            cls.start_calendar_year = None;
            cls.end_calendar_year = None;
            cls.current_year = cls.start_year;
        }
    }
    cls.class_number = academic::class_number(
        cls.course.as_deref(),
        cls.start_year_date.as_deref(),
        cls.start_year,
    );
}

fn write_class(conn: &Connection, cls: &SchoolClass, insert: bool) -> Result<(), HandlerErr> {
    let now = db::now_rfc3339();
    let active = cls.active as i64;
    let archived = cls.archived as i64;
    let start_year = cls.start_year.map(i64::from);
    let current_year = cls.current_year.map(i64::from);
    let values = params![
        cls.name,
        cls.series,
        cls.letter,
        cls.course,
        active,
        start_year,
        current_year,
        cls.start_year_date,
        cls.start_calendar_year,
        cls.end_calendar_year,
        archived,
        cls.archived_at,
        cls.archived_reason,
        cls.template_id,
        cls.class_number,
        now,
        cls.id,
    ];
    if insert {
        conn.execute(
            "INSERT INTO classes(name, series, letter, course, active, start_year, current_year,
                start_year_date, start_calendar_year, end_calendar_year, archived, archived_at,
                archived_reason, template_id, class_number, updated_at, id, created_at)
             VALUES(?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17, ?16)",
            values,
        )
        .map_err(|e| HandlerErr::table("db_insert_failed", e, "classes"))?;
    } else {
        conn.execute(
            "UPDATE classes SET name = ?1, series = ?2, letter = ?3, course = ?4, active = ?5,
                start_year = ?6, current_year = ?7, start_year_date = ?8,
                start_calendar_year = ?9, end_calendar_year = ?10, archived = ?11,
                archived_at = ?12, archived_reason = ?13, template_id = ?14,
                class_number = ?15, updated_at = ?16
             WHERE id = ?17",
            values,
        )
        .map_err(|e| HandlerErr::table("db_update_failed", e, "classes"))?;
    }
    Ok(())
}

fn class_json(cls: &SchoolClass, student_count: i64, today: NaiveDate) -> Result<Value, HandlerErr> {
    let mut v = to_json(cls)?;
    let should_archive = !cls.archived
        && cls
            .start_year_date
            .as_deref()
            .and_then(academic::parse_date)
            .map(|d| academic::should_archive(d, cls.start_year.unwrap_or(1), today))
            .unwrap_or(false);
    v["studentCount"] = json!(student_count);
    v["shouldArchive"] = json!(should_archive);
    Ok(v)
}

fn classes_list(conn: &Connection, params: &Value) -> Result<Value, HandlerErr> {
    let include_archived = get_optional_bool(params, "includeArchived")?.unwrap_or(true);
    let today = today(params)?;
    let counts = db::student_counts(conn).map_err(HandlerErr::query)?;
    let classes = db::load_classes(conn).map_err(HandlerErr::query)?;
    let mut out = Vec::with_capacity(classes.len());
    for cls in classes.iter().filter(|c| include_archived || !c.archived) {
        let n = counts.get(&cls.id).copied().unwrap_or(0);
        out.push(class_json(cls, n, today)?);
    }
    Ok(json!({ "classes": out }))
}

fn classes_create(conn: &Connection, params: &Value) -> Result<Value, HandlerErr> {
    let fields: ClassFields = parse_params(params)?;
    if blank_to_none(fields.name.clone()).is_none() {
        return Err(HandlerErr::bad_params("missing name"));
    }
    if blank_to_none(fields.series.clone()).is_none() {
        return Err(HandlerErr::bad_params("missing series"));
    }
    let mut cls = SchoolClass {
        id: Uuid::new_v4().to_string(),
        name: String::new(),
        series: String::new(),
        letter: None,
        course: None,
        active: true,
        start_year: None,
        current_year: None,
        start_year_date: None,
        start_calendar_year: None,
        end_calendar_year: None,
        archived: false,
        archived_at: None,
        archived_reason: None,
        template_id: None,
        class_number: None,
    };
    apply_fields(&mut cls, fields)?;
    check_template(conn, &cls)?;
    let settings = school_settings(conn)?;
    derive_calendar(&mut cls, settings.academic_start_month0, today(params)?);
    write_class(conn, &cls, true)?;
    tracing::debug!(class_id = %cls.id, "class created");
    Ok(json!({ "classId": cls.id, "class": cls }))
}

fn classes_update(conn: &Connection, params: &Value) -> Result<Value, HandlerErr> {
    let class_id = get_required_str(params, "classId")?;
    let mut cls = require_class(conn, &class_id)?;
    let fields: ClassFields = match params.get("patch") {
        Some(p) => parse_params(p)?,
        None => return Err(HandlerErr::bad_params("missing patch")),
    };
    apply_fields(&mut cls, fields)?;
    check_template(conn, &cls)?;
    let settings = school_settings(conn)?;
    derive_calendar(&mut cls, settings.academic_start_month0, today(params)?);
    write_class(conn, &cls, false)?;
    Ok(json!({ "class": cls }))
}

fn classes_archive(conn: &Connection, params: &Value) -> Result<Value, HandlerErr> {
    let class_id = get_required_str(params, "classId")?;
    let mut cls = require_class(conn, &class_id)?;
    cls.archived = true;
    cls.active = false;
    cls.archived_at = Some(db::now_rfc3339());
    cls.archived_reason = get_optional_str(params, "reason");
    write_class(conn, &cls, false)?;
    Ok(json!({ "class": cls }))
}

fn classes_unarchive(conn: &Connection, params: &Value) -> Result<Value, HandlerErr> {
    let class_id = get_required_str(params, "classId")?;
    let mut cls = require_class(conn, &class_id)?;
    cls.archived = false;
    cls.active = true;
    cls.archived_at = None;
    cls.archived_reason = None;
    write_class(conn, &cls, false)?;
    Ok(json!({ "class": cls }))
}

fn classes_delete(conn: &Connection, params: &Value) -> Result<Value, HandlerErr> {
    let class_id = get_required_str(params, "classId")?;
    require_class(conn, &class_id)?;

    let tx = conn
        .unchecked_transaction()
        .map_err(|e| HandlerErr::new("db_tx_failed", e.to_string()))?;

    // Explicitly delete in dependency order (no ON DELETE CASCADE).
    let steps: [(&str, &str); 13] = [
        (
            "incident_comments",
            "DELETE FROM incident_comments WHERE incident_id IN (SELECT id FROM incidents WHERE class_id = ?)",
        ),
        (
            "follow_ups",
            "DELETE FROM follow_ups WHERE incident_id IN (SELECT id FROM incidents WHERE class_id = ?)",
        ),
        (
            "incident_episodes",
            "DELETE FROM incident_episodes WHERE incident_id IN (SELECT id FROM incidents WHERE class_id = ?)",
        ),
        (
            "incident_students",
            "DELETE FROM incident_students WHERE incident_id IN (SELECT id FROM incidents WHERE class_id = ?)",
        ),
        (
            "incident_students",
            "DELETE FROM incident_students WHERE student_id IN (SELECT id FROM students WHERE class_id = ?)",
        ),
        ("incidents", "DELETE FROM incidents WHERE class_id = ?"),
        ("attendance", "DELETE FROM attendance WHERE class_id = ?"),
        ("grades", "DELETE FROM grades WHERE class_id = ?"),
        (
            "external_assessments",
            "DELETE FROM external_assessments WHERE student_id IN (SELECT id FROM students WHERE class_id = ?)",
        ),
        (
            "historical_grades",
            "DELETE FROM historical_grades WHERE student_id IN (SELECT id FROM students WHERE class_id = ?)",
        ),
        ("professional_subjects", "DELETE FROM professional_subjects WHERE class_id = ?"),
        ("students", "DELETE FROM students WHERE class_id = ?"),
        ("classes", "DELETE FROM classes WHERE id = ?"),
    ];
    for (table, sql) in steps {
        if let Err(e) = tx.execute(sql, [&class_id]) {
            let _ = tx.rollback();
            return Err(HandlerErr::table("db_delete_failed", e, table));
        }
    }

    tx.commit()
        .map_err(|e| HandlerErr::new("db_commit_failed", e.to_string()))?;
    tracing::info!(class_id = %class_id, "class deleted");
    Ok(json!({ "ok": true }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<Value> {
    match req.method.as_str() {
        "classes.list" => Some(with_conn(state, req, classes_list)),
        "classes.create" => Some(with_conn(state, req, classes_create)),
        "classes.update" => Some(with_conn(state, req, classes_update)),
        "classes.archive" => Some(with_conn(state, req, classes_archive)),
        "classes.unarchive" => Some(with_conn(state, req, classes_unarchive)),
        "classes.delete" => Some(with_conn(state, req, classes_delete)),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn blank_class() -> SchoolClass {
        SchoolClass {
            id: "c1".into(),
            name: "1º DS".into(),
            series: "1º ano".into(),
            letter: None,
            course: Some("Desenvolvimento de Sistemas".into()),
            active: true,
            start_year: Some(1),
            current_year: None,
            start_year_date: Some("2024-02-01".into()),
            start_calendar_year: None,
            end_calendar_year: None,
            archived: false,
            archived_at: None,
            archived_reason: None,
            template_id: None,
            class_number: None,
        }
    }

    #[test]
    fn calendar_fields_follow_start_date() {
        let mut cls = blank_class();
        let today = NaiveDate::from_ymd_opt(2025, 5, 10).unwrap();
        derive_calendar(&mut cls, 1, today);
        assert_eq!(cls.start_calendar_year, Some(2024));
        assert_eq!(cls.end_calendar_year, Some(2026));
        assert_eq!(cls.current_year, Some(2));
        assert_eq!(cls.class_number.as_deref(), Some("2024-2026-DS"));
    }

    #[test]
    fn blank_fields_clear_and_bad_years_fail() {
        let mut cls = blank_class();
        apply_fields(
            &mut cls,
            ClassFields {
                course: Some("  ".into()),
                letter: Some("b".into()),
                ..ClassFields::default()
            },
        )
        .unwrap();
        assert_eq!(cls.course, None);
        assert_eq!(cls.letter.as_deref(), Some("B"));

        let e = apply_fields(
            &mut cls,
            ClassFields {
                start_year: Some(4),
                ..ClassFields::default()
            },
        )
        .unwrap_err();
        assert_eq!(e.code, "bad_params");
    }
}
