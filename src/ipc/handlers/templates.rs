use crate::db;
use crate::ipc::helpers::{
    class_exists, get_required_str, get_string_list, parse_params, row_exists, with_conn,
    HandlerErr,
};
use crate::ipc::types::{AppState, Request};
use crate::model::YearSubjects;
use crate::text;
use rusqlite::Connection;
use serde::Deserialize;
use serde_json::{json, Value};
use uuid::Uuid;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct TemplateDraft {
    name: String,
    #[serde(default)]
    course: Option<String>,
    subjects_by_year: Vec<YearSubjects>,
}

/// Drops blank subjects, dedupes each year and rejects years outside 1..=3.
fn normalize_years(years: Vec<YearSubjects>) -> Result<Vec<YearSubjects>, HandlerErr> {
    let mut out: Vec<YearSubjects> = Vec::new();
    for entry in years {
        if !(1..=3).contains(&entry.year) {
            return Err(HandlerErr::bad_params(format!(
                "template year must be 1, 2 or 3 (got {})",
                entry.year
            )));
        }
        let subjects = text::dedupe_sorted(
            entry
                .subjects
                .into_iter()
                .map(|s| text::collapse_spaces(s.trim()))
                .filter(|s| !s.is_empty()),
        );
        match out.iter_mut().find(|y| y.year == entry.year) {
            Some(existing) => {
                existing.subjects =
                    text::dedupe_sorted(existing.subjects.drain(..).chain(subjects));
            }
            None => out.push(YearSubjects {
                year: entry.year,
                subjects,
            }),
        }
    }
    out.sort_by_key(|y| y.year);
    Ok(out)
}

fn templates_list(conn: &Connection, _params: &Value) -> Result<Value, HandlerErr> {
    let templates = db::load_templates(conn).map_err(HandlerErr::query)?;
    Ok(json!({ "templates": templates }))
}

fn templates_create(conn: &Connection, params: &Value) -> Result<Value, HandlerErr> {
    let draft: TemplateDraft = parse_params(params)?;
    let name = draft.name.trim().to_string();
    if name.is_empty() {
        return Err(HandlerErr::bad_params("name must not be empty"));
    }
    let course = draft
        .course
        .map(|c| c.trim().to_string())
        .filter(|c| !c.is_empty());
    let years = normalize_years(draft.subjects_by_year)?;
    let encoded =
        serde_json::to_string(&years).map_err(|e| HandlerErr::bad_params(e.to_string()))?;

    let id = Uuid::new_v4().to_string();
    conn.execute(
        "INSERT INTO subject_templates(id, name, course, subjects_by_year, created_at)
         VALUES(?, ?, ?, ?, ?)",
        (&id, &name, &course, &encoded, db::now_rfc3339()),
    )
    .map_err(|e| HandlerErr::table("db_insert_failed", e, "subject_templates"))?;

    Ok(json!({
        "templateId": id,
        "template": { "id": id, "name": name, "course": course, "subjectsByYear": years }
    }))
}

fn templates_delete(conn: &Connection, params: &Value) -> Result<Value, HandlerErr> {
    let template_id = get_required_str(params, "templateId")?;
    if !row_exists(conn, "subject_templates", &template_id)? {
        return Err(HandlerErr::not_found("template"));
    }
    let tx = conn
        .unchecked_transaction()
        .map_err(|e| HandlerErr::new("db_tx_failed", e.to_string()))?;
    if let Err(e) = tx.execute(
        "UPDATE classes SET template_id = NULL WHERE template_id = ?",
        [&template_id],
    ) {
        let _ = tx.rollback();
        return Err(HandlerErr::table("db_update_failed", e, "classes"));
    }
    if let Err(e) = tx.execute("DELETE FROM subject_templates WHERE id = ?", [&template_id]) {
        let _ = tx.rollback();
        return Err(HandlerErr::table("db_delete_failed", e, "subject_templates"));
    }
    tx.commit()
        .map_err(|e| HandlerErr::new("db_commit_failed", e.to_string()))?;
    Ok(json!({ "ok": true }))
}

fn professional_subjects_list(conn: &Connection, params: &Value) -> Result<Value, HandlerErr> {
    let class_id = params.get("classId").and_then(|v| v.as_str());
    let subjects = db::load_professional_subjects(conn, class_id).map_err(HandlerErr::query)?;
    Ok(json!({ "subjects": subjects }))
}

/// Replaces the professional subjects mapped to a class.
fn professional_subjects_set(conn: &Connection, params: &Value) -> Result<Value, HandlerErr> {
    let class_id = get_required_str(params, "classId")?;
    if !class_exists(conn, &class_id)? {
        return Err(HandlerErr::not_found("class"));
    }
    let subjects = text::dedupe_sorted(
        get_string_list(params, "subjects")?
            .into_iter()
            .map(|s| text::collapse_spaces(&s))
            .filter(|s| !s.is_empty()),
    );

    let tx = conn
        .unchecked_transaction()
        .map_err(|e| HandlerErr::new("db_tx_failed", e.to_string()))?;
    if let Err(e) = tx.execute(
        "DELETE FROM professional_subjects WHERE class_id = ?",
        [&class_id],
    ) {
        let _ = tx.rollback();
        return Err(HandlerErr::table("db_delete_failed", e, "professional_subjects"));
    }
    for subject in &subjects {
        if let Err(e) = tx.execute(
            "INSERT INTO professional_subjects(id, class_id, subject) VALUES(?, ?, ?)",
            (Uuid::new_v4().to_string(), &class_id, subject),
        ) {
            let _ = tx.rollback();
            return Err(HandlerErr::table("db_insert_failed", e, "professional_subjects"));
        }
    }
    tx.commit()
        .map_err(|e| HandlerErr::new("db_commit_failed", e.to_string()))?;
    Ok(json!({ "classId": class_id, "subjects": subjects }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<Value> {
    match req.method.as_str() {
        "templates.list" => Some(with_conn(state, req, templates_list)),
        "templates.create" => Some(with_conn(state, req, templates_create)),
        "templates.delete" => Some(with_conn(state, req, templates_delete)),
        "professionalSubjects.list" => Some(with_conn(state, req, professional_subjects_list)),
        "professionalSubjects.set" => Some(with_conn(state, req, professional_subjects_set)),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn years_are_merged_and_cleaned() {
        let years = normalize_years(vec![
            YearSubjects {
                year: 2,
                subjects: vec!["Banco de Dados".into(), " ".into()],
            },
            YearSubjects {
                year: 1,
                subjects: vec!["Lógica  de Programação".into()],
            },
            YearSubjects {
                year: 2,
                subjects: vec!["Banco de Dados".into(), "Redes".into()],
            },
        ])
        .unwrap();
        assert_eq!(years.len(), 2);
        assert_eq!(years[0].subjects, vec!["Lógica de Programação".to_string()]);
        assert_eq!(
            years[1].subjects,
            vec!["Banco de Dados".to_string(), "Redes".to_string()]
        );

        assert!(normalize_years(vec![YearSubjects {
            year: 4,
            subjects: vec![]
        }])
        .is_err());
    }
}
