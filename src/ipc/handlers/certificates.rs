use crate::bundle::{self, BundleCertificate, BundleRequest};
use crate::certificates::{
    self, CertificateEventDraft, CertificateTextInput, EventStudentRow, PeriodMode,
    ReferenceType, SignatureMode, VerificationStatus,
};
use crate::db;
use crate::ipc::handlers::config::school_settings;
use crate::ipc::helpers::{
    get_optional_str, get_required_str, get_school_year, get_string_list, parse_params, require_class,
    to_json, today, with_conn, HandlerErr,
};
use crate::ipc::types::{AppState, Request};
use crate::model::{SchoolClass, StudentStatus};
use chrono::Datelike;
use rusqlite::{Connection, Transaction};
use serde_json::{json, Value};
use std::path::PathBuf;
use uuid::Uuid;

fn period_mode(params: &Value) -> Result<PeriodMode, HandlerErr> {
    match get_optional_str(params, "periodMode") {
        None => Ok(PeriodMode::default()),
        Some(raw) => PeriodMode::parse(&raw).ok_or_else(|| HandlerErr::bad_params(format!("unknown periodMode: {}", raw))),
    }
}

fn certificates_period_label(_conn: &Connection, params: &Value) -> Result<Value, HandlerErr> {
    let mode = period_mode(params)?;
    let selected = get_string_list(params, "selectedQuarters")?;
    let year = match params.get("year").and_then(|v| v.as_i64()) {
        Some(y) => i32::try_from(y).map_err(|_| HandlerErr::bad_params("invalid year"))?,
        None => today(params)?.year(),
    };
    Ok(json!({
        "label": certificates::format_period_label(mode, &selected, year),
        "quarters": certificates::resolve_certificate_quarters(mode, &selected),
    }))
}

/// Class (if any) and the course year certificates for it refer to.
fn reference_scope(conn: &Connection, params: &Value) -> Result<(Option<SchoolClass>, u8), HandlerErr> {
    let cls = match get_optional_str(params, "classId") {
        Some(id) => Some(require_class(conn, &id)?),
        None => None,
    };
    let school_year = match get_school_year(params, "schoolYear")? {
        Some(y) => y,
        None => match &cls {
            Some(c) => certificates::default_school_year_for_class(c, today(params)?),
            None => 1,
        },
    };
    Ok((cls, school_year))
}

fn technical_subjects(conn: &Connection, cls: Option<&SchoolClass>, school_year: u8) -> Result<Vec<String>, HandlerErr> {
    let Some(cls) = cls else {
        return Ok(Vec::new());
    };
    let templates = db::load_templates(conn).map_err(HandlerErr::query)?;
    let manual: Vec<String> = db::load_professional_subjects(conn, Some(&cls.id))
        .map_err(HandlerErr::query)?
        .into_iter()
        .map(|p| p.subject)
        .collect();
    let grades = db::load_grades(conn, Some(&cls.id)).map_err(HandlerErr::query)?;
    Ok(certificates::technical_subjects_for_school_year(
        Some(cls),
        school_year,
        &templates,
        &manual,
        &grades,
    ))
}

fn certificates_references(conn: &Connection, params: &Value) -> Result<Value, HandlerErr> {
    let (cls, school_year) = reference_scope(conn, params)?;
    let technical = technical_subjects(conn, cls.as_ref(), school_year)?;
    Ok(json!({
        "schoolYear": school_year,
        "technicalSubjects": technical,
        "subjects": to_json(&certificates::subject_references_for_class(cls.as_ref(), &technical))?,
        "areas": to_json(&certificates::area_references_for_class(cls.as_ref(), &technical))?,
    }))
}

/// `expectedSubjects` when given; otherwise the subjects the reference points
/// at, or every subject of the class.
fn expected_subjects(
    params: &Value,
    cls: &SchoolClass,
    technical: &[String],
) -> Result<Vec<String>, HandlerErr> {
    let explicit = get_string_list(params, "expectedSubjects")?;
    if !explicit.is_empty() {
        return Ok(explicit);
    }
    let reference_type = get_optional_str(params, "referenceType").and_then(|s| ReferenceType::parse(&s));
    let reference_value = get_optional_str(params, "referenceValue");
    match (reference_type, reference_value) {
        (Some(ReferenceType::Subject), Some(subject)) => Ok(vec![subject]),
        (Some(ReferenceType::Area), Some(area)) => Ok(certificates::area_references_for_class(Some(cls), technical)
            .into_iter()
            .find(|a| a.value == area)
            .map(|a| a.subjects)
            .unwrap_or_default()),
        _ => Ok(certificates::subject_references_for_class(Some(cls), technical)
            .into_iter()
            .map(|s| s.value)
            .collect()),
    }
}

fn certificates_highlight_suggestions(conn: &Connection, params: &Value) -> Result<Value, HandlerErr> {
    get_required_str(params, "classId")?;
    let (cls, school_year) = reference_scope(conn, params)?;
    let Some(cls) = cls else {
        return Err(HandlerErr::bad_params("missing classId"));
    };
    let quarters = certificates::resolve_certificate_quarters(
        period_mode(params)?,
        &get_string_list(params, "selectedQuarters")?,
    );
    let technical = technical_subjects(conn, Some(&cls), school_year)?;
    let expected = expected_subjects(params, &cls, &technical)?;

    let mut students = db::load_students(conn, Some(&cls.id)).map_err(HandlerErr::query)?;
    students.retain(|s| s.status == StudentStatus::Active);
    let grades = db::load_grades(conn, Some(&cls.id)).map_err(HandlerErr::query)?;
    let suggestions =
        certificates::build_highlight_suggestions(&students, &grades, school_year, &quarters, &expected);
    Ok(json!({
        "schoolYear": school_year,
        "quarters": quarters,
        "expectedSubjects": expected,
        "suggestions": to_json(&suggestions)?,
    }))
}

fn certificates_render_text(conn: &Connection, params: &Value) -> Result<Value, HandlerErr> {
    let mut raw = params
        .get("input")
        .cloned()
        .ok_or_else(|| HandlerErr::bad_params("missing input"))?;
    let needs_school = raw
        .get("schoolName")
        .and_then(|v| v.as_str())
        .map(|s| s.trim().is_empty())
        .unwrap_or(true);
    if needs_school {
        if let Some(obj) = raw.as_object_mut() {
            obj.insert("schoolName".into(), json!(school_settings(conn)?.name));
        }
    }
    let input: CertificateTextInput = parse_params(&raw)?;
    Ok(json!({ "text": certificates::render_certificate_text(&input) }))
}

fn certificate_events_list(conn: &Connection, _params: &Value) -> Result<Value, HandlerErr> {
    let repaired = db::repair_missing_verification_codes(conn).map_err(HandlerErr::query)?;
    if repaired > 0 {
        tracing::info!(repaired, "filled missing certificate verification codes");
    }
    let events = db::load_certificate_events(conn).map_err(HandlerErr::query)?;
    Ok(json!({ "events": to_json(&events)? }))
}

fn load_event(conn: &Connection, event_id: &str) -> Result<certificates::CertificateEvent, HandlerErr> {
    db::load_certificate_event(conn, event_id)
        .map_err(HandlerErr::query)?
        .ok_or_else(|| HandlerErr::not_found("certificate event"))
}

fn certificate_events_get(conn: &Connection, params: &Value) -> Result<Value, HandlerErr> {
    let event_id = get_required_str(params, "eventId")?;
    Ok(json!({ "event": to_json(&load_event(conn, &event_id)?)? }))
}

/// Draft fields after validation, ready to be written.
struct EventFields {
    draft: CertificateEventDraft,
    school_year: u8,
    class_name: String,
    quarters: Vec<String>,
    period_label: String,
}

fn prepare_event(conn: &Connection, params: &Value) -> Result<EventFields, HandlerErr> {
    let mut draft: CertificateEventDraft = match params.get("event") {
        Some(v) => parse_params(v)?,
        None => return Err(HandlerErr::bad_params("missing event")),
    };
    let school_year = certificates::validate_event_draft(&draft).map_err(HandlerErr::validation)?;
    draft.class_id = draft
        .class_id
        .take()
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty());
    let class_name = match draft.class_id.as_deref() {
        Some(id) => {
            let cls = require_class(conn, id)?;
            match draft.class_name_snapshot.trim() {
                "" => cls.name,
                snapshot => snapshot.to_string(),
            }
        }
        None => draft.class_name_snapshot.trim().to_string(),
    };
    let quarters = certificates::resolve_certificate_quarters(draft.period_mode, &draft.selected_quarters);
    let period_label = match draft.period_label.as_deref().map(str::trim).filter(|s| !s.is_empty()) {
        Some(label) => label.to_string(),
        None => certificates::format_period_label(draft.period_mode, &quarters, today(params)?.year()),
    };
    Ok(EventFields {
        draft,
        school_year,
        class_name,
        quarters,
        period_label,
    })
}

fn insert_event_student(
    tx: &Transaction<'_>,
    event_id: &str,
    row: &EventStudentRow,
    now: &str,
) -> rusqlite::Result<usize> {
    tx.execute(
        "INSERT INTO certificate_event_students(id, certificate_event_id, student_id,
            student_name_snapshot, text_override, highlight_status, highlight_average,
            verification_code, verification_status, created_at)
         VALUES(?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        (
            Uuid::new_v4().to_string(),
            event_id,
            &row.student_id,
            &row.student_name_snapshot,
            &row.text_override,
            row.highlight_status.map(|h| h.as_str()),
            row.highlight_average,
            &row.verification_code,
            row.verification_status.as_str(),
            now,
        ),
    )
}

fn type_meta_json(fields: &EventFields) -> String {
    fields
        .draft
        .type_meta
        .as_ref()
        .filter(|v| v.is_object())
        .map(|v| v.to_string())
        .unwrap_or_else(|| "{}".to_string())
}

fn certificate_events_create(conn: &Connection, params: &Value) -> Result<Value, HandlerErr> {
    let fields = prepare_event(conn, params)?;
    let created_by = get_optional_str(params, "createdByName").unwrap_or_else(|| "Sistema".to_string());
    let plan = certificates::reconcile_event_students(&[], fields.draft.students.clone());
    let event_id = Uuid::new_v4().to_string();
    let now = db::now_rfc3339();
    let quarters_json = serde_json::to_string(&fields.quarters).map_err(|e| HandlerErr::new("internal_error", e.to_string()))?;

    let tx = conn
        .unchecked_transaction()
        .map_err(|e| HandlerErr::new("db_tx_failed", e.to_string()))?;
    let draft = &fields.draft;
    if let Err(e) = tx.execute(
        "INSERT INTO certificate_events(id, created_by_name, title, certificate_type, class_id,
            class_name_snapshot, school_year, period_mode, selected_quarters, period_label,
            reference_type, reference_value, reference_label, base_text, teacher_name,
            director_name, signature_mode, type_meta, students_count, created_at, updated_at)
         VALUES(?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17, ?18, ?19, ?20, ?20)",
        rusqlite::params![
            &event_id,
            &created_by,
            draft.title.trim(),
            draft.certificate_type.as_str(),
            &draft.class_id,
            &fields.class_name,
            i64::from(fields.school_year),
            draft.period_mode.as_str(),
            &quarters_json,
            &fields.period_label,
            draft.reference_type.map(|r| r.as_str()),
            &draft.reference_value,
            &draft.reference_label,
            draft.base_text.trim(),
            &draft.teacher_name,
            &draft.director_name,
            draft.signature_mode.as_str(),
            type_meta_json(&fields),
            plan.inserts.len() as i64,
            &now,
        ],
    ) {
        let _ = tx.rollback();
        return Err(HandlerErr::table("db_insert_failed", e, "certificate_events"));
    }
    for row in &plan.inserts {
        if let Err(e) = insert_event_student(&tx, &event_id, row, &now) {
            let _ = tx.rollback();
            return Err(HandlerErr::table("db_insert_failed", e, "certificate_event_students"));
        }
    }
    tx.commit()
        .map_err(|e| HandlerErr::new("db_commit_failed", e.to_string()))?;
    tracing::info!(event = %event_id, students = plan.inserts.len(), "certificate event created");

    Ok(json!({ "eventId": event_id, "event": to_json(&load_event(conn, &event_id)?)? }))
}

/// Re-saves an event. Students already on it keep their verification code and
/// revocation; dropped students lose their rows.
fn certificate_events_update(conn: &Connection, params: &Value) -> Result<Value, HandlerErr> {
    let event_id = get_required_str(params, "eventId")?;
    let existing = load_event(conn, &event_id)?;
    let fields = prepare_event(conn, params)?;
    let plan = certificates::reconcile_event_students(&existing.students, fields.draft.students.clone());
    let count = plan.updates.len() + plan.inserts.len();
    let now = db::now_rfc3339();
    let quarters_json = serde_json::to_string(&fields.quarters).map_err(|e| HandlerErr::new("internal_error", e.to_string()))?;

    let tx = conn
        .unchecked_transaction()
        .map_err(|e| HandlerErr::new("db_tx_failed", e.to_string()))?;
    let draft = &fields.draft;
    if let Err(e) = tx.execute(
        "UPDATE certificate_events SET title = ?1, certificate_type = ?2, class_id = ?3,
            class_name_snapshot = ?4, school_year = ?5, period_mode = ?6, selected_quarters = ?7,
            period_label = ?8, reference_type = ?9, reference_value = ?10, reference_label = ?11,
            base_text = ?12, teacher_name = ?13, director_name = ?14, signature_mode = ?15,
            type_meta = ?16, students_count = ?17, updated_at = ?18
         WHERE id = ?19",
        rusqlite::params![
            draft.title.trim(),
            draft.certificate_type.as_str(),
            &draft.class_id,
            &fields.class_name,
            i64::from(fields.school_year),
            draft.period_mode.as_str(),
            &quarters_json,
            &fields.period_label,
            draft.reference_type.map(|r| r.as_str()),
            &draft.reference_value,
            &draft.reference_label,
            draft.base_text.trim(),
            &draft.teacher_name,
            &draft.director_name,
            draft.signature_mode.as_str(),
            type_meta_json(&fields),
            count as i64,
            &now,
            &event_id,
        ],
    ) {
        let _ = tx.rollback();
        return Err(HandlerErr::table("db_update_failed", e, "certificate_events"));
    }

    for (row_id, row) in &plan.updates {
        if let Err(e) = tx.execute(
            "UPDATE certificate_event_students SET student_id = ?, student_name_snapshot = ?,
                text_override = ?, highlight_status = ?, highlight_average = ?,
                verification_code = ?, verification_status = ?
             WHERE id = ?",
            (
                &row.student_id,
                &row.student_name_snapshot,
                &row.text_override,
                row.highlight_status.map(|h| h.as_str()),
                row.highlight_average,
                &row.verification_code,
                row.verification_status.as_str(),
                row_id,
            ),
        ) {
            let _ = tx.rollback();
            return Err(HandlerErr::table("db_update_failed", e, "certificate_event_students"));
        }
    }
    for row in &plan.inserts {
        if let Err(e) = insert_event_student(&tx, &event_id, row, &now) {
            let _ = tx.rollback();
            return Err(HandlerErr::table("db_insert_failed", e, "certificate_event_students"));
        }
    }
    for row_id in &plan.deletes {
        if let Err(e) = tx.execute("DELETE FROM certificate_event_students WHERE id = ?", [row_id]) {
            let _ = tx.rollback();
            return Err(HandlerErr::table("db_delete_failed", e, "certificate_event_students"));
        }
    }
    tx.commit()
        .map_err(|e| HandlerErr::new("db_commit_failed", e.to_string()))?;
    tracing::info!(
        event = %event_id,
        kept = plan.updates.len(),
        added = plan.inserts.len(),
        removed = plan.deletes.len(),
        "certificate event updated"
    );

    Ok(json!({ "event": to_json(&load_event(conn, &event_id)?)? }))
}

fn certificate_events_delete(conn: &Connection, params: &Value) -> Result<Value, HandlerErr> {
    let event_id = get_required_str(params, "eventId")?;
    load_event(conn, &event_id)?;
    let tx = conn
        .unchecked_transaction()
        .map_err(|e| HandlerErr::new("db_tx_failed", e.to_string()))?;
    if let Err(e) = tx.execute(
        "DELETE FROM certificate_event_students WHERE certificate_event_id = ?",
        [&event_id],
    ) {
        let _ = tx.rollback();
        return Err(HandlerErr::table("db_delete_failed", e, "certificate_event_students"));
    }
    if let Err(e) = tx.execute("DELETE FROM certificate_events WHERE id = ?", [&event_id]) {
        let _ = tx.rollback();
        return Err(HandlerErr::table("db_delete_failed", e, "certificate_events"));
    }
    tx.commit()
        .map_err(|e| HandlerErr::new("db_commit_failed", e.to_string()))?;
    Ok(json!({ "ok": true }))
}

fn certificates_verify(conn: &Connection, params: &Value) -> Result<Value, HandlerErr> {
    let raw = get_optional_str(params, "code").unwrap_or_default();
    let code = certificates::normalize_verification_code(&raw).map_err(HandlerErr::validation)?;
    let Some(row) = db::find_by_verification_code(conn, &code).map_err(HandlerErr::query)? else {
        return Ok(json!({ "found": false, "code": code }));
    };
    Ok(json!({
        "found": true,
        "code": code,
        "valid": row.verification_status == VerificationStatus::Valid,
        "status": row.verification_status.as_str(),
        "verificationCode": row.verification_code,
        "issuedAt": row.issued_at,
        "studentName": row.student_name,
        "certificateType": row.certificate_type.as_str(),
        "certificateTypeLabel": row.certificate_type.label(),
        "eventTitle": row.event_title,
        "className": row.class_name,
    }))
}

fn certificates_set_verification_status(conn: &Connection, params: &Value) -> Result<Value, HandlerErr> {
    let raw = get_required_str(params, "code")?;
    let code = certificates::normalize_verification_code(&raw).map_err(HandlerErr::validation)?;
    let status = match get_required_str(params, "status")?.as_str() {
        "valid" => VerificationStatus::Valid,
        "revoked" => VerificationStatus::Revoked,
        other => return Err(HandlerErr::bad_params(format!("unknown verification status: {}", other))),
    };
    let changed = conn
        .execute(
            "UPDATE certificate_event_students SET verification_status = ?
             WHERE UPPER(verification_code) = ?",
            (status.as_str(), &code),
        )
        .map_err(|e| HandlerErr::table("db_update_failed", e, "certificate_event_students"))?;
    if changed == 0 {
        return Err(HandlerErr::not_found("certificate"));
    }
    tracing::info!(code = %code, status = status.as_str(), "certificate verification status changed");
    Ok(json!({ "ok": true, "code": code, "status": status.as_str() }))
}

fn certificates_export_bundle(conn: &Connection, params: &Value) -> Result<Value, HandlerErr> {
    let event_id = get_required_str(params, "eventId")?;
    let out_path = PathBuf::from(get_required_str(params, "outPath")?);
    let subset = get_string_list(params, "studentIds")?;
    let event = load_event(conn, &event_id)?;
    let school_name = school_settings(conn)?.name;

    let input = certificates::build_export_input(&event, &subset);
    let request = BundleRequest {
        title: input.title.clone(),
        certificate_type: input.certificate_type.as_str().to_string(),
        certificate_type_label: input.certificate_type.label().to_string(),
        class_name: input.class_name.clone(),
        period_label: input.period_label.clone(),
        teacher_name: input.teacher_name.clone(),
        director_name: input.director_name.clone(),
        physical_signature: input.signature_mode == SignatureMode::PhysicalPrint,
        certificates: input
            .students
            .iter()
            .map(|s| BundleCertificate {
                student_name: s.name.clone(),
                text: certificates::render_for_student(&input, s, &school_name),
                verification_code: s.verification_code.clone(),
                revoked: s.verification_status == VerificationStatus::Revoked,
            })
            .collect(),
    };

    let summary = bundle::export_certificate_bundle(&request, &school_name, &out_path)
        .map_err(|e| HandlerErr::new("io_failed", format!("{e:?}")))?;
    let manifest = bundle::read_bundle_manifest(&out_path)
        .map_err(|e| HandlerErr::new("io_failed", format!("{e:?}")))?;
    tracing::info!(
        event = %event_id,
        certificates = summary.certificate_count,
        path = %out_path.display(),
        "certificate bundle exported"
    );
    Ok(json!({
        "ok": true,
        "path": out_path.to_string_lossy(),
        "bundleFormat": summary.bundle_format,
        "entryCount": summary.entry_count,
        "certificateCount": summary.certificate_count,
        "manifest": to_json(&manifest)?,
    }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<Value> {
    match req.method.as_str() {
        "certificates.periodLabel" => Some(with_conn(state, req, certificates_period_label)),
        "certificates.references" => Some(with_conn(state, req, certificates_references)),
        "certificates.highlightSuggestions" => Some(with_conn(state, req, certificates_highlight_suggestions)),
        "certificates.renderText" => Some(with_conn(state, req, certificates_render_text)),
        "certificateEvents.list" => Some(with_conn(state, req, certificate_events_list)),
        "certificateEvents.get" => Some(with_conn(state, req, certificate_events_get)),
        "certificateEvents.create" => Some(with_conn(state, req, certificate_events_create)),
        "certificateEvents.update" => Some(with_conn(state, req, certificate_events_update)),
        "certificateEvents.delete" => Some(with_conn(state, req, certificate_events_delete)),
        "certificates.verify" => Some(with_conn(state, req, certificates_verify)),
        "certificates.setVerificationStatus" => Some(with_conn(state, req, certificates_set_verification_status)),
        "certificates.exportBundle" => Some(with_conn(state, req, certificates_export_bundle)),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn period_mode_defaults_to_quarters() {
        assert_eq!(period_mode(&json!({})).unwrap(), PeriodMode::Quarters);
        assert_eq!(period_mode(&json!({ "periodMode": "annual" })).unwrap(), PeriodMode::Annual);
        assert_eq!(period_mode(&json!({ "periodMode": "semester" })).unwrap_err().code, "bad_params");
    }
}
