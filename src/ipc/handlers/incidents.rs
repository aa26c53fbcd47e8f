use crate::db;
use crate::incidents::{self, Incident, IncidentDraft, IncidentStatus, IncidentType, Severity};
use crate::ipc::helpers::{
    get_optional_bool, get_optional_str, get_required_str, parse_params, today, to_json, with_conn,
    HandlerErr,
};
use crate::ipc::types::{AppState, Request};
use rusqlite::Connection;
use serde::Deserialize;
use serde_json::{json, Value};
use std::collections::{BTreeMap, HashSet};
use uuid::Uuid;

const SYSTEM_AUTHOR: &str = "Sistema";

pub(super) fn load_incident(conn: &Connection, incident_id: &str) -> Result<Incident, HandlerErr> {
    db::load_incident(conn, incident_id)
        .map_err(HandlerErr::query)?
        .ok_or_else(|| HandlerErr::not_found("incident"))
}

/// Ids that are not students of `class_id`.
fn foreign_students(conn: &Connection, class_id: &str, student_ids: &[String]) -> Result<Vec<String>, HandlerErr> {
    let roster: HashSet<String> = db::load_students(conn, Some(class_id))
        .map_err(HandlerErr::query)?
        .into_iter()
        .map(|s| s.id)
        .collect();
    Ok(student_ids
        .iter()
        .filter(|id| !roster.contains(*id))
        .cloned()
        .collect())
}

fn clean_ids(ids: &[String]) -> Vec<String> {
    let mut seen = HashSet::new();
    ids.iter()
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty() && seen.insert(s.clone()))
        .collect()
}

fn incidents_episodes(_conn: &Connection, params: &Value) -> Result<Value, HandlerErr> {
    let kind = match get_optional_str(params, "incidentType") {
        Some(s) => IncidentType::parse(&s)
            .ok_or_else(|| HandlerErr::bad_params(format!("unknown incidentType: {}", s)))?,
        None => IncidentType::Disciplinar,
    };
    let severities: Vec<Value> = Severity::ALL
        .iter()
        .map(|s| json!({ "value": s.as_str(), "label": s.label(kind) }))
        .collect();
    Ok(json!({
        "incidentType": kind.as_str(),
        "label": kind.label(),
        "episodes": kind.episodes(),
        "severities": severities
    }))
}

/// Severity, escalation and follow-up suggestion for a draft, without saving.
fn incidents_preview(conn: &Connection, params: &Value) -> Result<Value, HandlerErr> {
    let draft: IncidentDraft = parse_params(params)?;
    let catalog = draft.incident_type.episodes();
    let calculated = incidents::calculate_severity(&draft.episodes, catalog);
    let final_severity = draft.final_severity.unwrap_or(calculated);
    let student_ids = clean_ids(&draft.student_ids);

    let history = db::load_incidents(conn, None).map_err(HandlerErr::query)?;
    let level = incidents::calculate_action_level(&student_ids, final_severity, &history);
    let per_student: BTreeMap<&str, incidents::SeverityCounts> = student_ids
        .iter()
        .map(|s| (s.as_str(), incidents::student_history(s, &history)))
        .collect();
    let follow_up = incidents::suggest_follow_up_type(level.text(), Some(final_severity));

    Ok(json!({
        "calculatedSeverity": calculated,
        "finalSeverity": final_severity,
        "severityLabel": final_severity.label(draft.incident_type),
        "overrideReasonRequired": final_severity != calculated,
        "actionLevel": level,
        "suggestedAction": level.text(),
        "history": per_student,
        "worstHistory": incidents::worst_history(&student_ids, &history),
        "suggestedFollowUpType": follow_up.as_str(),
        "defaultMotivo": incidents::default_motivo(final_severity),
    }))
}

fn insert_incident(conn: &Connection, incident: &Incident) -> Result<(), HandlerErr> {
    let tx = conn
        .unchecked_transaction()
        .map_err(|e| HandlerErr::new("db_tx_failed", e.to_string()))?;
    if let Err(e) = tx.execute(
        "INSERT INTO incidents(id, class_id, date, incident_type, calculated_severity,
            final_severity, severity_override_reason, description, actions, suggested_action,
            status, validated_by, validated_at, created_by, created_at, updated_at)
         VALUES(?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        (
            &incident.id,
            &incident.class_id,
            &incident.date,
            incident.incident_type.as_str(),
            incident.calculated_severity.as_str(),
            incident.final_severity.as_str(),
            &incident.severity_override_reason,
            &incident.description,
            &incident.actions,
            &incident.suggested_action,
            incident.status.as_str(),
            &incident.validated_by,
            &incident.validated_at,
            &incident.created_by,
            &incident.created_at,
            &incident.updated_at,
        ),
    ) {
        let _ = tx.rollback();
        return Err(HandlerErr::table("db_insert_failed", e, "incidents"));
    }
    if let Err(e) = write_links(&tx, incident) {
        let _ = tx.rollback();
        return Err(e);
    }
    tx.commit()
        .map_err(|e| HandlerErr::new("db_commit_failed", e.to_string()))
}

/// Rewrites the student and episode links of an incident.
fn write_links(conn: &Connection, incident: &Incident) -> Result<(), HandlerErr> {
    conn.execute("DELETE FROM incident_students WHERE incident_id = ?", [&incident.id])
        .map_err(|e| HandlerErr::table("db_delete_failed", e, "incident_students"))?;
    conn.execute("DELETE FROM incident_episodes WHERE incident_id = ?", [&incident.id])
        .map_err(|e| HandlerErr::table("db_delete_failed", e, "incident_episodes"))?;
    for student_id in &incident.student_ids {
        conn.execute(
            "INSERT INTO incident_students(incident_id, student_id) VALUES(?, ?)",
            (&incident.id, student_id),
        )
        .map_err(|e| HandlerErr::table("db_insert_failed", e, "incident_students"))?;
    }
    for (i, episode) in incident.episodes.iter().enumerate() {
        conn.execute(
            "INSERT INTO incident_episodes(incident_id, episode_id, sort_order) VALUES(?, ?, ?)",
            (&incident.id, episode, i as i64),
        )
        .map_err(|e| HandlerErr::table("db_insert_failed", e, "incident_episodes"))?;
    }
    Ok(())
}

fn non_blank(v: Option<String>) -> Option<String> {
    v.map(|s| s.trim().to_string()).filter(|s| !s.is_empty())
}

fn incidents_create(conn: &Connection, params: &Value) -> Result<Value, HandlerErr> {
    let mut draft: IncidentDraft = parse_params(params)?;
    draft.student_ids = clean_ids(&draft.student_ids);
    draft.episodes = clean_ids(&draft.episodes);
    let severity = incidents::validate_new_incident(&draft).map_err(HandlerErr::validation)?;
    let class_id = draft.class_id.trim().to_string();
    if db::load_class(conn, &class_id).map_err(HandlerErr::query)?.is_none() {
        return Err(HandlerErr::not_found("class"));
    }
    let foreign = foreign_students(conn, &class_id, &draft.student_ids)?;
    if !foreign.is_empty() {
        return Err(HandlerErr {
            code: "not_found",
            message: "student not found in class".to_string(),
            details: Some(json!({ "studentIds": foreign })),
        });
    }
    if draft.description.trim().is_empty() {
        return Err(HandlerErr::bad_params("description must not be empty"));
    }

    let date = match non_blank(draft.date) {
        Some(d) => {
            if crate::academic::parse_date(&d).is_none() {
                return Err(HandlerErr::bad_params(format!("invalid date: {}", d)));
            }
            d
        }
        None => today(params)?.format("%Y-%m-%d").to_string(),
    };
    let history = db::load_incidents(conn, None).map_err(HandlerErr::query)?;
    let suggested_action = non_blank(draft.suggested_action).unwrap_or_else(|| {
        incidents::calculate_suggested_action(&draft.student_ids, severity.final_severity, &history)
            .to_string()
    });

    let now = db::now_rfc3339();
    let incident = Incident {
        id: Uuid::new_v4().to_string(),
        class_id,
        date,
        incident_type: draft.incident_type,
        student_ids: draft.student_ids,
        episodes: draft.episodes,
        calculated_severity: severity.calculated,
        final_severity: severity.final_severity,
        severity_override_reason: if severity.final_severity != severity.calculated {
            non_blank(draft.severity_override_reason)
        } else {
            None
        },
        description: draft.description.trim().to_string(),
        actions: non_blank(draft.actions),
        suggested_action: Some(suggested_action),
        status: IncidentStatus::Aberta,
        validated_by: None,
        validated_at: None,
        follow_ups: Vec::new(),
        comments: Vec::new(),
        created_by: non_blank(draft.created_by).unwrap_or_else(|| SYSTEM_AUTHOR.to_string()),
        created_at: now.clone(),
        updated_at: now,
    };
    insert_incident(conn, &incident)?;
    tracing::info!(
        incident_id = %incident.id,
        severity = incident.final_severity.as_str(),
        "incident created"
    );
    Ok(json!({ "incidentId": incident.id, "incident": incident }))
}

fn incidents_list(conn: &Connection, params: &Value) -> Result<Value, HandlerErr> {
    let class_id = get_optional_str(params, "classId");
    let student_id = get_optional_str(params, "studentId");
    let status = match get_optional_str(params, "status") {
        Some(s) => Some(
            IncidentStatus::parse(&s)
                .ok_or_else(|| HandlerErr::bad_params(format!("unknown status: {}", s)))?,
        ),
        None => None,
    };
    let kind = match get_optional_str(params, "incidentType") {
        Some(s) => Some(
            IncidentType::parse(&s)
                .ok_or_else(|| HandlerErr::bad_params(format!("unknown incidentType: {}", s)))?,
        ),
        None => None,
    };

    let mut list = db::load_incidents(conn, class_id.as_deref()).map_err(HandlerErr::query)?;
    list.retain(|i| {
        status.map(|s| i.status == s).unwrap_or(true)
            && kind.map(|k| i.incident_type == k).unwrap_or(true)
            && student_id
                .as_deref()
                .map(|s| i.student_ids.iter().any(|x| x == s))
                .unwrap_or(true)
    });
    Ok(json!({ "incidents": list }))
}

fn incidents_get(conn: &Connection, params: &Value) -> Result<Value, HandlerErr> {
    let incident_id = get_required_str(params, "incidentId")?;
    let incident = load_incident(conn, &incident_id)?;
    // Parent notices for low performance carry no sanction wording.
    let performance_convocation =
        incidents::is_performance_convocation(&incident.description, incident.suggested_action.as_deref());
    Ok(json!({ "incident": incident, "performanceConvocation": performance_convocation }))
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
struct IncidentPatch {
    date: Option<String>,
    student_ids: Option<Vec<String>>,
    episodes: Option<Vec<String>>,
    final_severity: Option<Severity>,
    severity_override_reason: Option<String>,
    description: Option<String>,
    actions: Option<String>,
    suggested_action: Option<String>,
}

/// Edits an incident. The merged record goes through the same checks as a new one.
fn incidents_update(conn: &Connection, params: &Value) -> Result<Value, HandlerErr> {
    let incident_id = get_required_str(params, "incidentId")?;
    let mut incident = load_incident(conn, &incident_id)?;
    let patch: IncidentPatch = match params.get("patch") {
        Some(p) => parse_params(p)?,
        None => return Err(HandlerErr::bad_params("missing patch")),
    };

    let student_ids = patch
        .student_ids
        .as_deref()
        .map(clean_ids)
        .unwrap_or_else(|| incident.student_ids.clone());
    let episodes = patch
        .episodes
        .as_deref()
        .map(clean_ids)
        .unwrap_or_else(|| incident.episodes.clone());
    // A new episode selection recomputes the severity unless one is given.
    let final_severity = patch.final_severity.or_else(|| {
        if patch.episodes.is_some() {
            None
        } else {
            Some(incident.final_severity)
        }
    });
    let draft = IncidentDraft {
        class_id: incident.class_id.clone(),
        date: Some(incident.date.clone()),
        incident_type: incident.incident_type,
        student_ids,
        episodes,
        final_severity,
        severity_override_reason: patch
            .severity_override_reason
            .clone()
            .or_else(|| incident.severity_override_reason.clone()),
        description: incident.description.clone(),
        actions: None,
        suggested_action: None,
        created_by: None,
    };
    let severity = incidents::validate_new_incident(&draft).map_err(HandlerErr::validation)?;
    let foreign = foreign_students(conn, &incident.class_id, &draft.student_ids)?;
    if !foreign.is_empty() {
        return Err(HandlerErr::not_found("student in class"));
    }

    if let Some(date) = non_blank(patch.date) {
        if crate::academic::parse_date(&date).is_none() {
            return Err(HandlerErr::bad_params(format!("invalid date: {}", date)));
        }
        incident.date = date;
    }
    if let Some(description) = patch.description {
        let description = description.trim().to_string();
        if description.is_empty() {
            return Err(HandlerErr::bad_params("description must not be empty"));
        }
        incident.description = description;
    }
    if patch.actions.is_some() {
        incident.actions = non_blank(patch.actions);
    }
    if patch.suggested_action.is_some() {
        incident.suggested_action = non_blank(patch.suggested_action);
    }
    incident.student_ids = draft.student_ids;
    incident.episodes = draft.episodes;
    incident.calculated_severity = severity.calculated;
    incident.final_severity = severity.final_severity;
    incident.severity_override_reason = if severity.final_severity != severity.calculated {
        non_blank(draft.severity_override_reason)
    } else {
        None
    };
    incident.updated_at = db::now_rfc3339();

    let tx = conn
        .unchecked_transaction()
        .map_err(|e| HandlerErr::new("db_tx_failed", e.to_string()))?;
    if let Err(e) = tx.execute(
        "UPDATE incidents SET date = ?, calculated_severity = ?, final_severity = ?,
            severity_override_reason = ?, description = ?, actions = ?, suggested_action = ?,
            updated_at = ?
         WHERE id = ?",
        (
            &incident.date,
            incident.calculated_severity.as_str(),
            incident.final_severity.as_str(),
            &incident.severity_override_reason,
            &incident.description,
            &incident.actions,
            &incident.suggested_action,
            &incident.updated_at,
            &incident.id,
        ),
    ) {
        let _ = tx.rollback();
        return Err(HandlerErr::table("db_update_failed", e, "incidents"));
    }
    if let Err(e) = write_links(&tx, &incident) {
        let _ = tx.rollback();
        return Err(e);
    }
    tx.commit()
        .map_err(|e| HandlerErr::new("db_commit_failed", e.to_string()))?;
    Ok(json!({ "incident": incident }))
}

pub(super) fn add_comment(
    conn: &Connection,
    incident_id: &str,
    user_id: &str,
    user_name: &str,
    text: &str,
) -> rusqlite::Result<String> {
    let id = Uuid::new_v4().to_string();
    conn.execute(
        "INSERT INTO incident_comments(id, incident_id, user_id, user_name, text, created_at)
         VALUES(?, ?, ?, ?, ?, ?)",
        (&id, incident_id, user_id, user_name, text, db::now_rfc3339()),
    )?;
    Ok(id)
}

/// Approves or rejects an open incident. The decision is also logged as a
/// comment by the validator.
fn incidents_validate(conn: &Connection, params: &Value) -> Result<Value, HandlerErr> {
    let incident_id = get_required_str(params, "incidentId")?;
    let validator_id = get_required_str(params, "validatorId")?;
    let validator_name = get_optional_str(params, "validatorName").unwrap_or_else(|| validator_id.clone());
    let approved = get_optional_bool(params, "approved")?
        .ok_or_else(|| HandlerErr::bad_params("missing approved"))?;
    let notes = get_optional_str(params, "notes");

    let incident = load_incident(conn, &incident_id)?;
    let next = incidents::validation_outcome(incident.status, approved).map_err(HandlerErr::validation)?;
    let now = db::now_rfc3339();

    let tx = conn
        .unchecked_transaction()
        .map_err(|e| HandlerErr::new("db_tx_failed", e.to_string()))?;
    // Rejections are stamped too; the incident just stays open.
    let stamped = tx.execute(
        "UPDATE incidents SET status = ?, validated_by = ?, validated_at = ?, updated_at = ? WHERE id = ?",
        (next.as_str(), &validator_name, &now, &now, &incident_id),
    );
    if let Err(e) = stamped {
        let _ = tx.rollback();
        return Err(HandlerErr::table("db_update_failed", e, "incidents"));
    }
    let text = incidents::validation_comment(approved, notes.as_deref());
    if let Err(e) = add_comment(&tx, &incident_id, &validator_id, &validator_name, &text) {
        let _ = tx.rollback();
        return Err(HandlerErr::table("db_insert_failed", e, "incident_comments"));
    }
    tx.commit()
        .map_err(|e| HandlerErr::new("db_commit_failed", e.to_string()))?;

    let incident = load_incident(conn, &incident_id)?;
    Ok(json!({ "incident": incident }))
}

fn incidents_set_status(conn: &Connection, params: &Value) -> Result<Value, HandlerErr> {
    let incident_id = get_required_str(params, "incidentId")?;
    let raw = get_required_str(params, "status")?;
    let status = IncidentStatus::parse(&raw)
        .ok_or_else(|| HandlerErr::bad_params(format!("unknown status: {}", raw)))?;
    let incident = load_incident(conn, &incident_id)?;
    incidents::check_status_change(incident.status, status).map_err(HandlerErr::validation)?;

    conn.execute(
        "UPDATE incidents SET status = ?, updated_at = ? WHERE id = ?",
        (status.as_str(), db::now_rfc3339(), &incident_id),
    )
    .map_err(|e| HandlerErr::table("db_update_failed", e, "incidents"))?;
    Ok(json!({ "incidentId": incident_id, "status": status }))
}

fn incidents_delete(conn: &Connection, params: &Value) -> Result<Value, HandlerErr> {
    let incident_id = get_required_str(params, "incidentId")?;
    load_incident(conn, &incident_id)?;
    let tx = conn
        .unchecked_transaction()
        .map_err(|e| HandlerErr::new("db_tx_failed", e.to_string()))?;
    if let Err(e) = db::delete_incident_rows(&tx, &incident_id) {
        let _ = tx.rollback();
        return Err(HandlerErr::table("db_delete_failed", e, "incidents"));
    }
    tx.commit()
        .map_err(|e| HandlerErr::new("db_commit_failed", e.to_string()))?;
    Ok(json!({ "ok": true }))
}

/// Opens a parents' meeting incident for students failing three or more
/// subjects. `dryRun` only reports what would be created.
fn incidents_generate_academic(conn: &Connection, params: &Value) -> Result<Value, HandlerErr> {
    let today = today(params)?;
    let dry_run = get_optional_bool(params, "dryRun")?.unwrap_or(false);
    let class_id = get_optional_str(params, "classId");

    let mut classes = db::load_classes(conn).map_err(HandlerErr::query)?;
    classes.retain(|c| !c.archived && class_id.as_deref().map(|id| c.id == id).unwrap_or(true));
    let students = db::load_students(conn, class_id.as_deref()).map_err(HandlerErr::query)?;
    let grades = db::load_grades(conn, class_id.as_deref()).map_err(HandlerErr::query)?;
    let existing = db::load_incidents(conn, class_id.as_deref()).map_err(HandlerErr::query)?;

    let generated = incidents::generate_academic_incidents(&grades, &students, &classes, &existing, today);
    let mut created = Vec::new();
    if !dry_run {
        for g in &generated {
            let now = db::now_rfc3339();
            let incident = Incident {
                id: Uuid::new_v4().to_string(),
                class_id: g.class_id.clone(),
                date: g.date.clone(),
                incident_type: IncidentType::Disciplinar,
                student_ids: vec![g.student_id.clone()],
                episodes: Vec::new(),
                calculated_severity: g.severity,
                final_severity: g.severity,
                severity_override_reason: None,
                description: g.description.clone(),
                actions: None,
                suggested_action: Some(g.suggested_action.clone()),
                status: IncidentStatus::Aberta,
                validated_by: None,
                validated_at: None,
                follow_ups: Vec::new(),
                comments: Vec::new(),
                created_by: SYSTEM_AUTHOR.to_string(),
                created_at: now.clone(),
                updated_at: now,
            };
            insert_incident(conn, &incident)?;
            created.push(incident.id);
        }
        tracing::info!(created = created.len(), "academic incidents generated");
    }
    Ok(json!({
        "generated": to_json(&generated)?,
        "createdIds": created,
        "dryRun": dry_run
    }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<Value> {
    match req.method.as_str() {
        "incidents.episodes" => Some(with_conn(state, req, incidents_episodes)),
        "incidents.preview" => Some(with_conn(state, req, incidents_preview)),
        "incidents.create" => Some(with_conn(state, req, incidents_create)),
        "incidents.list" => Some(with_conn(state, req, incidents_list)),
        "incidents.get" => Some(with_conn(state, req, incidents_get)),
        "incidents.update" => Some(with_conn(state, req, incidents_update)),
        "incidents.validate" => Some(with_conn(state, req, incidents_validate)),
        "incidents.setStatus" => Some(with_conn(state, req, incidents_set_status)),
        "incidents.delete" => Some(with_conn(state, req, incidents_delete)),
        "incidents.generateAcademic" => Some(with_conn(state, req, incidents_generate_academic)),
        _ => None,
    }
}
