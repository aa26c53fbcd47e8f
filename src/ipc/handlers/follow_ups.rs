use crate::db;
use crate::incidents::{self, FollowUpDraft, IncidentRuleError};
use crate::ipc::handlers::incidents::{add_comment, load_incident};
use crate::ipc::helpers::{get_optional_str, get_required_str, parse_params, row_exists, with_conn, HandlerErr};
use crate::ipc::types::{AppState, Request};
use rusqlite::Connection;
use serde_json::{json, Value};
use uuid::Uuid;

/// Creates a follow-up, or replaces one when `followUp.id` names an existing
/// record of the same incident.
fn follow_ups_save(conn: &Connection, params: &Value) -> Result<Value, HandlerErr> {
    let incident_id = get_required_str(params, "incidentId")?;
    let incident = load_incident(conn, &incident_id)?;
    let draft: FollowUpDraft = match params.get("followUp") {
        Some(v) => parse_params(v)?,
        None => return Err(HandlerErr::bad_params("missing followUp")),
    };
    let record = incidents::normalize_follow_up(draft, &incident).map_err(HandlerErr::validation)?;
    let kind = record
        .follow_up_type
        .ok_or_else(|| HandlerErr::bad_params("missing follow-up type"))?;

    let existing_id = match record.id.as_deref().map(str::trim).filter(|s| !s.is_empty()) {
        Some(id) => {
            if !incident.follow_ups.iter().any(|f| f.id == id) {
                return Err(HandlerErr::not_found("follow-up"));
            }
            Some(id.to_string())
        }
        None => None,
    };

    let id = match existing_id {
        Some(id) => {
            conn.execute(
                "UPDATE follow_ups SET type = ?, date = ?, responsavel = ?, motivo = ?,
                    providencias = ?, assuntos_tratados = ?, encaminhamentos = ?, disciplina = ?,
                    tipo_situacao = ?, descricao_situacao = ?, nome_responsavel_pai = ?,
                    grau_parentesco = ?
                 WHERE id = ?",
                (
                    kind.as_str(),
                    &record.date,
                    &record.responsavel,
                    &record.motivo,
                    &record.providencias,
                    &record.assuntos_tratados,
                    &record.encaminhamentos,
                    &record.disciplina,
                    &record.tipo_situacao,
                    &record.descricao_situacao,
                    &record.nome_responsavel_pai,
                    &record.grau_parentesco,
                    &id,
                ),
            )
            .map_err(|e| HandlerErr::table("db_update_failed", e, "follow_ups"))?;
            id
        }
        None => {
            let id = Uuid::new_v4().to_string();
            let created_by = record
                .created_by
                .clone()
                .unwrap_or_else(|| record.responsavel.clone());
            conn.execute(
                "INSERT INTO follow_ups(id, incident_id, type, date, responsavel, motivo,
                    providencias, assuntos_tratados, encaminhamentos, disciplina, tipo_situacao,
                    descricao_situacao, nome_responsavel_pai, grau_parentesco, created_by, created_at)
                 VALUES(?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
                (
                    &id,
                    &incident_id,
                    kind.as_str(),
                    &record.date,
                    &record.responsavel,
                    &record.motivo,
                    &record.providencias,
                    &record.assuntos_tratados,
                    &record.encaminhamentos,
                    &record.disciplina,
                    &record.tipo_situacao,
                    &record.descricao_situacao,
                    &record.nome_responsavel_pai,
                    &record.grau_parentesco,
                    &created_by,
                    db::now_rfc3339(),
                ),
            )
            .map_err(|e| HandlerErr::table("db_insert_failed", e, "follow_ups"))?;
            id
        }
    };

    let incident = load_incident(conn, &incident_id)?;
    Ok(json!({ "followUpId": id, "incident": incident }))
}

fn follow_ups_delete(conn: &Connection, params: &Value) -> Result<Value, HandlerErr> {
    let follow_up_id = get_required_str(params, "followUpId")?;
    if !row_exists(conn, "follow_ups", &follow_up_id)? {
        return Err(HandlerErr::not_found("follow-up"));
    }
    conn.execute("DELETE FROM follow_ups WHERE id = ?", [&follow_up_id])
        .map_err(|e| HandlerErr::table("db_delete_failed", e, "follow_ups"))?;
    Ok(json!({ "ok": true }))
}

fn comments_add(conn: &Connection, params: &Value) -> Result<Value, HandlerErr> {
    let incident_id = get_required_str(params, "incidentId")?;
    let user_id = get_required_str(params, "userId")?;
    let user_name = get_optional_str(params, "userName").unwrap_or_else(|| user_id.clone());
    let text = get_optional_str(params, "text")
        .ok_or_else(|| HandlerErr::validation(IncidentRuleError::EmptyComment))?;
    load_incident(conn, &incident_id)?;

    let id = add_comment(conn, &incident_id, &user_id, &user_name, &text)
        .map_err(|e| HandlerErr::table("db_insert_failed", e, "incident_comments"))?;
    Ok(json!({ "commentId": id }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<Value> {
    match req.method.as_str() {
        "followUps.save" => Some(with_conn(state, req, follow_ups_save)),
        "followUps.delete" => Some(with_conn(state, req, follow_ups_delete)),
        "comments.add" => Some(with_conn(state, req, comments_add)),
        _ => None,
    }
}
