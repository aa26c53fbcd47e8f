mod test_support;

use pretty_assertions::assert_eq;
use serde_json::{json, Value};
use std::io::BufReader;
use std::process::{ChildStdin, ChildStdout};
use test_support::{create_class, create_student, error_code, open_workspace, request, request_ok, str_at, TODAY};

fn create_leve(
    stdin: &mut ChildStdin,
    reader: &mut BufReader<ChildStdout>,
    id: &str,
    class_id: &str,
    student_id: &str,
) -> Value {
    request_ok(
        stdin,
        reader,
        id,
        "incidents.create",
        json!({
            "classId": class_id,
            "studentIds": [student_id],
            "episodes": ["leve-1"],
            "description": "Conversa paralela",
            "today": TODAY
        }),
    )
}

fn approve(stdin: &mut ChildStdin, reader: &mut BufReader<ChildStdout>, id: &str, incident_id: &str) -> Value {
    request_ok(
        stdin,
        reader,
        id,
        "incidents.validate",
        json!({
            "incidentId": incident_id,
            "validatorId": "u-coord",
            "validatorName": "Coordenação",
            "approved": true
        }),
    )
}

#[test]
fn handled_incidents_escalate_the_suggested_action() {
    let (_child, mut stdin, mut reader, _ws) = open_workspace("escola-incident-escalation");
    let class_id = create_class(&mut stdin, &mut reader, "2º DS A");
    let ana = create_student(&mut stdin, &mut reader, &class_id, "Ana");

    let first = create_leve(&mut stdin, &mut reader, "1", &class_id, &ana);
    assert_eq!(first["incident"]["status"], json!("aberta"));
    assert_eq!(first["incident"]["suggestedAction"], json!("Conversa e registro."));

    // open incidents do not count towards the history
    let second = create_leve(&mut stdin, &mut reader, "2", &class_id, &ana);
    assert_eq!(second["incident"]["suggestedAction"], json!("Conversa e registro."));

    approve(&mut stdin, &mut reader, "3", str_at(&first, "incidentId"));
    approve(&mut stdin, &mut reader, "4", str_at(&second, "incidentId"));

    let preview = request_ok(
        &mut stdin,
        &mut reader,
        "5",
        "incidents.preview",
        json!({ "classId": class_id, "studentIds": [ana], "episodes": ["leve-3"] }),
    );
    assert_eq!(preview["actionLevel"], json!("comunicado_pais"));
    assert_eq!(preview["worstHistory"]["leve"], json!(2));
    assert_eq!(preview["suggestedFollowUpType"], json!("conversa_pais"));

    let third = create_leve(&mut stdin, &mut reader, "6", &class_id, &ana);
    let action = third["incident"]["suggestedAction"].as_str().unwrap_or_default();
    assert!(action.contains("COMUNICADO AOS PAIS"), "{}", action);
}

#[test]
fn severity_override_requires_a_reason() {
    let (_child, mut stdin, mut reader, _ws) = open_workspace("escola-incident-override");
    let class_id = create_class(&mut stdin, &mut reader, "2º DS B");
    let ana = create_student(&mut stdin, &mut reader, &class_id, "Ana");

    let preview = request_ok(
        &mut stdin,
        &mut reader,
        "1",
        "incidents.preview",
        json!({
            "classId": class_id, "studentIds": [ana],
            "episodes": ["leve-1", "inter-2"], "finalSeverity": "grave"
        }),
    );
    assert_eq!(preview["calculatedSeverity"], json!("intermediaria"));
    assert_eq!(preview["overrideReasonRequired"], json!(true));

    let rejected = request(
        &mut stdin,
        &mut reader,
        "2",
        "incidents.create",
        json!({
            "classId": class_id, "studentIds": [ana], "episodes": ["leve-1", "inter-2"],
            "finalSeverity": "grave", "description": "Celular e conversa"
        }),
    );
    assert_eq!(error_code(&rejected), Some("validation_failed"));

    let unknown = request(
        &mut stdin,
        &mut reader,
        "3",
        "incidents.create",
        json!({
            "classId": class_id, "studentIds": [ana], "episodes": ["voar-1"],
            "description": "?"
        }),
    );
    assert_eq!(error_code(&unknown), Some("validation_failed"));

    let created = request_ok(
        &mut stdin,
        &mut reader,
        "4",
        "incidents.create",
        json!({
            "classId": class_id, "studentIds": [ana], "episodes": ["leve-1", "inter-2"],
            "finalSeverity": "grave", "severityOverrideReason": "Reincidente na semana",
            "description": "Celular e conversa", "today": TODAY
        }),
    );
    assert_eq!(created["incident"]["finalSeverity"], json!("grave"));
    assert_eq!(created["incident"]["date"], json!(TODAY));
    let action = created["incident"]["suggestedAction"].as_str().unwrap_or_default();
    assert!(action.contains("POR UM dia"), "{}", action);
}

#[test]
fn follow_ups_comments_and_status_changes() {
    let (_child, mut stdin, mut reader, _ws) = open_workspace("escola-incident-followups");
    let class_id = create_class(&mut stdin, &mut reader, "3º DS A");
    let ana = create_student(&mut stdin, &mut reader, &class_id, "Ana");
    let created = create_leve(&mut stdin, &mut reader, "1", &class_id, &ana);
    let incident_id = str_at(&created, "incidentId").to_string();

    // open incidents must be validated first
    let early = request(
        &mut stdin,
        &mut reader,
        "2",
        "incidents.setStatus",
        json!({ "incidentId": incident_id, "status": "resolvida" }),
    );
    assert_eq!(error_code(&early), Some("validation_failed"));

    let validated = approve(&mut stdin, &mut reader, "3", &incident_id);
    assert_eq!(validated["incident"]["status"], json!("acompanhamento"));
    assert_eq!(validated["incident"]["validatedBy"], json!("Coordenação"));
    assert_eq!(validated["incident"]["comments"].as_array().map(|c| c.len()), Some(1));

    let again = request(
        &mut stdin,
        &mut reader,
        "4",
        "incidents.validate",
        json!({ "incidentId": incident_id, "validatorId": "u", "approved": true }),
    );
    assert_eq!(error_code(&again), Some("validation_failed"));

    let saved = request_ok(
        &mut stdin,
        &mut reader,
        "5",
        "followUps.save",
        json!({
            "incidentId": incident_id,
            "followUp": { "date": "2025-06-16", "responsavel": "Prof. Marta" }
        }),
    );
    let follow_up = &saved["incident"]["followUps"][0];
    assert_eq!(follow_up["type"], json!("conversa_individual"));
    assert_eq!(follow_up["motivo"], json!("1 - Comportamento inadequado"));
    assert_eq!(follow_up["createdBy"], json!("Prof. Marta"));

    let edited = request_ok(
        &mut stdin,
        &mut reader,
        "6",
        "followUps.save",
        json!({
            "incidentId": incident_id,
            "followUp": {
                "id": saved["followUpId"], "date": "2025-06-17", "responsavel": "Prof. Marta",
                "providencias": "Troca de lugar"
            }
        }),
    );
    assert_eq!(edited["incident"]["followUps"].as_array().map(|f| f.len()), Some(1));
    assert_eq!(edited["incident"]["followUps"][0]["date"], json!("2025-06-17"));

    let blank = request(
        &mut stdin,
        &mut reader,
        "7",
        "comments.add",
        json!({ "incidentId": incident_id, "userId": "u1", "text": "   " }),
    );
    assert_eq!(error_code(&blank), Some("validation_failed"));
    request_ok(
        &mut stdin,
        &mut reader,
        "8",
        "comments.add",
        json!({ "incidentId": incident_id, "userId": "u1", "userName": "Marta", "text": "Aluna colaborou." }),
    );

    let resolved = request_ok(
        &mut stdin,
        &mut reader,
        "9",
        "incidents.setStatus",
        json!({ "incidentId": incident_id, "status": "resolvida" }),
    );
    assert_eq!(resolved["status"], json!("resolvida"));

    let fetched = request_ok(&mut stdin, &mut reader, "10", "incidents.get", json!({ "incidentId": incident_id }));
    assert_eq!(fetched["incident"]["comments"].as_array().map(|c| c.len()), Some(2));

    let filtered = request_ok(
        &mut stdin,
        &mut reader,
        "11",
        "incidents.list",
        json!({ "studentId": ana, "status": "resolvida" }),
    );
    assert_eq!(filtered["incidents"].as_array().map(|l| l.len()), Some(1));

    request_ok(&mut stdin, &mut reader, "12", "incidents.delete", json!({ "incidentId": incident_id }));
    let gone = request(&mut stdin, &mut reader, "13", "incidents.get", json!({ "incidentId": incident_id }));
    assert_eq!(error_code(&gone), Some("not_found"));
}

#[test]
fn failing_students_get_an_academic_incident_once() {
    let (_child, mut stdin, mut reader, _ws) = open_workspace("escola-incident-academic");
    let class_id = create_class(&mut stdin, &mut reader, "1º DS E");
    let ana = create_student(&mut stdin, &mut reader, &class_id, "Ana");
    for (i, subject) in ["Matemática", "Português", "Química"].iter().enumerate() {
        request_ok(
            &mut stdin,
            &mut reader,
            &format!("g{}", i),
            "grades.upsert",
            json!({
                "studentId": ana, "classId": class_id, "subject": subject,
                "quarter": "1º Bimestre", "schoolYear": 1, "grade": 3.0
            }),
        );
    }

    let dry = request_ok(
        &mut stdin,
        &mut reader,
        "1",
        "incidents.generateAcademic",
        json!({ "dryRun": true, "today": TODAY }),
    );
    assert_eq!(dry["generated"].as_array().map(|g| g.len()), Some(1));
    assert_eq!(dry["createdIds"], json!([]));

    let real = request_ok(
        &mut stdin,
        &mut reader,
        "2",
        "incidents.generateAcademic",
        json!({ "today": TODAY }),
    );
    assert_eq!(real["createdIds"].as_array().map(|g| g.len()), Some(1));

    let repeat = request_ok(
        &mut stdin,
        &mut reader,
        "3",
        "incidents.generateAcademic",
        json!({ "today": TODAY }),
    );
    assert_eq!(repeat["generated"], json!([]));
}

#[test]
fn rejected_validation_stamps_the_validator() {
    let (_child, mut stdin, mut reader, _ws) = open_workspace("escola-incident-rejection");
    let class_id = create_class(&mut stdin, &mut reader, "1º DS C");
    let ana = create_student(&mut stdin, &mut reader, &class_id, "Ana");
    let created = create_leve(&mut stdin, &mut reader, "1", &class_id, &ana);

    let rejected = request_ok(
        &mut stdin,
        &mut reader,
        "2",
        "incidents.validate",
        json!({
            "incidentId": str_at(&created, "incidentId"),
            "validatorId": "u-coord",
            "validatorName": "Coord",
            "approved": false,
            "notes": "Registro incompleto"
        }),
    );
    let incident = &rejected["incident"];
    assert_eq!(incident["status"], json!("aberta"));
    assert_eq!(incident["validatedBy"], json!("Coord"));
    assert!(incident["validatedAt"].is_string(), "{}", incident);
    assert_eq!(incident["comments"].as_array().map(|c| c.len()), Some(1));
}

#[test]
fn performance_convocations_count_towards_escalation() {
    let (_child, mut stdin, mut reader, _ws) = open_workspace("escola-incident-convocation");
    let class_id = create_class(&mut stdin, &mut reader, "1º DS D");
    let ana = create_student(&mut stdin, &mut reader, &class_id, "Ana");

    for i in 0..2 {
        let created = request_ok(
            &mut stdin,
            &mut reader,
            &format!("c{}", i),
            "incidents.create",
            json!({
                "classId": class_id,
                "studentIds": [ana],
                "episodes": ["inter-1"],
                "description": "Convocação de pais por baixo rendimento",
                "today": TODAY
            }),
        );
        let incident_id = str_at(&created, "incidentId").to_string();
        approve(&mut stdin, &mut reader, &format!("a{}", i), &incident_id);
        let fetched = request_ok(
            &mut stdin,
            &mut reader,
            &format!("g{}", i),
            "incidents.get",
            json!({ "incidentId": incident_id }),
        );
        assert_eq!(fetched["performanceConvocation"], json!(true));
    }

    let preview = request_ok(
        &mut stdin,
        &mut reader,
        "p",
        "incidents.preview",
        json!({ "classId": class_id, "studentIds": [ana], "episodes": ["leve-1"] }),
    );
    assert_eq!(preview["worstHistory"]["intermediaria"], json!(2));
    assert_eq!(preview["actionLevel"], json!("suspensao_um_dia"));
}
