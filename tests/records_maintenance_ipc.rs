mod test_support;

use pretty_assertions::assert_eq;
use serde_json::{json, Value};
use test_support::{create_class, create_student, error_code, open_workspace, request, request_ok, str_at, TODAY};

#[test]
fn templates_feed_certificate_references() {
    let (_child, mut stdin, mut reader, _ws) = open_workspace("escola-templates");
    let class_id = create_class(&mut stdin, &mut reader, "1º DS A");

    let bad_year = request(
        &mut stdin,
        &mut reader,
        "0",
        "templates.create",
        json!({ "name": "DS", "subjectsByYear": [{ "year": 4, "subjects": ["Lógica"] }] }),
    );
    assert_eq!(error_code(&bad_year), Some("bad_params"));

    let created = request_ok(
        &mut stdin,
        &mut reader,
        "1",
        "templates.create",
        json!({
            "name": " Desenvolvimento de Sistemas ",
            "course": "DS",
            "subjectsByYear": [
                { "year": 1, "subjects": ["Lógica de Programação", " ", "Lógica  de Programação"] },
                { "year": 2, "subjects": ["Banco de Dados"] }
            ]
        }),
    );
    let template_id = str_at(&created, "templateId").to_string();
    assert_eq!(created["template"]["name"], json!("Desenvolvimento de Sistemas"));
    assert_eq!(
        created["template"]["subjectsByYear"][0]["subjects"],
        json!(["Lógica de Programação"])
    );

    let missing = request(
        &mut stdin,
        &mut reader,
        "2",
        "classes.update",
        json!({ "classId": class_id, "patch": { "templateId": "nope" }, "today": TODAY }),
    );
    assert_eq!(error_code(&missing), Some("not_found"));
    let linked = request_ok(
        &mut stdin,
        &mut reader,
        "3",
        "classes.update",
        json!({ "classId": class_id, "patch": { "templateId": template_id, "letter": "b" }, "today": TODAY }),
    );
    assert_eq!(linked["class"]["templateId"], json!(template_id));
    assert_eq!(linked["class"]["letter"], json!("B"));

    let set = request_ok(
        &mut stdin,
        &mut reader,
        "4",
        "professionalSubjects.set",
        json!({ "classId": class_id, "subjects": ["Redes", "Redes", "  "] }),
    );
    assert_eq!(set["subjects"], json!(["Redes"]));
    let listed = request_ok(
        &mut stdin,
        &mut reader,
        "5",
        "professionalSubjects.list",
        json!({ "classId": class_id }),
    );
    assert_eq!(listed["subjects"].as_array().map(|s| s.len()), Some(1));

    // Manual subjects only count once they have grades.
    let references = request_ok(
        &mut stdin,
        &mut reader,
        "6",
        "certificates.references",
        json!({ "classId": class_id, "schoolYear": 1 }),
    );
    assert_eq!(references["technicalSubjects"], json!(["Lógica de Programação"]));

    request_ok(&mut stdin, &mut reader, "7", "templates.delete", json!({ "templateId": template_id }));
    let classes = request_ok(&mut stdin, &mut reader, "8", "classes.list", json!({ "today": TODAY }));
    assert_eq!(classes["classes"][0]["templateId"], Value::Null);
    let again = request(&mut stdin, &mut reader, "9", "templates.delete", json!({ "templateId": template_id }));
    assert_eq!(error_code(&again), Some("not_found"));
}

#[test]
fn student_edits_and_removal() {
    let (_child, mut stdin, mut reader, _ws) = open_workspace("escola-student-edits");
    let class_id = create_class(&mut stdin, &mut reader, "2º DS A");
    let ana = create_student(&mut stdin, &mut reader, &class_id, "Ana");
    let bruno = create_student(&mut stdin, &mut reader, &class_id, "Bruno");

    let updated = request_ok(
        &mut stdin,
        &mut reader,
        "1",
        "students.update",
        json!({ "studentId": ana, "patch": { "name": "Ana   Souza", "status": "transferred", "birthDate": "2009-04-02" } }),
    );
    assert_eq!(updated["student"]["name"], json!("Ana Souza"));
    assert_eq!(updated["student"]["status"], json!("transferred"));

    let bad_status = request(
        &mut stdin,
        &mut reader,
        "2",
        "students.update",
        json!({ "studentId": ana, "patch": { "status": "graduated" } }),
    );
    assert_eq!(error_code(&bad_status), Some("bad_params"));
    let bad_class = request(
        &mut stdin,
        &mut reader,
        "3",
        "students.update",
        json!({ "studentId": ana, "patch": { "classId": "missing" } }),
    );
    assert_eq!(error_code(&bad_class), Some("not_found"));

    let active = request_ok(
        &mut stdin,
        &mut reader,
        "4",
        "students.list",
        json!({ "classId": class_id, "status": "active" }),
    );
    assert_eq!(active["students"].as_array().map(|s| s.len()), Some(1));

    let solo = request_ok(
        &mut stdin,
        &mut reader,
        "5",
        "incidents.create",
        json!({ "classId": class_id, "studentIds": [ana], "episodes": ["leve-1"], "description": "Atraso", "today": TODAY }),
    );
    let shared = request_ok(
        &mut stdin,
        &mut reader,
        "6",
        "incidents.create",
        json!({ "classId": class_id, "studentIds": [ana, bruno], "episodes": ["leve-1"], "description": "Conversa", "today": TODAY }),
    );

    let deleted = request_ok(&mut stdin, &mut reader, "7", "students.delete", json!({ "studentId": ana }));
    assert_eq!(deleted["deletedIncidents"], json!(1));

    let gone = request(
        &mut stdin,
        &mut reader,
        "8",
        "incidents.get",
        json!({ "incidentId": str_at(&solo, "incidentId") }),
    );
    assert_eq!(error_code(&gone), Some("not_found"));
    let kept = request_ok(
        &mut stdin,
        &mut reader,
        "9",
        "incidents.get",
        json!({ "incidentId": str_at(&shared, "incidentId") }),
    );
    assert_eq!(kept["incident"]["studentIds"], json!([bruno]));
}

#[test]
fn grade_and_incident_edits() {
    let (_child, mut stdin, mut reader, _ws) = open_workspace("escola-record-edits");
    let class_id = create_class(&mut stdin, &mut reader, "3º DS A");
    let ana = create_student(&mut stdin, &mut reader, &class_id, "Ana");

    let grade = request_ok(
        &mut stdin,
        &mut reader,
        "1",
        "grades.upsert",
        json!({
            "studentId": ana, "classId": class_id, "subject": "Física",
            "quarter": "2º Bimestre", "schoolYear": 1, "grade": 7.5
        }),
    );
    let grade_id = str_at(&grade, "gradeId").to_string();
    request_ok(&mut stdin, &mut reader, "2", "grades.delete", json!({ "gradeId": grade_id }));
    let listed = request_ok(&mut stdin, &mut reader, "3", "grades.list", json!({ "classId": class_id }));
    assert_eq!(listed["grades"], json!([]));
    let again = request(&mut stdin, &mut reader, "4", "grades.delete", json!({ "gradeId": grade_id }));
    assert_eq!(error_code(&again), Some("not_found"));

    let created = request_ok(
        &mut stdin,
        &mut reader,
        "5",
        "incidents.create",
        json!({ "classId": class_id, "studentIds": [ana], "episodes": ["leve-1"], "description": "Atraso", "today": TODAY }),
    );
    let incident_id = str_at(&created, "incidentId").to_string();

    let recomputed = request_ok(
        &mut stdin,
        &mut reader,
        "6",
        "incidents.update",
        json!({ "incidentId": incident_id, "patch": { "episodes": ["inter-2"], "description": "Uso de celular" } }),
    );
    assert_eq!(recomputed["incident"]["calculatedSeverity"], json!("intermediaria"));
    assert_eq!(recomputed["incident"]["finalSeverity"], json!("intermediaria"));
    assert_eq!(recomputed["incident"]["description"], json!("Uso de celular"));

    let no_reason = request(
        &mut stdin,
        &mut reader,
        "7",
        "incidents.update",
        json!({ "incidentId": incident_id, "patch": { "finalSeverity": "grave" } }),
    );
    assert_eq!(error_code(&no_reason), Some("validation_failed"));
    let overridden = request_ok(
        &mut stdin,
        &mut reader,
        "8",
        "incidents.update",
        json!({
            "incidentId": incident_id,
            "patch": { "finalSeverity": "grave", "severityOverrideReason": "Reincidência na semana" }
        }),
    );
    assert_eq!(overridden["incident"]["finalSeverity"], json!("grave"));

    let saved = request_ok(
        &mut stdin,
        &mut reader,
        "9",
        "followUps.save",
        json!({ "incidentId": incident_id, "followUp": { "date": "2025-06-16", "responsavel": "Prof. Marta" } }),
    );
    let follow_up_id = str_at(&saved, "followUpId").to_string();
    request_ok(&mut stdin, &mut reader, "10", "followUps.delete", json!({ "followUpId": follow_up_id }));
    let fetched = request_ok(&mut stdin, &mut reader, "11", "incidents.get", json!({ "incidentId": incident_id }));
    assert_eq!(fetched["incident"]["followUps"], json!([]));
    let missing = request(&mut stdin, &mut reader, "12", "followUps.delete", json!({ "followUpId": follow_up_id }));
    assert_eq!(error_code(&missing), Some("not_found"));
}
