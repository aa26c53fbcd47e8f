mod test_support;

use pretty_assertions::assert_eq;
use serde_json::{json, Value};
use std::fs::File;
use std::io::Read;
use test_support::{create_class, create_student, error_code, open_workspace, request, request_ok, str_at, TODAY};

fn event_draft(class_id: &str, students: Value) -> Value {
    json!({
        "title": "Monitoria de Matemática",
        "certificateType": "monitoria",
        "classId": class_id,
        "schoolYear": 1,
        "periodMode": "quarters",
        "selectedQuarters": ["2º Bimestre", "1º Bimestre", "9º Bimestre"],
        "referenceType": "subject",
        "referenceValue": "Matemática",
        "baseText": "A {{escola}} certifica que o(a) aluno(a) {{aluno}} atuou como monitor(a).",
        "teacherName": "Marta Lima",
        "typeMeta": {
            "monitoriaMeta": { "workloadHours": 20, "monitoriaPeriod": "no 1º semestre", "activity": "plantões" }
        },
        "students": students
    })
}

fn codes_by_name(event: &Value) -> Vec<(String, String, String)> {
    event["students"]
        .as_array()
        .map(|rows| {
            rows.iter()
                .map(|r| {
                    (
                        str_at(r, "studentNameSnapshot").to_string(),
                        str_at(r, "verificationCode").to_string(),
                        str_at(r, "verificationStatus").to_string(),
                    )
                })
                .collect()
        })
        .unwrap_or_default()
}

#[test]
fn events_keep_codes_across_edits_and_verify() {
    let (_child, mut stdin, mut reader, workspace) = open_workspace("escola-certificates");
    request_ok(
        &mut stdin,
        &mut reader,
        "cfg",
        "school.config.update",
        json!({ "patch": { "name": "EEEP Escola Modelo" } }),
    );
    let class_id = create_class(&mut stdin, &mut reader, "1º DS A");
    let ana = create_student(&mut stdin, &mut reader, &class_id, "Ana Júlia");
    let bruno = create_student(&mut stdin, &mut reader, &class_id, "Bruno Lima");

    let no_students = request(
        &mut stdin,
        &mut reader,
        "0",
        "certificateEvents.create",
        json!({ "event": event_draft(&class_id, json!([])) }),
    );
    assert_eq!(error_code(&no_students), Some("validation_failed"));

    let created = request_ok(
        &mut stdin,
        &mut reader,
        "1",
        "certificateEvents.create",
        json!({
            "createdByName": "Marta",
            "today": TODAY,
            "event": event_draft(&class_id, json!([
                { "studentId": ana, "studentNameSnapshot": "Ana Júlia" },
                { "studentId": bruno, "studentNameSnapshot": "Bruno Lima" }
            ]))
        }),
    );
    let event_id = str_at(&created, "eventId").to_string();
    let event = &created["event"];
    assert_eq!(event["classNameSnapshot"], json!("1º DS A"));
    assert_eq!(event["selectedQuarters"], json!(["2º Bimestre", "1º Bimestre"]));
    assert_eq!(event["periodLabel"], json!("2º bimestre e 1º bimestre de 2025"));
    assert_eq!(event["studentsCount"], json!(2));
    let fetched = request_ok(
        &mut stdin,
        &mut reader,
        "1b",
        "certificateEvents.get",
        json!({ "eventId": event_id }),
    );
    assert_eq!(fetched["event"]["title"], json!("Monitoria de Matemática"));
    let before = codes_by_name(event);
    assert!(before.iter().all(|(_, code, _)| code.len() == 32));

    let ana_code = before
        .iter()
        .find(|(name, _, _)| name == "Ana Júlia")
        .map(|(_, code, _)| code.clone())
        .expect("ana code");
    let revoked = request_ok(
        &mut stdin,
        &mut reader,
        "2",
        "certificates.setVerificationStatus",
        json!({ "code": ana_code.to_lowercase(), "status": "revoked" }),
    );
    assert_eq!(revoked["status"], json!("revoked"));

    // Ana is matched by name, Bruno is dropped, Carla is new.
    let updated = request_ok(
        &mut stdin,
        &mut reader,
        "3",
        "certificateEvents.update",
        json!({
            "eventId": event_id,
            "event": event_draft(&class_id, json!([
                { "studentNameSnapshot": "  ana   julia " },
                { "studentNameSnapshot": "Carla Nunes", "textOverride": "Texto livre para Carla." }
            ]))
        }),
    );
    let after = codes_by_name(&updated["event"]);
    assert_eq!(after.len(), 2);
    let kept = after.iter().find(|(_, code, _)| *code == ana_code).expect("ana kept her code");
    assert_eq!(kept.2, "revoked");
    assert_eq!(updated["event"]["studentsCount"], json!(2));

    let verified = request_ok(
        &mut stdin,
        &mut reader,
        "4",
        "certificates.verify",
        json!({ "code": format!(" {}-{}", &ana_code[..16], &ana_code[16..]) }),
    );
    assert_eq!(verified["found"], json!(true));
    assert_eq!(verified["valid"], json!(false));
    assert_eq!(verified["certificateTypeLabel"], json!("Monitoria"));
    assert_eq!(verified["className"], json!("1º DS A"));

    let unknown = request_ok(&mut stdin, &mut reader, "5", "certificates.verify", json!({ "code": "ZZZ999" }));
    assert_eq!(unknown["found"], json!(false));
    let empty = request(&mut stdin, &mut reader, "6", "certificates.verify", json!({ "code": " -- " }));
    assert_eq!(error_code(&empty), Some("validation_failed"));

    let out_path = workspace.join("exports").join("monitoria.zip");
    let exported = request_ok(
        &mut stdin,
        &mut reader,
        "7",
        "certificates.exportBundle",
        json!({ "eventId": event_id, "outPath": out_path.to_string_lossy() }),
    );
    assert_eq!(exported["certificateCount"], json!(2));
    assert_eq!(exported["entryCount"], json!(4));
    assert_eq!(exported["manifest"]["format"], json!("escola-certificates-v1"));
    assert_eq!(exported["manifest"]["certificateType"], json!("monitoria"));

    let mut archive = zip::ZipArchive::new(File::open(&out_path).expect("open bundle")).expect("zip");
    let mut texts = Vec::new();
    for i in 0..archive.len() {
        let mut entry = archive.by_index(i).expect("entry");
        if entry.name().starts_with("certificados/") {
            let mut body = String::new();
            entry.read_to_string(&mut body).expect("read entry");
            texts.push(body);
        }
    }
    assert_eq!(texts.len(), 2);
    assert!(texts.iter().any(|t| t.contains("Texto livre para Carla.")));
    assert!(texts.iter().any(|t| t.contains("Situação: REVOGADO")));
    assert!(texts.iter().all(|t| t.starts_with("EEEP Escola Modelo")));

    request_ok(&mut stdin, &mut reader, "8", "certificateEvents.delete", json!({ "eventId": event_id }));
    let listed = request_ok(&mut stdin, &mut reader, "9", "certificateEvents.list", json!({}));
    assert_eq!(listed["events"], json!([]));
    let gone = request_ok(&mut stdin, &mut reader, "10", "certificates.verify", json!({ "code": ana_code }));
    assert_eq!(gone["found"], json!(false));
}

#[test]
fn highlight_suggestions_and_period_labels() {
    let (_child, mut stdin, mut reader, _ws) = open_workspace("escola-certificate-highlights");
    let class_id = create_class(&mut stdin, &mut reader, "1º DS B");
    let ana = create_student(&mut stdin, &mut reader, &class_id, "Ana");
    let bruno = create_student(&mut stdin, &mut reader, &class_id, "Bruno");
    let carla = create_student(&mut stdin, &mut reader, &class_id, "Carla");

    for (i, (student, grade)) in [(&ana, 9.5), (&bruno, 5.9)].iter().enumerate() {
        request_ok(
            &mut stdin,
            &mut reader,
            &format!("g{}", i),
            "grades.upsert",
            json!({
                "studentId": student, "classId": class_id, "subject": "Matemática",
                "quarter": "1º Bimestre", "schoolYear": 1, "grade": grade
            }),
        );
    }

    let suggestions = request_ok(
        &mut stdin,
        &mut reader,
        "1",
        "certificates.highlightSuggestions",
        json!({
            "classId": class_id, "schoolYear": 1,
            "selectedQuarters": ["1º Bimestre"],
            "referenceType": "subject", "referenceValue": "Matemática"
        }),
    );
    let rows = suggestions["suggestions"].as_array().cloned().unwrap_or_default();
    let ids: Vec<&str> = rows.iter().filter_map(|r| r["studentId"].as_str()).collect();
    assert_eq!(ids, vec![ana.as_str(), carla.as_str()]);
    assert_eq!(rows[0]["status"], json!("confirmed"));
    assert_eq!(rows[1]["status"], json!("pending"));

    let label = request_ok(
        &mut stdin,
        &mut reader,
        "2",
        "certificates.periodLabel",
        json!({ "periodMode": "annual", "year": 2025 }),
    );
    assert_eq!(label["label"], json!("1º ao 4º bimestre de 2025"));

    let references = request_ok(
        &mut stdin,
        &mut reader,
        "3",
        "certificates.references",
        json!({ "classId": class_id, "today": TODAY }),
    );
    assert_eq!(references["schoolYear"], json!(1));
    assert!(references["areas"].as_array().map(|a| !a.is_empty()).unwrap_or(false));

    let rendered = request_ok(
        &mut stdin,
        &mut reader,
        "4",
        "certificates.renderText",
        json!({ "input": {
            "certificateType": "destaque",
            "className": "1º DS B",
            "schoolYear": 1,
            "periodLabel": "1º bimestre de 2025",
            "studentName": "Ana"
        } }),
    );
    let text = rendered["text"].as_str().unwrap_or_default();
    assert!(text.contains("Ana"), "{}", text);
    assert!(text.contains("1º DS B"), "{}", text);
}
