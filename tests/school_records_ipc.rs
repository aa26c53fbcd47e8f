mod test_support;

use pretty_assertions::assert_eq;
use serde_json::json;
use test_support::{create_class, create_student, error_code, open_workspace, request, request_ok, str_at, TODAY};

#[test]
fn school_config_validates_and_persists_patches() {
    let (_child, mut stdin, mut reader, _ws) = open_workspace("escola-config");

    let initial = request_ok(&mut stdin, &mut reader, "1", "school.config.get", json!({}));
    assert_eq!(initial["config"]["academicYearStartMonth"], json!(2));

    let updated = request_ok(
        &mut stdin,
        &mut reader,
        "2",
        "school.config.update",
        json!({ "patch": { "name": "EEEP Modelo", "state": "ce", "inepCode": "23012345" } }),
    );
    assert_eq!(updated["config"]["state"], json!("CE"));

    let bad = request(
        &mut stdin,
        &mut reader,
        "3",
        "school.config.update",
        json!({ "patch": { "inepCode": "123" } }),
    );
    assert_eq!(bad["ok"], json!(false));

    let bad = request(
        &mut stdin,
        &mut reader,
        "4",
        "school.config.update",
        json!({ "patch": { "mascot": "owl" } }),
    );
    assert_eq!(bad["ok"], json!(false));

    let after = request_ok(&mut stdin, &mut reader, "5", "school.config.get", json!({}));
    assert_eq!(after["config"]["name"], json!("EEEP Modelo"));
    assert_eq!(after["config"]["inepCode"], json!("23012345"));
}

#[test]
fn classes_derive_calendar_and_archive() {
    let (_child, mut stdin, mut reader, _ws) = open_workspace("escola-classes");

    let class_id = create_class(&mut stdin, &mut reader, "1º DS A");
    let listed = request_ok(&mut stdin, &mut reader, "1", "classes.list", json!({ "today": TODAY }));
    let cls = &listed["classes"][0];
    assert_eq!(cls["id"], json!(class_id));
    assert_eq!(cls["startCalendarYear"], json!(2025));
    assert_eq!(cls["endCalendarYear"], json!(2027));
    assert_eq!(cls["currentYear"], json!(1));
    assert_eq!(cls["studentCount"], json!(0));
    assert_eq!(cls["shouldArchive"], json!(false));

    let missing = request(
        &mut stdin,
        &mut reader,
        "2",
        "classes.create",
        json!({ "name": "Sem série" }),
    );
    assert_eq!(error_code(&missing), Some("bad_params"));

    let archived = request_ok(
        &mut stdin,
        &mut reader,
        "3",
        "classes.archive",
        json!({ "classId": class_id, "reason": "concluída" }),
    );
    assert_eq!(archived["class"]["archived"], json!(true));

    let active_only = request_ok(
        &mut stdin,
        &mut reader,
        "4",
        "classes.list",
        json!({ "includeArchived": false }),
    );
    assert_eq!(active_only["classes"].as_array().map(|a| a.len()), Some(0));

    let restored = request_ok(
        &mut stdin,
        &mut reader,
        "5",
        "classes.unarchive",
        json!({ "classId": class_id }),
    );
    assert_eq!(restored["class"]["archived"], json!(false));
}

#[test]
fn grades_import_and_academic_status() {
    let (_child, mut stdin, mut reader, _ws) = open_workspace("escola-grades");
    let class_id = create_class(&mut stdin, &mut reader, "1º DS B");
    let ana = create_student(&mut stdin, &mut reader, &class_id, "Ana Júlia Souza");
    let bruno = create_student(&mut stdin, &mut reader, &class_id, "Bruno Lima");

    let out_of_range = request(
        &mut stdin,
        &mut reader,
        "1",
        "grades.upsert",
        json!({
            "studentId": ana, "classId": class_id, "subject": "Matemática",
            "quarter": "1º Bimestre", "schoolYear": 1, "grade": 11
        }),
    );
    assert_eq!(error_code(&out_of_range), Some("bad_params"));

    let first = request_ok(
        &mut stdin,
        &mut reader,
        "2",
        "grades.upsert",
        json!({
            "studentId": ana, "classId": class_id, "subject": "Matemática",
            "quarter": "1º Bimestre", "schoolYear": 1, "grade": 4.0
        }),
    );
    let again = request_ok(
        &mut stdin,
        &mut reader,
        "3",
        "grades.upsert",
        json!({
            "studentId": ana, "classId": class_id, "subject": "Matemática",
            "quarter": "1º Bimestre", "schoolYear": 1, "grade": 5.0
        }),
    );
    assert_eq!(str_at(&first, "gradeId"), str_at(&again, "gradeId"));

    let csv = "Nome;Matemática;Português\nAna Julia Souza;8,0;9\nBruno Lima;7;6,5\nCarla Nunes;5;5\n";
    let preview = request_ok(
        &mut stdin,
        &mut reader,
        "4",
        "grades.importPreview",
        json!({ "classId": class_id, "content": csv }),
    );
    assert_eq!(preview["unmatchedNames"], json!(["Carla Nunes"]));
    let rows = preview["grades"].as_array().cloned().unwrap_or_default();
    assert_eq!(rows.len(), 4);

    let mut items: Vec<serde_json::Value> = rows
        .iter()
        .map(|r| {
            json!({
                "studentId": r["studentId"], "subject": r["subject"],
                "grade": r["grade"], "selected": true
            })
        })
        .collect();
    items.push(json!({ "studentId": "not-enrolled", "subject": "Matemática", "grade": 9 }));
    let applied = request_ok(
        &mut stdin,
        &mut reader,
        "5",
        "grades.importApply",
        json!({ "classId": class_id, "quarter": "2º Bimestre", "schoolYear": 1, "grades": items }),
    );
    assert_eq!(applied["applied"], json!(4));
    assert_eq!(applied["failed"], json!(0));
    assert_eq!(applied["skipped"], json!(1));

    let bad_quarter = request(
        &mut stdin,
        &mut reader,
        "6",
        "grades.importApply",
        json!({ "classId": class_id, "quarter": "5º Bimestre", "schoolYear": 1, "grades": [] }),
    );
    assert_eq!(error_code(&bad_quarter), Some("validation_failed"));

    for (i, year) in [json!("2"), json!(4)].into_iter().enumerate() {
        let bad_year = request(
            &mut stdin,
            &mut reader,
            &format!("6y{}", i),
            "grades.importApply",
            json!({ "classId": class_id, "quarter": "2º Bimestre", "schoolYear": year, "grades": items }),
        );
        assert_eq!(error_code(&bad_year), Some("bad_params"));
    }

    let listed = request_ok(
        &mut stdin,
        &mut reader,
        "7",
        "grades.list",
        json!({ "classId": class_id, "studentId": bruno }),
    );
    assert_eq!(listed["grades"].as_array().map(|a| a.len()), Some(2));

    let status = request_ok(
        &mut stdin,
        &mut reader,
        "8",
        "academic.classStatus",
        json!({ "classId": class_id, "schoolYear": 1 }),
    );
    assert_eq!(status["summary"]["total"], json!(2));
    assert_eq!(status["summary"]["recovery"], json!(2));

    let single = request_ok(
        &mut stdin,
        &mut reader,
        "9",
        "academic.studentStatus",
        json!({ "studentId": ana }),
    );
    assert_eq!(single["status"], json!("recovery"));
    assert_eq!(single["schoolYear"], json!(1));
}

#[test]
fn attendance_is_recorded_per_day() {
    let (_child, mut stdin, mut reader, _ws) = open_workspace("escola-attendance");
    let class_id = create_class(&mut stdin, &mut reader, "1º DS C");
    let ana = create_student(&mut stdin, &mut reader, &class_id, "Ana");

    for (i, (date, status)) in [("2025-03-10", "presente"), ("2025-03-11", "falta"), ("2025-03-11", "atestado")]
        .iter()
        .enumerate()
    {
        request_ok(
            &mut stdin,
            &mut reader,
            &format!("a{}", i),
            "attendance.record",
            json!({ "classId": class_id, "date": date, "records": [{ "studentId": ana, "status": status }] }),
        );
    }
    let listed = request_ok(
        &mut stdin,
        &mut reader,
        "l",
        "attendance.list",
        json!({ "classId": class_id }),
    );
    assert_eq!(listed["records"].as_array().map(|a| a.len()), Some(2));

    let bad = request(
        &mut stdin,
        &mut reader,
        "b",
        "attendance.record",
        json!({ "classId": class_id, "date": "2025-03-12", "records": [{ "studentId": ana, "status": "dormindo" }] }),
    );
    assert_eq!(error_code(&bad), Some("bad_params"));
}

#[test]
fn deleting_a_class_removes_its_records() {
    let (_child, mut stdin, mut reader, _ws) = open_workspace("escola-class-delete");
    let class_id = create_class(&mut stdin, &mut reader, "1º DS D");
    let ana = create_student(&mut stdin, &mut reader, &class_id, "Ana");
    request_ok(
        &mut stdin,
        &mut reader,
        "1",
        "grades.upsert",
        json!({
            "studentId": ana, "classId": class_id, "subject": "Arte",
            "quarter": "1º Bimestre", "grade": 7
        }),
    );
    request_ok(
        &mut stdin,
        &mut reader,
        "2",
        "incidents.create",
        json!({
            "classId": class_id, "studentIds": [ana], "episodes": ["leve-2"],
            "description": "Chegou atrasado", "today": TODAY
        }),
    );

    request_ok(&mut stdin, &mut reader, "3", "classes.delete", json!({ "classId": class_id }));

    let students = request_ok(&mut stdin, &mut reader, "4", "students.list", json!({}));
    assert_eq!(students["students"], json!([]));
    let grades = request_ok(&mut stdin, &mut reader, "5", "grades.list", json!({}));
    assert_eq!(grades["grades"], json!([]));
    let incidents = request_ok(&mut stdin, &mut reader, "6", "incidents.list", json!({}));
    assert_eq!(incidents["incidents"], json!([]));
}
