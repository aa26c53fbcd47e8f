mod test_support;

use pretty_assertions::assert_eq;
use serde_json::json;
use test_support::{create_class, create_student, error_code, open_workspace, request, request_ok, str_at};

#[test]
fn external_assessments_crud_and_validation() {
    let (_child, mut stdin, mut reader, _ws) = open_workspace("escola-external");
    let class_id = create_class(&mut stdin, &mut reader, "1º DS A");
    let ana = create_student(&mut stdin, &mut reader, &class_id, "Ana Lima");

    let created = request_ok(
        &mut stdin,
        &mut reader,
        "1",
        "externalAssessments.create",
        json!({
            "studentId": ana,
            "assessmentType": "SAEB",
            "assessmentName": "  SAEB   2025 ",
            "score": 240.0,
            "maxScore": 400.0,
            "proficiencyLevel": "Nível 4",
            "appliedDate": "2025-05-20",
            "schoolLevel": "medio",
            "gradeYear": 1
        }),
    );
    let assessment_id = str_at(&created, "assessmentId").to_string();
    let record = &created["externalAssessment"];
    assert_eq!(record["assessmentName"], json!("SAEB 2025"));
    assert_eq!(record["assessmentType"], json!("SAEB"));
    assert_eq!(record["subject"], json!(null));

    let bad_inputs = [
        json!({ "score": 500.0 }),
        json!({ "maxScore": 0 }),
        json!({ "gradeYear": 7 }),
        json!({ "assessmentType": "ENEM" }),
        json!({ "quarter": "5º Bimestre" }),
        json!({ "appliedDate": "20/05/2025" }),
    ];
    for (i, extra) in bad_inputs.into_iter().enumerate() {
        let mut params = json!({
            "studentId": ana,
            "assessmentType": "Simulado",
            "assessmentName": "Simulado 1",
            "score": 6.0,
            "maxScore": 10.0,
            "appliedDate": "2025-04-02",
            "schoolLevel": "medio",
            "gradeYear": 1
        });
        for (k, v) in extra.as_object().unwrap() {
            params[k] = v.clone();
        }
        let bad = request(&mut stdin, &mut reader, &format!("bad-{}", i), "externalAssessments.create", params);
        assert_eq!(error_code(&bad), Some("bad_params"), "{}", extra);
    }

    let ghost = request(
        &mut stdin,
        &mut reader,
        "2",
        "externalAssessments.create",
        json!({
            "studentId": "nope",
            "assessmentName": "Simulado 1",
            "score": 6.0,
            "maxScore": 10.0,
            "appliedDate": "2025-04-02",
            "schoolLevel": "medio",
            "gradeYear": 1
        }),
    );
    assert_eq!(error_code(&ghost), Some("not_found"));

    // Fundamental scores need a fundamental year.
    let updated = request_ok(
        &mut stdin,
        &mut reader,
        "3",
        "externalAssessments.update",
        json!({
            "assessmentId": assessment_id,
            "patch": { "schoolLevel": "fundamental", "gradeYear": 9, "subject": "Matemática" }
        }),
    );
    assert_eq!(updated["externalAssessment"]["gradeYear"], json!(9));
    assert_eq!(updated["externalAssessment"]["subject"], json!("Matemática"));
    let rejected = request(
        &mut stdin,
        &mut reader,
        "4",
        "externalAssessments.update",
        json!({ "assessmentId": assessment_id, "patch": { "schoolLevel": "medio" } }),
    );
    assert_eq!(error_code(&rejected), Some("bad_params"));

    request_ok(
        &mut stdin,
        &mut reader,
        "5",
        "externalAssessments.create",
        json!({
            "studentId": ana,
            "assessmentType": "Simulado",
            "assessmentName": "Simulado 1",
            "score": 7.5,
            "maxScore": 10.0,
            "appliedDate": "2025-06-10",
            "schoolLevel": "medio",
            "gradeYear": 1,
            "quarter": "2º Bimestre"
        }),
    );
    let listed = request_ok(
        &mut stdin,
        &mut reader,
        "6",
        "externalAssessments.list",
        json!({ "studentId": ana }),
    );
    let names: Vec<&str> = listed["externalAssessments"]
        .as_array()
        .unwrap()
        .iter()
        .map(|a| a["assessmentName"].as_str().unwrap())
        .collect();
    assert_eq!(names, vec!["Simulado 1", "SAEB 2025"]);

    request_ok(
        &mut stdin,
        &mut reader,
        "7",
        "externalAssessments.delete",
        json!({ "assessmentId": assessment_id }),
    );
    let again = request(
        &mut stdin,
        &mut reader,
        "8",
        "externalAssessments.delete",
        json!({ "assessmentId": assessment_id }),
    );
    assert_eq!(error_code(&again), Some("not_found"));

    // Deleting the student takes the remaining score with it.
    request_ok(&mut stdin, &mut reader, "9", "students.delete", json!({ "studentId": ana }));
    let listed = request_ok(&mut stdin, &mut reader, "10", "externalAssessments.list", json!({}));
    assert_eq!(listed["externalAssessments"], json!([]));
}

#[test]
fn historical_grades_upsert_on_the_same_slot() {
    let (_child, mut stdin, mut reader, _ws) = open_workspace("escola-historical");
    let class_id = create_class(&mut stdin, &mut reader, "1º DS A");
    let ana = create_student(&mut stdin, &mut reader, &class_id, "Ana Lima");

    let first = request_ok(
        &mut stdin,
        &mut reader,
        "1",
        "historicalGrades.upsert",
        json!({
            "studentId": ana,
            "schoolLevel": "fundamental",
            "gradeYear": 9,
            "subject": "Matemática",
            "grade": "7,5",
            "schoolName": "EMEF Centro"
        }),
    );
    let second = request_ok(
        &mut stdin,
        &mut reader,
        "2",
        "historicalGrades.upsert",
        json!({ "studentId": ana, "schoolLevel": "fundamental", "gradeYear": 9, "subject": "Matemática", "grade": 8 }),
    );
    assert_eq!(second["historicalGrade"]["id"], first["historicalGrade"]["id"]);

    let bad = request(
        &mut stdin,
        &mut reader,
        "3",
        "historicalGrades.upsert",
        json!({ "studentId": ana, "schoolLevel": "fundamental", "gradeYear": 5, "subject": "Matemática", "grade": 8 }),
    );
    assert_eq!(error_code(&bad), Some("bad_params"));

    let listed = request_ok(&mut stdin, &mut reader, "4", "historicalGrades.list", json!({ "studentId": ana }));
    let grades = listed["historicalGrades"].as_array().unwrap();
    assert_eq!(grades.len(), 1);
    assert_eq!(grades[0]["grade"], json!(8.0));
    assert_eq!(grades[0]["schoolName"], json!(null));

    let id = str_at(&first["historicalGrade"], "id").to_string();
    request_ok(&mut stdin, &mut reader, "5", "historicalGrades.delete", json!({ "historicalGradeId": id }));
    let listed = request_ok(&mut stdin, &mut reader, "6", "historicalGrades.list", json!({}));
    assert_eq!(listed["historicalGrades"], json!([]));
}

#[test]
fn class_trajectory_joins_history_gradebook_and_external_scores() {
    let (_child, mut stdin, mut reader, _ws) = open_workspace("escola-trajectory");
    let class_id = create_class(&mut stdin, &mut reader, "1º DS A");
    let empty_class = create_class(&mut stdin, &mut reader, "1º DS B");
    let ana = create_student(&mut stdin, &mut reader, &class_id, "Ana Lima");
    let bruno = create_student(&mut stdin, &mut reader, &class_id, "Bruno Reis");

    for (i, (student, value)) in [(&ana, 9.0), (&bruno, 5.0)].into_iter().enumerate() {
        request_ok(
            &mut stdin,
            &mut reader,
            &format!("hist-{}", i),
            "historicalGrades.upsert",
            json!({ "studentId": student, "schoolLevel": "fundamental", "gradeYear": 9, "subject": "Matemática", "grade": value }),
        );
    }
    for (i, (student, value)) in [(&ana, 10.0), (&bruno, 4.0)].into_iter().enumerate() {
        request_ok(
            &mut stdin,
            &mut reader,
            &format!("grade-{}", i),
            "grades.upsert",
            json!({
                "studentId": student,
                "classId": class_id,
                "subject": "Matemática",
                "quarter": "1º Bimestre",
                "schoolYear": 1,
                "grade": value
            }),
        );
    }
    request_ok(
        &mut stdin,
        &mut reader,
        "ext",
        "externalAssessments.create",
        json!({
            "studentId": ana,
            "assessmentType": "Simulado",
            "assessmentName": "Simulado 1",
            "score": 8.0,
            "maxScore": 10.0,
            "appliedDate": "2025-03-12",
            "schoolLevel": "medio",
            "gradeYear": 1
        }),
    );

    let result = request_ok(
        &mut stdin,
        &mut reader,
        "t",
        "analytics.trajectory",
        json!({ "classIds": [class_id, empty_class] }),
    );
    assert_eq!(result["distinctAssessments"], json!(["Simulado 1"]));
    assert_eq!(result["classes"][1]["stats"], json!(null));

    let stats = &result["classes"][0]["stats"];
    assert_eq!(stats["averages"]["fund"], json!(7.0));
    assert_eq!(stats["averages"]["hs"], json!(7.0));
    assert_eq!(stats["averages"]["ext"], json!(8.0));
    assert_eq!(stats["counts"], json!({ "critical": 1, "excellence": 1, "total": 2 }));

    let timeline = stats["timeline"].as_array().unwrap();
    assert_eq!(timeline.len(), 2);
    assert_eq!(timeline[0]["label"], json!("9º Ano"));
    assert_eq!(timeline[0]["type"], json!("Fundamental"));
    assert_eq!(timeline[1]["label"], json!("1º ano - 1º Bimestre"));
    assert_eq!(timeline[1]["type"], json!("Médio"));
    assert_eq!(timeline[1]["internal"], json!(7.0));
    assert_eq!(timeline[1]["external"], json!(8.0));
    assert_eq!(timeline[1]["unified"], json!(7.5));

    let missing = request(&mut stdin, &mut reader, "bad", "analytics.trajectory", json!({ "classIds": "x" }));
    assert_eq!(error_code(&missing), Some("bad_params"));
}
