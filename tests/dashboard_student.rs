
use serde_json::json;
use test_support::Sidecar;

#[test]
fn student_dashboard_rolls_up_results_and_lists_open_exams() {
    let (mut s, workspace) = Sidecar::with_workspace("examdesk-dashboard-student");

    let teacher_id = s.register("Adler, Kim", "kim@example.test", "teacher");
    let student_id = s.register("Boame, Esi", "esi@example.test", "student");
    let subject_id = s.create_subject("Mathematics");
    let class_id = s.create_class("10A Math", &subject_id, &teacher_id);
    s.enroll(&class_id, &student_id);

    let bank_id = s.create_bank("Algebra", &subject_id, &teacher_id);
    let q1 = s.create_question(&bank_id, "2+2?", "A", 1.0);
    let q2 = s.create_question(&bank_id, "3*3?", "B", 1.0);

    let exam1 = s.create_published_exam(
        "Quiz 1",
        &subject_id,
        &class_id,
        &teacher_id,
        &[q1.clone(), q2.clone()],
        50.0,
    );
    let exam2 = s.create_published_exam(
        "Quiz 2",
        &subject_id,
        &class_id,
        &teacher_id,
        &[q1.clone(), q2.clone()],
        50.0,
    );

    // 100% on quiz 1, 0% on quiz 2.
    let _ = s.submit(&exam1, &student_id, &[(&q1, Some("A")), (&q2, Some("B"))]);
    let _ = s.submit(&exam2, &student_id, &[(&q1, Some("B")), (&q2, Some("A"))]);

    // Still open for this student.
    let open_exam = s.create_published_exam(
        "Quiz 3",
        &subject_id,
        &class_id,
        &teacher_id,
        &[q1.clone()],
        50.0,
    );
    // Window already closed; must not show up.
    let closed = s.ok(
        "exams.create",
        json!({
            "title": "Missed quiz",
            "subjectId": subject_id,
            "classId": class_id,
            "teacherId": teacher_id,
            "endsAt": "2000-01-01T00:00:00Z"
        }),
    );
    let closed_id = closed
        .get("examId")
        .and_then(|v| v.as_str())
        .expect("examId")
        .to_string();
    let _ = s.ok(
        "exams.questions.set",
        json!({ "examId": closed_id, "questionIds": [q2.clone()] }),
    );
    let _ = s.ok("exams.publish", json!({ "examId": closed_id }));

    let dash = s.ok("dashboard.student", json!({ "studentId": student_id }));

    let summary = dash.get("summary").cloned().unwrap_or_default();
    assert_eq!(summary.get("taken").and_then(|v| v.as_u64()), Some(2));
    assert_eq!(summary.get("passed").and_then(|v| v.as_u64()), Some(1));
    assert_eq!(summary.get("failed").and_then(|v| v.as_u64()), Some(1));
    assert_eq!(summary.get("passRate").and_then(|v| v.as_f64()), Some(50.0));
    assert_eq!(
        summary.get("averagePercent").and_then(|v| v.as_f64()),
        Some(50.0)
    );
    assert_eq!(
        summary.get("highestPercent").and_then(|v| v.as_f64()),
        Some(100.0)
    );
    assert_eq!(
        summary.get("lowestPercent").and_then(|v| v.as_f64()),
        Some(0.0)
    );

    let recent = dash
        .get("recentResults")
        .and_then(|v| v.as_array())
        .cloned()
        .unwrap_or_default();
    assert_eq!(recent.len(), 2);
    assert!(recent
        .iter()
        .all(|r| r.get("subjectName").and_then(|v| v.as_str()) == Some("Mathematics")));

    let upcoming = dash
        .get("upcomingExams")
        .and_then(|v| v.as_array())
        .cloned()
        .unwrap_or_default();
    let upcoming_ids = upcoming
        .iter()
        .filter_map(|e| e.get("examId").and_then(|v| v.as_str()))
        .collect::<Vec<_>>();
    assert_eq!(upcoming_ids, vec![open_exam.as_str()]);

    drop(s.stdin);
    let _ = s.child.wait();
    let _ = std::fs::remove_dir_all(workspace);
}

#[test]
fn student_dashboard_requires_student_account() {
    let (mut s, workspace) = Sidecar::with_workspace("examdesk-dashboard-student-role");

    let teacher_id = s.register("Adler, Kim", "kim@example.test", "teacher");
    let code = s.err_code("dashboard.student", json!({ "studentId": teacher_id }));
    assert_eq!(code, "bad_params");
    let missing = s.err_code("dashboard.student", json!({ "studentId": "missing" }));
    assert_eq!(missing, "not_found");

    // A fresh student has an empty rollup, not an error.
    let student_id = s.register("Boame, Esi", "esi@example.test", "student");
    let dash = s.ok("dashboard.student", json!({ "studentId": student_id }));
    let summary = dash.get("summary").cloned().unwrap_or_default();
    assert_eq!(summary.get("taken").and_then(|v| v.as_u64()), Some(0));
    assert!(summary
        .get("averagePercent")
        .map(|v| v.is_null())
        .unwrap_or(false));

    drop(s.stdin);
    let _ = s.child.wait();
    let _ = std::fs::remove_dir_all(workspace);
}
