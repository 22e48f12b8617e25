
use serde_json::json;
use test_support::{request, spawn_sidecar, temp_dir};

#[test]
fn router_dispatch_smoke_covers_handler_families() {
    let workspace = temp_dir("examdesk-router-smoke");
    let csv_out = workspace.join("smoke-export.csv");

    let (mut child, mut stdin, mut reader) = spawn_sidecar();

    let health = request(&mut stdin, &mut reader, "1", "health", json!({}));
    assert_eq!(health.get("ok").and_then(|v| v.as_bool()), Some(true));

    // Data methods refuse until a workspace is selected.
    let early = request(&mut stdin, &mut reader, "2", "classes.create", json!({ "name": "X" }));
    assert_eq!(
        early
            .get("error")
            .and_then(|e| e.get("code"))
            .and_then(|v| v.as_str()),
        Some("no_workspace")
    );

    let _ = request(
        &mut stdin,
        &mut reader,
        "3",
        "workspace.select",
        json!({ "path": workspace.to_string_lossy() }),
    );

    let teacher = request(
        &mut stdin,
        &mut reader,
        "4",
        "accounts.register",
        json!({
            "fullName": "Reyes, Ana",
            "email": "ana@example.test",
            "password": "pw-123456",
            "role": "teacher"
        }),
    );
    let teacher_id = teacher
        .get("result")
        .and_then(|v| v.get("accountId"))
        .and_then(|v| v.as_str())
        .expect("teacher accountId")
        .to_string();

    let _ = request(&mut stdin, &mut reader, "5", "accounts.list", json!({}));
    let subject = request(
        &mut stdin,
        &mut reader,
        "6",
        "subjects.create",
        json!({ "name": "Mathematics" }),
    );
    let subject_id = subject
        .get("result")
        .and_then(|v| v.get("subjectId"))
        .and_then(|v| v.as_str())
        .expect("subjectId")
        .to_string();

    let created = request(
        &mut stdin,
        &mut reader,
        "7",
        "classes.create",
        json!({ "name": "Smoke Class", "subjectId": subject_id, "teacherId": teacher_id }),
    );
    let class_id = created
        .get("result")
        .and_then(|v| v.get("classId"))
        .and_then(|v| v.as_str())
        .expect("classId")
        .to_string();

    let _ = request(&mut stdin, &mut reader, "8", "classes.list", json!({}));
    let _ = request(
        &mut stdin,
        &mut reader,
        "9",
        "classes.members.list",
        json!({ "classId": class_id }),
    );
    let _ = request(
        &mut stdin,
        &mut reader,
        "10",
        "banks.list",
        json!({}),
    );
    let _ = request(
        &mut stdin,
        &mut reader,
        "11",
        "exams.list",
        json!({ "classId": class_id }),
    );
    let _ = request(
        &mut stdin,
        &mut reader,
        "12",
        "grades.forExam",
        json!({ "examId": "missing" }),
    );
    let _ = request(
        &mut stdin,
        &mut reader,
        "13",
        "dashboard.teacher",
        json!({ "teacherId": teacher_id }),
    );
    let _ = request(
        &mut stdin,
        &mut reader,
        "14",
        "dashboard.topStudents",
        json!({}),
    );
    let _ = request(
        &mut stdin,
        &mut reader,
        "15",
        "reports.exportResultsCsv",
        json!({ "examId": "missing", "outPath": csv_out.to_string_lossy() }),
    );

    let unknown = request(&mut stdin, &mut reader, "16", "nope.method", json!({}));
    assert_eq!(
        unknown
            .get("error")
            .and_then(|e| e.get("code"))
            .and_then(|v| v.as_str()),
        Some("not_implemented")
    );

    let _ = request(
        &mut stdin,
        &mut reader,
        "17",
        "classes.delete",
        json!({ "classId": class_id }),
    );

    drop(stdin);
    let _ = child.wait();
    let _ = std::fs::remove_dir_all(workspace);
}
