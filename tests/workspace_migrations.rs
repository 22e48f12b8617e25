
use serde_json::json;
use test_support::Sidecar;

#[test]
fn workspace_reopen_preserves_data() {
    let (mut s, workspace) = Sidecar::with_workspace("examdesk-reopen");

    let teacher_id = s.register("Adler, Kim", "kim@example.test", "teacher");
    let subject_id = s.create_subject("Computing");
    let _class_id = s.create_class("11B Computing", &subject_id, &teacher_id);

    drop(s.stdin);
    let _ = s.child.wait();

    // Second process over the same workspace sees everything.
    let (mut child, mut stdin, mut reader) = test_support::spawn_sidecar();
    let _ = test_support::request_ok(
        &mut stdin,
        &mut reader,
        "1",
        "workspace.select",
        json!({ "path": workspace.to_string_lossy() }),
    );
    let listed = test_support::request_ok(&mut stdin, &mut reader, "2", "classes.list", json!({}));
    let classes = listed
        .get("classes")
        .and_then(|v| v.as_array())
        .cloned()
        .unwrap_or_default();
    assert_eq!(classes.len(), 1);
    assert_eq!(
        classes[0].get("name").and_then(|v| v.as_str()),
        Some("11B Computing")
    );
    assert_eq!(
        classes[0].get("teacherName").and_then(|v| v.as_str()),
        Some("Adler, Kim")
    );

    drop(stdin);
    let _ = child.wait();
    let _ = std::fs::remove_dir_all(workspace);
}

#[test]
fn grade_percent_columns_are_backfilled_on_open() {
    let (mut s, workspace) = Sidecar::with_workspace("examdesk-grade-migration");

    let teacher_id = s.register("Adler, Kim", "kim@example.test", "teacher");
    let student_id = s.register("Boame, Esi", "esi@example.test", "student");
    let subject_id = s.create_subject("Economics");
    let class_id = s.create_class("12C Econ", &subject_id, &teacher_id);
    s.enroll(&class_id, &student_id);
    let bank_id = s.create_bank("Markets", &subject_id, &teacher_id);
    let q1 = s.create_question(&bank_id, "Supply curve slopes?", "A", 1.0);
    let q2 = s.create_question(&bank_id, "Demand curve slopes?", "B", 1.0);
    let exam_id = s.create_published_exam(
        "Curves quiz",
        &subject_id,
        &class_id,
        &teacher_id,
        &[q1.clone(), q2.clone()],
        50.0,
    );
    let _ = s.submit(&exam_id, &student_id, &[(&q1, Some("A")), (&q2, Some("D"))]);

    drop(s.stdin);
    let _ = s.child.wait();

    // Rewind the grades table to the pre-percent schema.
    {
        let db_path = workspace.join("examdesk.sqlite3");
        let conn = rusqlite::Connection::open(&db_path).expect("open db directly");
        conn.execute("ALTER TABLE grades DROP COLUMN percent", [])
            .expect("drop percent");
        conn.execute("ALTER TABLE grades DROP COLUMN passed", [])
            .expect("drop passed");
    }

    // Reopening migrates: columns come back, values recomputed from
    // score / total_marks and the exam's pass mark.
    let (mut child, mut stdin, mut reader) = test_support::spawn_sidecar();
    let _ = test_support::request_ok(
        &mut stdin,
        &mut reader,
        "1",
        "workspace.select",
        json!({ "path": workspace.to_string_lossy() }),
    );
    let grades = test_support::request_ok(
        &mut stdin,
        &mut reader,
        "2",
        "grades.forStudent",
        json!({ "studentId": student_id }),
    );
    let rows = grades
        .get("grades")
        .and_then(|v| v.as_array())
        .cloned()
        .unwrap_or_default();
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].get("percent").and_then(|v| v.as_f64()), Some(50.0));
    assert_eq!(rows[0].get("passed").and_then(|v| v.as_bool()), Some(true));

    drop(stdin);
    let _ = child.wait();
    let _ = std::fs::remove_dir_all(workspace);
}
