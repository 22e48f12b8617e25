
use serde_json::json;
use test_support::Sidecar;

#[test]
fn leaderboard_ranks_ties_filters_and_limits() {
    let (mut s, workspace) = Sidecar::with_workspace("examdesk-leaderboard");

    let teacher_id = s.register("Adler, Kim", "kim@example.test", "teacher");
    let alice = s.register("Abara, Ngozi", "ngozi@example.test", "student");
    let mia = s.register("Brandt, Mia", "mia@example.test", "student");
    let dan = s.register("Cho, Daniel", "dan@example.test", "student");

    let math = s.create_subject("Mathematics");
    let science = s.create_subject("Science");
    let class_math = s.create_class("10A Math", &math, &teacher_id);
    let class_sci = s.create_class("10A Science", &science, &teacher_id);
    for sid in [&alice, &mia, &dan] {
        s.enroll(&class_math, sid);
    }
    s.enroll(&class_sci, &mia);

    let bank = s.create_bank("Mixed", &math, &teacher_id);
    let q1 = s.create_question(&bank, "Q1", "A", 1.0);
    let q2 = s.create_question(&bank, "Q2", "B", 1.0);
    let q3 = s.create_question(&bank, "Q3", "C", 1.0);

    let exam1 = s.create_published_exam(
        "Math quiz 1",
        &math,
        &class_math,
        &teacher_id,
        &[q1.clone(), q2.clone()],
        50.0,
    );
    let exam2 = s.create_published_exam(
        "Math quiz 2",
        &math,
        &class_math,
        &teacher_id,
        &[q1.clone(), q2.clone()],
        50.0,
    );
    let exam3 = s.create_published_exam(
        "Science quiz",
        &science,
        &class_sci,
        &teacher_id,
        &[q3.clone()],
        50.0,
    );

    // exam1: alice 100, mia 50, dan 100. exam2: alice 100, mia 50.
    let _ = s.submit(&exam1, &alice, &[(&q1, Some("A")), (&q2, Some("B"))]);
    let _ = s.submit(&exam1, &mia, &[(&q1, Some("A")), (&q2, Some("D"))]);
    let _ = s.submit(&exam1, &dan, &[(&q1, Some("A")), (&q2, Some("B"))]);
    let _ = s.submit(&exam2, &alice, &[(&q1, Some("A")), (&q2, Some("B"))]);
    let _ = s.submit(&exam2, &mia, &[(&q1, Some("D")), (&q2, Some("B"))]);
    // exam3: mia 100.
    let _ = s.submit(&exam3, &mia, &[(&q3, Some("C"))]);

    // Overall: alice avg 100 over 2, dan avg 100 over 1, mia avg 66.67 over 3.
    let board = s.ok("dashboard.topStudents", json!({}));
    let rows = board
        .get("rows")
        .and_then(|v| v.as_array())
        .cloned()
        .unwrap_or_default();
    assert_eq!(rows.len(), 3);
    assert_eq!(
        rows[0].get("studentId").and_then(|v| v.as_str()),
        Some(alice.as_str())
    );
    assert_eq!(rows[0].get("rank").and_then(|v| v.as_u64()), Some(1));
    assert_eq!(rows[0].get("examsTaken").and_then(|v| v.as_u64()), Some(2));
    assert_eq!(
        rows[0].get("averagePercent").and_then(|v| v.as_f64()),
        Some(100.0)
    );
    // Same average, fewer exams: shares rank 1, sorts after.
    assert_eq!(
        rows[1].get("studentId").and_then(|v| v.as_str()),
        Some(dan.as_str())
    );
    assert_eq!(rows[1].get("rank").and_then(|v| v.as_u64()), Some(1));
    assert_eq!(
        rows[2].get("studentId").and_then(|v| v.as_str()),
        Some(mia.as_str())
    );
    assert_eq!(rows[2].get("rank").and_then(|v| v.as_u64()), Some(3));
    assert_eq!(
        rows[2].get("averagePercent").and_then(|v| v.as_f64()),
        Some(66.67)
    );
    assert_eq!(rows[2].get("passRate").and_then(|v| v.as_f64()), Some(100.0));

    // minExams floor removes one-exam entries.
    let board = s.ok("dashboard.topStudents", json!({ "minExams": 2 }));
    let rows = board
        .get("rows")
        .and_then(|v| v.as_array())
        .cloned()
        .unwrap_or_default();
    let ids = rows
        .iter()
        .filter_map(|r| r.get("studentId").and_then(|v| v.as_str()))
        .collect::<Vec<_>>();
    assert_eq!(ids, vec![alice.as_str(), mia.as_str()]);

    // Limit cuts after ranking.
    let board = s.ok("dashboard.topStudents", json!({ "limit": 1 }));
    let rows = board
        .get("rows")
        .and_then(|v| v.as_array())
        .cloned()
        .unwrap_or_default();
    assert_eq!(rows.len(), 1);
    assert_eq!(
        rows[0].get("studentId").and_then(|v| v.as_str()),
        Some(alice.as_str())
    );

    // Subject and class filters narrow the grade pool.
    let board = s.ok("dashboard.topStudents", json!({ "subjectId": science }));
    let rows = board
        .get("rows")
        .and_then(|v| v.as_array())
        .cloned()
        .unwrap_or_default();
    assert_eq!(rows.len(), 1);
    assert_eq!(
        rows[0].get("studentId").and_then(|v| v.as_str()),
        Some(mia.as_str())
    );
    assert_eq!(
        rows[0].get("averagePercent").and_then(|v| v.as_f64()),
        Some(100.0)
    );
    let board = s.ok("dashboard.topStudents", json!({ "classId": class_sci }));
    let rows = board
        .get("rows")
        .and_then(|v| v.as_array())
        .cloned()
        .unwrap_or_default();
    assert_eq!(rows.len(), 1);

    // Unknown filter targets are not silently empty boards.
    let missing = s.err_code("dashboard.topStudents", json!({ "subjectId": "missing" }));
    assert_eq!(missing, "not_found");
    let bad_limit = s.err_code("dashboard.topStudents", json!({ "limit": 0 }));
    assert_eq!(bad_limit, "bad_params");

    drop(s.stdin);
    let _ = s.child.wait();
    let _ = std::fs::remove_dir_all(workspace);
}
