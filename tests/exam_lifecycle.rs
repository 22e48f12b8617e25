
use serde_json::json;
use test_support::Sidecar;

#[test]
fn exam_setup_publish_and_open() {
    let (mut s, workspace) = Sidecar::with_workspace("examdesk-exam-lifecycle");

    let teacher_id = s.register("Adler, Kim", "kim@example.test", "teacher");
    let subject_id = s.create_subject("Biology");
    let class_id = s.create_class("9C Biology", &subject_id, &teacher_id);
    let bank_id = s.create_bank("Cell basics", &subject_id, &teacher_id);
    let q1 = s.create_question(&bank_id, "Organelle with DNA?", "A", 2.0);
    let q2 = s.create_question(&bank_id, "Site of photosynthesis?", "C", 3.0);

    let created = s.ok(
        "exams.create",
        json!({
            "title": "Unit 1 Quiz",
            "subjectId": subject_id,
            "classId": class_id,
            "teacherId": teacher_id,
            "passPercent": 60.0
        }),
    );
    let exam_id = created
        .get("examId")
        .and_then(|v| v.as_str())
        .expect("examId")
        .to_string();

    // No questions yet: publish refuses.
    let code = s.err_code("exams.publish", json!({ "examId": exam_id }));
    assert_eq!(code, "conflict");

    let set = s.ok(
        "exams.questions.set",
        json!({ "examId": exam_id, "questionIds": [q1, q2] }),
    );
    assert_eq!(set.get("questionCount").and_then(|v| v.as_u64()), Some(2));

    let opened = s.ok("exams.open", json!({ "examId": exam_id }));
    assert_eq!(opened.get("totalMarks").and_then(|v| v.as_f64()), Some(5.0));
    let questions = opened
        .get("questions")
        .and_then(|v| v.as_array())
        .cloned()
        .unwrap_or_default();
    assert_eq!(questions.len(), 2);
    // The answer key stays server-side unless explicitly requested.
    assert!(questions.iter().all(|q| q.get("correctChoice").is_none()));

    let with_key = s.ok(
        "exams.open",
        json!({ "examId": exam_id, "includeAnswers": true }),
    );
    let keyed = with_key
        .get("questions")
        .and_then(|v| v.as_array())
        .cloned()
        .unwrap_or_default();
    assert_eq!(
        keyed[0].get("correctChoice").and_then(|v| v.as_str()),
        Some("A")
    );

    let published = s.ok("exams.publish", json!({ "examId": exam_id }));
    assert_eq!(published.get("published").and_then(|v| v.as_bool()), Some(true));

    // Question list is frozen once published.
    let frozen = s.err_code(
        "exams.questions.set",
        json!({ "examId": exam_id, "questionIds": [q1] }),
    );
    assert_eq!(frozen, "conflict");
    let sched = s.err_code(
        "exams.update",
        json!({ "examId": exam_id, "patch": { "passPercent": 40.0 } }),
    );
    assert_eq!(sched, "conflict");
    // Title changes stay allowed.
    let _ = s.ok(
        "exams.update",
        json!({ "examId": exam_id, "patch": { "title": "Unit 1 Quiz (retitled)" } }),
    );

    let listed = s.ok(
        "exams.list",
        json!({ "classId": class_id, "publishedOnly": true }),
    );
    let exams = listed
        .get("exams")
        .and_then(|v| v.as_array())
        .cloned()
        .unwrap_or_default();
    assert_eq!(exams.len(), 1);
    assert_eq!(
        exams[0].get("title").and_then(|v| v.as_str()),
        Some("Unit 1 Quiz (retitled)")
    );
    assert_eq!(exams[0].get("questionCount").and_then(|v| v.as_u64()), Some(2));

    drop(s.stdin);
    let _ = s.child.wait();
    let _ = std::fs::remove_dir_all(workspace);
}

#[test]
fn bank_and_question_guards() {
    let (mut s, workspace) = Sidecar::with_workspace("examdesk-bank-guards");

    let teacher_id = s.register("Adler, Kim", "kim@example.test", "teacher");
    let student_id = s.register("Boame, Esi", "esi@example.test", "student");
    let subject_id = s.create_subject("History");

    // Students cannot own banks.
    let code = s.err_code(
        "banks.create",
        json!({ "title": "Nope", "subjectId": subject_id, "ownerId": student_id }),
    );
    assert_eq!(code, "bad_params");

    let bank_id = s.create_bank("Revolutions", &subject_id, &teacher_id);
    let q1 = s.create_question(&bank_id, "Year of 1789 revolution?", "B", 1.0);
    let q2 = s.create_question(&bank_id, "Author of common sense?", "D", 1.0);

    let listed = s.ok("questions.list", json!({ "bankId": bank_id }));
    let questions = listed
        .get("questions")
        .and_then(|v| v.as_array())
        .cloned()
        .unwrap_or_default();
    assert_eq!(questions.len(), 2);
    assert_eq!(questions[0].get("sortOrder").and_then(|v| v.as_i64()), Some(0));
    assert_eq!(questions[1].get("sortOrder").and_then(|v| v.as_i64()), Some(1));

    let bad_choice = s.err_code(
        "questions.create",
        json!({
            "bankId": bank_id,
            "prompt": "p",
            "choiceA": "a",
            "choiceB": "b",
            "choiceC": "c",
            "choiceD": "d",
            "correctChoice": "E"
        }),
    );
    assert_eq!(bad_choice, "bad_params");

    // Attach q1 to an exam; key edits and deletes must refuse.
    let class_id = s.create_class("7A History", &subject_id, &teacher_id);
    let exam = s.ok(
        "exams.create",
        json!({
            "title": "Checkpoint",
            "subjectId": subject_id,
            "classId": class_id,
            "teacherId": teacher_id
        }),
    );
    let exam_id = exam.get("examId").and_then(|v| v.as_str()).expect("examId").to_string();
    let _ = s.ok(
        "exams.questions.set",
        json!({ "examId": exam_id, "questionIds": [q1.clone()] }),
    );

    let locked = s.err_code(
        "questions.update",
        json!({ "questionId": q1, "patch": { "correctChoice": "A" } }),
    );
    assert_eq!(locked, "conflict");
    // Prompt edits are typo fixes; they stay open.
    let _ = s.ok(
        "questions.update",
        json!({ "questionId": q1, "patch": { "prompt": "Year of the 1789 revolution?" } }),
    );
    let del_locked = s.err_code("questions.delete", json!({ "questionId": q1 }));
    assert_eq!(del_locked, "conflict");
    let bank_locked = s.err_code("banks.delete", json!({ "bankId": bank_id }));
    assert_eq!(bank_locked, "conflict");

    // Detached questions delete fine, then the bank does too.
    let _ = s.ok("questions.delete", json!({ "questionId": q2 }));
    let _ = s.ok("exams.delete", json!({ "examId": exam_id }));
    let _ = s.ok("banks.delete", json!({ "bankId": bank_id }));

    // The subject is still referenced by the class.
    let subj_locked = s.err_code("subjects.delete", json!({ "subjectId": subject_id }));
    assert_eq!(subj_locked, "conflict");
    let _ = s.ok("classes.delete", json!({ "classId": class_id }));
    let _ = s.ok("subjects.delete", json!({ "subjectId": subject_id }));

    drop(s.stdin);
    let _ = s.child.wait();
    let _ = std::fs::remove_dir_all(workspace);
}

#[test]
fn class_delete_cascades_exam_data() {
    let (mut s, workspace) = Sidecar::with_workspace("examdesk-class-cascade");

    let teacher_id = s.register("Adler, Kim", "kim@example.test", "teacher");
    let student_id = s.register("Boame, Esi", "esi@example.test", "student");
    let subject_id = s.create_subject("Chemistry");
    let class_id = s.create_class("11A Chem", &subject_id, &teacher_id);
    s.enroll(&class_id, &student_id);

    let bank_id = s.create_bank("Stoichiometry", &subject_id, &teacher_id);
    let q1 = s.create_question(&bank_id, "Moles in 18g of water?", "A", 1.0);
    let exam_id = s.create_published_exam(
        "Mole quiz",
        &subject_id,
        &class_id,
        &teacher_id,
        &[q1.clone()],
        50.0,
    );
    let _ = s.submit(&exam_id, &student_id, &[(&q1, Some("A"))]);

    let _ = s.ok("classes.delete", json!({ "classId": class_id }));

    // Exam and its grades went with the class.
    let gone = s.err_code("exams.open", json!({ "examId": exam_id }));
    assert_eq!(gone, "not_found");
    let grades = s.ok("grades.forStudent", json!({ "studentId": student_id }));
    let rows = grades
        .get("grades")
        .and_then(|v| v.as_array())
        .cloned()
        .unwrap_or_default();
    assert!(rows.is_empty());

    // The bank survives; its question is detached again.
    let _ = s.ok("questions.delete", json!({ "questionId": q1 }));
    let _ = s.ok("banks.delete", json!({ "bankId": bank_id }));

    drop(s.stdin);
    let _ = s.child.wait();
    let _ = std::fs::remove_dir_all(workspace);
}
