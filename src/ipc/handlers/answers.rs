use crate::ipc::error::{err, ok};
use crate::ipc::helpers::{db_conn, now_rfc3339, required_str, require_role};
use crate::ipc::types::{AppState, Request};
use crate::scoring;
use rusqlite::OptionalExtension;
use serde_json::json;
use std::collections::HashMap;
use uuid::Uuid;

struct AttachedQuestion {
    id: String,
    correct_choice: String,
    marks: f64,
}

fn handle_submit(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(v) => v,
        Err(e) => return e,
    };
    let exam_id = match required_str(req, "examId") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let student_id = match required_str(req, "studentId") {
        Ok(v) => v,
        Err(e) => return e,
    };

    let exam_row: Option<(bool, f64, String)> = match conn
        .query_row(
            "SELECT published, pass_percent, class_id FROM exams WHERE id = ?",
            [&exam_id],
            |r| Ok((r.get::<_, i64>(0)? != 0, r.get(1)?, r.get(2)?)),
        )
        .optional()
    {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    let Some((published, pass_percent, class_id)) = exam_row else {
        return err(&req.id, "not_found", "exam not found", None);
    };
    if !published {
        return err(&req.id, "conflict", "exam is not published", None);
    }

    if let Err(e) = require_role(conn, req, &student_id, &["student"], "student") {
        return e;
    }
    let member: Option<i64> = match conn
        .query_row(
            "SELECT 1 FROM class_members WHERE class_id = ? AND student_id = ?",
            (&class_id, &student_id),
            |r| r.get(0),
        )
        .optional()
    {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    if member.is_none() {
        return err(
            &req.id,
            "bad_params",
            "student is not a member of the exam's class",
            None,
        );
    }

    let already: Option<i64> = match conn
        .query_row(
            "SELECT 1 FROM grades WHERE exam_id = ? AND student_id = ?",
            (&exam_id, &student_id),
            |r| r.get(0),
        )
        .optional()
    {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    if already.is_some() {
        return err(&req.id, "conflict", "already submitted", None);
    }

    let mut stmt = match conn.prepare(
        "SELECT q.id, q.correct_choice, q.marks
         FROM exam_questions eq
         JOIN questions q ON q.id = eq.question_id
         WHERE eq.exam_id = ?
         ORDER BY eq.sort_order",
    ) {
        Ok(s) => s,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    let questions = match stmt
        .query_map([&exam_id], |r| {
            Ok(AttachedQuestion {
                id: r.get(0)?,
                correct_choice: r.get(1)?,
                marks: r.get(2)?,
            })
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
    {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    if questions.is_empty() {
        return err(&req.id, "conflict", "exam has no questions", None);
    }

    let raw_answers = req
        .params
        .get("answers")
        .and_then(|v| v.as_object())
        .cloned()
        .unwrap_or_default();
    let attached_ids: HashMap<&str, ()> = questions.iter().map(|q| (q.id.as_str(), ())).collect();
    let mut chosen_by_question: HashMap<String, Option<String>> = HashMap::new();
    for (qid, v) in &raw_answers {
        if !attached_ids.contains_key(qid.as_str()) {
            return err(
                &req.id,
                "bad_params",
                "answers contains a question not attached to this exam",
                Some(json!({ "questionId": qid })),
            );
        }
        let chosen = if v.is_null() {
            None
        } else {
            let Some(s) = v.as_str() else {
                return err(
                    &req.id,
                    "bad_params",
                    "answers values must be 'A'..'D' or null",
                    Some(json!({ "questionId": qid })),
                );
            };
            let up = s.trim().to_ascii_uppercase();
            if !["A", "B", "C", "D"].contains(&up.as_str()) {
                return err(
                    &req.id,
                    "bad_params",
                    "answers values must be 'A'..'D' or null",
                    Some(json!({ "questionId": qid, "chosen": s })),
                );
            }
            Some(up)
        };
        chosen_by_question.insert(qid.clone(), chosen);
    }

    // Grade the whole sheet and write it in one transaction.
    let tx = match conn.unchecked_transaction() {
        Ok(t) => t,
        Err(e) => return err(&req.id, "db_tx_failed", e.to_string(), None),
    };

    let graded_at = now_rfc3339();
    let mut score = 0.0_f64;
    let mut total_marks = 0.0_f64;
    let mut correct_count = 0usize;
    let mut unanswered_count = 0usize;
    for q in &questions {
        let chosen = chosen_by_question.get(&q.id).cloned().flatten();
        let is_correct = chosen.as_deref() == Some(q.correct_choice.as_str());
        let awarded = if is_correct { q.marks } else { 0.0 };
        total_marks += q.marks;
        score += awarded;
        if is_correct {
            correct_count += 1;
        }
        if chosen.is_none() {
            unanswered_count += 1;
        }

        let answer_id = Uuid::new_v4().to_string();
        if let Err(e) = tx.execute(
            "INSERT INTO student_answers(id, exam_id, question_id, student_id, chosen, is_correct, awarded)
             VALUES(?, ?, ?, ?, ?, ?, ?)",
            (
                &answer_id,
                &exam_id,
                &q.id,
                &student_id,
                &chosen,
                is_correct as i64,
                awarded,
            ),
        ) {
            let _ = tx.rollback();
            return err(
                &req.id,
                "db_insert_failed",
                e.to_string(),
                Some(json!({ "table": "student_answers" })),
            );
        }
    }

    let percent = scoring::grade_percent(score, total_marks);
    let passed = percent >= pass_percent;
    let grade_id = Uuid::new_v4().to_string();
    if let Err(e) = tx.execute(
        "INSERT INTO grades(id, exam_id, student_id, score, total_marks, percent, passed, graded_at)
         VALUES(?, ?, ?, ?, ?, ?, ?, ?)",
        (
            &grade_id,
            &exam_id,
            &student_id,
            score,
            total_marks,
            percent,
            passed as i64,
            &graded_at,
        ),
    ) {
        let _ = tx.rollback();
        return err(
            &req.id,
            "db_insert_failed",
            e.to_string(),
            Some(json!({ "table": "grades" })),
        );
    }

    if let Err(e) = tx.commit() {
        return err(&req.id, "db_commit_failed", e.to_string(), None);
    }

    tracing::info!(
        exam_id = %exam_id,
        student_id = %student_id,
        percent,
        passed,
        "answer sheet graded"
    );
    ok(
        &req.id,
        json!({
            "gradeId": grade_id,
            "examId": exam_id,
            "studentId": student_id,
            "score": score,
            "totalMarks": total_marks,
            "percent": percent,
            "passed": passed,
            "gradedAt": graded_at,
            "questionCount": questions.len(),
            "correctCount": correct_count,
            "wrongCount": questions.len() - correct_count - unanswered_count,
            "unansweredCount": unanswered_count
        }),
    )
}

fn handle_for_student(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(v) => v,
        Err(e) => return e,
    };
    let exam_id = match required_str(req, "examId") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let student_id = match required_str(req, "studentId") {
        Ok(v) => v,
        Err(e) => return e,
    };

    let grade: Option<(f64, f64, Option<f64>, Option<i64>, String)> = match conn
        .query_row(
            "SELECT score, total_marks, percent, passed, graded_at
             FROM grades WHERE exam_id = ? AND student_id = ?",
            (&exam_id, &student_id),
            |r| Ok((r.get(0)?, r.get(1)?, r.get(2)?, r.get(3)?, r.get(4)?)),
        )
        .optional()
    {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    let Some((score, total_marks, percent, passed, graded_at)) = grade else {
        return err(&req.id, "not_found", "no submission for this exam and student", None);
    };

    let mut stmt = match conn.prepare(
        "SELECT q.id, q.prompt, sa.chosen, q.correct_choice, sa.is_correct, sa.awarded, q.marks
         FROM student_answers sa
         JOIN questions q ON q.id = sa.question_id
         JOIN exam_questions eq ON eq.exam_id = sa.exam_id AND eq.question_id = sa.question_id
         WHERE sa.exam_id = ? AND sa.student_id = ?
         ORDER BY eq.sort_order",
    ) {
        Ok(s) => s,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    let rows = stmt
        .query_map((&exam_id, &student_id), |row| {
            let question_id: String = row.get(0)?;
            let prompt: String = row.get(1)?;
            let chosen: Option<String> = row.get(2)?;
            let correct_choice: String = row.get(3)?;
            let is_correct: i64 = row.get(4)?;
            let awarded: f64 = row.get(5)?;
            let marks: f64 = row.get(6)?;
            Ok(json!({
                "questionId": question_id,
                "prompt": prompt,
                "chosen": chosen,
                "correctChoice": correct_choice,
                "isCorrect": is_correct != 0,
                "awarded": awarded,
                "marks": marks
            }))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>());

    match rows {
        Ok(answers) => ok(
            &req.id,
            json!({
                "examId": exam_id,
                "studentId": student_id,
                "grade": {
                    "score": score,
                    "totalMarks": total_marks,
                    "percent": percent,
                    "passed": passed.unwrap_or(0) != 0,
                    "gradedAt": graded_at
                },
                "answers": answers
            }),
        ),
        Err(e) => err(&req.id, "db_query_failed", e.to_string(), None),
    }
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "answers.submit" => Some(handle_submit(state, req)),
        "answers.forStudent" => Some(handle_for_student(state, req)),
        _ => None,
    }
}
