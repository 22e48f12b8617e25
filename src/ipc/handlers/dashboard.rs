use crate::ipc::error::{err, ok};
use crate::ipc::helpers::{db_conn, required_str, require_role, row_exists};
use crate::ipc::types::{AppState, Request};
use crate::scoring;
use rusqlite::OptionalExtension;
use serde_json::json;
use std::collections::HashMap;

fn parse_count(
    req: &Request,
    key: &str,
    default: usize,
    max: usize,
) -> Result<usize, serde_json::Value> {
    let Some(v) = req.params.get(key) else {
        return Ok(default);
    };
    if v.is_null() {
        return Ok(default);
    }
    let Some(n) = v.as_u64() else {
        return Err(err(
            &req.id,
            "bad_params",
            format!("{} must be a positive integer", key),
            None,
        ));
    };
    if n == 0 || n as usize > max {
        return Err(err(
            &req.id,
            "bad_params",
            format!("{} must be in range 1..={}", key, max),
            None,
        ));
    }
    Ok(n as usize)
}

fn stats_err(req: &Request, e: scoring::StatsError) -> serde_json::Value {
    err(&req.id, &e.code, e.message, e.details)
}

/// An exam window counts as open until its end passes; a missing or
/// unparsable ends_at never hides the exam.
fn window_open(ends_at: Option<&str>, now: chrono::DateTime<chrono::Utc>) -> bool {
    let Some(raw) = ends_at else {
        return true;
    };
    match chrono::DateTime::parse_from_rfc3339(raw) {
        Ok(t) => t.with_timezone(&chrono::Utc) >= now,
        Err(_) => true,
    }
}

fn handle_student(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(v) => v,
        Err(e) => return e,
    };
    let student_id = match required_str(req, "studentId") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let recent_limit = match parse_count(req, "recentLimit", 5, 50) {
        Ok(v) => v,
        Err(e) => return e,
    };
    if let Err(e) = require_role(conn, req, &student_id, &["student"], "student") {
        return e;
    }
    let student: (String, String) = match conn.query_row(
        "SELECT full_name, email FROM accounts WHERE id = ?",
        [&student_id],
        |r| Ok((r.get(0)?, r.get(1)?)),
    ) {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };

    let outcomes = match scoring::student_outcomes(conn, &student_id) {
        Ok(v) => v,
        Err(e) => return stats_err(req, e),
    };
    let summary = scoring::pass_fail_rollup(outcomes.iter().map(|o| (o.percent, o.passed)));
    let recent = outcomes.iter().take(recent_limit).collect::<Vec<_>>();

    let mut stmt = match conn.prepare(
        "SELECT e.id, e.title, s.name, e.class_id, c.name, e.starts_at, e.ends_at, e.duration_minutes
         FROM exams e
         JOIN classes c ON c.id = e.class_id
         JOIN subjects s ON s.id = e.subject_id
         JOIN class_members m ON m.class_id = e.class_id
         WHERE m.student_id = ?
           AND e.published != 0
           AND NOT EXISTS (
             SELECT 1 FROM grades g
             WHERE g.exam_id = e.id AND g.student_id = m.student_id
           )
         ORDER BY e.starts_at IS NULL, e.starts_at, e.title",
    ) {
        Ok(s) => s,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    let pending = stmt
        .query_map([&student_id], |row| {
            let id: String = row.get(0)?;
            let title: String = row.get(1)?;
            let subject_name: String = row.get(2)?;
            let class_id: String = row.get(3)?;
            let class_name: String = row.get(4)?;
            let starts_at: Option<String> = row.get(5)?;
            let ends_at: Option<String> = row.get(6)?;
            let duration_minutes: Option<i64> = row.get(7)?;
            Ok((
                json!({
                    "examId": id,
                    "title": title,
                    "subjectName": subject_name,
                    "classId": class_id,
                    "className": class_name,
                    "startsAt": starts_at,
                    "endsAt": ends_at.clone(),
                    "durationMinutes": duration_minutes
                }),
                ends_at,
            ))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>());
    let pending = match pending {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };

    let now = chrono::Utc::now();
    let upcoming = pending
        .into_iter()
        .filter(|(_, ends_at)| window_open(ends_at.as_deref(), now))
        .map(|(row, _)| row)
        .collect::<Vec<_>>();

    ok(
        &req.id,
        json!({
            "student": {
                "id": student_id,
                "fullName": student.0,
                "email": student.1
            },
            "summary": summary,
            "recentResults": recent,
            "upcomingExams": upcoming
        }),
    )
}

fn handle_teacher(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(v) => v,
        Err(e) => return e,
    };
    let teacher_id = match required_str(req, "teacherId") {
        Ok(v) => v,
        Err(e) => return e,
    };
    if let Err(e) = require_role(conn, req, &teacher_id, &["teacher", "admin"], "teacher") {
        return e;
    }
    let teacher_name: String = match conn.query_row(
        "SELECT full_name FROM accounts WHERE id = ?",
        [&teacher_id],
        |r| r.get(0),
    ) {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };

    let counts: (i64, i64, i64, i64, i64) = match conn.query_row(
        "SELECT
           (SELECT COUNT(*) FROM classes c WHERE c.teacher_id = ?1),
           (SELECT COUNT(DISTINCT m.student_id)
              FROM class_members m
              JOIN classes c ON c.id = m.class_id
              WHERE c.teacher_id = ?1),
           (SELECT COUNT(*) FROM exams e WHERE e.teacher_id = ?1),
           (SELECT COUNT(*) FROM exams e WHERE e.teacher_id = ?1 AND e.published != 0),
           (SELECT COUNT(*) FROM question_banks b WHERE b.owner_id = ?1)",
        [&teacher_id],
        |r| Ok((r.get(0)?, r.get(1)?, r.get(2)?, r.get(3)?, r.get(4)?)),
    ) {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };

    // One pass over every grade of the teacher's exams feeds both the overall
    // rollup and the per-exam ones.
    let mut stmt = match conn.prepare(
        "SELECT e.id, g.percent, g.passed
         FROM grades g
         JOIN exams e ON e.id = g.exam_id
         WHERE e.teacher_id = ?",
    ) {
        Ok(s) => s,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    let grade_rows = match stmt
        .query_map([&teacher_id], |r| {
            Ok((
                r.get::<_, String>(0)?,
                r.get::<_, Option<f64>>(1)?.unwrap_or(0.0),
                r.get::<_, Option<i64>>(2)?.unwrap_or(0) != 0,
            ))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
    {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };

    let overall =
        scoring::pass_fail_rollup(grade_rows.iter().map(|(_, percent, passed)| (*percent, *passed)));
    let mut grades_by_exam: HashMap<String, Vec<(f64, bool)>> = HashMap::new();
    for (exam_id, percent, passed) in grade_rows {
        grades_by_exam.entry(exam_id).or_default().push((percent, passed));
    }

    let mut stmt = match conn.prepare(
        "SELECT e.id, e.title, s.name, c.name, e.published, e.created_at
         FROM exams e
         JOIN subjects s ON s.id = e.subject_id
         JOIN classes c ON c.id = e.class_id
         WHERE e.teacher_id = ?
         ORDER BY e.created_at DESC, e.title",
    ) {
        Ok(s) => s,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    let exams = stmt
        .query_map([&teacher_id], |row| {
            let id: String = row.get(0)?;
            let title: String = row.get(1)?;
            let subject_name: String = row.get(2)?;
            let class_name: String = row.get(3)?;
            let published: i64 = row.get(4)?;
            let created_at: String = row.get(5)?;
            Ok((id, title, subject_name, class_name, published != 0, created_at))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>());
    let exams = match exams {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };

    let per_exam = exams
        .into_iter()
        .map(|(id, title, subject_name, class_name, published, created_at)| {
            let rollup = scoring::pass_fail_rollup(
                grades_by_exam.get(&id).into_iter().flatten().copied(),
            );
            json!({
                "examId": id,
                "title": title,
                "subjectName": subject_name,
                "className": class_name,
                "published": published,
                "createdAt": created_at,
                "summary": rollup
            })
        })
        .collect::<Vec<_>>();

    ok(
        &req.id,
        json!({
            "teacher": { "id": teacher_id, "fullName": teacher_name },
            "counts": {
                "classes": counts.0,
                "students": counts.1,
                "exams": counts.2,
                "publishedExams": counts.3,
                "questionBanks": counts.4
            },
            "overall": overall,
            "exams": per_exam
        }),
    )
}

fn handle_exam_stats(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(v) => v,
        Err(e) => return e,
    };
    let exam_id = match required_str(req, "examId") {
        Ok(v) => v,
        Err(e) => return e,
    };

    let exam: Option<(String, f64, String, i64)> = match conn
        .query_row(
            "SELECT title, pass_percent, class_id, published FROM exams WHERE id = ?",
            [&exam_id],
            |r| Ok((r.get(0)?, r.get(1)?, r.get(2)?, r.get(3)?)),
        )
        .optional()
    {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    let Some((title, pass_percent, class_id, published)) = exam else {
        return err(&req.id, "not_found", "exam not found", None);
    };

    let outcomes = match scoring::exam_outcomes(conn, &exam_id) {
        Ok(v) => v,
        Err(e) => return stats_err(req, e),
    };
    let summary = scoring::pass_fail_rollup(outcomes.iter().map(|o| (o.percent, o.passed)));
    let percents = outcomes.iter().map(|o| o.percent).collect::<Vec<_>>();
    let distribution = scoring::distribution_bins(&percents);

    let member_count: i64 = match conn.query_row(
        "SELECT COUNT(*) FROM class_members WHERE class_id = ?",
        [&class_id],
        |r| r.get(0),
    ) {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    let participants = outcomes.len();
    let absent = (member_count as usize).saturating_sub(participants);

    let mut stmt = match conn.prepare(
        "SELECT q.id, q.prompt, eq.sort_order, q.marks,
                (SELECT COUNT(*) FROM student_answers sa
                   WHERE sa.exam_id = eq.exam_id AND sa.question_id = q.id
                     AND sa.chosen IS NOT NULL) AS answered,
                (SELECT COUNT(*) FROM student_answers sa
                   WHERE sa.exam_id = eq.exam_id AND sa.question_id = q.id
                     AND sa.is_correct != 0) AS correct
         FROM exam_questions eq
         JOIN questions q ON q.id = eq.question_id
         WHERE eq.exam_id = ?
         ORDER BY eq.sort_order",
    ) {
        Ok(s) => s,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    let per_question = stmt
        .query_map([&exam_id], |row| {
            let question_id: String = row.get(0)?;
            let prompt: String = row.get(1)?;
            let sort_order: i64 = row.get(2)?;
            let marks: f64 = row.get(3)?;
            let answered: i64 = row.get(4)?;
            let correct: i64 = row.get(5)?;
            let correct_rate = if participants > 0 {
                Some(scoring::round2(100.0 * correct as f64 / participants as f64))
            } else {
                None
            };
            Ok(json!({
                "questionId": question_id,
                "prompt": prompt,
                "sortOrder": sort_order,
                "marks": marks,
                "answeredCount": answered,
                "correctCount": correct,
                "correctRate": correct_rate
            }))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>());
    let per_question = match per_question {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };

    ok(
        &req.id,
        json!({
            "exam": {
                "id": exam_id,
                "title": title,
                "passPercent": pass_percent,
                "published": published != 0
            },
            "participants": participants,
            "memberCount": member_count,
            "absent": absent,
            "summary": summary,
            "distribution": distribution,
            "perQuestion": per_question
        }),
    )
}

fn handle_top_students(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(v) => v,
        Err(e) => return e,
    };
    let limit = match parse_count(req, "limit", 10, 100) {
        Ok(v) => v,
        Err(e) => return e,
    };
    let min_exams = match parse_count(req, "minExams", 1, 1000) {
        Ok(v) => v,
        Err(e) => return e,
    };
    let subject_id = match crate::ipc::helpers::optional_str(req, "subjectId") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let class_id = match crate::ipc::helpers::optional_str(req, "classId") {
        Ok(v) => v,
        Err(e) => return e,
    };
    if let Some(sid) = subject_id.as_deref() {
        if let Err(e) = row_exists(conn, req, "SELECT 1 FROM subjects WHERE id = ?", sid, "subject")
        {
            return e;
        }
    }
    if let Some(cid) = class_id.as_deref() {
        if let Err(e) = row_exists(conn, req, "SELECT 1 FROM classes WHERE id = ?", cid, "class") {
            return e;
        }
    }

    let query = scoring::LeaderboardQuery {
        subject_id: subject_id.clone(),
        class_id: class_id.clone(),
        min_exams,
        limit,
    };
    let rows = match scoring::top_students(conn, &query) {
        Ok(v) => v,
        Err(e) => return stats_err(req, e),
    };

    ok(
        &req.id,
        json!({
            "filters": {
                "subjectId": subject_id,
                "classId": class_id,
                "minExams": min_exams,
                "limit": limit
            },
            "rows": rows
        }),
    )
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "dashboard.student" => Some(handle_student(state, req)),
        "dashboard.teacher" => Some(handle_teacher(state, req)),
        "dashboard.examStats" => Some(handle_exam_stats(state, req)),
        "dashboard.topStudents" => Some(handle_top_students(state, req)),
        _ => None,
    }
}
