use crate::ipc::error::{err, ok};
use crate::ipc::helpers::{
    db_conn, now_rfc3339, optional_bool, optional_str, required_str, require_role, row_exists,
};
use crate::ipc::types::{AppState, Request};
use rusqlite::OptionalExtension;
use serde_json::json;
use uuid::Uuid;

fn parse_timestamp(
    req: &Request,
    key: &str,
    raw: Option<String>,
) -> Result<Option<String>, serde_json::Value> {
    let Some(raw) = raw else {
        return Ok(None);
    };
    if chrono::DateTime::parse_from_rfc3339(&raw).is_err() {
        return Err(err(
            &req.id,
            "bad_params",
            format!("{} must be an RFC 3339 timestamp", key),
            Some(json!({ key: raw })),
        ));
    }
    Ok(Some(raw))
}

fn parse_pass_percent(req: &Request) -> Result<f64, serde_json::Value> {
    let Some(v) = req.params.get("passPercent") else {
        return Ok(50.0);
    };
    if v.is_null() {
        return Ok(50.0);
    }
    let Some(p) = v.as_f64() else {
        return Err(err(&req.id, "bad_params", "passPercent must be a number", None));
    };
    if !(0.0..=100.0).contains(&p) {
        return Err(err(
            &req.id,
            "bad_params",
            "passPercent must be in range 0..=100",
            None,
        ));
    }
    Ok(p)
}

fn parse_duration(req: &Request) -> Result<Option<i64>, serde_json::Value> {
    let Some(v) = req.params.get("durationMinutes") else {
        return Ok(None);
    };
    if v.is_null() {
        return Ok(None);
    }
    let Some(minutes) = v.as_i64().filter(|m| *m > 0) else {
        return Err(err(
            &req.id,
            "bad_params",
            "durationMinutes must be a positive integer",
            None,
        ));
    };
    Ok(Some(minutes))
}

fn exam_row_json(row: &rusqlite::Row<'_>) -> rusqlite::Result<serde_json::Value> {
    let id: String = row.get(0)?;
    let title: String = row.get(1)?;
    let subject_id: String = row.get(2)?;
    let subject_name: String = row.get(3)?;
    let class_id: String = row.get(4)?;
    let class_name: String = row.get(5)?;
    let teacher_id: String = row.get(6)?;
    let starts_at: Option<String> = row.get(7)?;
    let ends_at: Option<String> = row.get(8)?;
    let duration_minutes: Option<i64> = row.get(9)?;
    let pass_percent: f64 = row.get(10)?;
    let published: i64 = row.get(11)?;
    let created_at: String = row.get(12)?;
    let question_count: i64 = row.get(13)?;
    let grade_count: i64 = row.get(14)?;
    Ok(json!({
        "id": id,
        "title": title,
        "subjectId": subject_id,
        "subjectName": subject_name,
        "classId": class_id,
        "className": class_name,
        "teacherId": teacher_id,
        "startsAt": starts_at,
        "endsAt": ends_at,
        "durationMinutes": duration_minutes,
        "passPercent": pass_percent,
        "published": published != 0,
        "createdAt": created_at,
        "questionCount": question_count,
        "gradeCount": grade_count
    }))
}

const EXAM_SELECT: &str = "SELECT
    e.id, e.title, e.subject_id, s.name, e.class_id, c.name, e.teacher_id,
    e.starts_at, e.ends_at, e.duration_minutes, e.pass_percent, e.published, e.created_at,
    (SELECT COUNT(*) FROM exam_questions eq WHERE eq.exam_id = e.id) AS question_count,
    (SELECT COUNT(*) FROM grades g WHERE g.exam_id = e.id) AS grade_count
  FROM exams e
  JOIN subjects s ON s.id = e.subject_id
  JOIN classes c ON c.id = e.class_id";

fn handle_create(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(v) => v,
        Err(e) => return e,
    };
    let title = match required_str(req, "title") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let subject_id = match required_str(req, "subjectId") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let class_id = match required_str(req, "classId") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let teacher_id = match required_str(req, "teacherId") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let starts_at = match optional_str(req, "startsAt").and_then(|v| parse_timestamp(req, "startsAt", v)) {
        Ok(v) => v,
        Err(e) => return e,
    };
    let ends_at = match optional_str(req, "endsAt").and_then(|v| parse_timestamp(req, "endsAt", v)) {
        Ok(v) => v,
        Err(e) => return e,
    };
    if let (Some(s), Some(t)) = (starts_at.as_deref(), ends_at.as_deref()) {
        if s > t {
            return err(&req.id, "bad_params", "startsAt must be <= endsAt", None);
        }
    }
    let duration_minutes = match parse_duration(req) {
        Ok(v) => v,
        Err(e) => return e,
    };
    let pass_percent = match parse_pass_percent(req) {
        Ok(v) => v,
        Err(e) => return e,
    };

    if let Err(e) = row_exists(
        conn,
        req,
        "SELECT 1 FROM subjects WHERE id = ?",
        &subject_id,
        "subject",
    ) {
        return e;
    }
    if let Err(e) = row_exists(conn, req, "SELECT 1 FROM classes WHERE id = ?", &class_id, "class")
    {
        return e;
    }
    if let Err(e) = require_role(conn, req, &teacher_id, &["teacher", "admin"], "teacher") {
        return e;
    }

    let exam_id = Uuid::new_v4().to_string();
    let created_at = now_rfc3339();
    if let Err(e) = conn.execute(
        "INSERT INTO exams(id, title, subject_id, class_id, teacher_id,
                           starts_at, ends_at, duration_minutes, pass_percent, published, created_at)
         VALUES(?, ?, ?, ?, ?, ?, ?, ?, ?, 0, ?)",
        (
            &exam_id,
            &title,
            &subject_id,
            &class_id,
            &teacher_id,
            &starts_at,
            &ends_at,
            &duration_minutes,
            pass_percent,
            &created_at,
        ),
    ) {
        return err(
            &req.id,
            "db_insert_failed",
            e.to_string(),
            Some(json!({ "table": "exams" })),
        );
    }

    ok(&req.id, json!({ "examId": exam_id, "title": title }))
}

fn handle_list(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(v) => v,
        Err(e) => return e,
    };
    let class_id = match optional_str(req, "classId") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let teacher_id = match optional_str(req, "teacherId") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let published_only = match optional_bool(req, "publishedOnly") {
        Ok(v) => v.unwrap_or(false),
        Err(e) => return e,
    };

    let mut sql = String::from(EXAM_SELECT);
    let mut clauses: Vec<&str> = Vec::new();
    let mut params: Vec<String> = Vec::new();
    if let Some(cid) = class_id {
        clauses.push("e.class_id = ?");
        params.push(cid);
    }
    if let Some(tid) = teacher_id {
        clauses.push("e.teacher_id = ?");
        params.push(tid);
    }
    if published_only {
        clauses.push("e.published != 0");
    }
    if !clauses.is_empty() {
        sql.push_str(" WHERE ");
        sql.push_str(&clauses.join(" AND "));
    }
    sql.push_str(" ORDER BY e.created_at DESC, e.title");

    let mut stmt = match conn.prepare(&sql) {
        Ok(s) => s,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    let rows = stmt
        .query_map(rusqlite::params_from_iter(params.iter()), exam_row_json)
        .and_then(|it| it.collect::<Result<Vec<_>, _>>());

    match rows {
        Ok(exams) => ok(&req.id, json!({ "exams": exams })),
        Err(e) => err(&req.id, "db_query_failed", e.to_string(), None),
    }
}

fn handle_open(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(v) => v,
        Err(e) => return e,
    };
    let exam_id = match required_str(req, "examId") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let include_answers = match optional_bool(req, "includeAnswers") {
        Ok(v) => v.unwrap_or(false),
        Err(e) => return e,
    };

    let sql = format!("{} WHERE e.id = ?", EXAM_SELECT);
    let exam = match conn.query_row(&sql, [&exam_id], exam_row_json).optional() {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    let Some(exam) = exam else {
        return err(&req.id, "not_found", "exam not found", None);
    };

    let mut stmt = match conn.prepare(
        "SELECT q.id, q.prompt, q.choice_a, q.choice_b, q.choice_c, q.choice_d,
                q.correct_choice, q.marks, eq.sort_order
         FROM exam_questions eq
         JOIN questions q ON q.id = eq.question_id
         WHERE eq.exam_id = ?
         ORDER BY eq.sort_order",
    ) {
        Ok(s) => s,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    let rows = stmt
        .query_map([&exam_id], |row| {
            let id: String = row.get(0)?;
            let prompt: String = row.get(1)?;
            let choice_a: String = row.get(2)?;
            let choice_b: String = row.get(3)?;
            let choice_c: String = row.get(4)?;
            let choice_d: String = row.get(5)?;
            let correct_choice: String = row.get(6)?;
            let marks: f64 = row.get(7)?;
            let sort_order: i64 = row.get(8)?;
            let mut q = json!({
                "id": id,
                "prompt": prompt,
                "choiceA": choice_a,
                "choiceB": choice_b,
                "choiceC": choice_c,
                "choiceD": choice_d,
                "marks": marks,
                "sortOrder": sort_order
            });
            if include_answers {
                q["correctChoice"] = json!(correct_choice);
            }
            Ok(q)
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>());

    let questions = match rows {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    let total_marks: f64 = match conn.query_row(
        "SELECT COALESCE(SUM(q.marks), 0)
         FROM exam_questions eq
         JOIN questions q ON q.id = eq.question_id
         WHERE eq.exam_id = ?",
        [&exam_id],
        |r| r.get(0),
    ) {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };

    ok(
        &req.id,
        json!({ "exam": exam, "questions": questions, "totalMarks": total_marks }),
    )
}

fn exam_flags(
    conn: &rusqlite::Connection,
    exam_id: &str,
) -> rusqlite::Result<Option<(bool, i64)>> {
    conn.query_row(
        "SELECT e.published,
                (SELECT COUNT(*) FROM grades g WHERE g.exam_id = e.id)
         FROM exams e WHERE e.id = ?",
        [exam_id],
        |r| Ok((r.get::<_, i64>(0)? != 0, r.get::<_, i64>(1)?)),
    )
    .optional()
}

fn handle_update(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(v) => v,
        Err(e) => return e,
    };
    let exam_id = match required_str(req, "examId") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let flags = match exam_flags(conn, &exam_id) {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    let Some((published, _)) = flags else {
        return err(&req.id, "not_found", "exam not found", None);
    };

    let patch = req
        .params
        .get("patch")
        .and_then(|v| v.as_object())
        .cloned()
        .unwrap_or_default();
    if patch.is_empty() {
        return err(&req.id, "bad_params", "patch must not be empty", None);
    }

    let schedule_keys = ["startsAt", "endsAt", "durationMinutes", "passPercent"];
    if published && schedule_keys.iter().any(|k| patch.contains_key(*k)) {
        return err(
            &req.id,
            "conflict",
            "published exams accept title changes only",
            None,
        );
    }

    if let Some(v) = patch.get("title") {
        let Some(title) = v.as_str().map(str::trim).filter(|s| !s.is_empty()) else {
            return err(&req.id, "bad_params", "patch.title must be a non-empty string", None);
        };
        if let Err(e) = conn.execute(
            "UPDATE exams SET title = ? WHERE id = ?",
            (title, &exam_id),
        ) {
            return err(&req.id, "db_update_failed", e.to_string(), None);
        }
    }
    for key in ["startsAt", "endsAt"] {
        if let Some(v) = patch.get(key) {
            let value = if v.is_null() {
                None
            } else {
                let Some(s) = v.as_str() else {
                    return err(
                        &req.id,
                        "bad_params",
                        format!("patch.{} must be string or null", key),
                        None,
                    );
                };
                match parse_timestamp(req, key, Some(s.to_string())) {
                    Ok(v) => v,
                    Err(e) => return e,
                }
            };
            let col = if key == "startsAt" { "starts_at" } else { "ends_at" };
            let sql = format!("UPDATE exams SET {} = ? WHERE id = ?", col);
            if let Err(e) = conn.execute(&sql, (&value, &exam_id)) {
                return err(&req.id, "db_update_failed", e.to_string(), None);
            }
        }
    }
    if let Some(v) = patch.get("durationMinutes") {
        let value = if v.is_null() {
            None
        } else {
            match v.as_i64().filter(|m| *m > 0) {
                Some(m) => Some(m),
                None => {
                    return err(
                        &req.id,
                        "bad_params",
                        "patch.durationMinutes must be a positive integer",
                        None,
                    )
                }
            }
        };
        if let Err(e) = conn.execute(
            "UPDATE exams SET duration_minutes = ? WHERE id = ?",
            (&value, &exam_id),
        ) {
            return err(&req.id, "db_update_failed", e.to_string(), None);
        }
    }
    if let Some(v) = patch.get("passPercent") {
        let Some(p) = v.as_f64().filter(|p| (0.0..=100.0).contains(p)) else {
            return err(
                &req.id,
                "bad_params",
                "patch.passPercent must be a number in range 0..=100",
                None,
            );
        };
        if let Err(e) = conn.execute(
            "UPDATE exams SET pass_percent = ? WHERE id = ?",
            (p, &exam_id),
        ) {
            return err(&req.id, "db_update_failed", e.to_string(), None);
        }
    }

    ok(&req.id, json!({ "examId": exam_id }))
}

fn handle_delete(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(v) => v,
        Err(e) => return e,
    };
    let exam_id = match required_str(req, "examId") {
        Ok(v) => v,
        Err(e) => return e,
    };
    if let Err(e) = row_exists(conn, req, "SELECT 1 FROM exams WHERE id = ?", &exam_id, "exam") {
        return e;
    }

    let tx = match conn.unchecked_transaction() {
        Ok(t) => t,
        Err(e) => return err(&req.id, "db_tx_failed", e.to_string(), None),
    };
    let steps: [(&str, &str); 3] = [
        ("grades", "DELETE FROM grades WHERE exam_id = ?"),
        ("student_answers", "DELETE FROM student_answers WHERE exam_id = ?"),
        ("exam_questions", "DELETE FROM exam_questions WHERE exam_id = ?"),
    ];
    for (table, sql) in steps {
        if let Err(e) = tx.execute(sql, [&exam_id]) {
            let _ = tx.rollback();
            return err(
                &req.id,
                "db_delete_failed",
                e.to_string(),
                Some(json!({ "table": table })),
            );
        }
    }
    if let Err(e) = tx.execute("DELETE FROM exams WHERE id = ?", [&exam_id]) {
        let _ = tx.rollback();
        return err(
            &req.id,
            "db_delete_failed",
            e.to_string(),
            Some(json!({ "table": "exams" })),
        );
    }
    if let Err(e) = tx.commit() {
        return err(&req.id, "db_commit_failed", e.to_string(), None);
    }

    ok(&req.id, json!({ "ok": true }))
}

fn handle_publish(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(v) => v,
        Err(e) => return e,
    };
    let exam_id = match required_str(req, "examId") {
        Ok(v) => v,
        Err(e) => return e,
    };
    if let Err(e) = row_exists(conn, req, "SELECT 1 FROM exams WHERE id = ?", &exam_id, "exam") {
        return e;
    }

    let question_count: i64 = match conn.query_row(
        "SELECT COUNT(*) FROM exam_questions WHERE exam_id = ?",
        [&exam_id],
        |r| r.get(0),
    ) {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    if question_count == 0 {
        return err(&req.id, "conflict", "exam has no questions", None);
    }

    if let Err(e) = conn.execute("UPDATE exams SET published = 1 WHERE id = ?", [&exam_id]) {
        return err(&req.id, "db_update_failed", e.to_string(), None);
    }

    tracing::info!(exam_id = %exam_id, questions = question_count, "exam published");
    ok(
        &req.id,
        json!({ "examId": exam_id, "published": true, "questionCount": question_count }),
    )
}

fn handle_questions_set(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(v) => v,
        Err(e) => return e,
    };
    let exam_id = match required_str(req, "examId") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let flags = match exam_flags(conn, &exam_id) {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    let Some((published, grade_count)) = flags else {
        return err(&req.id, "not_found", "exam not found", None);
    };
    if published {
        return err(
            &req.id,
            "conflict",
            "cannot change questions of a published exam",
            None,
        );
    }
    if grade_count > 0 {
        return err(
            &req.id,
            "conflict",
            "exam already has grades",
            Some(json!({ "gradeCount": grade_count })),
        );
    }

    let Some(raw) = req.params.get("questionIds").and_then(|v| v.as_array()) else {
        return err(&req.id, "bad_params", "missing questionIds", None);
    };
    let mut question_ids = Vec::new();
    let mut seen = std::collections::HashSet::new();
    for v in raw {
        let Some(id) = v.as_str().map(str::trim).filter(|s| !s.is_empty()) else {
            return err(
                &req.id,
                "bad_params",
                "questionIds must contain only non-empty strings",
                None,
            );
        };
        if !seen.insert(id.to_string()) {
            return err(
                &req.id,
                "bad_params",
                "questionIds must not contain duplicates",
                Some(json!({ "questionId": id })),
            );
        }
        question_ids.push(id.to_string());
    }
    if question_ids.is_empty() {
        return err(
            &req.id,
            "bad_params",
            "questionIds must contain at least one question id",
            None,
        );
    }

    for qid in &question_ids {
        let found: Option<i64> = match conn
            .query_row("SELECT 1 FROM questions WHERE id = ?", [qid], |r| r.get(0))
            .optional()
        {
            Ok(v) => v,
            Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
        };
        if found.is_none() {
            return err(
                &req.id,
                "not_found",
                "question not found",
                Some(json!({ "questionId": qid })),
            );
        }
    }

    let tx = match conn.unchecked_transaction() {
        Ok(t) => t,
        Err(e) => return err(&req.id, "db_tx_failed", e.to_string(), None),
    };
    if let Err(e) = tx.execute("DELETE FROM exam_questions WHERE exam_id = ?", [&exam_id]) {
        let _ = tx.rollback();
        return err(
            &req.id,
            "db_delete_failed",
            e.to_string(),
            Some(json!({ "table": "exam_questions" })),
        );
    }
    for (i, qid) in question_ids.iter().enumerate() {
        if let Err(e) = tx.execute(
            "INSERT INTO exam_questions(exam_id, question_id, sort_order) VALUES(?, ?, ?)",
            (&exam_id, qid, i as i64),
        ) {
            let _ = tx.rollback();
            return err(
                &req.id,
                "db_insert_failed",
                e.to_string(),
                Some(json!({ "table": "exam_questions" })),
            );
        }
    }
    if let Err(e) = tx.commit() {
        return err(&req.id, "db_commit_failed", e.to_string(), None);
    }

    ok(
        &req.id,
        json!({ "examId": exam_id, "questionCount": question_ids.len() }),
    )
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "exams.create" => Some(handle_create(state, req)),
        "exams.list" => Some(handle_list(state, req)),
        "exams.open" => Some(handle_open(state, req)),
        "exams.update" => Some(handle_update(state, req)),
        "exams.delete" => Some(handle_delete(state, req)),
        "exams.publish" => Some(handle_publish(state, req)),
        "exams.questions.set" => Some(handle_questions_set(state, req)),
        _ => None,
    }
}
