use crate::ipc::error::{err, ok};
use crate::ipc::helpers::{db_conn, now_rfc3339, optional_str, required_str, require_role, row_exists};
use crate::ipc::types::{AppState, Request};
use serde_json::json;
use uuid::Uuid;

fn parse_choice(req: &Request, raw: &str, key: &str) -> Result<String, serde_json::Value> {
    let up = raw.trim().to_ascii_uppercase();
    match up.as_str() {
        "A" | "B" | "C" | "D" => Ok(up),
        _ => Err(err(
            &req.id,
            "bad_params",
            format!("{} must be one of: A, B, C, D", key),
            Some(json!({ key: raw })),
        )),
    }
}

fn parse_marks(req: &Request, key: &str) -> Result<f64, serde_json::Value> {
    let Some(v) = req.params.get(key) else {
        // Single-mark questions are the common case.
        return Ok(1.0);
    };
    if v.is_null() {
        return Ok(1.0);
    }
    let Some(marks) = v.as_f64() else {
        return Err(err(
            &req.id,
            "bad_params",
            format!("{} must be a number", key),
            None,
        ));
    };
    if marks <= 0.0 {
        return Err(err(
            &req.id,
            "bad_params",
            format!("{} must be greater than 0", key),
            None,
        ));
    }
    Ok(marks)
}

fn handle_banks_list(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(v) => v,
        Err(e) => return e,
    };
    let subject_id = match optional_str(req, "subjectId") {
        Ok(v) => v,
        Err(e) => return e,
    };

    let sql = if subject_id.is_some() {
        "SELECT
           b.id, b.title, b.description, b.subject_id, s.name, b.owner_id, a.full_name,
           (SELECT COUNT(*) FROM questions q WHERE q.bank_id = b.id) AS question_count
         FROM question_banks b
         JOIN subjects s ON s.id = b.subject_id
         JOIN accounts a ON a.id = b.owner_id
         WHERE b.subject_id = ?
         ORDER BY b.title"
    } else {
        "SELECT
           b.id, b.title, b.description, b.subject_id, s.name, b.owner_id, a.full_name,
           (SELECT COUNT(*) FROM questions q WHERE q.bank_id = b.id) AS question_count
         FROM question_banks b
         JOIN subjects s ON s.id = b.subject_id
         JOIN accounts a ON a.id = b.owner_id
         ORDER BY b.title"
    };
    let mut stmt = match conn.prepare(sql) {
        Ok(s) => s,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };

    let map_row = |row: &rusqlite::Row<'_>| -> rusqlite::Result<serde_json::Value> {
        let id: String = row.get(0)?;
        let title: String = row.get(1)?;
        let description: Option<String> = row.get(2)?;
        let subject_id: String = row.get(3)?;
        let subject_name: String = row.get(4)?;
        let owner_id: String = row.get(5)?;
        let owner_name: String = row.get(6)?;
        let question_count: i64 = row.get(7)?;
        Ok(json!({
            "id": id,
            "title": title,
            "description": description,
            "subjectId": subject_id,
            "subjectName": subject_name,
            "ownerId": owner_id,
            "ownerName": owner_name,
            "questionCount": question_count
        }))
    };
    let rows = if let Some(sid) = subject_id.as_deref() {
        stmt.query_map([sid], map_row)
            .and_then(|it| it.collect::<Result<Vec<_>, _>>())
    } else {
        stmt.query_map([], map_row)
            .and_then(|it| it.collect::<Result<Vec<_>, _>>())
    };

    match rows {
        Ok(banks) => ok(&req.id, json!({ "banks": banks })),
        Err(e) => err(&req.id, "db_query_failed", e.to_string(), None),
    }
}

fn handle_banks_create(state: &mut AppState, req: &Request) -> serde_json::Value {
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
    let owner_id = match required_str(req, "ownerId") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let description = match optional_str(req, "description") {
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
    if let Err(e) = require_role(conn, req, &owner_id, &["teacher", "admin"], "owner") {
        return e;
    }

    let bank_id = Uuid::new_v4().to_string();
    let created_at = now_rfc3339();
    if let Err(e) = conn.execute(
        "INSERT INTO question_banks(id, subject_id, owner_id, title, description, created_at)
         VALUES(?, ?, ?, ?, ?, ?)",
        (&bank_id, &subject_id, &owner_id, &title, &description, &created_at),
    ) {
        return err(
            &req.id,
            "db_insert_failed",
            e.to_string(),
            Some(json!({ "table": "question_banks" })),
        );
    }

    ok(&req.id, json!({ "bankId": bank_id, "title": title }))
}

fn handle_banks_update(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(v) => v,
        Err(e) => return e,
    };
    let bank_id = match required_str(req, "bankId") {
        Ok(v) => v,
        Err(e) => return e,
    };
    if let Err(e) = row_exists(
        conn,
        req,
        "SELECT 1 FROM question_banks WHERE id = ?",
        &bank_id,
        "question bank",
    ) {
        return e;
    }

    let patch = req
        .params
        .get("patch")
        .and_then(|v| v.as_object())
        .cloned()
        .unwrap_or_default();
    if patch.is_empty() {
        return err(&req.id, "bad_params", "patch must not be empty", None);
    }

    if let Some(v) = patch.get("title") {
        let Some(title) = v.as_str().map(str::trim).filter(|s| !s.is_empty()) else {
            return err(&req.id, "bad_params", "patch.title must be a non-empty string", None);
        };
        if let Err(e) = conn.execute(
            "UPDATE question_banks SET title = ? WHERE id = ?",
            (title, &bank_id),
        ) {
            return err(&req.id, "db_update_failed", e.to_string(), None);
        }
    }
    if let Some(v) = patch.get("description") {
        let description = if v.is_null() {
            None
        } else {
            match v.as_str() {
                Some(s) => Some(s.to_string()),
                None => {
                    return err(
                        &req.id,
                        "bad_params",
                        "patch.description must be string or null",
                        None,
                    )
                }
            }
        };
        if let Err(e) = conn.execute(
            "UPDATE question_banks SET description = ? WHERE id = ?",
            (&description, &bank_id),
        ) {
            return err(&req.id, "db_update_failed", e.to_string(), None);
        }
    }

    ok(&req.id, json!({ "bankId": bank_id }))
}

fn handle_banks_delete(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(v) => v,
        Err(e) => return e,
    };
    let bank_id = match required_str(req, "bankId") {
        Ok(v) => v,
        Err(e) => return e,
    };
    if let Err(e) = row_exists(
        conn,
        req,
        "SELECT 1 FROM question_banks WHERE id = ?",
        &bank_id,
        "question bank",
    ) {
        return e;
    }

    let attached: i64 = match conn.query_row(
        "SELECT COUNT(*)
         FROM exam_questions eq
         JOIN questions q ON q.id = eq.question_id
         WHERE q.bank_id = ?",
        [&bank_id],
        |r| r.get(0),
    ) {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    if attached > 0 {
        return err(
            &req.id,
            "conflict",
            "bank has questions attached to exams",
            Some(json!({ "attachedCount": attached })),
        );
    }

    let tx = match conn.unchecked_transaction() {
        Ok(t) => t,
        Err(e) => return err(&req.id, "db_tx_failed", e.to_string(), None),
    };
    if let Err(e) = tx.execute("DELETE FROM questions WHERE bank_id = ?", [&bank_id]) {
        let _ = tx.rollback();
        return err(
            &req.id,
            "db_delete_failed",
            e.to_string(),
            Some(json!({ "table": "questions" })),
        );
    }
    if let Err(e) = tx.execute("DELETE FROM question_banks WHERE id = ?", [&bank_id]) {
        let _ = tx.rollback();
        return err(
            &req.id,
            "db_delete_failed",
            e.to_string(),
            Some(json!({ "table": "question_banks" })),
        );
    }
    if let Err(e) = tx.commit() {
        return err(&req.id, "db_commit_failed", e.to_string(), None);
    }

    ok(&req.id, json!({ "ok": true }))
}

fn handle_questions_list(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(v) => v,
        Err(e) => return e,
    };
    let bank_id = match required_str(req, "bankId") {
        Ok(v) => v,
        Err(e) => return e,
    };
    if let Err(e) = row_exists(
        conn,
        req,
        "SELECT 1 FROM question_banks WHERE id = ?",
        &bank_id,
        "question bank",
    ) {
        return e;
    }

    let mut stmt = match conn.prepare(
        "SELECT id, prompt, choice_a, choice_b, choice_c, choice_d,
                correct_choice, marks, sort_order
         FROM questions
         WHERE bank_id = ?
         ORDER BY sort_order",
    ) {
        Ok(s) => s,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    let rows = stmt
        .query_map([&bank_id], |row| {
            let id: String = row.get(0)?;
            let prompt: String = row.get(1)?;
            let choice_a: String = row.get(2)?;
            let choice_b: String = row.get(3)?;
            let choice_c: String = row.get(4)?;
            let choice_d: String = row.get(5)?;
            let correct_choice: String = row.get(6)?;
            let marks: f64 = row.get(7)?;
            let sort_order: i64 = row.get(8)?;
            Ok(json!({
                "id": id,
                "prompt": prompt,
                "choiceA": choice_a,
                "choiceB": choice_b,
                "choiceC": choice_c,
                "choiceD": choice_d,
                "correctChoice": correct_choice,
                "marks": marks,
                "sortOrder": sort_order
            }))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>());

    match rows {
        Ok(questions) => ok(&req.id, json!({ "questions": questions })),
        Err(e) => err(&req.id, "db_query_failed", e.to_string(), None),
    }
}

fn handle_questions_create(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(v) => v,
        Err(e) => return e,
    };
    let bank_id = match required_str(req, "bankId") {
        Ok(v) => v,
        Err(e) => return e,
    };
    if let Err(e) = row_exists(
        conn,
        req,
        "SELECT 1 FROM question_banks WHERE id = ?",
        &bank_id,
        "question bank",
    ) {
        return e;
    }

    let prompt = match required_str(req, "prompt") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let mut choices = Vec::with_capacity(4);
    for key in ["choiceA", "choiceB", "choiceC", "choiceD"] {
        match required_str(req, key) {
            Ok(v) => choices.push(v),
            Err(e) => return e,
        }
    }
    let correct_raw = match required_str(req, "correctChoice") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let correct_choice = match parse_choice(req, &correct_raw, "correctChoice") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let marks = match parse_marks(req, "marks") {
        Ok(v) => v,
        Err(e) => return e,
    };

    let next_order: i64 = match conn.query_row(
        "SELECT COALESCE(MAX(sort_order) + 1, 0) FROM questions WHERE bank_id = ?",
        [&bank_id],
        |r| r.get(0),
    ) {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };

    let question_id = Uuid::new_v4().to_string();
    if let Err(e) = conn.execute(
        "INSERT INTO questions(id, bank_id, prompt, choice_a, choice_b, choice_c, choice_d,
                               correct_choice, marks, sort_order)
         VALUES(?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        (
            &question_id,
            &bank_id,
            &prompt,
            &choices[0],
            &choices[1],
            &choices[2],
            &choices[3],
            &correct_choice,
            marks,
            next_order,
        ),
    ) {
        return err(
            &req.id,
            "db_insert_failed",
            e.to_string(),
            Some(json!({ "table": "questions" })),
        );
    }

    ok(
        &req.id,
        json!({ "questionId": question_id, "bankId": bank_id, "sortOrder": next_order }),
    )
}

fn question_attached_count(
    conn: &rusqlite::Connection,
    question_id: &str,
) -> rusqlite::Result<i64> {
    conn.query_row(
        "SELECT COUNT(*) FROM exam_questions WHERE question_id = ?",
        [question_id],
        |r| r.get(0),
    )
}

fn handle_questions_update(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(v) => v,
        Err(e) => return e,
    };
    let question_id = match required_str(req, "questionId") {
        Ok(v) => v,
        Err(e) => return e,
    };
    if let Err(e) = row_exists(
        conn,
        req,
        "SELECT 1 FROM questions WHERE id = ?",
        &question_id,
        "question",
    ) {
        return e;
    }

    let patch = req
        .params
        .get("patch")
        .and_then(|v| v.as_object())
        .cloned()
        .unwrap_or_default();
    if patch.is_empty() {
        return err(&req.id, "bad_params", "patch must not be empty", None);
    }

    // Changing the answer key under a graded exam would desync stored grades.
    if patch.contains_key("correctChoice") || patch.contains_key("marks") {
        let attached = match question_attached_count(conn, &question_id) {
            Ok(v) => v,
            Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
        };
        if attached > 0 {
            return err(
                &req.id,
                "conflict",
                "question is attached to an exam; detach before changing its key or marks",
                Some(json!({ "attachedCount": attached })),
            );
        }
    }

    let text_cols: [(&str, &str); 5] = [
        ("prompt", "prompt"),
        ("choiceA", "choice_a"),
        ("choiceB", "choice_b"),
        ("choiceC", "choice_c"),
        ("choiceD", "choice_d"),
    ];
    for (key, col) in text_cols {
        if let Some(v) = patch.get(key) {
            let Some(text) = v.as_str().map(str::trim).filter(|s| !s.is_empty()) else {
                return err(
                    &req.id,
                    "bad_params",
                    format!("patch.{} must be a non-empty string", key),
                    None,
                );
            };
            let sql = format!("UPDATE questions SET {} = ? WHERE id = ?", col);
            if let Err(e) = conn.execute(&sql, (text, &question_id)) {
                return err(&req.id, "db_update_failed", e.to_string(), None);
            }
        }
    }
    if let Some(v) = patch.get("correctChoice") {
        let Some(raw) = v.as_str() else {
            return err(&req.id, "bad_params", "patch.correctChoice must be a string", None);
        };
        let correct = match parse_choice(req, raw, "correctChoice") {
            Ok(v) => v,
            Err(e) => return e,
        };
        if let Err(e) = conn.execute(
            "UPDATE questions SET correct_choice = ? WHERE id = ?",
            (&correct, &question_id),
        ) {
            return err(&req.id, "db_update_failed", e.to_string(), None);
        }
    }
    if let Some(v) = patch.get("marks") {
        let Some(marks) = v.as_f64().filter(|m| *m > 0.0) else {
            return err(&req.id, "bad_params", "patch.marks must be a number greater than 0", None);
        };
        if let Err(e) = conn.execute(
            "UPDATE questions SET marks = ? WHERE id = ?",
            (marks, &question_id),
        ) {
            return err(&req.id, "db_update_failed", e.to_string(), None);
        }
    }

    ok(&req.id, json!({ "questionId": question_id }))
}

fn handle_questions_delete(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(v) => v,
        Err(e) => return e,
    };
    let question_id = match required_str(req, "questionId") {
        Ok(v) => v,
        Err(e) => return e,
    };
    if let Err(e) = row_exists(
        conn,
        req,
        "SELECT 1 FROM questions WHERE id = ?",
        &question_id,
        "question",
    ) {
        return e;
    }

    let attached = match question_attached_count(conn, &question_id) {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    if attached > 0 {
        return err(
            &req.id,
            "conflict",
            "question is attached to an exam",
            Some(json!({ "attachedCount": attached })),
        );
    }

    if let Err(e) = conn.execute("DELETE FROM questions WHERE id = ?", [&question_id]) {
        return err(
            &req.id,
            "db_delete_failed",
            e.to_string(),
            Some(json!({ "table": "questions" })),
        );
    }

    ok(&req.id, json!({ "ok": true }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "banks.list" => Some(handle_banks_list(state, req)),
        "banks.create" => Some(handle_banks_create(state, req)),
        "banks.update" => Some(handle_banks_update(state, req)),
        "banks.delete" => Some(handle_banks_delete(state, req)),
        "questions.list" => Some(handle_questions_list(state, req)),
        "questions.create" => Some(handle_questions_create(state, req)),
        "questions.update" => Some(handle_questions_update(state, req)),
        "questions.delete" => Some(handle_questions_delete(state, req)),
        _ => None,
    }
}
