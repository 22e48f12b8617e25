use crate::ipc::error::{err, ok};
use crate::ipc::helpers::{db_conn, now_rfc3339, required_str, require_role, row_exists};
use crate::ipc::types::{AppState, Request};
use rusqlite::OptionalExtension;
use serde_json::json;
use uuid::Uuid;

fn handle_list(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return ok(&req.id, json!({ "classes": [] }));
    };

    // Correlated subqueries keep the counts join-free.
    let mut stmt = match conn.prepare(
        "SELECT
           c.id,
           c.name,
           c.subject_id,
           s.name,
           c.teacher_id,
           a.full_name,
           (SELECT COUNT(*) FROM class_members m WHERE m.class_id = c.id) AS member_count,
           (SELECT COUNT(*) FROM exams e WHERE e.class_id = c.id) AS exam_count
         FROM classes c
         JOIN subjects s ON s.id = c.subject_id
         JOIN accounts a ON a.id = c.teacher_id
         ORDER BY c.name",
    ) {
        Ok(s) => s,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };

    let rows = stmt
        .query_map([], |row| {
            let id: String = row.get(0)?;
            let name: String = row.get(1)?;
            let subject_id: String = row.get(2)?;
            let subject_name: String = row.get(3)?;
            let teacher_id: String = row.get(4)?;
            let teacher_name: String = row.get(5)?;
            let member_count: i64 = row.get(6)?;
            let exam_count: i64 = row.get(7)?;
            Ok(json!({
                "id": id,
                "name": name,
                "subjectId": subject_id,
                "subjectName": subject_name,
                "teacherId": teacher_id,
                "teacherName": teacher_name,
                "memberCount": member_count,
                "examCount": exam_count
            }))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>());

    match rows {
        Ok(classes) => ok(&req.id, json!({ "classes": classes })),
        Err(e) => err(&req.id, "db_query_failed", e.to_string(), None),
    }
}

fn handle_create(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(v) => v,
        Err(e) => return e,
    };
    let name = match required_str(req, "name") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let subject_id = match required_str(req, "subjectId") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let teacher_id = match required_str(req, "teacherId") {
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
    if let Err(e) = require_role(conn, req, &teacher_id, &["teacher", "admin"], "teacher") {
        return e;
    }

    let class_id = Uuid::new_v4().to_string();
    let created_at = now_rfc3339();
    if let Err(e) = conn.execute(
        "INSERT INTO classes(id, name, subject_id, teacher_id, created_at)
         VALUES(?, ?, ?, ?, ?)",
        (&class_id, &name, &subject_id, &teacher_id, &created_at),
    ) {
        return err(
            &req.id,
            "db_insert_failed",
            e.to_string(),
            Some(json!({ "table": "classes" })),
        );
    }

    ok(&req.id, json!({ "classId": class_id, "name": name }))
}

fn handle_update(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(v) => v,
        Err(e) => return e,
    };
    let class_id = match required_str(req, "classId") {
        Ok(v) => v,
        Err(e) => return e,
    };
    if let Err(e) = row_exists(conn, req, "SELECT 1 FROM classes WHERE id = ?", &class_id, "class")
    {
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

    if let Some(v) = patch.get("name") {
        let Some(name) = v.as_str().map(str::trim).filter(|s| !s.is_empty()) else {
            return err(&req.id, "bad_params", "patch.name must be a non-empty string", None);
        };
        if let Err(e) = conn.execute(
            "UPDATE classes SET name = ? WHERE id = ?",
            (name, &class_id),
        ) {
            return err(&req.id, "db_update_failed", e.to_string(), None);
        }
    }
    if let Some(v) = patch.get("teacherId") {
        let Some(teacher_id) = v.as_str().map(str::trim).filter(|s| !s.is_empty()) else {
            return err(&req.id, "bad_params", "patch.teacherId must be a non-empty string", None);
        };
        if let Err(e) = require_role(conn, req, teacher_id, &["teacher", "admin"], "teacher") {
            return e;
        }
        if let Err(e) = conn.execute(
            "UPDATE classes SET teacher_id = ? WHERE id = ?",
            (teacher_id, &class_id),
        ) {
            return err(&req.id, "db_update_failed", e.to_string(), None);
        }
    }

    ok(&req.id, json!({ "classId": class_id }))
}

fn handle_delete(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(v) => v,
        Err(e) => return e,
    };
    let class_id = match required_str(req, "classId") {
        Ok(v) => v,
        Err(e) => return e,
    };
    if let Err(e) = row_exists(conn, req, "SELECT 1 FROM classes WHERE id = ?", &class_id, "class")
    {
        return e;
    }

    let tx = match conn.unchecked_transaction() {
        Ok(t) => t,
        Err(e) => return err(&req.id, "db_tx_failed", e.to_string(), None),
    };

    // Explicit deletes in dependency order (no ON DELETE CASCADE).
    let steps: [(&str, &str); 5] = [
        (
            "grades",
            "DELETE FROM grades
             WHERE exam_id IN (SELECT id FROM exams WHERE class_id = ?)",
        ),
        (
            "student_answers",
            "DELETE FROM student_answers
             WHERE exam_id IN (SELECT id FROM exams WHERE class_id = ?)",
        ),
        (
            "exam_questions",
            "DELETE FROM exam_questions
             WHERE exam_id IN (SELECT id FROM exams WHERE class_id = ?)",
        ),
        ("exams", "DELETE FROM exams WHERE class_id = ?"),
        ("class_members", "DELETE FROM class_members WHERE class_id = ?"),
    ];
    for (table, sql) in steps {
        if let Err(e) = tx.execute(sql, [&class_id]) {
            let _ = tx.rollback();
            return err(
                &req.id,
                "db_delete_failed",
                e.to_string(),
                Some(json!({ "table": table })),
            );
        }
    }
    if let Err(e) = tx.execute("DELETE FROM classes WHERE id = ?", [&class_id]) {
        let _ = tx.rollback();
        return err(
            &req.id,
            "db_delete_failed",
            e.to_string(),
            Some(json!({ "table": "classes" })),
        );
    }

    if let Err(e) = tx.commit() {
        return err(&req.id, "db_commit_failed", e.to_string(), None);
    }

    ok(&req.id, json!({ "ok": true }))
}

fn handle_members_list(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(v) => v,
        Err(e) => return e,
    };
    let class_id = match required_str(req, "classId") {
        Ok(v) => v,
        Err(e) => return e,
    };
    if let Err(e) = row_exists(conn, req, "SELECT 1 FROM classes WHERE id = ?", &class_id, "class")
    {
        return e;
    }

    let mut stmt = match conn.prepare(
        "SELECT m.student_id, a.full_name, a.email, m.joined_at
         FROM class_members m
         JOIN accounts a ON a.id = m.student_id
         WHERE m.class_id = ?
         ORDER BY a.full_name, a.email",
    ) {
        Ok(s) => s,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    let rows = stmt
        .query_map([&class_id], |row| {
            let student_id: String = row.get(0)?;
            let full_name: String = row.get(1)?;
            let email: String = row.get(2)?;
            let joined_at: String = row.get(3)?;
            Ok(json!({
                "studentId": student_id,
                "fullName": full_name,
                "email": email,
                "joinedAt": joined_at
            }))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>());

    match rows {
        Ok(members) => ok(&req.id, json!({ "members": members })),
        Err(e) => err(&req.id, "db_query_failed", e.to_string(), None),
    }
}

fn handle_members_add(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(v) => v,
        Err(e) => return e,
    };
    let class_id = match required_str(req, "classId") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let student_id = match required_str(req, "studentId") {
        Ok(v) => v,
        Err(e) => return e,
    };
    if let Err(e) = row_exists(conn, req, "SELECT 1 FROM classes WHERE id = ?", &class_id, "class")
    {
        return e;
    }
    if let Err(e) = require_role(conn, req, &student_id, &["student"], "student") {
        return e;
    }

    let already: Option<i64> = match conn
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
    if already.is_some() {
        return err(
            &req.id,
            "conflict",
            "student is already a member of this class",
            None,
        );
    }

    let joined_at = now_rfc3339();
    if let Err(e) = conn.execute(
        "INSERT INTO class_members(class_id, student_id, joined_at) VALUES(?, ?, ?)",
        (&class_id, &student_id, &joined_at),
    ) {
        return err(
            &req.id,
            "db_insert_failed",
            e.to_string(),
            Some(json!({ "table": "class_members" })),
        );
    }

    ok(&req.id, json!({ "classId": class_id, "studentId": student_id }))
}

fn handle_members_remove(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(v) => v,
        Err(e) => return e,
    };
    let class_id = match required_str(req, "classId") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let student_id = match required_str(req, "studentId") {
        Ok(v) => v,
        Err(e) => return e,
    };

    let removed = match conn.execute(
        "DELETE FROM class_members WHERE class_id = ? AND student_id = ?",
        (&class_id, &student_id),
    ) {
        Ok(n) => n,
        Err(e) => {
            return err(
                &req.id,
                "db_delete_failed",
                e.to_string(),
                Some(json!({ "table": "class_members" })),
            )
        }
    };
    if removed == 0 {
        return err(&req.id, "not_found", "membership not found", None);
    }

    ok(&req.id, json!({ "ok": true }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "classes.list" => Some(handle_list(state, req)),
        "classes.create" => Some(handle_create(state, req)),
        "classes.update" => Some(handle_update(state, req)),
        "classes.delete" => Some(handle_delete(state, req)),
        "classes.members.list" => Some(handle_members_list(state, req)),
        "classes.members.add" => Some(handle_members_add(state, req)),
        "classes.members.remove" => Some(handle_members_remove(state, req)),
        _ => None,
    }
}
