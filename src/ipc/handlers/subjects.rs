use crate::ipc::error::{err, ok};
use crate::ipc::helpers::{db_conn, optional_str, required_str};
use crate::ipc::types::{AppState, Request};
use rusqlite::OptionalExtension;
use serde_json::json;
use uuid::Uuid;

fn handle_list(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(v) => v,
        Err(e) => return e,
    };

    let mut stmt = match conn.prepare(
        "SELECT
           s.id,
           s.name,
           s.code,
           (SELECT COUNT(*) FROM classes c WHERE c.subject_id = s.id) AS class_count,
           (SELECT COUNT(*) FROM question_banks b WHERE b.subject_id = s.id) AS bank_count
         FROM subjects s
         ORDER BY s.name",
    ) {
        Ok(s) => s,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };

    let rows = stmt
        .query_map([], |row| {
            let id: String = row.get(0)?;
            let name: String = row.get(1)?;
            let code: Option<String> = row.get(2)?;
            let class_count: i64 = row.get(3)?;
            let bank_count: i64 = row.get(4)?;
            Ok(json!({
                "id": id,
                "name": name,
                "code": code,
                "classCount": class_count,
                "bankCount": bank_count
            }))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>());

    match rows {
        Ok(subjects) => ok(&req.id, json!({ "subjects": subjects })),
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
    let code = match optional_str(req, "code") {
        Ok(v) => v,
        Err(e) => return e,
    };

    let taken: Option<i64> = match conn
        .query_row("SELECT 1 FROM subjects WHERE name = ?", [&name], |r| r.get(0))
        .optional()
    {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    if taken.is_some() {
        return err(
            &req.id,
            "conflict",
            "subject name already exists",
            Some(json!({ "name": name })),
        );
    }

    let subject_id = Uuid::new_v4().to_string();
    if let Err(e) = conn.execute(
        "INSERT INTO subjects(id, name, code) VALUES(?, ?, ?)",
        (&subject_id, &name, &code),
    ) {
        return err(
            &req.id,
            "db_insert_failed",
            e.to_string(),
            Some(json!({ "table": "subjects" })),
        );
    }

    ok(&req.id, json!({ "subjectId": subject_id, "name": name, "code": code }))
}

fn handle_update(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(v) => v,
        Err(e) => return e,
    };
    let subject_id = match required_str(req, "subjectId") {
        Ok(v) => v,
        Err(e) => return e,
    };

    let exists: Option<i64> = match conn
        .query_row("SELECT 1 FROM subjects WHERE id = ?", [&subject_id], |r| {
            r.get(0)
        })
        .optional()
    {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    if exists.is_none() {
        return err(&req.id, "not_found", "subject not found", None);
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
        let taken: Option<String> = match conn
            .query_row(
                "SELECT id FROM subjects WHERE name = ? AND id != ?",
                (name, &subject_id),
                |r| r.get(0),
            )
            .optional()
        {
            Ok(v) => v,
            Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
        };
        if taken.is_some() {
            return err(
                &req.id,
                "conflict",
                "subject name already exists",
                Some(json!({ "name": name })),
            );
        }
        if let Err(e) = conn.execute(
            "UPDATE subjects SET name = ? WHERE id = ?",
            (name, &subject_id),
        ) {
            return err(&req.id, "db_update_failed", e.to_string(), None);
        }
    }
    if let Some(v) = patch.get("code") {
        let code = if v.is_null() {
            None
        } else {
            match v.as_str() {
                Some(s) => Some(s.trim().to_string()),
                None => {
                    return err(&req.id, "bad_params", "patch.code must be string or null", None)
                }
            }
        };
        if let Err(e) = conn.execute(
            "UPDATE subjects SET code = ? WHERE id = ?",
            (&code, &subject_id),
        ) {
            return err(&req.id, "db_update_failed", e.to_string(), None);
        }
    }

    ok(&req.id, json!({ "subjectId": subject_id }))
}

fn handle_delete(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(v) => v,
        Err(e) => return e,
    };
    let subject_id = match required_str(req, "subjectId") {
        Ok(v) => v,
        Err(e) => return e,
    };

    let exists: Option<i64> = match conn
        .query_row("SELECT 1 FROM subjects WHERE id = ?", [&subject_id], |r| {
            r.get(0)
        })
        .optional()
    {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    if exists.is_none() {
        return err(&req.id, "not_found", "subject not found", None);
    }

    let guards: [(&str, &str); 3] = [
        ("classes", "SELECT COUNT(*) FROM classes WHERE subject_id = ?"),
        ("question_banks", "SELECT COUNT(*) FROM question_banks WHERE subject_id = ?"),
        ("exams", "SELECT COUNT(*) FROM exams WHERE subject_id = ?"),
    ];
    for (table, sql) in guards {
        let count: i64 = match conn.query_row(sql, [&subject_id], |r| r.get(0)) {
            Ok(v) => v,
            Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
        };
        if count > 0 {
            return err(
                &req.id,
                "conflict",
                "subject is still referenced",
                Some(json!({ "table": table, "count": count })),
            );
        }
    }

    if let Err(e) = conn.execute("DELETE FROM subjects WHERE id = ?", [&subject_id]) {
        return err(
            &req.id,
            "db_delete_failed",
            e.to_string(),
            Some(json!({ "table": "subjects" })),
        );
    }

    ok(&req.id, json!({ "ok": true }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "subjects.list" => Some(handle_list(state, req)),
        "subjects.create" => Some(handle_create(state, req)),
        "subjects.update" => Some(handle_update(state, req)),
        "subjects.delete" => Some(handle_delete(state, req)),
        _ => None,
    }
}
