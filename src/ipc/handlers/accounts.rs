use crate::ipc::error::{err, ok};
use crate::ipc::helpers::{db_conn, now_rfc3339, optional_str, required_str};
use crate::ipc::types::{AppState, Request};
use rusqlite::OptionalExtension;
use serde_json::json;
use uuid::Uuid;

const ROLES: [&str; 3] = ["student", "teacher", "admin"];

fn handle_register(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(v) => v,
        Err(e) => return e,
    };

    let full_name = match required_str(req, "fullName") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let email = match required_str(req, "email") {
        Ok(v) => v.to_ascii_lowercase(),
        Err(e) => return e,
    };
    let password = match required_str(req, "password") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let role = match required_str(req, "role") {
        Ok(v) => v.to_ascii_lowercase(),
        Err(e) => return e,
    };
    if !ROLES.contains(&role.as_str()) {
        return err(
            &req.id,
            "bad_params",
            "role must be one of: student, teacher, admin",
            Some(json!({ "role": role })),
        );
    }

    let taken: Option<i64> = match conn
        .query_row("SELECT 1 FROM accounts WHERE email = ?", [&email], |r| {
            r.get(0)
        })
        .optional()
    {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    if taken.is_some() {
        return err(
            &req.id,
            "conflict",
            "email already registered",
            Some(json!({ "email": email })),
        );
    }

    let password_hash = match bcrypt::hash(&password, bcrypt::DEFAULT_COST) {
        Ok(v) => v,
        Err(e) => return err(&req.id, "bad_params", format!("password hash failed: {}", e), None),
    };

    let account_id = Uuid::new_v4().to_string();
    let created_at = now_rfc3339();
    if let Err(e) = conn.execute(
        "INSERT INTO accounts(id, full_name, email, password_hash, role, created_at)
         VALUES(?, ?, ?, ?, ?, ?)",
        (&account_id, &full_name, &email, &password_hash, &role, &created_at),
    ) {
        return err(
            &req.id,
            "db_insert_failed",
            e.to_string(),
            Some(json!({ "table": "accounts" })),
        );
    }

    tracing::debug!(account_id = %account_id, role = %role, "account registered");
    ok(
        &req.id,
        json!({
            "accountId": account_id,
            "fullName": full_name,
            "email": email,
            "role": role
        }),
    )
}

fn handle_login(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(v) => v,
        Err(e) => return e,
    };
    let email = match required_str(req, "email") {
        Ok(v) => v.to_ascii_lowercase(),
        Err(e) => return e,
    };
    let password = match required_str(req, "password") {
        Ok(v) => v,
        Err(e) => return e,
    };

    let row: Option<(String, String, String, String)> = match conn
        .query_row(
            "SELECT id, full_name, password_hash, role FROM accounts WHERE email = ?",
            [&email],
            |r| Ok((r.get(0)?, r.get(1)?, r.get(2)?, r.get(3)?)),
        )
        .optional()
    {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };

    // Same answer for unknown email and wrong password.
    let Some((account_id, full_name, password_hash, role)) = row else {
        return err(&req.id, "invalid_credentials", "invalid email or password", None);
    };
    match bcrypt::verify(&password, &password_hash) {
        Ok(true) => {}
        Ok(false) => {
            return err(&req.id, "invalid_credentials", "invalid email or password", None)
        }
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    }

    ok(
        &req.id,
        json!({
            "accountId": account_id,
            "fullName": full_name,
            "email": email,
            "role": role
        }),
    )
}

fn handle_list(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(v) => v,
        Err(e) => return e,
    };
    let role = match optional_str(req, "role") {
        Ok(v) => v.map(|r| r.to_ascii_lowercase()),
        Err(e) => return e,
    };
    if let Some(r) = role.as_deref() {
        if !ROLES.contains(&r) {
            return err(
                &req.id,
                "bad_params",
                "role must be one of: student, teacher, admin",
                Some(json!({ "role": r })),
            );
        }
    }

    let sql = if role.is_some() {
        "SELECT id, full_name, email, role, created_at, updated_at
         FROM accounts WHERE role = ? ORDER BY full_name, email"
    } else {
        "SELECT id, full_name, email, role, created_at, updated_at
         FROM accounts ORDER BY full_name, email"
    };
    let mut stmt = match conn.prepare(sql) {
        Ok(s) => s,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };

    let map_row = |row: &rusqlite::Row<'_>| -> rusqlite::Result<serde_json::Value> {
        let id: String = row.get(0)?;
        let full_name: String = row.get(1)?;
        let email: String = row.get(2)?;
        let role: String = row.get(3)?;
        let created_at: String = row.get(4)?;
        let updated_at: Option<String> = row.get(5)?;
        Ok(json!({
            "id": id,
            "fullName": full_name,
            "email": email,
            "role": role,
            "createdAt": created_at,
            "updatedAt": updated_at
        }))
    };
    let rows = if let Some(r) = role.as_deref() {
        stmt.query_map([r], map_row)
            .and_then(|it| it.collect::<Result<Vec<_>, _>>())
    } else {
        stmt.query_map([], map_row)
            .and_then(|it| it.collect::<Result<Vec<_>, _>>())
    };

    match rows {
        Ok(accounts) => ok(&req.id, json!({ "accounts": accounts })),
        Err(e) => err(&req.id, "db_query_failed", e.to_string(), None),
    }
}

fn handle_update(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(v) => v,
        Err(e) => return e,
    };
    let account_id = match required_str(req, "accountId") {
        Ok(v) => v,
        Err(e) => return e,
    };

    let exists: Option<i64> = match conn
        .query_row("SELECT 1 FROM accounts WHERE id = ?", [&account_id], |r| {
            r.get(0)
        })
        .optional()
    {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    if exists.is_none() {
        return err(&req.id, "not_found", "account not found", None);
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

    let mut sets: Vec<&str> = Vec::new();
    let mut values: Vec<String> = Vec::new();

    if let Some(v) = patch.get("fullName") {
        let Some(name) = v.as_str().map(str::trim).filter(|s| !s.is_empty()) else {
            return err(&req.id, "bad_params", "patch.fullName must be a non-empty string", None);
        };
        sets.push("full_name = ?");
        values.push(name.to_string());
    }
    if let Some(v) = patch.get("email") {
        let Some(email) = v.as_str().map(str::trim).filter(|s| !s.is_empty()) else {
            return err(&req.id, "bad_params", "patch.email must be a non-empty string", None);
        };
        let email = email.to_ascii_lowercase();
        let taken: Option<String> = match conn
            .query_row(
                "SELECT id FROM accounts WHERE email = ? AND id != ?",
                (&email, &account_id),
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
                "email already registered",
                Some(json!({ "email": email })),
            );
        }
        sets.push("email = ?");
        values.push(email);
    }
    if let Some(v) = patch.get("password") {
        let Some(password) = v.as_str().filter(|s| !s.trim().is_empty()) else {
            return err(&req.id, "bad_params", "patch.password must be a non-empty string", None);
        };
        let hash = match bcrypt::hash(password, bcrypt::DEFAULT_COST) {
            Ok(v) => v,
            Err(e) => {
                return err(&req.id, "bad_params", format!("password hash failed: {}", e), None)
            }
        };
        sets.push("password_hash = ?");
        values.push(hash);
    }

    if sets.is_empty() {
        return err(
            &req.id,
            "bad_params",
            "patch supports fullName, email, password",
            None,
        );
    }

    sets.push("updated_at = ?");
    values.push(now_rfc3339());
    values.push(account_id.clone());

    let sql = format!("UPDATE accounts SET {} WHERE id = ?", sets.join(", "));
    if let Err(e) = conn.execute(&sql, rusqlite::params_from_iter(values.iter())) {
        return err(
            &req.id,
            "db_update_failed",
            e.to_string(),
            Some(json!({ "table": "accounts" })),
        );
    }

    ok(&req.id, json!({ "accountId": account_id }))
}

fn handle_delete(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(v) => v,
        Err(e) => return e,
    };
    let account_id = match required_str(req, "accountId") {
        Ok(v) => v,
        Err(e) => return e,
    };

    let exists: Option<i64> = match conn
        .query_row("SELECT 1 FROM accounts WHERE id = ?", [&account_id], |r| {
            r.get(0)
        })
        .optional()
    {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    if exists.is_none() {
        return err(&req.id, "not_found", "account not found", None);
    }

    // An account with any platform history stays; deleting it would orphan
    // grades and leaderboards.
    let guards: [(&str, &str); 6] = [
        ("classes", "SELECT COUNT(*) FROM classes WHERE teacher_id = ?"),
        ("class_members", "SELECT COUNT(*) FROM class_members WHERE student_id = ?"),
        ("question_banks", "SELECT COUNT(*) FROM question_banks WHERE owner_id = ?"),
        ("exams", "SELECT COUNT(*) FROM exams WHERE teacher_id = ?"),
        ("student_answers", "SELECT COUNT(*) FROM student_answers WHERE student_id = ?"),
        ("grades", "SELECT COUNT(*) FROM grades WHERE student_id = ?"),
    ];
    for (table, sql) in guards {
        let count: i64 = match conn.query_row(sql, [&account_id], |r| r.get(0)) {
            Ok(v) => v,
            Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
        };
        if count > 0 {
            return err(
                &req.id,
                "conflict",
                "account is still referenced",
                Some(json!({ "table": table, "count": count })),
            );
        }
    }

    if let Err(e) = conn.execute("DELETE FROM accounts WHERE id = ?", [&account_id]) {
        return err(
            &req.id,
            "db_delete_failed",
            e.to_string(),
            Some(json!({ "table": "accounts" })),
        );
    }

    ok(&req.id, json!({ "ok": true }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "accounts.register" => Some(handle_register(state, req)),
        "accounts.login" => Some(handle_login(state, req)),
        "accounts.list" => Some(handle_list(state, req)),
        "accounts.update" => Some(handle_update(state, req)),
        "accounts.delete" => Some(handle_delete(state, req)),
        _ => None,
    }
}
