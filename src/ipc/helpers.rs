use rusqlite::{Connection, OptionalExtension};
use serde_json::json;

use crate::ipc::error::err;
use crate::ipc::types::{AppState, Request};

pub fn db_conn<'a>(state: &'a AppState, req: &Request) -> Result<&'a Connection, serde_json::Value> {
    state
        .db
        .as_ref()
        .ok_or_else(|| err(&req.id, "no_workspace", "select a workspace first", None))
}

pub fn required_str(req: &Request, key: &str) -> Result<String, serde_json::Value> {
    let raw = req
        .params
        .get(key)
        .and_then(|v| v.as_str())
        .map(|v| v.trim().to_string())
        .ok_or_else(|| err(&req.id, "bad_params", format!("missing {}", key), None))?;
    if raw.is_empty() {
        return Err(err(
            &req.id,
            "bad_params",
            format!("{} must not be empty", key),
            None,
        ));
    }
    Ok(raw)
}

pub fn optional_str(req: &Request, key: &str) -> Result<Option<String>, serde_json::Value> {
    match req.params.get(key) {
        None => Ok(None),
        Some(v) if v.is_null() => Ok(None),
        Some(v) => {
            let Some(s) = v.as_str() else {
                return Err(err(
                    &req.id,
                    "bad_params",
                    format!("{} must be string or null", key),
                    None,
                ));
            };
            let t = s.trim();
            if t.is_empty() {
                Ok(None)
            } else {
                Ok(Some(t.to_string()))
            }
        }
    }
}

pub fn optional_bool(req: &Request, key: &str) -> Result<Option<bool>, serde_json::Value> {
    match req.params.get(key) {
        None => Ok(None),
        Some(v) if v.is_null() => Ok(None),
        Some(v) => v.as_bool().map(Some).ok_or_else(|| {
            err(
                &req.id,
                "bad_params",
                format!("{} must be a boolean", key),
                None,
            )
        }),
    }
}

pub fn account_role(
    conn: &Connection,
    account_id: &str,
) -> Result<Option<String>, rusqlite::Error> {
    conn.query_row(
        "SELECT role FROM accounts WHERE id = ?",
        [account_id],
        |r| r.get(0),
    )
    .optional()
}

/// Looks the account up and enforces one of the allowed roles; answers
/// not_found / bad_params envelopes ready to return.
pub fn require_role(
    conn: &Connection,
    req: &Request,
    account_id: &str,
    allowed: &[&str],
    what: &str,
) -> Result<(), serde_json::Value> {
    let role = match account_role(conn, account_id) {
        Ok(v) => v,
        Err(e) => return Err(err(&req.id, "db_query_failed", e.to_string(), None)),
    };
    let Some(role) = role else {
        return Err(err(
            &req.id,
            "not_found",
            format!("{} account not found", what),
            Some(json!({ "accountId": account_id })),
        ));
    };
    if !allowed.iter().any(|a| *a == role) {
        return Err(err(
            &req.id,
            "bad_params",
            format!("{} must have role {}", what, allowed.join(" or ")),
            Some(json!({ "accountId": account_id, "role": role })),
        ));
    }
    Ok(())
}

pub fn row_exists(
    conn: &Connection,
    req: &Request,
    sql: &str,
    id: &str,
    what: &str,
) -> Result<(), serde_json::Value> {
    let found: Option<i64> = match conn.query_row(sql, [id], |r| r.get(0)).optional() {
        Ok(v) => v,
        Err(e) => return Err(err(&req.id, "db_query_failed", e.to_string(), None)),
    };
    if found.is_none() {
        return Err(err(&req.id, "not_found", format!("{} not found", what), None));
    }
    Ok(())
}

pub fn now_rfc3339() -> String {
    chrono::Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Secs, true)
}
