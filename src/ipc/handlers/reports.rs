use crate::ipc::error::{err, ok};
use crate::ipc::helpers::{db_conn, required_str, row_exists};
use crate::ipc::types::{AppState, Request};
use crate::report;
use serde_json::json;
use std::path::PathBuf;

fn handle_export_results_csv(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(v) => v,
        Err(e) => return e,
    };
    let exam_id = match required_str(req, "examId") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let out_path = match required_str(req, "outPath") {
        Ok(v) => PathBuf::from(v),
        Err(e) => return e,
    };
    if let Err(e) = row_exists(conn, req, "SELECT 1 FROM exams WHERE id = ?", &exam_id, "exam") {
        return e;
    }

    match report::export_results_csv(conn, &exam_id, &out_path) {
        Ok(summary) => {
            tracing::info!(exam_id = %exam_id, rows = summary.row_count, "results csv exported");
            ok(
                &req.id,
                json!({
                    "examId": exam_id,
                    "outPath": out_path.to_string_lossy(),
                    "rowCount": summary.row_count
                }),
            )
        }
        Err(e) => err(&req.id, "io_failed", format!("{e:?}"), None),
    }
}

fn handle_export_results_archive(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(v) => v,
        Err(e) => return e,
    };
    let class_id = match required_str(req, "classId") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let out_path = match required_str(req, "outPath") {
        Ok(v) => PathBuf::from(v),
        Err(e) => return e,
    };
    if let Err(e) = row_exists(conn, req, "SELECT 1 FROM classes WHERE id = ?", &class_id, "class")
    {
        return e;
    }

    match report::export_results_archive(conn, &class_id, &out_path) {
        Ok(summary) => {
            tracing::info!(
                class_id = %class_id,
                exams = summary.exam_count,
                "results archive exported"
            );
            ok(
                &req.id,
                json!({
                    "classId": class_id,
                    "outPath": out_path.to_string_lossy(),
                    "bundleFormat": summary.bundle_format,
                    "examCount": summary.exam_count,
                    "entryCount": summary.entry_count
                }),
            )
        }
        Err(e) => err(&req.id, "io_failed", format!("{e:?}"), None),
    }
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "reports.exportResultsCsv" => Some(handle_export_results_csv(state, req)),
        "reports.exportResultsArchive" => Some(handle_export_results_archive(state, req)),
        _ => None,
    }
}
