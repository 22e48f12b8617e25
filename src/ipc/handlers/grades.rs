use crate::ipc::error::{err, ok};
use crate::ipc::helpers::{db_conn, required_str, row_exists};
use crate::ipc::types::{AppState, Request};
use crate::scoring;
use serde_json::json;

fn handle_for_exam(state: &mut AppState, req: &Request) -> serde_json::Value {
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

    match scoring::exam_outcomes(conn, &exam_id) {
        Ok(outcomes) => ok(&req.id, json!({ "examId": exam_id, "grades": outcomes })),
        Err(e) => err(&req.id, &e.code, e.message, e.details),
    }
}

fn handle_for_student(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(v) => v,
        Err(e) => return e,
    };
    let student_id = match required_str(req, "studentId") {
        Ok(v) => v,
        Err(e) => return e,
    };
    if let Err(e) = row_exists(
        conn,
        req,
        "SELECT 1 FROM accounts WHERE id = ?",
        &student_id,
        "student",
    ) {
        return e;
    }

    match scoring::student_outcomes(conn, &student_id) {
        Ok(outcomes) => ok(&req.id, json!({ "studentId": student_id, "grades": outcomes })),
        Err(e) => err(&req.id, &e.code, e.message, e.details),
    }
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "grades.forExam" => Some(handle_for_exam(state, req)),
        "grades.forStudent" => Some(handle_for_student(state, req)),
        _ => None,
    }
}
