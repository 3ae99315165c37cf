use crate::config;
use crate::ipc::error::{err, ok};
use crate::ipc::helpers::{db_conn, engine_err, required_str};
use crate::ipc::types::{AppState, Request};
use crate::period::{self, Granularity, Period};
use crate::query::{self, Requester, Role};
use serde_json::json;

fn parse_requester(req: &Request) -> Result<Requester, serde_json::Value> {
    let id = required_str(req, "requesterId")?;
    let role_raw = required_str(req, "requesterRole")?;
    let role = Role::parse(&role_raw).ok_or_else(|| {
        err(
            &req.id,
            "bad_params",
            format!("requesterRole must be student|teacher, got {:?}", role_raw),
            None,
        )
    })?;
    Ok(Requester { id, role })
}

fn parse_req_period(req: &Request) -> Result<Period, serde_json::Value> {
    period::parse_period(req.params.get("period"))
        .map_err(|m| err(&req.id, "bad_params", m, None))
}

fn handle_student_overall(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(c) => c,
        Err(resp) => return resp,
    };
    let requester = match parse_requester(req) {
        Ok(v) => v,
        Err(resp) => return resp,
    };
    let student_id = match required_str(req, "studentId") {
        Ok(v) => v,
        Err(resp) => return resp,
    };
    let period = match parse_req_period(req) {
        Ok(v) => v,
        Err(resp) => return resp,
    };
    match query::student_overall(conn, &requester, &student_id, &period) {
        Ok(result) => ok(
            &req.id,
            serde_json::to_value(result).unwrap_or_else(|_| json!({})),
        ),
        Err(e) => engine_err(&req.id, e),
    }
}

fn handle_student_by_subject(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(c) => c,
        Err(resp) => return resp,
    };
    let requester = match parse_requester(req) {
        Ok(v) => v,
        Err(resp) => return resp,
    };
    let student_id = match required_str(req, "studentId") {
        Ok(v) => v,
        Err(resp) => return resp,
    };
    let period = match parse_req_period(req) {
        Ok(v) => v,
        Err(resp) => return resp,
    };
    match query::student_by_subject(conn, &requester, &student_id, &period) {
        Ok(rows) => ok(
            &req.id,
            json!({
                "subjects": serde_json::to_value(rows).unwrap_or_else(|_| json!([])),
            }),
        ),
        Err(e) => engine_err(&req.id, e),
    }
}

fn handle_class_trend(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(c) => c,
        Err(resp) => return resp,
    };
    let requester = match parse_requester(req) {
        Ok(v) => v,
        Err(resp) => return resp,
    };
    let class_id = match required_str(req, "classId") {
        Ok(v) => v,
        Err(resp) => return resp,
    };
    let subject_id = match required_str(req, "subjectId") {
        Ok(v) => v,
        Err(resp) => return resp,
    };
    let period = match parse_req_period(req) {
        Ok(v) => v,
        Err(resp) => return resp,
    };
    let cfg = match config::load(conn) {
        Ok(c) => c,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    let granularity = match req.params.get("granularity") {
        None => cfg.trend_granularity,
        Some(v) if v.is_null() => cfg.trend_granularity,
        Some(v) => {
            let Some(g) = v.as_str().and_then(Granularity::parse) else {
                return err(
                    &req.id,
                    "bad_params",
                    "granularity must be day|week|month",
                    None,
                );
            };
            g
        }
    };
    match query::class_trend(conn, &requester, &class_id, &subject_id, granularity, &period) {
        Ok(points) => ok(
            &req.id,
            json!({
                "granularity": granularity.as_str(),
                "points": serde_json::to_value(points).unwrap_or_else(|_| json!([])),
            }),
        ),
        Err(e) => engine_err(&req.id, e),
    }
}

fn handle_engagement_score(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(c) => c,
        Err(resp) => return resp,
    };
    let requester = match parse_requester(req) {
        Ok(v) => v,
        Err(resp) => return resp,
    };
    let class_id = match required_str(req, "classId") {
        Ok(v) => v,
        Err(resp) => return resp,
    };
    let period = match parse_req_period(req) {
        Ok(v) => v,
        Err(resp) => return resp,
    };
    let cfg = match config::load(conn) {
        Ok(c) => c,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    match query::engagement_score(conn, &cfg, &requester, &class_id, &period) {
        Ok(result) => ok(
            &req.id,
            serde_json::to_value(result).unwrap_or_else(|_| json!({})),
        ),
        Err(e) => engine_err(&req.id, e),
    }
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "query.studentOverall" => Some(handle_student_overall(state, req)),
        "query.studentBySubject" => Some(handle_student_by_subject(state, req)),
        "query.classTrend" => Some(handle_class_trend(state, req)),
        "query.engagementScore" => Some(handle_engagement_score(state, req)),
        _ => None,
    }
}
