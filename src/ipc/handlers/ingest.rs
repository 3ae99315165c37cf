use crate::config;
use crate::engine::{self, ApplyOutcome, IncomingEvent};
use crate::ipc::error::{err, ok};
use crate::ipc::helpers::{db_conn, engine_err};
use crate::ipc::types::{AppState, Request};
use crate::store::{self, AttendanceStatus, EventSource};
use chrono::Utc;
use serde_json::json;

struct ParseErr(String);

fn get_str(params: &serde_json::Value, key: &str) -> Result<String, ParseErr> {
    params
        .get(key)
        .and_then(|v| v.as_str())
        .map(|s| s.to_string())
        .ok_or_else(|| ParseErr(format!("missing {}", key)))
}

/// Wire-level validation of one ingestion record. Recognition events must
/// carry a confidence score; manual entries must not.
fn parse_incoming(params: &serde_json::Value) -> Result<IncomingEvent, ParseErr> {
    let lecture_id = get_str(params, "lectureId")?;
    let student_id = get_str(params, "studentId")?;
    let status_raw = get_str(params, "status")?;
    let status = AttendanceStatus::parse(&status_raw)
        .ok_or_else(|| ParseErr(format!("status must be present|absent|excused, got {:?}", status_raw)))?;
    let source_raw = get_str(params, "source")?;
    let source = EventSource::parse(&source_raw)
        .ok_or_else(|| ParseErr(format!("source must be recognition|manual, got {:?}", source_raw)))?;
    let recorded_raw = get_str(params, "recordedAt")?;
    let recorded_at = store::parse_ts(&recorded_raw).map_err(ParseErr)?;

    let confidence = match params.get("confidence") {
        None => None,
        Some(v) if v.is_null() => None,
        Some(v) => Some(
            v.as_f64()
                .ok_or_else(|| ParseErr("confidence must be a number".to_string()))?,
        ),
    };
    match (source, confidence) {
        (EventSource::Recognition, None) => {
            return Err(ParseErr("recognition events require confidence".to_string()))
        }
        (EventSource::Manual, Some(_)) => {
            return Err(ParseErr(
                "confidence is only valid for recognition events".to_string(),
            ))
        }
        (EventSource::Recognition, Some(c)) if !(0.0..=1.0).contains(&c) => {
            return Err(ParseErr("confidence must be within 0..=1".to_string()))
        }
        _ => {}
    }

    Ok(IncomingEvent {
        lecture_id,
        student_id,
        status,
        source,
        recorded_at,
        confidence,
    })
}

fn outcome_json(outcome: &ApplyOutcome) -> serde_json::Value {
    let late_correction = outcome.late_correction.as_ref().map(|lc| {
        json!({
            "lectureId": lc.lecture_id,
            "studentId": lc.student_id,
            "dimensions": lc.dimensions.iter().map(engine::key_json).collect::<Vec<_>>(),
        })
    });
    json!({
        "eventId": outcome.event_id,
        "applied": outcome.applied,
        "effectiveStatus": outcome.effective_status.as_str(),
        "lateCorrection": late_correction,
    })
}

fn handle_ingest(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(c) => c,
        Err(resp) => return resp,
    };
    let ev = match parse_incoming(&req.params) {
        Ok(v) => v,
        Err(ParseErr(message)) => return err(&req.id, "bad_params", message, None),
    };
    let cfg = match config::load(conn) {
        Ok(c) => c,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    match engine::apply_event(conn, &state.locks, &cfg, &ev, Utc::now()) {
        Ok(outcome) => ok(&req.id, outcome_json(&outcome)),
        Err(e) => engine_err(&req.id, e),
    }
}

fn handle_ingest_batch(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(c) => c,
        Err(resp) => return resp,
    };
    let Some(items) = req.params.get("events").and_then(|v| v.as_array()) else {
        return err(&req.id, "bad_params", "missing events", None);
    };
    let cfg = match config::load(conn) {
        Ok(c) => c,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };

    // Events are independent: one bad record never blocks the rest of a
    // recognition batch, but every rejection is reported back.
    let mut results = Vec::with_capacity(items.len());
    let mut applied = 0usize;
    let mut stale = 0usize;
    let mut rejected = 0usize;
    for (index, item) in items.iter().enumerate() {
        match parse_incoming(item) {
            Ok(ev) => match engine::apply_event(conn, &state.locks, &cfg, &ev, Utc::now()) {
                Ok(outcome) => {
                    if outcome.applied {
                        applied += 1;
                    } else {
                        stale += 1;
                    }
                    results.push(json!({
                        "index": index,
                        "ok": true,
                        "result": outcome_json(&outcome),
                    }));
                }
                Err(e) => {
                    rejected += 1;
                    let mut error = json!({ "code": e.code, "message": e.message });
                    if let Some(d) = e.details {
                        error["details"] = d;
                    }
                    results.push(json!({ "index": index, "ok": false, "error": error }));
                }
            },
            Err(ParseErr(message)) => {
                rejected += 1;
                results.push(json!({
                    "index": index,
                    "ok": false,
                    "error": { "code": "bad_params", "message": message },
                }));
            }
        }
    }
    ok(
        &req.id,
        json!({
            "results": results,
            "applied": applied,
            "stale": stale,
            "rejected": rejected,
        }),
    )
}

fn handle_history(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(c) => c,
        Err(resp) => return resp,
    };
    let lecture_id = match get_str(&req.params, "lectureId") {
        Ok(v) => v,
        Err(ParseErr(m)) => return err(&req.id, "bad_params", m, None),
    };
    let student_id = match get_str(&req.params, "studentId") {
        Ok(v) => v,
        Err(ParseErr(m)) => return err(&req.id, "bad_params", m, None),
    };
    match store::lecture_by_id(conn, &lecture_id) {
        Ok(Some(_)) => {}
        Ok(None) => {
            return err(
                &req.id,
                "unknown_lecture",
                "lecture not found",
                Some(json!({ "lectureId": lecture_id })),
            )
        }
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    }
    let effective = match store::effective_for_pair(conn, &lecture_id, &student_id) {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    let effective_id = effective.map(|e| e.event_id);
    match store::events_for_pair(conn, &lecture_id, &student_id) {
        Ok(events) => {
            let items: Vec<serde_json::Value> = events
                .iter()
                .map(|e| {
                    json!({
                        "eventId": e.id,
                        "status": e.status.as_str(),
                        "source": e.source.as_str(),
                        "recordedAt": store::ts(e.recorded_at),
                        "confidence": e.confidence,
                        "ingestedAt": store::ts(e.ingested_at),
                        "effective": Some(&e.id) == effective_id.as_ref(),
                    })
                })
                .collect();
            ok(&req.id, json!({ "events": items }))
        }
        Err(e) => err(&req.id, "db_query_failed", e.to_string(), None),
    }
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "attendance.ingest" => Some(handle_ingest(state, req)),
        "attendance.ingestBatch" => Some(handle_ingest_batch(state, req)),
        "attendance.history" => Some(handle_history(state, req)),
        _ => None,
    }
}
