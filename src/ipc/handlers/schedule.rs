use crate::engine;
use crate::ipc::error::{err, ok};
use crate::ipc::helpers::{db_conn, engine_err};
use crate::ipc::types::{AppState, Request};
use crate::roster;
use crate::store;
use chrono::{DateTime, Utc};
use rusqlite::{Connection, OptionalExtension};
use serde_json::json;

struct HandlerErr {
    code: &'static str,
    message: String,
    details: Option<serde_json::Value>,
}

impl HandlerErr {
    fn bad_params(message: impl Into<String>) -> Self {
        Self {
            code: "bad_params",
            message: message.into(),
            details: None,
        }
    }

    fn response(self, id: &str) -> serde_json::Value {
        err(id, self.code, self.message, self.details)
    }
}

fn get_required_str(params: &serde_json::Value, key: &str) -> Result<String, HandlerErr> {
    params
        .get(key)
        .and_then(|v| v.as_str())
        .map(|s| s.to_string())
        .ok_or_else(|| HandlerErr::bad_params(format!("missing {}", key)))
}

fn get_required_ts(params: &serde_json::Value, key: &str) -> Result<DateTime<Utc>, HandlerErr> {
    let raw = get_required_str(params, key)?;
    store::parse_ts(&raw).map_err(HandlerErr::bad_params)
}

fn get_optional_ts(
    params: &serde_json::Value,
    key: &str,
) -> Result<Option<DateTime<Utc>>, HandlerErr> {
    match params.get(key) {
        None => Ok(None),
        Some(v) if v.is_null() => Ok(None),
        Some(v) => {
            let Some(s) = v.as_str() else {
                return Err(HandlerErr::bad_params(format!("{} must be a string", key)));
            };
            store::parse_ts(s).map(Some).map_err(HandlerErr::bad_params)
        }
    }
}

fn require_row(
    conn: &Connection,
    table: &str,
    id: &str,
) -> Result<(), HandlerErr> {
    let sql = format!("SELECT 1 FROM {} WHERE id = ?", table);
    let found = conn
        .query_row(&sql, [id], |r| r.get::<_, i64>(0))
        .optional()
        .map_err(|e| HandlerErr {
            code: "db_query_failed",
            message: e.to_string(),
            details: None,
        })?
        .is_some();
    if found {
        Ok(())
    } else {
        Err(HandlerErr {
            code: "not_found",
            message: format!("{} id not found", table),
            details: Some(json!({ "id": id })),
        })
    }
}

fn enrollments_add(conn: &Connection, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let student_id = get_required_str(params, "studentId")?;
    let class_id = get_required_str(params, "classId")?;
    let effective_from = get_required_ts(params, "effectiveFrom")?;
    let effective_to = get_optional_ts(params, "effectiveTo")?;
    if let Some(to) = effective_to {
        if to <= effective_from {
            return Err(HandlerErr::bad_params(
                "effectiveTo must be after effectiveFrom",
            ));
        }
    }
    require_row(conn, "students", &student_id)?;
    require_row(conn, "classes", &class_id)?;

    let id = uuid::Uuid::new_v4().to_string();
    conn.execute(
        "INSERT INTO enrollments(id, student_id, class_id, effective_from, effective_to)
         VALUES(?, ?, ?, ?, ?)",
        (
            &id,
            &student_id,
            &class_id,
            store::ts(effective_from),
            effective_to.map(store::ts),
        ),
    )
    .map_err(|e| HandlerErr {
        code: "db_update_failed",
        message: e.to_string(),
        details: None,
    })?;
    Ok(json!({ "enrollmentId": id }))
}

fn enrollments_end(conn: &Connection, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let enrollment_id = get_required_str(params, "enrollmentId")?;
    let effective_to = get_required_ts(params, "effectiveTo")?;
    require_row(conn, "enrollments", &enrollment_id)?;
    conn.execute(
        "UPDATE enrollments SET effective_to = ? WHERE id = ?",
        (store::ts(effective_to), &enrollment_id),
    )
    .map_err(|e| HandlerErr {
        code: "db_update_failed",
        message: e.to_string(),
        details: None,
    })?;
    Ok(json!({ "ok": true }))
}

fn enrollments_list(conn: &Connection, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let class_id = get_required_str(params, "classId")?;
    let mut stmt = conn
        .prepare(
            "SELECT id, student_id, effective_from, effective_to
             FROM enrollments WHERE class_id = ? ORDER BY effective_from, id",
        )
        .map_err(|e| HandlerErr {
            code: "db_query_failed",
            message: e.to_string(),
            details: None,
        })?;
    let rows = stmt
        .query_map([&class_id], |r| {
            Ok(json!({
                "enrollmentId": r.get::<_, String>(0)?,
                "studentId": r.get::<_, String>(1)?,
                "effectiveFrom": r.get::<_, String>(2)?,
                "effectiveTo": r.get::<_, Option<String>>(3)?,
            }))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(|e| HandlerErr {
            code: "db_query_failed",
            message: e.to_string(),
            details: None,
        })?;
    Ok(json!({ "enrollments": rows }))
}

fn lectures_schedule(conn: &Connection, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let subject_id = get_required_str(params, "subjectId")?;
    let class_id = get_required_str(params, "classId")?;
    let teacher_id = get_required_str(params, "teacherId")?;
    let scheduled_at = get_required_ts(params, "scheduledAt")?;
    let duration_minutes = params
        .get("durationMinutes")
        .and_then(|v| v.as_i64())
        .ok_or_else(|| HandlerErr::bad_params("missing durationMinutes"))?;
    if duration_minutes <= 0 {
        return Err(HandlerErr::bad_params("durationMinutes must be positive"));
    }
    let classroom = params
        .get("classroom")
        .and_then(|v| v.as_str())
        .map(|s| s.to_string());
    require_row(conn, "subjects", &subject_id)?;
    require_row(conn, "classes", &class_id)?;

    let lecture_id = uuid::Uuid::new_v4().to_string();
    let tx = conn.unchecked_transaction().map_err(|e| HandlerErr {
        code: "db_tx_failed",
        message: e.to_string(),
        details: None,
    })?;
    tx.execute(
        "INSERT INTO lectures(id, subject_id, class_id, teacher_id, scheduled_at,
                              duration_minutes, classroom)
         VALUES(?, ?, ?, ?, ?, ?, ?)",
        (
            &lecture_id,
            &subject_id,
            &class_id,
            &teacher_id,
            store::ts(scheduled_at),
            duration_minutes,
            &classroom,
        ),
    )
    .map_err(|e| HandlerErr {
        code: "db_update_failed",
        message: e.to_string(),
        details: None,
    })?;

    // Roster freezes now: enrollment changes after scheduling never touch
    // this lecture.
    let students = roster::enrolled_as_of(&tx, &class_id, scheduled_at).map_err(|e| HandlerErr {
        code: "db_query_failed",
        message: e.to_string(),
        details: None,
    })?;
    roster::snapshot_roster(&tx, &lecture_id, &students).map_err(|e| HandlerErr {
        code: "db_update_failed",
        message: e.to_string(),
        details: None,
    })?;

    let lecture = store::lecture_by_id(&tx, &lecture_id)
        .map_err(|e| HandlerErr {
            code: "db_query_failed",
            message: e.to_string(),
            details: None,
        })?
        .ok_or_else(|| HandlerErr {
            code: "db_query_failed",
            message: "lecture row missing after insert".to_string(),
            details: None,
        })?;
    let roster_size = engine::register_lecture(&tx, &lecture).map_err(|e| HandlerErr {
        code: "db_update_failed",
        message: e.message,
        details: e.details,
    })?;

    tx.commit().map_err(|e| HandlerErr {
        code: "db_commit_failed",
        message: e.to_string(),
        details: None,
    })?;
    Ok(json!({ "lectureId": lecture_id, "rosterSize": roster_size }))
}

fn lectures_list(conn: &Connection, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let class_id = params.get("classId").and_then(|v| v.as_str());
    let mut sql = String::from(
        "SELECT id, subject_id, class_id, teacher_id, scheduled_at, duration_minutes,
                classroom, status
         FROM lectures",
    );
    if class_id.is_some() {
        sql.push_str(" WHERE class_id = ?");
    }
    sql.push_str(" ORDER BY scheduled_at, id");
    let mut stmt = conn.prepare(&sql).map_err(|e| HandlerErr {
        code: "db_query_failed",
        message: e.to_string(),
        details: None,
    })?;
    let map_row = |r: &rusqlite::Row<'_>| -> rusqlite::Result<serde_json::Value> {
        Ok(json!({
            "lectureId": r.get::<_, String>(0)?,
            "subjectId": r.get::<_, String>(1)?,
            "classId": r.get::<_, String>(2)?,
            "teacherId": r.get::<_, String>(3)?,
            "scheduledAt": r.get::<_, String>(4)?,
            "durationMinutes": r.get::<_, i64>(5)?,
            "classroom": r.get::<_, Option<String>>(6)?,
            "status": r.get::<_, String>(7)?,
        }))
    };
    let rows = match class_id {
        Some(cid) => stmt
            .query_map([cid], map_row)
            .and_then(|it| it.collect::<Result<Vec<_>, _>>()),
        None => stmt
            .query_map([], map_row)
            .and_then(|it| it.collect::<Result<Vec<_>, _>>()),
    }
    .map_err(|e| HandlerErr {
        code: "db_query_failed",
        message: e.to_string(),
        details: None,
    })?;
    Ok(json!({ "lectures": rows }))
}

fn lectures_roster(conn: &Connection, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let lecture_id = get_required_str(params, "lectureId")?;
    let students = roster::expected_attendees(conn, &lecture_id)
        .map_err(|e| HandlerErr {
            code: "db_query_failed",
            message: e.to_string(),
            details: None,
        })?
        .ok_or_else(|| HandlerErr {
            code: "unknown_lecture",
            message: "lecture not found".to_string(),
            details: Some(json!({ "lectureId": lecture_id })),
        })?;
    Ok(json!({ "lectureId": lecture_id, "studentIds": students }))
}

fn handle_with_conn(
    state: &mut AppState,
    req: &Request,
    f: fn(&Connection, &serde_json::Value) -> Result<serde_json::Value, HandlerErr>,
) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(c) => c,
        Err(resp) => return resp,
    };
    match f(conn, &req.params) {
        Ok(result) => ok(&req.id, result),
        Err(error) => error.response(&req.id),
    }
}

fn handle_lectures_cancel(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(c) => c,
        Err(resp) => return resp,
    };
    let lecture_id = match get_required_str(&req.params, "lectureId") {
        Ok(v) => v,
        Err(e) => return e.response(&req.id),
    };
    match engine::cancel_lecture(conn, &lecture_id, Utc::now()) {
        Ok(summary) => ok(
            &req.id,
            json!({
                "lectureId": lecture_id,
                "alreadyCancelled": summary.already_cancelled,
                "studentsWithdrawn": summary.students_withdrawn,
            }),
        ),
        Err(e) => engine_err(&req.id, e),
    }
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "enrollments.add" => Some(handle_with_conn(state, req, enrollments_add)),
        "enrollments.end" => Some(handle_with_conn(state, req, enrollments_end)),
        "enrollments.list" => Some(handle_with_conn(state, req, enrollments_list)),
        "lectures.schedule" => Some(handle_with_conn(state, req, lectures_schedule)),
        "lectures.cancel" => Some(handle_lectures_cancel(state, req)),
        "lectures.list" => Some(handle_with_conn(state, req, lectures_list)),
        "lectures.roster" => Some(handle_with_conn(state, req, lectures_roster)),
        _ => None,
    }
}
