use crate::ipc::error::{err, ok};
use crate::ipc::helpers::{db_conn, optional_str, required_str};
use crate::ipc::types::{AppState, Request};
use rusqlite::{Connection, OptionalExtension};
use serde_json::json;

fn row_exists(
    conn: &Connection,
    table: &str,
    id: &str,
    req_id: &str,
) -> Result<bool, serde_json::Value> {
    let sql = format!("SELECT 1 FROM {} WHERE id = ?", table);
    conn.query_row(&sql, [id], |r| r.get::<_, i64>(0))
        .optional()
        .map(|v| v.is_some())
        .map_err(|e| err(req_id, "db_query_failed", e.to_string(), None))
}

fn create_named(
    state: &mut AppState,
    req: &Request,
    table: &str,
    name_key: &str,
    name_column: &str,
) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(c) => c,
        Err(resp) => return resp,
    };
    let name = match required_str(req, name_key) {
        Ok(v) => v,
        Err(resp) => return resp,
    };
    if name.trim().is_empty() {
        return err(&req.id, "bad_params", format!("{} must not be blank", name_key), None);
    }
    let id = optional_str(req, "id").unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
    match row_exists(conn, table, &id, &req.id) {
        Ok(true) => {
            return err(
                &req.id,
                "conflict",
                format!("{} id already exists", table),
                Some(json!({ "id": id })),
            )
        }
        Ok(false) => {}
        Err(resp) => return resp,
    }
    let sql = format!("INSERT INTO {}(id, {}) VALUES(?, ?)", table, name_column);
    if let Err(e) = conn.execute(&sql, (&id, name.trim())) {
        return err(&req.id, "db_update_failed", e.to_string(), None);
    }
    ok(&req.id, json!({ "id": id }))
}

fn list_named(
    state: &mut AppState,
    req: &Request,
    table: &str,
    name_column: &str,
    out_key: &str,
) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(c) => c,
        Err(resp) => return resp,
    };
    let sql = format!("SELECT id, {} FROM {} ORDER BY {}, id", name_column, table, name_column);
    let mut stmt = match conn.prepare(&sql) {
        Ok(s) => s,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    let rows = stmt
        .query_map([], |r| Ok((r.get::<_, String>(0)?, r.get::<_, String>(1)?)))
        .and_then(|it| it.collect::<Result<Vec<_>, _>>());
    match rows {
        Ok(rows) => {
            let items: Vec<serde_json::Value> = rows
                .into_iter()
                .map(|(id, name)| json!({ "id": id, "name": name }))
                .collect();
            let mut result = serde_json::Map::new();
            result.insert(out_key.to_string(), serde_json::Value::Array(items));
            ok(&req.id, serde_json::Value::Object(result))
        }
        Err(e) => err(&req.id, "db_query_failed", e.to_string(), None),
    }
}

fn handle_students_create(state: &mut AppState, req: &Request) -> serde_json::Value {
    create_named(state, req, "students", "fullName", "full_name")
}

fn handle_students_list(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(c) => c,
        Err(resp) => return resp,
    };
    let mut stmt = match conn.prepare("SELECT id, full_name FROM students ORDER BY full_name, id") {
        Ok(s) => s,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    let rows = stmt
        .query_map([], |r| Ok((r.get::<_, String>(0)?, r.get::<_, String>(1)?)))
        .and_then(|it| it.collect::<Result<Vec<_>, _>>());
    match rows {
        Ok(rows) => {
            let items: Vec<serde_json::Value> = rows
                .into_iter()
                .map(|(id, full_name)| json!({ "id": id, "fullName": full_name }))
                .collect();
            ok(&req.id, json!({ "students": items }))
        }
        Err(e) => err(&req.id, "db_query_failed", e.to_string(), None),
    }
}

fn handle_teachers_assign(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(c) => c,
        Err(resp) => return resp,
    };
    let teacher_id = match required_str(req, "teacherId") {
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
    for (table, id) in [("classes", &class_id), ("subjects", &subject_id)] {
        match row_exists(conn, table, id, &req.id) {
            Ok(true) => {}
            Ok(false) => {
                return err(
                    &req.id,
                    "not_found",
                    format!("{} id not found", table),
                    Some(json!({ "id": id })),
                )
            }
            Err(resp) => return resp,
        }
    }
    let inserted = conn.execute(
        "INSERT OR IGNORE INTO teaching_assignments(teacher_id, class_id, subject_id)
         VALUES(?, ?, ?)",
        (&teacher_id, &class_id, &subject_id),
    );
    match inserted {
        Ok(n) => ok(&req.id, json!({ "assigned": n > 0 })),
        Err(e) => err(&req.id, "db_update_failed", e.to_string(), None),
    }
}

fn handle_teachers_assignments(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(c) => c,
        Err(resp) => return resp,
    };
    let teacher_id = match required_str(req, "teacherId") {
        Ok(v) => v,
        Err(resp) => return resp,
    };
    let mut stmt = match conn.prepare(
        "SELECT class_id, subject_id FROM teaching_assignments
         WHERE teacher_id = ? ORDER BY class_id, subject_id",
    ) {
        Ok(s) => s,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    let rows = stmt
        .query_map([&teacher_id], |r| {
            Ok((r.get::<_, String>(0)?, r.get::<_, String>(1)?))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>());
    match rows {
        Ok(rows) => {
            let items: Vec<serde_json::Value> = rows
                .into_iter()
                .map(|(class_id, subject_id)| {
                    json!({ "classId": class_id, "subjectId": subject_id })
                })
                .collect();
            ok(&req.id, json!({ "assignments": items }))
        }
        Err(e) => err(&req.id, "db_query_failed", e.to_string(), None),
    }
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "subjects.create" => Some(create_named(state, req, "subjects", "name", "name")),
        "subjects.list" => Some(list_named(state, req, "subjects", "name", "subjects")),
        "classes.create" => Some(create_named(state, req, "classes", "name", "name")),
        "classes.list" => Some(list_named(state, req, "classes", "name", "classes")),
        "students.create" => Some(handle_students_create(state, req)),
        "students.list" => Some(handle_students_list(state, req)),
        "teachers.assign" => Some(handle_teachers_assign(state, req)),
        "teachers.assignments" => Some(handle_teachers_assignments(state, req)),
        _ => None,
    }
}
