use crate::config;
use crate::engine;
use crate::ipc::error::{err, ok};
use crate::ipc::helpers::db_conn;
use crate::ipc::types::{AppState, Request};
use chrono::Utc;
use serde_json::json;

fn handle_config_get(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(c) => c,
        Err(resp) => return resp,
    };
    match config::load(conn) {
        Ok(cfg) => ok(
            &req.id,
            serde_json::to_value(cfg).unwrap_or_else(|_| json!({})),
        ),
        Err(e) => err(&req.id, "db_query_failed", e.to_string(), None),
    }
}

fn handle_config_set(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(c) => c,
        Err(resp) => return resp,
    };
    let Some(patch) = req.params.get("config") else {
        return err(&req.id, "bad_params", "missing config", None);
    };
    let current = match config::load(conn) {
        Ok(cfg) => cfg,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    let next = match config::merged(&current, patch) {
        Ok(cfg) => cfg,
        Err(message) => return err(&req.id, "bad_params", message, None),
    };
    if let Err(e) = config::save(conn, &next) {
        return err(&req.id, "db_update_failed", e.to_string(), None);
    }
    ok(
        &req.id,
        serde_json::to_value(next).unwrap_or_else(|_| json!({})),
    )
}

fn handle_rollups_rebuild(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(c) => c,
        Err(resp) => return resp,
    };
    match engine::rebuild_rollups(conn, Utc::now()) {
        Ok(summary) => ok(
            &req.id,
            json!({
                "lecturesSeeded": summary.lectures_seeded,
                "pairsResolved": summary.pairs_resolved,
            }),
        ),
        Err(e) => err(&req.id, &e.code, e.message, e.details),
    }
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "config.get" => Some(handle_config_get(state, req)),
        "config.set" => Some(handle_config_set(state, req)),
        "rollups.rebuild" => Some(handle_rollups_rebuild(state, req)),
        _ => None,
    }
}
