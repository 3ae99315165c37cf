use crate::backup;
use crate::db;
use crate::ipc::error::{err, ok};
use crate::ipc::helpers::required_str;
use crate::ipc::types::{AppState, Request};
use serde_json::json;
use std::path::PathBuf;

fn handle_export(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(workspace) = state.workspace.clone() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    let out_path = match required_str(req, "outPath") {
        Ok(v) => PathBuf::from(v),
        Err(resp) => return resp,
    };
    match backup::export_workspace_bundle(&workspace, &out_path) {
        Ok(summary) => ok(
            &req.id,
            json!({
                "bundleFormat": summary.bundle_format,
                "dbSha256": summary.db_sha256,
                "outPath": out_path.to_string_lossy(),
            }),
        ),
        Err(e) => err(&req.id, "export_failed", format!("{e:#}"), None),
    }
}

fn handle_import(state: &mut AppState, req: &Request) -> serde_json::Value {
    let in_path = match required_str(req, "inPath") {
        Ok(v) => PathBuf::from(v),
        Err(resp) => return resp,
    };
    let workspace = match required_str(req, "workspacePath") {
        Ok(v) => PathBuf::from(v),
        Err(resp) => return resp,
    };

    // Release any open handle before the database file is replaced.
    state.db = None;
    state.workspace = None;

    let summary = match backup::import_workspace_bundle(&in_path, &workspace) {
        Ok(s) => s,
        Err(e) => return err(&req.id, "import_failed", format!("{e:#}"), None),
    };
    match db::open_db(&workspace) {
        Ok(conn) => {
            state.workspace = Some(workspace.clone());
            state.db = Some(conn);
            ok(
                &req.id,
                json!({
                    "bundleFormat": summary.bundle_format_detected,
                    "dbSha256": summary.db_sha256,
                    "workspacePath": workspace.to_string_lossy(),
                }),
            )
        }
        Err(e) => err(&req.id, "db_open_failed", format!("{e:?}"), None),
    }
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "workspace.export" => Some(handle_export(state, req)),
        "workspace.import" => Some(handle_import(state, req)),
        _ => None,
    }
}
