use std::path::PathBuf;

use crate::engine::PairLocks;
use rusqlite::Connection;
use serde::Deserialize;

#[derive(Debug, Deserialize, Clone)]
pub struct Request {
    pub id: String,
    pub method: String,
    #[serde(default)]
    pub params: serde_json::Value,
}

pub struct AppState {
    pub workspace: Option<PathBuf>,
    pub db: Option<Connection>,
    pub locks: PairLocks,
}

impl AppState {
    pub fn new() -> Self {
        Self {
            workspace: None,
            db: None,
            locks: PairLocks::new(),
        }
    }
}
