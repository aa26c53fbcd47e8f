use std::path::PathBuf;

use rusqlite::Connection;
use serde::Deserialize;

/// One line of the request stream.
#[derive(Debug, Deserialize, Clone)]
pub struct Request {
    pub id: String,
    pub method: String,
    #[serde(default)]
    pub params: serde_json::Value,
}

/// The open workspace, if any. Every data method needs one.
#[derive(Default)]
pub struct AppState {
    pub workspace: Option<PathBuf>,
    pub db: Option<Connection>,
}

impl AppState {
    pub fn conn(&self) -> Option<&Connection> {
        self.db.as_ref()
    }
}
