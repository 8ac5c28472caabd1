use std::collections::HashMap;
use std::path::PathBuf;

use crate::resolve::Memo;
use rusqlite::Connection;
use serde::Deserialize;

#[derive(Debug, Deserialize, Clone)]
pub struct Request {
    pub id: String,
    pub method: String,
    #[serde(default)]
    pub params: serde_json::Value,
}

#[derive(Default)]
pub struct AppState {
    pub workspace: Option<PathBuf>,
    pub db: Option<Connection>,
    /// Resolved values per class id, stamped with rubric fingerprint and score revision.
    pub memos: HashMap<String, Memo>,
}
