use crate::db;
use rusqlite::Connection;
use serde::Serialize;
use serde_json::{Map, Value};

pub const GRADING_SETTINGS_KEY: &str = "setup.grading";

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GradingSetup {
    /// Keep resolved values between requests until a score or rubric changes.
    pub memoize: bool,
    pub default_week_number: i64,
    pub max_table_students: i64,
}

impl Default for GradingSetup {
    fn default() -> Self {
        Self {
            memoize: true,
            default_week_number: 1,
            max_table_students: 2000,
        }
    }
}

fn parse_bool(v: &Value, key: &str) -> Result<bool, String> {
    v.as_bool().ok_or_else(|| format!("{} must be boolean", key))
}

fn parse_i64_range(v: &Value, key: &str, min: i64, max: i64) -> Result<i64, String> {
    let n = v
        .as_i64()
        .ok_or_else(|| format!("{} must be integer", key))?;
    if !(min..=max).contains(&n) {
        return Err(format!("{} must be in {}..={}", key, min, max));
    }
    Ok(n)
}

impl GradingSetup {
    pub fn merge_patch(&mut self, patch: &Map<String, Value>) -> Result<(), String> {
        for (k, v) in patch {
            match k.as_str() {
                "memoize" => self.memoize = parse_bool(v, k)?,
                "defaultWeekNumber" => self.default_week_number = parse_i64_range(v, k, 1, 60)?,
                "maxTableStudents" => self.max_table_students = parse_i64_range(v, k, 1, 5000)?,
                _ => return Err(format!("unknown grading field: {}", k)),
            }
        }
        Ok(())
    }

    pub fn to_value(&self) -> Value {
        serde_json::to_value(self).unwrap_or(Value::Null)
    }
}

pub fn load_grading(conn: &Connection) -> anyhow::Result<GradingSetup> {
    let mut current = GradingSetup::default();
    if let Some(saved) = db::settings_get_json(conn, GRADING_SETTINGS_KEY)? {
        if let Some(saved_obj) = saved.as_object() {
            // A stale or hand-edited value must not block the workspace.
            let mut candidate = current.clone();
            if candidate.merge_patch(saved_obj).is_ok() {
                current = candidate;
            } else {
                tracing::warn!("ignoring malformed grading settings");
            }
        }
    }
    Ok(current)
}

pub fn save_grading(conn: &Connection, setup: &GradingSetup) -> anyhow::Result<()> {
    db::settings_set_json(conn, GRADING_SETTINGS_KEY, &setup.to_value())
}
