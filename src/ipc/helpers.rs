use crate::db;
use crate::ipc::error::err;
use crate::ipc::types::Request;
use crate::resolve::{find_cycles, Memo};
use crate::rubric::{ColumnAddr, Rubric};
use rusqlite::Connection;
use serde_json::{json, Value};
use std::collections::HashMap;

/// Non-empty string parameter, or a ready `bad_params` response.
pub fn required_str<'r>(req: &'r Request, key: &str) -> Result<&'r str, Value> {
    match req.params.get(key).and_then(|v| v.as_str()) {
        Some(v) if !v.trim().is_empty() => Ok(v),
        Some(_) => Err(err(
            &req.id,
            "bad_params",
            format!("{} must not be empty", key),
            None,
        )),
        None => Err(err(&req.id, "bad_params", format!("missing {}", key), None)),
    }
}

pub fn require_class(conn: &Connection, req: &Request, class_id: &str) -> Result<(), Value> {
    match db::class_exists(conn, class_id) {
        Ok(true) => Ok(()),
        Ok(false) => Err(err(
            &req.id,
            "not_found",
            "class not found",
            Some(json!({ "classId": class_id })),
        )),
        Err(e) => Err(err(&req.id, "db_query_failed", e.to_string(), None)),
    }
}

/// The class rubric, or the empty default when none has been stored yet.
/// The flag is true for the default.
pub fn load_rubric(conn: &Connection, req: &Request, class_id: &str) -> Result<(Rubric, bool), Value> {
    let stored = db::rubric_get(conn, class_id)
        .map_err(|e| err(&req.id, "db_query_failed", e.to_string(), None))?;
    match stored {
        None => Ok((Rubric::default(), true)),
        Some(text) => Rubric::from_json(&text)
            .map(|r| (r, false))
            .map_err(|e| err(&req.id, "invalid_rubric", e.to_string(), Some(e.details()))),
    }
}

/// The class memo, replaced when it is stale or memoization is off.
pub fn class_memo<'m>(
    memos: &'m mut HashMap<String, Memo>,
    class_id: &str,
    rubric: &Rubric,
    revision: i64,
    memoize: bool,
) -> &'m mut Memo {
    let memo = memos
        .entry(class_id.to_string())
        .or_insert_with(|| Memo::new(rubric.fingerprint(), revision));
    if !memoize || !memo.is_current(rubric.fingerprint(), revision) {
        *memo = Memo::new(rubric.fingerprint(), revision);
    } else {
        memo.reset_stats();
    }
    memo
}

pub fn cycles_json(rubric: &Rubric) -> Value {
    let cycles: Vec<Value> = find_cycles(rubric)
        .into_iter()
        .map(|(addr, e)| {
            let ColumnAddr { group, column } = addr;
            let g = rubric.group(group);
            json!({
                "groupId": g.id,
                "columnId": g.columns[column].id,
                "code": e.code(),
                "message": e.to_string(),
                "details": e.details()
            })
        })
        .collect();
    Value::Array(cycles)
}
