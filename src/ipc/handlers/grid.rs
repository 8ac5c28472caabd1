use crate::config;
use crate::db;
use crate::ipc::error::{err, ok};
use crate::ipc::helpers::{class_memo, load_rubric, require_class, required_str};
use crate::ipc::types::{AppState, Request};
use crate::present::{build_table, TableStudent};
use crate::resolve::Resolver;
use crate::rubric::Rubric;
use crate::store::{RecordMode, ScoreSnapshot, ScoreStore, SqliteScoreStore};
use rusqlite::Connection;
use serde_json::{json, Value};
use std::collections::BTreeSet;

/// Rubric-driven grading reads structured records from week 1 only.
const STRUCTURED_WEEK: i64 = 1;

struct ClassView {
    rubric: Rubric,
    scores: ScoreSnapshot,
    revision: i64,
}

fn load_view(conn: &Connection, req: &Request, class_id: &str) -> Result<ClassView, Value> {
    require_class(conn, req, class_id)?;
    let (rubric, _) = load_rubric(conn, req, class_id)?;
    let revision = db::score_revision(conn, class_id)
        .map_err(|e| err(&req.id, "db_query_failed", e.to_string(), None))?;
    let records = SqliteScoreStore::new(conn)
        .list(class_id, Some(RecordMode::Structured), Some(STRUCTURED_WEEK))
        .map_err(|e| err(&req.id, "db_query_failed", e.to_string(), None))?;
    Ok(ClassView {
        rubric,
        scores: ScoreSnapshot::from_records(&records),
        revision,
    })
}

/// Optional array of ids; absent or null means empty.
fn id_set(req: &Request, key: &str) -> Result<Option<BTreeSet<String>>, Value> {
    match req.params.get(key) {
        None | Some(Value::Null) => Ok(None),
        Some(Value::Array(items)) => items
            .iter()
            .map(|v| {
                v.as_str().map(str::to_string).ok_or_else(|| {
                    err(
                        &req.id,
                        "bad_params",
                        format!("{} must be an array of strings", key),
                        None,
                    )
                })
            })
            .collect::<Result<BTreeSet<_>, _>>()
            .map(Some),
        Some(_) => Err(err(
            &req.id,
            "bad_params",
            format!("{} must be an array of strings", key),
            None,
        )),
    }
}

fn handle_table_get(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    let class_id = match required_str(req, "classId") {
        Ok(v) => v,
        Err(resp) => return resp,
    };
    let collapsed = match id_set(req, "collapsedGroups") {
        Ok(v) => v.unwrap_or_default(),
        Err(resp) => return resp,
    };
    let wanted = match id_set(req, "studentIds") {
        Ok(v) => v,
        Err(resp) => return resp,
    };
    let view = match load_view(conn, req, class_id) {
        Ok(v) => v,
        Err(resp) => return resp,
    };
    let setup = match config::load_grading(conn) {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    let roster = match db::students_list(conn, class_id) {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };

    let students: Vec<TableStudent<'_>> = roster
        .iter()
        .filter(|s| wanted.as_ref().map_or(true, |w| w.contains(&s.id)))
        .map(|s| TableStudent {
            id: &s.id,
            display_name: Some(&s.display_name),
        })
        .collect();
    if students.len() as i64 > setup.max_table_students {
        return err(
            &req.id,
            "bad_params",
            "too many students for one table; pass studentIds",
            Some(json!({
                "count": students.len(),
                "maxTableStudents": setup.max_table_students
            })),
        );
    }

    let memo = class_memo(
        &mut state.memos,
        class_id,
        &view.rubric,
        view.revision,
        setup.memoize,
    );
    let mut resolver = Resolver::new(&view.rubric, &view.scores, memo);
    let table = build_table(&mut resolver, &students, &collapsed);
    ok(&req.id, json!(table))
}

fn handle_cell_resolve(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    let class_id = match required_str(req, "classId") {
        Ok(v) => v,
        Err(resp) => return resp,
    };
    let student_id = match required_str(req, "studentId") {
        Ok(v) => v,
        Err(resp) => return resp,
    };
    let group_id = match required_str(req, "groupId") {
        Ok(v) => v,
        Err(resp) => return resp,
    };
    let column_id = match required_str(req, "columnId") {
        Ok(v) => v,
        Err(resp) => return resp,
    };
    let view = match load_view(conn, req, class_id) {
        Ok(v) => v,
        Err(resp) => return resp,
    };
    let memoize = match config::load_grading(conn) {
        Ok(v) => v.memoize,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };

    let known = view.rubric.locate(group_id, column_id).is_some();
    let memo = class_memo(
        &mut state.memos,
        class_id,
        &view.rubric,
        view.revision,
        memoize,
    );
    // Unknown cells are worth 0, the same as a dangling reference.
    match Resolver::new(&view.rubric, &view.scores, memo).resolve_by_id(student_id, group_id, column_id) {
        Ok(value) => ok(&req.id, json!({ "value": value, "known": known })),
        Err(e) => err(&req.id, e.code(), e.to_string(), Some(e.details())),
    }
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "table.get" => Some(handle_table_get(state, req)),
        "cell.resolve" => Some(handle_cell_resolve(state, req)),
        _ => None,
    }
}
