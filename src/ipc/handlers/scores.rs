use crate::config;
use crate::db;
use crate::gateway::{submit_score, GradingMode, SubmitError, SubmitRequest};
use crate::ipc::error::{err, ok};
use crate::ipc::helpers::{load_rubric, require_class, required_str};
use crate::ipc::types::{AppState, Request};
use crate::store::{RecordMode, ScoreStore, SqliteScoreStore};
use serde_json::{json, Value};

fn week_param(req: &Request, default: i64) -> Result<i64, Value> {
    match req.params.get("weekNumber") {
        None | Some(Value::Null) => Ok(default),
        Some(v) => match v.as_i64() {
            Some(n) if (1..=60).contains(&n) => Ok(n),
            _ => Err(err(
                &req.id,
                "bad_params",
                "weekNumber must be an integer in 1..=60",
                None,
            )),
        },
    }
}

fn handle_scores_submit(state: &mut AppState, req: &Request) -> serde_json::Value {
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
    let column_id = match required_str(req, "columnId") {
        Ok(v) => v,
        Err(resp) => return resp,
    };
    let Some(raw_value) = req.params.get("value") else {
        return err(&req.id, "bad_params", "missing value", None);
    };
    if let Err(resp) = require_class(conn, req, class_id) {
        return resp;
    }
    match db::student_in_class(conn, class_id, student_id) {
        Ok(true) => {}
        Ok(false) => {
            return err(
                &req.id,
                "not_found",
                "student not found in class",
                Some(json!({ "classId": class_id, "studentId": student_id })),
            )
        }
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    }

    let mode_raw = req
        .params
        .get("mode")
        .and_then(|v| v.as_str())
        .unwrap_or("structured");
    let (group_id, max_score, mode) = match mode_raw {
        "structured" => {
            let group_id = match required_str(req, "groupId") {
                Ok(v) => v,
                Err(resp) => return resp,
            };
            let (rubric, _) = match load_rubric(conn, req, class_id) {
                Ok(v) => v,
                Err(resp) => return resp,
            };
            let Some(addr) = rubric.locate(group_id, column_id) else {
                return err(
                    &req.id,
                    "not_found",
                    "column not found in rubric",
                    Some(json!({ "groupId": group_id, "columnId": column_id })),
                );
            };
            let column = rubric.column(addr);
            if !column.kind.is_editable() {
                return err(
                    &req.id,
                    "read_only",
                    format!("{} columns are computed", column.kind.as_str()),
                    Some(json!({
                        "groupId": group_id,
                        "columnId": column_id,
                        "type": column.kind.as_str()
                    })),
                );
            }
            (group_id, column.max_score, GradingMode::Structured)
        }
        "weekly" => {
            let setup = match config::load_grading(conn) {
                Ok(v) => v,
                Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
            };
            let week_number = match week_param(req, setup.default_week_number) {
                Ok(v) => v,
                Err(resp) => return resp,
            };
            let max_score = match req.params.get("maxScore").and_then(|v| v.as_f64()) {
                Some(v) if v.is_finite() && v >= 0.0 => v,
                _ => {
                    return err(
                        &req.id,
                        "bad_params",
                        "maxScore must be a non-negative number",
                        None,
                    )
                }
            };
            let category = req
                .params
                .get("type")
                .and_then(|v| v.as_str())
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(str::to_string);
            let group_id = req
                .params
                .get("groupId")
                .and_then(|v| v.as_str())
                .unwrap_or("");
            (
                group_id,
                max_score,
                GradingMode::Weekly {
                    week_number,
                    category,
                },
            )
        }
        other => {
            return err(
                &req.id,
                "bad_params",
                format!("unknown mode: {}", other),
                None,
            )
        }
    };

    let mut store = SqliteScoreStore::new(conn);
    let submitted = submit_score(
        &mut store,
        &SubmitRequest {
            class_id,
            student_id,
            group_id,
            column_id,
            raw_value,
            max_score,
            mode,
        },
    );
    match submitted {
        Ok(outcome) => ok(&req.id, json!(outcome)),
        Err(SubmitError::Validation(e)) => err(&req.id, e.code(), e.to_string(), Some(e.details())),
        Err(SubmitError::Store {
            student_id,
            column_id,
            source,
        }) => {
            tracing::error!(%student_id, %column_id, error = %source, "score write failed");
            err(
                &req.id,
                "db_write_failed",
                source.to_string(),
                Some(json!({ "studentId": student_id, "columnId": column_id })),
            )
        }
    }
}

fn handle_scores_list(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    let class_id = match required_str(req, "classId") {
        Ok(v) => v,
        Err(resp) => return resp,
    };
    if let Err(resp) = require_class(conn, req, class_id) {
        return resp;
    }
    let week_number = match req.params.get("weekNumber") {
        None | Some(Value::Null) => None,
        Some(_) => match week_param(req, 1) {
            Ok(v) => Some(v),
            Err(resp) => return resp,
        },
    };

    let mode = match req.params.get("mode") {
        None | Some(Value::Null) => None,
        Some(v) => match v.as_str().and_then(RecordMode::parse) {
            Some(m) => Some(m),
            None => {
                return err(
                    &req.id,
                    "bad_params",
                    "mode must be \"structured\" or \"weekly\"",
                    None,
                )
            }
        },
    };

    match SqliteScoreStore::new(conn).list(class_id, mode, week_number) {
        Ok(records) => ok(&req.id, json!({ "records": records })),
        Err(e) => err(&req.id, "db_query_failed", e.to_string(), None),
    }
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "scores.submit" => Some(handle_scores_submit(state, req)),
        "scores.list" => Some(handle_scores_list(state, req)),
        _ => None,
    }
}
