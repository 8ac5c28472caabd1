use crate::db;
use crate::ipc::error::{err, ok};
use crate::ipc::helpers::{cycles_json, load_rubric, require_class, required_str};
use crate::ipc::types::{AppState, Request};
use crate::rubric::Rubric;
use serde_json::json;

fn handle_rubric_get(state: &mut AppState, req: &Request) -> serde_json::Value {
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
    let (rubric, is_default) = match load_rubric(conn, req, class_id) {
        Ok(v) => v,
        Err(resp) => return resp,
    };

    ok(
        &req.id,
        json!({
            "rubric": rubric.doc(),
            "fingerprint": rubric.fingerprint(),
            "diagnostics": rubric.diagnostics(),
            "isDefault": is_default
        }),
    )
}

fn handle_rubric_set(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    let class_id = match required_str(req, "classId") {
        Ok(v) => v,
        Err(resp) => return resp,
    };
    let Some(raw) = req.params.get("rubric").filter(|v| v.is_object()) else {
        return err(&req.id, "bad_params", "rubric must be an object", None);
    };
    if let Err(resp) = require_class(conn, req, class_id) {
        return resp;
    }

    let rubric = match Rubric::from_value(raw) {
        Ok(r) => r,
        Err(e) => return err(&req.id, "invalid_rubric", e.to_string(), Some(e.details())),
    };
    let document = match serde_json::to_string(rubric.doc()) {
        Ok(v) => v,
        Err(e) => return err(&req.id, "invalid_rubric", e.to_string(), None),
    };
    if let Err(e) = db::rubric_put(conn, class_id, &document, rubric.fingerprint()) {
        return err(
            &req.id,
            "db_update_failed",
            e.to_string(),
            Some(json!({ "table": "rubrics" })),
        );
    }
    state.memos.remove(class_id);

    tracing::info!(
        class_id,
        fingerprint = rubric.fingerprint(),
        diagnostics = rubric.diagnostics().len(),
        "rubric stored"
    );
    ok(
        &req.id,
        json!({
            "fingerprint": rubric.fingerprint(),
            "diagnostics": rubric.diagnostics(),
            "cycles": cycles_json(&rubric)
        }),
    )
}

/// Dry run of `rubric.set`; needs no workspace.
fn handle_rubric_check(_state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(raw) = req.params.get("rubric") else {
        return err(&req.id, "bad_params", "missing rubric", None);
    };

    match Rubric::from_value(raw) {
        Ok(rubric) => {
            let cycles = cycles_json(&rubric);
            let valid = cycles.as_array().map(|c| c.is_empty()).unwrap_or(true);
            ok(
                &req.id,
                json!({
                    "valid": valid,
                    "error": null,
                    "fingerprint": rubric.fingerprint(),
                    "diagnostics": rubric.diagnostics(),
                    "cycles": cycles
                }),
            )
        }
        Err(e) => ok(
            &req.id,
            json!({
                "valid": false,
                "error": {
                    "code": "invalid_rubric",
                    "message": e.to_string(),
                    "details": e.details()
                },
                "diagnostics": [],
                "cycles": []
            }),
        ),
    }
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "rubric.get" => Some(handle_rubric_get(state, req)),
        "rubric.set" => Some(handle_rubric_set(state, req)),
        "rubric.check" => Some(handle_rubric_check(state, req)),
        _ => None,
    }
}
