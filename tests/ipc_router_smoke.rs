mod test_support;

use serde_json::json;
use std::io::Write;
use test_support::{request, request_err, request_ok, setup_class, spawn_sidecar, temp_dir};

#[test]
fn router_dispatch_smoke_covers_handler_families() {
    let (mut child, mut stdin, mut reader) = spawn_sidecar();

    let health = request_ok(&mut stdin, &mut reader, "1", "health", json!({}));
    assert!(health.get("version").and_then(|v| v.as_str()).is_some());
    assert!(health.get("workspacePath").map(|v| v.is_null()).unwrap_or(false));

    // Everything that touches the database needs a workspace first.
    let e = request_err(
        &mut stdin,
        &mut reader,
        "2",
        "table.get",
        json!({ "classId": "nope" }),
    );
    assert_eq!(e["code"], "no_workspace");

    let fx = setup_class(&mut stdin, &mut reader, "rubricd-router-smoke", &["Ann"]);
    let class_id = fx.class_id.as_str();

    let classes = request_ok(&mut stdin, &mut reader, "3", "classes.list", json!({}));
    let listed = classes["classes"].as_array().expect("classes");
    assert_eq!(listed.len(), 1);
    assert_eq!(listed[0]["studentCount"], 1);
    assert_eq!(listed[0]["hasRubric"], false);

    let students = request_ok(
        &mut stdin,
        &mut reader,
        "4",
        "students.list",
        json!({ "classId": class_id }),
    );
    assert_eq!(students["students"][0]["displayName"], "Ann");

    let rubric = request_ok(
        &mut stdin,
        &mut reader,
        "5",
        "rubric.get",
        json!({ "classId": class_id }),
    );
    assert_eq!(rubric["isDefault"], true);
    assert_eq!(rubric["rubric"]["groups"], json!([]));
    assert_eq!(rubric["rubric"]["settings"]["showGrandTotal"], true);

    for (id, method, params) in [
        ("6", "rubric.check", json!({ "rubric": { "groups": [] } })),
        ("7", "table.get", json!({ "classId": class_id })),
        ("8", "scores.list", json!({ "classId": class_id })),
        ("9", "setup.get", json!({})),
        (
            "10",
            "cell.resolve",
            json!({ "classId": class_id, "studentId": fx.student_ids[0],
                    "groupId": "g", "columnId": "c" }),
        ),
    ] {
        let _ = request_ok(&mut stdin, &mut reader, id, method, params);
    }

    let e = request_err(&mut stdin, &mut reader, "11", "grid.get", json!({}));
    assert_eq!(e["code"], "not_implemented");

    let e = request_err(
        &mut stdin,
        &mut reader,
        "12",
        "rubric.get",
        json!({ "classId": "missing-class" }),
    );
    assert_eq!(e["code"], "not_found");

    let e = request_err(&mut stdin, &mut reader, "13", "students.list", json!({}));
    assert_eq!(e["code"], "bad_params");

    drop(stdin);
    let _ = child.wait();
    let _ = std::fs::remove_dir_all(fx.workspace);
}

#[test]
fn unparseable_lines_get_bad_json_and_the_loop_continues() {
    let (mut child, mut stdin, mut reader) = spawn_sidecar();

    writeln!(stdin, "{{not json").expect("write garbage");
    stdin.flush().expect("flush");
    let mut line = String::new();
    std::io::BufRead::read_line(&mut reader, &mut line).expect("read");
    let value: serde_json::Value = serde_json::from_str(line.trim()).expect("json reply");
    assert_eq!(value["ok"], false);
    assert_eq!(value["error"]["code"], "bad_json");

    let health = request(&mut stdin, &mut reader, "after", "health", json!({}));
    assert_eq!(health["ok"], true);

    drop(stdin);
    let _ = child.wait();
}

#[test]
fn reselecting_a_workspace_reuses_stored_data() {
    let workspace = temp_dir("rubricd-reopen");
    let path = workspace.to_string_lossy().to_string();

    let class_id = {
        let (mut child, mut stdin, mut reader) = spawn_sidecar();
        let _ = request_ok(&mut stdin, &mut reader, "1", "workspace.select", json!({ "path": path }));
        let created = request_ok(
            &mut stdin,
            &mut reader,
            "2",
            "classes.create",
            json!({ "name": "Chemistry" }),
        );
        drop(stdin);
        let _ = child.wait();
        created["classId"].as_str().expect("classId").to_string()
    };

    assert!(workspace.join("rubricd.sqlite3").is_file());

    let (mut child, mut stdin, mut reader) = spawn_sidecar();
    let _ = request_ok(&mut stdin, &mut reader, "1", "workspace.select", json!({ "path": path }));
    let classes = request_ok(&mut stdin, &mut reader, "2", "classes.list", json!({}));
    assert_eq!(classes["classes"][0]["id"], class_id.as_str());
    assert_eq!(classes["classes"][0]["name"], "Chemistry");

    drop(stdin);
    let _ = child.wait();
    let _ = std::fs::remove_dir_all(workspace);
}
