#![allow(dead_code)]

use serde_json::{json, Value};
use std::io::{BufRead, BufReader, Write};
use std::path::PathBuf;
use std::process::{Child, ChildStdin, ChildStdout, Command, Stdio};
use std::time::{SystemTime, UNIX_EPOCH};

pub fn temp_dir(prefix: &str) -> PathBuf {
    let p = std::env::temp_dir().join(format!(
        "{}-{}",
        prefix,
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .expect("clock")
            .as_nanos()
    ));
    std::fs::create_dir_all(&p).expect("create temp dir");
    p
}

pub fn spawn_sidecar() -> (Child, ChildStdin, BufReader<ChildStdout>) {
    let exe = env!("CARGO_BIN_EXE_rubricd");
    let mut child = Command::new(exe)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .spawn()
        .expect("spawn rubricd");
    let stdin = child.stdin.take().expect("child stdin");
    let stdout = child.stdout.take().expect("child stdout");
    (child, stdin, BufReader::new(stdout))
}

pub fn request(
    stdin: &mut ChildStdin,
    reader: &mut BufReader<ChildStdout>,
    id: &str,
    method: &str,
    params: Value,
) -> Value {
    let payload = json!({
        "id": id,
        "method": method,
        "params": params,
    });
    writeln!(stdin, "{}", payload).expect("write request");
    stdin.flush().expect("flush request");

    let mut line = String::new();
    reader.read_line(&mut line).expect("read response line");
    assert!(!line.trim().is_empty(), "empty response for {}", method);
    let value: Value = serde_json::from_str(line.trim()).expect("parse response json");
    assert_eq!(value.get("id").and_then(|v| v.as_str()), Some(id));
    value
}

pub fn request_ok(
    stdin: &mut ChildStdin,
    reader: &mut BufReader<ChildStdout>,
    id: &str,
    method: &str,
    params: Value,
) -> Value {
    let value = request(stdin, reader, id, method, params);
    assert_eq!(
        value.get("ok").and_then(|v| v.as_bool()),
        Some(true),
        "{} failed: {}",
        method,
        value
    );
    value.get("result").cloned().unwrap_or(Value::Null)
}

/// Returns the error code of a failed request.
pub fn request_err(
    stdin: &mut ChildStdin,
    reader: &mut BufReader<ChildStdout>,
    id: &str,
    method: &str,
    params: Value,
) -> Value {
    let value = request(stdin, reader, id, method, params);
    assert_eq!(
        value.get("ok").and_then(|v| v.as_bool()),
        Some(false),
        "{} unexpectedly succeeded: {}",
        method,
        value
    );
    value.get("error").cloned().unwrap_or(Value::Null)
}

/// The Homework / Exams rubric: Homework has no total column, Exams totals
/// `exam1`, and Summary holds a grand total over both.
pub fn homework_exams_rubric() -> Value {
    json!({
        "groups": [
            {
                "id": "Homework",
                "nameDisplay": "Homework",
                "color": "#3366ff",
                "columns": [
                    { "id": "hw1", "nameDisplay": "HW 1", "maxScore": 10, "type": "score",
                      "useGroupColor": true }
                ]
            },
            {
                "id": "Exams",
                "nameDisplay": "Exams",
                "columns": [
                    { "id": "exam1", "nameDisplay": "Exam 1", "maxScore": 20, "type": "score" },
                    { "id": "examTotal", "nameDisplay": "Total", "maxScore": 20, "type": "Total",
                      "sourceColumnIds": ["exam1"] }
                ]
            },
            {
                "id": "Summary",
                "nameDisplay": "Summary",
                "columns": [
                    { "id": "grand", "nameDisplay": "Grand Total", "maxScore": 30,
                      "type": "GrandTotal", "sourceGroupIds": ["Homework", "Exams:exam1"] }
                ]
            }
        ]
    })
}

pub struct Fixture {
    pub workspace: PathBuf,
    pub class_id: String,
    pub student_ids: Vec<String>,
}

/// Selects a fresh workspace and creates one class with the given students.
pub fn setup_class(
    stdin: &mut ChildStdin,
    reader: &mut BufReader<ChildStdout>,
    prefix: &str,
    students: &[&str],
) -> Fixture {
    let workspace = temp_dir(prefix);
    let _ = request_ok(
        stdin,
        reader,
        "ws",
        "workspace.select",
        json!({ "path": workspace.to_string_lossy() }),
    );
    let class = request_ok(stdin, reader, "cls", "classes.create", json!({ "name": "Period 1" }));
    let class_id = class
        .get("classId")
        .and_then(|v| v.as_str())
        .expect("classId")
        .to_string();

    let mut student_ids = Vec::new();
    for (i, name) in students.iter().enumerate() {
        let created = request_ok(
            stdin,
            reader,
            &format!("stu{}", i),
            "students.create",
            json!({ "classId": class_id, "displayName": name }),
        );
        student_ids.push(
            created
                .get("studentId")
                .and_then(|v| v.as_str())
                .expect("studentId")
                .to_string(),
        );
    }

    Fixture {
        workspace,
        class_id,
        student_ids,
    }
}
