#![allow(dead_code)]

use serde_json::{json, Value};
use std::io::{BufRead, BufReader, Write};
use std::path::PathBuf;
use std::process::{Child, ChildStdin, ChildStdout, Command, Stdio};

/// Fixed clock for date-dependent rules.
pub const TODAY: &str = "2025-06-15";

pub fn temp_dir(prefix: &str) -> PathBuf {
    tempfile::Builder::new()
        .prefix(prefix)
        .tempdir()
        .expect("create temp dir")
        .keep()
}

pub fn spawn_sidecar() -> (Child, ChildStdin, BufReader<ChildStdout>) {
    let exe = env!("CARGO_BIN_EXE_escolad");
    let mut child = Command::new(exe)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .spawn()
        .expect("spawn escolad");
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
    let payload = json!({ "id": id, "method": method, "params": params });
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

pub fn error_code(response: &Value) -> Option<&str> {
    response
        .get("error")
        .and_then(|e| e.get("code"))
        .and_then(|v| v.as_str())
}

pub fn str_at<'v>(value: &'v Value, key: &str) -> &'v str {
    value
        .get(key)
        .and_then(|v| v.as_str())
        .unwrap_or_else(|| panic!("missing {} in {}", key, value))
}

/// Sidecar with a fresh workspace already selected.
pub fn open_workspace(prefix: &str) -> (Child, ChildStdin, BufReader<ChildStdout>, PathBuf) {
    let workspace = temp_dir(prefix);
    let (child, mut stdin, mut reader) = spawn_sidecar();
    request_ok(
        &mut stdin,
        &mut reader,
        "ws",
        "workspace.select",
        json!({ "path": workspace.to_string_lossy() }),
    );
    (child, stdin, reader, workspace)
}

/// A first-year class started in February 2025.
pub fn create_class(
    stdin: &mut ChildStdin,
    reader: &mut BufReader<ChildStdout>,
    name: &str,
) -> String {
    let created = request_ok(
        stdin,
        reader,
        &format!("class-{}", name),
        "classes.create",
        json!({
            "name": name,
            "series": "1º Ano",
            "course": "Desenvolvimento de Sistemas",
            "startYear": 1,
            "startYearDate": "2025-02-03",
            "today": TODAY
        }),
    );
    str_at(&created, "classId").to_string()
}

pub fn create_student(
    stdin: &mut ChildStdin,
    reader: &mut BufReader<ChildStdout>,
    class_id: &str,
    name: &str,
) -> String {
    let created = request_ok(
        stdin,
        reader,
        &format!("student-{}", name),
        "students.create",
        json!({ "classId": class_id, "name": name }),
    );
    str_at(&created, "studentId").to_string()
}
