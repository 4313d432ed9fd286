use serde_json::json;
use std::io::{BufRead, BufReader, Write};
use std::path::PathBuf;
use std::process::{Child, ChildStdin, ChildStdout, Command, Stdio};
use std::time::{SystemTime, UNIX_EPOCH};

fn temp_dir(prefix: &str) -> PathBuf {
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

fn spawn_sidecar() -> (Child, ChildStdin, BufReader<ChildStdout>) {
    let exe = env!("CARGO_BIN_EXE_classroomd");
    let mut child = Command::new(exe)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .spawn()
        .expect("spawn classroomd");
    let stdin = child.stdin.take().expect("child stdin");
    let stdout = child.stdout.take().expect("child stdout");
    (child, stdin, BufReader::new(stdout))
}

fn request(
    stdin: &mut ChildStdin,
    reader: &mut BufReader<ChildStdout>,
    id: &str,
    method: &str,
    params: serde_json::Value,
) -> serde_json::Value {
    let payload = json!({ "id": id, "method": method, "params": params });
    writeln!(stdin, "{}", payload).expect("write request");
    stdin.flush().expect("flush request");

    let mut line = String::new();
    reader.read_line(&mut line).expect("read response line");
    let value: serde_json::Value = serde_json::from_str(line.trim()).expect("parse response json");
    assert_eq!(value.get("id").and_then(|v| v.as_str()), Some(id));
    value
}

fn request_ok(
    stdin: &mut ChildStdin,
    reader: &mut BufReader<ChildStdout>,
    id: &str,
    method: &str,
    params: serde_json::Value,
) -> serde_json::Value {
    let value = request(stdin, reader, id, method, params);
    assert_eq!(
        value.get("ok").and_then(|v| v.as_bool()),
        Some(true),
        "expected ok for {}: {}",
        method,
        value
    );
    value.get("result").cloned().expect("result")
}

fn error_code(value: &serde_json::Value) -> String {
    assert_eq!(value.get("ok").and_then(|v| v.as_bool()), Some(false));
    value
        .get("error")
        .and_then(|e| e.get("code"))
        .and_then(|v| v.as_str())
        .unwrap_or("")
        .to_string()
}

#[test]
fn health_works_before_and_after_workspace_select() {
    let workspace = temp_dir("classroomd-smoke-health");
    let (mut child, mut stdin, mut reader) = spawn_sidecar();

    let health = request_ok(&mut stdin, &mut reader, "1", "health", json!({}));
    assert_eq!(
        health.get("version").and_then(|v| v.as_str()),
        Some(env!("CARGO_PKG_VERSION"))
    );
    assert!(health.get("workspacePath").map(|v| v.is_null()).unwrap_or(false));

    // Data methods are gated on a selected workspace.
    let gated = request(&mut stdin, &mut reader, "2", "classes.list", json!({}));
    assert_eq!(error_code(&gated), "no_workspace");

    request_ok(
        &mut stdin,
        &mut reader,
        "3",
        "workspace.select",
        json!({ "path": workspace.to_string_lossy() }),
    );
    let health = request_ok(&mut stdin, &mut reader, "4", "health", json!({}));
    assert!(health
        .get("workspacePath")
        .and_then(|v| v.as_str())
        .is_some());
    assert_eq!(
        health.get("cancelCutoffHours").and_then(|v| v.as_i64()),
        Some(24)
    );

    drop(stdin);
    let _ = child.wait();
    let _ = std::fs::remove_dir_all(workspace);
}

#[test]
fn unknown_method_and_malformed_line_do_not_wedge_the_loop() {
    let workspace = temp_dir("classroomd-smoke-loop");
    let (mut child, mut stdin, mut reader) = spawn_sidecar();

    let unknown = request(&mut stdin, &mut reader, "1", "planner.schedule", json!({}));
    assert_eq!(error_code(&unknown), "not_implemented");

    // A line that isn't JSON gets a bad_json reply and the loop keeps going.
    writeln!(stdin, "this is not json").expect("write garbage");
    stdin.flush().expect("flush garbage");
    let mut line = String::new();
    reader.read_line(&mut line).expect("read bad_json reply");
    let value: serde_json::Value = serde_json::from_str(line.trim()).expect("parse reply");
    assert_eq!(error_code(&value), "bad_json");

    request_ok(
        &mut stdin,
        &mut reader,
        "2",
        "workspace.select",
        json!({ "path": workspace.to_string_lossy() }),
    );

    drop(stdin);
    let _ = child.wait();
    let _ = std::fs::remove_dir_all(workspace);
}

#[test]
fn user_and_class_crud_round_out_the_surface() {
    let workspace = temp_dir("classroomd-smoke-crud");
    let (mut child, mut stdin, mut reader) = spawn_sidecar();

    request_ok(
        &mut stdin,
        &mut reader,
        "1",
        "workspace.select",
        json!({ "path": workspace.to_string_lossy() }),
    );

    let teacher = request_ok(
        &mut stdin,
        &mut reader,
        "2",
        "users.create",
        json!({ "name": "Lan", "email": "lan@school.test", "role": "teacher" }),
    );
    let teacher_id = teacher["userId"].as_str().expect("userId").to_string();

    // Duplicate email is a conflict; bad role and bad email are bad_params.
    let dup = request(
        &mut stdin,
        &mut reader,
        "3",
        "users.create",
        json!({ "name": "Other", "email": "lan@school.test", "role": "student" }),
    );
    assert_eq!(error_code(&dup), "conflict");
    let bad_role = request(
        &mut stdin,
        &mut reader,
        "4",
        "users.create",
        json!({ "name": "X", "email": "x@school.test", "role": "janitor" }),
    );
    assert_eq!(error_code(&bad_role), "bad_params");
    let bad_email = request(
        &mut stdin,
        &mut reader,
        "5",
        "users.create",
        json!({ "name": "X", "email": "nope", "role": "student" }),
    );
    assert_eq!(error_code(&bad_email), "bad_params");

    request_ok(
        &mut stdin,
        &mut reader,
        "6",
        "users.create",
        json!({ "name": "Binh", "email": "binh@school.test", "role": "student" }),
    );
    let students = request_ok(
        &mut stdin,
        &mut reader,
        "7",
        "users.list",
        json!({ "role": "student" }),
    );
    assert_eq!(
        students.get("users").and_then(|v| v.as_array()).map(|a| a.len()),
        Some(1)
    );

    let created = request_ok(
        &mut stdin,
        &mut reader,
        "8",
        "classes.create",
        json!({
            "name": "Literature",
            "subject": "Vietnamese",
            "teacherId": teacher_id,
            "maxStudents": 20,
            "timeSlots": [{ "day": "tue", "slot": "13:00-14:30" }]
        }),
    );
    let class_id = created["id"].as_str().expect("class id").to_string();
    assert_eq!(created.get("teacherName").and_then(|v| v.as_str()), Some("Lan"));
    assert_eq!(created.get("approvedCount").and_then(|v| v.as_i64()), Some(0));

    let fetched = request_ok(
        &mut stdin,
        &mut reader,
        "9",
        "classes.get",
        json!({ "classId": class_id }),
    );
    let slots = fetched
        .get("timeSlots")
        .and_then(|v| v.as_array())
        .expect("timeSlots");
    assert_eq!(slots.len(), 1);
    assert_eq!(slots[0].get("day").and_then(|v| v.as_str()), Some("Tue"));
    assert_eq!(slots[0].get("dayOfWeek").and_then(|v| v.as_i64()), Some(2));
    assert_eq!(
        slots[0].get("slot").and_then(|v| v.as_str()),
        Some("13:00-14:30")
    );

    // Another teacher may not touch this class; its owner may.
    let other = request_ok(
        &mut stdin,
        &mut reader,
        "10",
        "users.create",
        json!({ "name": "Minh", "email": "minh@school.test", "role": "teacher" }),
    );
    let other_id = other["userId"].as_str().expect("userId").to_string();
    let denied = request(
        &mut stdin,
        &mut reader,
        "11",
        "classes.delete",
        json!({ "classId": class_id, "actorId": other_id }),
    );
    assert_eq!(error_code(&denied), "forbidden");

    request_ok(
        &mut stdin,
        &mut reader,
        "12",
        "classes.delete",
        json!({ "classId": class_id, "actorId": teacher_id }),
    );
    let gone = request(
        &mut stdin,
        &mut reader,
        "13",
        "classes.get",
        json!({ "classId": class_id }),
    );
    assert_eq!(error_code(&gone), "not_found");

    drop(stdin);
    let _ = child.wait();
    let _ = std::fs::remove_dir_all(workspace);
}
