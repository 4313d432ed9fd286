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

fn spawn_sidecar_with_env(envs: &[(&str, &str)]) -> (Child, ChildStdin, BufReader<ChildStdout>) {
    let exe = env!("CARGO_BIN_EXE_classroomd");
    let mut cmd = Command::new(exe);
    for (k, v) in envs {
        cmd.env(k, v);
    }
    let mut child = cmd
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .spawn()
        .expect("spawn classroomd");
    let stdin = child.stdin.take().expect("child stdin");
    let stdout = child.stdout.take().expect("child stdout");
    (child, stdin, BufReader::new(stdout))
}

fn spawn_sidecar() -> (Child, ChildStdin, BufReader<ChildStdout>) {
    spawn_sidecar_with_env(&[])
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

fn counts(result: &serde_json::Value) -> (u64, u64, u64) {
    (
        result.get("upserted").and_then(|v| v.as_u64()).unwrap_or(99),
        result.get("modified").and_then(|v| v.as_u64()).unwrap_or(99),
        result.get("matched").and_then(|v| v.as_u64()).unwrap_or(99),
    )
}

fn setup(
    stdin: &mut ChildStdin,
    reader: &mut BufReader<ChildStdout>,
    workspace: &std::path::Path,
) -> (String, String, String) {
    request_ok(
        stdin,
        reader,
        "s1",
        "workspace.select",
        json!({ "path": workspace.to_string_lossy() }),
    );
    let teacher = request_ok(
        stdin,
        reader,
        "s2",
        "users.create",
        json!({ "name": "T", "email": "t@school.test", "role": "teacher" }),
    )["userId"]
        .as_str()
        .expect("teacher id")
        .to_string();
    let s1 = request_ok(
        stdin,
        reader,
        "s3",
        "users.create",
        json!({ "name": "S1", "email": "s1@school.test", "role": "student" }),
    )["userId"]
        .as_str()
        .expect("student id")
        .to_string();
    let s2 = request_ok(
        stdin,
        reader,
        "s4",
        "users.create",
        json!({ "name": "S2", "email": "s2@school.test", "role": "student" }),
    )["userId"]
        .as_str()
        .expect("student id")
        .to_string();
    let class_id = request_ok(
        stdin,
        reader,
        "s5",
        "classes.create",
        json!({
            "name": "Algebra",
            "subject": "Math",
            "teacherId": teacher,
            "maxStudents": 30,
            "timeSlots": [{ "day": "mon", "slot": "09:00-10:30" }]
        }),
    )["id"]
        .as_str()
        .expect("class id")
        .to_string();
    (class_id, s1, s2)
}

#[test]
fn recording_the_same_scores_twice_changes_nothing() {
    let workspace = temp_dir("classroomd-grades-idem");
    let (mut child, mut stdin, mut reader) = spawn_sidecar();
    let (class_id, s1, s2) = setup(&mut stdin, &mut reader, &workspace);

    let first = request_ok(
        &mut stdin,
        &mut reader,
        "1",
        "grades.record",
        json!({
            "classId": class_id,
            "type": "midterm",
            "items": [
                { "studentId": s1, "score": 8.5 },
                { "studentId": s2, "score": 6.0, "note": "late submission" }
            ]
        }),
    );
    assert_eq!(counts(&first), (2, 0, 0));

    let second = request_ok(
        &mut stdin,
        &mut reader,
        "2",
        "grades.record",
        json!({
            "classId": class_id,
            "type": "midterm",
            "items": [
                { "studentId": s1, "score": 8.5 },
                { "studentId": s2, "score": 6.0, "note": "late submission" }
            ]
        }),
    );
    assert_eq!(counts(&second), (0, 0, 2));

    // Regrading one student updates in place.
    let third = request_ok(
        &mut stdin,
        &mut reader,
        "3",
        "grades.record",
        json!({
            "classId": class_id,
            "type": "midterm",
            "items": [{ "studentId": s1, "score": 9.0 }]
        }),
    );
    assert_eq!(counts(&third), (0, 1, 1));

    // The same student in a different category is a fresh row.
    let fourth = request_ok(
        &mut stdin,
        &mut reader,
        "4",
        "grades.record",
        json!({
            "classId": class_id,
            "type": "final",
            "items": [{ "studentId": s1, "score": 9.0 }]
        }),
    );
    assert_eq!(counts(&fourth), (1, 0, 0));

    let all = request_ok(
        &mut stdin,
        &mut reader,
        "5",
        "grades.list",
        json!({ "classId": class_id }),
    );
    assert_eq!(
        all.get("grades").and_then(|v| v.as_array()).map(|a| a.len()),
        Some(3)
    );
    let midterms = request_ok(
        &mut stdin,
        &mut reader,
        "6",
        "grades.list",
        json!({ "classId": class_id, "type": "midterm" }),
    );
    assert_eq!(
        midterms.get("grades").and_then(|v| v.as_array()).map(|a| a.len()),
        Some(2)
    );

    drop(stdin);
    let _ = child.wait();
    let _ = std::fs::remove_dir_all(workspace);
}

#[test]
fn out_of_range_score_rejects_the_whole_batch() {
    let workspace = temp_dir("classroomd-grades-range");
    let (mut child, mut stdin, mut reader) = spawn_sidecar();
    let (class_id, s1, s2) = setup(&mut stdin, &mut reader, &workspace);

    let resp = request(
        &mut stdin,
        &mut reader,
        "1",
        "grades.record",
        json!({
            "classId": class_id,
            "type": "quiz",
            "items": [
                { "studentId": s1, "score": 7.0 },
                { "studentId": s2, "score": 10.5 }
            ]
        }),
    );
    assert_eq!(error_code(&resp), "bad_params");

    // The in-range score in the same batch was not written.
    let listed = request_ok(
        &mut stdin,
        &mut reader,
        "2",
        "grades.list",
        json!({ "classId": class_id, "type": "quiz" }),
    );
    assert_eq!(
        listed.get("grades").and_then(|v| v.as_array()).map(|a| a.len()),
        Some(0)
    );

    let negative = request(
        &mut stdin,
        &mut reader,
        "3",
        "grades.record",
        json!({
            "classId": class_id,
            "type": "quiz",
            "items": [{ "studentId": s1, "score": -1.0 }]
        }),
    );
    assert_eq!(error_code(&negative), "bad_params");

    let empty_type = request(
        &mut stdin,
        &mut reader,
        "4",
        "grades.record",
        json!({
            "classId": class_id,
            "type": "  ",
            "items": [{ "studentId": s1, "score": 7.0 }]
        }),
    );
    assert_eq!(error_code(&empty_type), "bad_params");

    // An explicit empty batch is a malformed payload, not a no-op success.
    let empty_batch = request(
        &mut stdin,
        &mut reader,
        "5",
        "grades.record",
        json!({ "classId": class_id, "type": "quiz", "items": [] }),
    );
    assert_eq!(error_code(&empty_batch), "bad_params");

    drop(stdin);
    let _ = child.wait();
    let _ = std::fs::remove_dir_all(workspace);
}

#[test]
fn grade_bounds_come_from_the_environment() {
    let workspace = temp_dir("classroomd-grades-bounds");
    let (mut child, mut stdin, mut reader) =
        spawn_sidecar_with_env(&[("GRADE_MAX", "100")]);
    let (class_id, s1, _s2) = setup(&mut stdin, &mut reader, &workspace);

    // 10.5 is over the default ceiling but fine on a 100-point scale.
    let result = request_ok(
        &mut stdin,
        &mut reader,
        "1",
        "grades.record",
        json!({
            "classId": class_id,
            "type": "midterm",
            "items": [{ "studentId": s1, "score": 10.5 }]
        }),
    );
    assert_eq!(counts(&result), (1, 0, 0));

    drop(stdin);
    let _ = child.wait();
    let _ = std::fs::remove_dir_all(workspace);
}

#[test]
fn single_item_shape_and_patch() {
    let workspace = temp_dir("classroomd-grades-single");
    let (mut child, mut stdin, mut reader) = spawn_sidecar();
    let (class_id, s1, _s2) = setup(&mut stdin, &mut reader, &workspace);

    let recorded = request_ok(
        &mut stdin,
        &mut reader,
        "1",
        "grades.record",
        json!({
            "classId": class_id,
            "type": "final",
            "item": { "studentId": s1, "score": 4.5 }
        }),
    );
    assert_eq!(counts(&recorded), (1, 0, 0));

    let listed = request_ok(
        &mut stdin,
        &mut reader,
        "2",
        "grades.list",
        json!({ "classId": class_id, "type": "final" }),
    );
    let grade_id = listed["grades"][0]["id"].as_str().expect("grade id").to_string();

    let patched = request_ok(
        &mut stdin,
        &mut reader,
        "3",
        "grades.update",
        json!({ "gradeId": grade_id, "score": 5.0, "note": "regraded" }),
    );
    assert_eq!(patched.get("score").and_then(|v| v.as_f64()), Some(5.0));
    assert_eq!(patched.get("note").and_then(|v| v.as_str()), Some("regraded"));

    let over = request(
        &mut stdin,
        &mut reader,
        "4",
        "grades.update",
        json!({ "gradeId": grade_id, "score": 11.0 }),
    );
    assert_eq!(error_code(&over), "bad_params");

    let missing = request(
        &mut stdin,
        &mut reader,
        "5",
        "grades.update",
        json!({ "gradeId": "missing", "score": 5.0 }),
    );
    assert_eq!(error_code(&missing), "not_found");

    drop(stdin);
    let _ = child.wait();
    let _ = std::fs::remove_dir_all(workspace);
}
