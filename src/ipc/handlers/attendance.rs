use crate::ipc::error::{err, ok, HandlerErr};
use crate::ipc::helpers::{get_opt_str, get_required_str, load_class};
use crate::ipc::types::{AppState, Request};
use chrono::{DateTime, NaiveDate, Utc};
use rusqlite::{Connection, OptionalExtension};
use serde_json::json;
use uuid::Uuid;

const STATUSES: &[&str] = &["present", "absent", "late"];

struct MarkRecord {
    student_id: String,
    status: String,
    note: String,
}

/// Accept a full ISO datetime or a bare date and normalize either to the
/// calendar day (midnight UTC). The day string is the stored form and part
/// of the upsert's natural key.
fn normalize_date(raw: &str) -> Result<String, HandlerErr> {
    let t = raw.trim();
    if let Ok(d) = NaiveDate::parse_from_str(t, "%Y-%m-%d") {
        return Ok(d.format("%Y-%m-%d").to_string());
    }
    if let Ok(dt) = DateTime::parse_from_rfc3339(t) {
        return Ok(dt.with_timezone(&Utc).date_naive().format("%Y-%m-%d").to_string());
    }
    Err(HandlerErr::bad_params(
        "date must be YYYY-MM-DD or an ISO datetime",
    ))
}

/// The wire shape may be a batch (`records`) or a single record (`record`);
/// a single record becomes a one-element batch here so everything past this
/// point has exactly one code path.
fn normalize_records(params: &serde_json::Value) -> Result<Vec<serde_json::Value>, HandlerErr> {
    if let Some(arr) = params.get("records").and_then(|v| v.as_array()) {
        if arr.is_empty() {
            return Err(HandlerErr::bad_params("records must not be empty"));
        }
        return Ok(arr.clone());
    }
    if let Some(one) = params.get("record") {
        if one.is_object() {
            return Ok(vec![one.clone()]);
        }
    }
    Err(HandlerErr::bad_params("missing records"))
}

fn validate_records(
    conn: &Connection,
    raw: &[serde_json::Value],
) -> Result<Vec<MarkRecord>, HandlerErr> {
    let mut records = Vec::with_capacity(raw.len());
    for (idx, item) in raw.iter().enumerate() {
        let student_id = item
            .get("studentId")
            .and_then(|v| v.as_str())
            .filter(|s| !s.trim().is_empty())
            .ok_or_else(|| {
                HandlerErr::bad_params(format!("records[{}] missing studentId", idx))
            })?
            .to_string();
        let exists: Option<i64> = conn
            .query_row("SELECT 1 FROM users WHERE id = ?", [&student_id], |r| {
                r.get(0)
            })
            .optional()
            .map_err(HandlerErr::db_query)?;
        if exists.is_none() {
            return Err(HandlerErr::bad_params(format!(
                "records[{}] unknown studentId {}",
                idx, student_id
            )));
        }
        let status = item
            .get("status")
            .and_then(|v| v.as_str())
            .ok_or_else(|| HandlerErr::bad_params(format!("records[{}] missing status", idx)))?;
        if !STATUSES.contains(&status) {
            return Err(HandlerErr::bad_params(format!(
                "records[{}] status must be present, absent or late",
                idx
            )));
        }
        let note = item
            .get("note")
            .and_then(|v| v.as_str())
            .unwrap_or("")
            .to_string();
        records.push(MarkRecord {
            student_id,
            status: status.to_string(),
            note,
        });
    }
    Ok(records)
}

/// Idempotent batch upsert keyed by (class, student, day). The whole batch
/// is validated before any write; the writes then run in one transaction.
/// Re-submitting an identical batch reports upserted=0 and modified=0.
fn attendance_mark(
    conn: &Connection,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let class_id = get_required_str(params, "classId")?;
    if load_class(conn, &class_id)?.is_none() {
        return Err(HandlerErr::not_found("class not found"));
    }
    let date = normalize_date(&get_required_str(params, "date")?)?;
    let records = validate_records(conn, &normalize_records(params)?)?;

    let mut upserted = 0u64;
    let mut modified = 0u64;
    let mut matched = 0u64;

    let tx = conn.unchecked_transaction().map_err(HandlerErr::db_update)?;
    for r in &records {
        let existing: Option<(String, String, String)> = tx
            .query_row(
                "SELECT id, status, note FROM attendance
                 WHERE class_id = ? AND student_id = ? AND date = ?",
                (&class_id, &r.student_id, &date),
                |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
            )
            .optional()
            .map_err(HandlerErr::db_query)?;
        match existing {
            None => {
                tx.execute(
                    "INSERT INTO attendance(id, class_id, student_id, date, status, note)
                     VALUES(?, ?, ?, ?, ?, ?)",
                    (
                        Uuid::new_v4().to_string(),
                        &class_id,
                        &r.student_id,
                        &date,
                        &r.status,
                        &r.note,
                    ),
                )
                .map_err(HandlerErr::db_update)?;
                upserted += 1;
            }
            Some((id, status, note)) => {
                matched += 1;
                if status != r.status || note != r.note {
                    tx.execute(
                        "UPDATE attendance SET status = ?, note = ? WHERE id = ?",
                        (&r.status, &r.note, &id),
                    )
                    .map_err(HandlerErr::db_update)?;
                    modified += 1;
                }
            }
        }
    }
    tx.commit()
        .map_err(|e| HandlerErr::new("db_commit_failed", e.to_string()))?;

    Ok(json!({ "upserted": upserted, "modified": modified, "matched": matched }))
}

fn attendance_get_by_date(
    conn: &Connection,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let class_id = get_required_str(params, "classId")?;
    let date = normalize_date(&get_required_str(params, "date")?)?;
    let mut stmt = conn
        .prepare(
            "SELECT id, student_id, status, note FROM attendance
             WHERE class_id = ? AND date = ?
             ORDER BY student_id",
        )
        .map_err(HandlerErr::db_query)?;
    let rows = stmt
        .query_map((&class_id, &date), |r| {
            let id: String = r.get(0)?;
            let student_id: String = r.get(1)?;
            let status: String = r.get(2)?;
            let note: String = r.get(3)?;
            Ok(json!({ "id": id, "studentId": student_id, "status": status, "note": note }))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(HandlerErr::db_query)?;
    Ok(json!({ "date": date, "records": rows }))
}

fn attendance_update(
    conn: &Connection,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let id = get_required_str(params, "attendanceId")?;
    let status = get_opt_str(params, "status");
    let note = get_opt_str(params, "note");
    if status.is_none() && note.is_none() {
        return Err(HandlerErr::bad_params("nothing to update"));
    }
    if let Some(ref s) = status {
        if !STATUSES.contains(&s.as_str()) {
            return Err(HandlerErr::bad_params(
                "status must be present, absent or late",
            ));
        }
    }

    let existing: Option<(String, String)> = conn
        .query_row(
            "SELECT status, note FROM attendance WHERE id = ?",
            [&id],
            |r| Ok((r.get(0)?, r.get(1)?)),
        )
        .optional()
        .map_err(HandlerErr::db_query)?;
    let Some((old_status, old_note)) = existing else {
        return Err(HandlerErr::not_found("attendance record not found"));
    };

    let new_status = status.unwrap_or(old_status);
    let new_note = note.unwrap_or(old_note);
    conn.execute(
        "UPDATE attendance SET status = ?, note = ? WHERE id = ?",
        (&new_status, &new_note, &id),
    )
    .map_err(HandlerErr::db_update)?;

    Ok(json!({ "id": id, "status": new_status, "note": new_note }))
}

fn handle_mark(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    match attendance_mark(conn, &req.params) {
        Ok(result) => ok(&req.id, result),
        Err(error) => error.response(&req.id),
    }
}

fn handle_get_by_date(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    match attendance_get_by_date(conn, &req.params) {
        Ok(result) => ok(&req.id, result),
        Err(error) => error.response(&req.id),
    }
}

fn handle_update(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    match attendance_update(conn, &req.params) {
        Ok(result) => ok(&req.id, result),
        Err(error) => error.response(&req.id),
    }
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "attendance.mark" => Some(handle_mark(state, req)),
        "attendance.getByDate" => Some(handle_get_by_date(state, req)),
        "attendance.update" => Some(handle_update(state, req)),
        _ => None,
    }
}
