use crate::config::Config;
use crate::ipc::error::{err, ok, HandlerErr};
use crate::ipc::helpers::{get_opt_str, get_required_str, load_class};
use crate::ipc::types::{AppState, Request};
use rusqlite::{Connection, OptionalExtension};
use serde_json::json;
use uuid::Uuid;

struct GradeItem {
    student_id: String,
    score: f64,
    note: String,
}

fn normalize_items(params: &serde_json::Value) -> Result<Vec<serde_json::Value>, HandlerErr> {
    if let Some(arr) = params.get("items").and_then(|v| v.as_array()) {
        if arr.is_empty() {
            return Err(HandlerErr::bad_params("items must not be empty"));
        }
        return Ok(arr.clone());
    }
    if let Some(one) = params.get("item") {
        if one.is_object() {
            return Ok(vec![one.clone()]);
        }
    }
    Err(HandlerErr::bad_params("missing items"))
}

fn check_score(config: &Config, score: f64, what: &str) -> Result<(), HandlerErr> {
    if !score.is_finite() || score < config.grade_min || score > config.grade_max {
        return Err(HandlerErr::bad_params(format!(
            "{} must be between {} and {}",
            what, config.grade_min, config.grade_max
        )));
    }
    Ok(())
}

fn validate_items(
    conn: &Connection,
    config: &Config,
    raw: &[serde_json::Value],
) -> Result<Vec<GradeItem>, HandlerErr> {
    let mut items = Vec::with_capacity(raw.len());
    for (idx, item) in raw.iter().enumerate() {
        let student_id = item
            .get("studentId")
            .and_then(|v| v.as_str())
            .filter(|s| !s.trim().is_empty())
            .ok_or_else(|| HandlerErr::bad_params(format!("items[{}] missing studentId", idx)))?
            .to_string();
        let exists: Option<i64> = conn
            .query_row("SELECT 1 FROM users WHERE id = ?", [&student_id], |r| {
                r.get(0)
            })
            .optional()
            .map_err(HandlerErr::db_query)?;
        if exists.is_none() {
            return Err(HandlerErr::bad_params(format!(
                "items[{}] unknown studentId {}",
                idx, student_id
            )));
        }
        let score = item
            .get("score")
            .and_then(|v| v.as_f64())
            .ok_or_else(|| HandlerErr::bad_params(format!("items[{}] score must be a number", idx)))?;
        check_score(config, score, &format!("items[{}] score", idx))?;
        let note = item
            .get("note")
            .and_then(|v| v.as_str())
            .unwrap_or("")
            .to_string();
        items.push(GradeItem {
            student_id,
            score,
            note,
        });
    }
    Ok(items)
}

/// Idempotent batch upsert keyed by (class, student, type); same contract as
/// the attendance batch, with the grade category as the natural-key extra.
fn grades_record(
    conn: &Connection,
    config: &Config,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let class_id = get_required_str(params, "classId")?;
    if load_class(conn, &class_id)?.is_none() {
        return Err(HandlerErr::not_found("class not found"));
    }
    let grade_type = get_required_str(params, "type")?.trim().to_string();
    if grade_type.is_empty() {
        return Err(HandlerErr::bad_params("type must not be empty"));
    }
    let items = validate_items(conn, config, &normalize_items(params)?)?;

    let mut upserted = 0u64;
    let mut modified = 0u64;
    let mut matched = 0u64;

    let tx = conn.unchecked_transaction().map_err(HandlerErr::db_update)?;
    for it in &items {
        let existing: Option<(String, f64, String)> = tx
            .query_row(
                "SELECT id, score, note FROM grades
                 WHERE class_id = ? AND student_id = ? AND type = ?",
                (&class_id, &it.student_id, &grade_type),
                |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
            )
            .optional()
            .map_err(HandlerErr::db_query)?;
        match existing {
            None => {
                tx.execute(
                    "INSERT INTO grades(id, class_id, student_id, type, score, note)
                     VALUES(?, ?, ?, ?, ?, ?)",
                    (
                        Uuid::new_v4().to_string(),
                        &class_id,
                        &it.student_id,
                        &grade_type,
                        it.score,
                        &it.note,
                    ),
                )
                .map_err(HandlerErr::db_update)?;
                upserted += 1;
            }
            Some((id, score, note)) => {
                matched += 1;
                if score != it.score || note != it.note {
                    tx.execute(
                        "UPDATE grades SET score = ?, note = ? WHERE id = ?",
                        (it.score, &it.note, &id),
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

fn grades_list(conn: &Connection, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let class_id = get_required_str(params, "classId")?;
    let grade_type = get_opt_str(params, "type");

    let sql = "SELECT id, student_id, type, score, note FROM grades
               WHERE class_id = ?1 AND (?2 IS NULL OR type = ?2)
               ORDER BY type, student_id";
    let mut stmt = conn.prepare(sql).map_err(HandlerErr::db_query)?;
    let rows = stmt
        .query_map((&class_id, &grade_type), |r| {
            let id: String = r.get(0)?;
            let student_id: String = r.get(1)?;
            let gtype: String = r.get(2)?;
            let score: f64 = r.get(3)?;
            let note: String = r.get(4)?;
            Ok(json!({
                "id": id,
                "studentId": student_id,
                "type": gtype,
                "score": score,
                "note": note
            }))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(HandlerErr::db_query)?;
    Ok(json!({ "grades": rows }))
}

fn grades_update(
    conn: &Connection,
    config: &Config,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let id = get_required_str(params, "gradeId")?;
    let score = params.get("score").and_then(|v| v.as_f64());
    let note = get_opt_str(params, "note");
    if score.is_none() && note.is_none() {
        return Err(HandlerErr::bad_params("nothing to update"));
    }
    if let Some(s) = score {
        check_score(config, s, "score")?;
    }

    let existing: Option<(f64, String)> = conn
        .query_row("SELECT score, note FROM grades WHERE id = ?", [&id], |r| {
            Ok((r.get(0)?, r.get(1)?))
        })
        .optional()
        .map_err(HandlerErr::db_query)?;
    let Some((old_score, old_note)) = existing else {
        return Err(HandlerErr::not_found("grade record not found"));
    };

    let new_score = score.unwrap_or(old_score);
    let new_note = note.unwrap_or(old_note);
    conn.execute(
        "UPDATE grades SET score = ?, note = ? WHERE id = ?",
        (new_score, &new_note, &id),
    )
    .map_err(HandlerErr::db_update)?;

    Ok(json!({ "id": id, "score": new_score, "note": new_note }))
}

fn handle_record(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    match grades_record(conn, &state.config, &req.params) {
        Ok(result) => ok(&req.id, result),
        Err(error) => error.response(&req.id),
    }
}

fn handle_list(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    match grades_list(conn, &req.params) {
        Ok(result) => ok(&req.id, result),
        Err(error) => error.response(&req.id),
    }
}

fn handle_update(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    match grades_update(conn, &state.config, &req.params) {
        Ok(result) => ok(&req.id, result),
        Err(error) => error.response(&req.id),
    }
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "grades.record" => Some(handle_record(state, req)),
        "grades.list" => Some(handle_list(state, req)),
        "grades.update" => Some(handle_update(state, req)),
        _ => None,
    }
}
