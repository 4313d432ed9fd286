use crate::ipc::error::{err, ok, HandlerErr};
use crate::ipc::helpers::{
    get_opt_str, get_required_str, load_class, load_class_slots, parse_slots_param, slots_json,
    user_role,
};
use crate::ipc::types::{AppState, Request};
use crate::schedule::{conflict_report, find_conflicts, find_internal_conflicts, OwnedSlot, WeeklySlot};
use chrono::{NaiveDate, Utc};
use rusqlite::{Connection, OptionalExtension};
use serde_json::json;
use uuid::Uuid;

struct ClassInput {
    name: String,
    subject: String,
    teacher_id: String,
    max_students: i64,
    start_date: Option<String>,
    slots: Vec<WeeklySlot>,
}

fn validate_class_input(
    conn: &Connection,
    params: &serde_json::Value,
) -> Result<ClassInput, HandlerErr> {
    let name = get_required_str(params, "name")?.trim().to_string();
    if name.is_empty() {
        return Err(HandlerErr::bad_params("name must not be empty"));
    }
    let subject = get_required_str(params, "subject")?.trim().to_string();
    if subject.is_empty() {
        return Err(HandlerErr::bad_params("subject must not be empty"));
    }
    let teacher_id = get_required_str(params, "teacherId")?;
    match user_role(conn, &teacher_id)? {
        Some(role) if role == "teacher" => {}
        _ => return Err(HandlerErr::bad_params("teacherId is not a teacher")),
    }
    let max_students = params
        .get("maxStudents")
        .and_then(|v| v.as_i64())
        .filter(|n| *n >= 1)
        .ok_or_else(|| HandlerErr::bad_params("maxStudents must be a positive integer"))?;
    let start_date = match get_opt_str(params, "startDate") {
        Some(raw) => {
            let parsed = NaiveDate::parse_from_str(raw.trim(), "%Y-%m-%d")
                .map_err(|_| HandlerErr::bad_params("startDate must be YYYY-MM-DD"))?;
            Some(parsed.format("%Y-%m-%d").to_string())
        }
        None => None,
    };
    let slots = parse_slots_param(params)?;
    Ok(ClassInput {
        name,
        subject,
        teacher_id,
        max_students,
        start_date,
        slots,
    })
}

/// Ownership check for mutating an existing class. The shim may have already
/// authorized the caller, so `actorId` is optional; when present, admins may
/// touch anything and teachers only their own classes.
fn ensure_can_modify(
    conn: &Connection,
    params: &serde_json::Value,
    owner_teacher_id: &str,
) -> Result<(), HandlerErr> {
    let Some(actor_id) = get_opt_str(params, "actorId") else {
        return Ok(());
    };
    match user_role(conn, &actor_id)? {
        None => Err(HandlerErr::new("unauthorized", "unknown caller identity")),
        Some(role) if role == "admin" => Ok(()),
        Some(role) if role == "teacher" && actor_id == owner_teacher_id => Ok(()),
        Some(_) => Err(HandlerErr::new(
            "forbidden",
            "caller may not modify this class",
        )),
    }
}

fn load_teacher_slots(
    conn: &Connection,
    teacher_id: &str,
    ignore_class_id: Option<&str>,
) -> Result<Vec<OwnedSlot>, HandlerErr> {
    let sql = "SELECT c.id, c.name, s.day_of_week, s.start_min, s.end_min
               FROM classes c
               JOIN class_slots s ON s.class_id = c.id
               WHERE c.teacher_id = ?1 AND (?2 IS NULL OR c.id <> ?2)";
    let mut stmt = conn.prepare(sql).map_err(HandlerErr::db_query)?;
    let rows = stmt
        .query_map((teacher_id, ignore_class_id), |r| {
            Ok((
                r.get::<_, String>(0)?,
                r.get::<_, String>(1)?,
                r.get::<_, i64>(2)?,
                r.get::<_, i64>(3)?,
                r.get::<_, i64>(4)?,
            ))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(HandlerErr::db_query)?;

    let mut owned = Vec::with_capacity(rows.len());
    for (class_id, class_name, day, start, end) in rows {
        let day = crate::schedule::Weekday::from_number(day).ok_or_else(|| {
            HandlerErr::new("db_query_failed", "invalid day_of_week in class_slots")
        })?;
        owned.push(OwnedSlot {
            slot: WeeklySlot {
                day,
                start_min: start as u16,
                end_min: end as u16,
            },
            class_id,
            class_name,
        });
    }
    Ok(owned)
}

/// Reject when the candidate slots collide with each other or with any other
/// class of the same teacher. Every collision is reported, one line each,
/// never just the first.
fn ensure_no_teacher_conflict(
    conn: &Connection,
    teacher_id: &str,
    slots: &[WeeklySlot],
    ignore_class_id: Option<&str>,
) -> Result<(), HandlerErr> {
    let mut lines = Vec::new();
    for (a, b) in find_internal_conflicts(slots) {
        lines.push(format!(
            "• {} {} overlaps another requested slot ({})",
            a.day.label(),
            a.time_range(),
            b.time_range(),
        ));
    }

    let existing = load_teacher_slots(conn, teacher_id, ignore_class_id)?;
    let conflicts = find_conflicts(slots, &existing);
    let count = lines.len() + conflicts.len();
    if !conflicts.is_empty() {
        lines.push(conflict_report(&conflicts));
    }

    if count == 0 {
        return Ok(());
    }
    Err(HandlerErr::with_details(
        "teacher_schedule_conflict",
        format!(
            "teacher already has overlapping classes:\n{}",
            lines.join("\n")
        ),
        json!({ "conflictCount": count }),
    ))
}

fn class_json(conn: &Connection, class_id: &str) -> Result<serde_json::Value, HandlerErr> {
    let Some(cls) = load_class(conn, class_id)? else {
        return Err(HandlerErr::not_found("class not found"));
    };
    let slots = load_class_slots(conn, class_id)?;
    let teacher_name: Option<String> = conn
        .query_row("SELECT name FROM users WHERE id = ?", [&cls.teacher_id], |r| {
            r.get(0)
        })
        .optional()
        .map_err(HandlerErr::db_query)?;
    let approved: i64 = conn
        .query_row(
            "SELECT COUNT(*) FROM enrollments WHERE class_id = ? AND status = 'approved'",
            [class_id],
            |r| r.get(0),
        )
        .map_err(HandlerErr::db_query)?;
    Ok(json!({
        "id": cls.id,
        "name": cls.name,
        "subject": cls.subject,
        "teacherId": cls.teacher_id,
        "teacherName": teacher_name,
        "maxStudents": cls.max_students,
        "startDate": cls.start_date,
        "approvedCount": approved,
        "timeSlots": slots_json(&slots),
    }))
}

fn classes_create(conn: &Connection, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let input = validate_class_input(conn, params)?;
    ensure_no_teacher_conflict(conn, &input.teacher_id, &input.slots, None)?;

    let class_id = Uuid::new_v4().to_string();
    let created_at = Utc::now().to_rfc3339();
    let tx = conn.unchecked_transaction().map_err(HandlerErr::db_update)?;
    tx.execute(
        "INSERT INTO classes(id, name, subject, teacher_id, max_students, start_date, created_at)
         VALUES(?, ?, ?, ?, ?, ?, ?)",
        (
            &class_id,
            &input.name,
            &input.subject,
            &input.teacher_id,
            input.max_students,
            &input.start_date,
            &created_at,
        ),
    )
    .map_err(HandlerErr::db_update)?;
    for s in &input.slots {
        tx.execute(
            "INSERT INTO class_slots(class_id, day_of_week, start_min, end_min)
             VALUES(?, ?, ?, ?)",
            (&class_id, s.day.number(), s.start_min, s.end_min),
        )
        .map_err(HandlerErr::db_update)?;
    }
    tx.commit().map_err(HandlerErr::db_update)?;

    class_json(conn, &class_id)
}

fn classes_update(conn: &Connection, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let class_id = get_required_str(params, "classId")?;
    let Some(existing) = load_class(conn, &class_id)? else {
        return Err(HandlerErr::not_found("class not found"));
    };
    ensure_can_modify(conn, params, &existing.teacher_id)?;
    let input = validate_class_input(conn, params)?;
    ensure_no_teacher_conflict(conn, &input.teacher_id, &input.slots, Some(&class_id))?;

    let tx = conn.unchecked_transaction().map_err(HandlerErr::db_update)?;
    tx.execute(
        "UPDATE classes
         SET name = ?, subject = ?, teacher_id = ?, max_students = ?, start_date = ?
         WHERE id = ?",
        (
            &input.name,
            &input.subject,
            &input.teacher_id,
            input.max_students,
            &input.start_date,
            &class_id,
        ),
    )
    .map_err(HandlerErr::db_update)?;
    // Slots are embedded: rewrite them wholesale with the class.
    tx.execute("DELETE FROM class_slots WHERE class_id = ?", [&class_id])
        .map_err(HandlerErr::db_update)?;
    for s in &input.slots {
        tx.execute(
            "INSERT INTO class_slots(class_id, day_of_week, start_min, end_min)
             VALUES(?, ?, ?, ?)",
            (&class_id, s.day.number(), s.start_min, s.end_min),
        )
        .map_err(HandlerErr::db_update)?;
    }
    tx.commit().map_err(HandlerErr::db_update)?;

    class_json(conn, &class_id)
}

fn classes_get(conn: &Connection, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let class_id = get_required_str(params, "classId")?;
    class_json(conn, &class_id)
}

fn classes_list(conn: &Connection, _params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let mut stmt = conn
        .prepare(
            "SELECT
               c.id,
               c.name,
               c.subject,
               c.teacher_id,
               u.name,
               c.max_students,
               (SELECT COUNT(*) FROM enrollments e
                WHERE e.class_id = c.id AND e.status = 'approved') AS approved_count
             FROM classes c
             LEFT JOIN users u ON u.id = c.teacher_id
             ORDER BY c.name",
        )
        .map_err(HandlerErr::db_query)?;
    let classes = stmt
        .query_map([], |r| {
            let id: String = r.get(0)?;
            let name: String = r.get(1)?;
            let subject: String = r.get(2)?;
            let teacher_id: String = r.get(3)?;
            let teacher_name: Option<String> = r.get(4)?;
            let max_students: i64 = r.get(5)?;
            let approved: i64 = r.get(6)?;
            Ok(json!({
                "id": id,
                "name": name,
                "subject": subject,
                "teacherId": teacher_id,
                "teacherName": teacher_name,
                "maxStudents": max_students,
                "approvedCount": approved
            }))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(HandlerErr::db_query)?;
    Ok(json!({ "classes": classes }))
}

fn classes_delete(conn: &Connection, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let class_id = get_required_str(params, "classId")?;
    let Some(existing) = load_class(conn, &class_id)? else {
        return Err(HandlerErr::not_found("class not found"));
    };
    ensure_can_modify(conn, params, &existing.teacher_id)?;

    // Deleting a class takes its dependents with it, in dependency order and
    // in one transaction, so no orphaned enrollment/attendance/grade rows
    // are left behind.
    let tx = conn.unchecked_transaction().map_err(HandlerErr::db_update)?;
    for (table, sql) in [
        ("attendance", "DELETE FROM attendance WHERE class_id = ?"),
        ("grades", "DELETE FROM grades WHERE class_id = ?"),
        ("enrollments", "DELETE FROM enrollments WHERE class_id = ?"),
        ("class_slots", "DELETE FROM class_slots WHERE class_id = ?"),
        ("classes", "DELETE FROM classes WHERE id = ?"),
    ] {
        tx.execute(sql, [&class_id]).map_err(|e| {
            HandlerErr::with_details("db_delete_failed", e.to_string(), json!({ "table": table }))
        })?;
    }
    tx.commit()
        .map_err(|e| HandlerErr::new("db_commit_failed", e.to_string()))?;

    Ok(json!({ "ok": true }))
}

fn with_db(
    state: &mut AppState,
    req: &Request,
    f: impl FnOnce(&Connection, &serde_json::Value) -> Result<serde_json::Value, HandlerErr>,
) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    match f(conn, &req.params) {
        Ok(result) => ok(&req.id, result),
        Err(error) => error.response(&req.id),
    }
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "classes.create" => Some(with_db(state, req, classes_create)),
        "classes.update" => Some(with_db(state, req, classes_update)),
        "classes.get" => Some(with_db(state, req, classes_get)),
        "classes.list" => Some(with_db(state, req, classes_list)),
        "classes.delete" => Some(with_db(state, req, classes_delete)),
        _ => None,
    }
}
