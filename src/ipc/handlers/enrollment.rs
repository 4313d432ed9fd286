use crate::config::Config;
use crate::ipc::error::{err, ok, HandlerErr};
use crate::ipc::helpers::{
    get_opt_str, get_required_str, is_constraint_violation, load_class, load_class_slots,
    slots_json, user_role,
};
use crate::ipc::types::{AppState, Request};
use crate::schedule::{conflict_report, find_conflicts, first_session_after, OwnedSlot, Weekday, WeeklySlot};
use chrono::{DateTime, Duration, NaiveDate, NaiveDateTime, Utc};
use rusqlite::{Connection, OptionalExtension};
use serde_json::json;
use uuid::Uuid;

/// Every slot of every class the student currently holds an approved seat
/// in, tagged with the class it came from for the conflict report.
fn load_student_slots(conn: &Connection, student_id: &str) -> Result<Vec<OwnedSlot>, HandlerErr> {
    let mut stmt = conn
        .prepare(
            "SELECT c.id, c.name, s.day_of_week, s.start_min, s.end_min
             FROM enrollments e
             JOIN classes c ON c.id = e.class_id
             JOIN class_slots s ON s.class_id = c.id
             WHERE e.student_id = ? AND e.status = 'approved'",
        )
        .map_err(HandlerErr::db_query)?;
    let rows = stmt
        .query_map([student_id], |r| {
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
        let day = Weekday::from_number(day).ok_or_else(|| {
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

fn approved_count(conn: &Connection, class_id: &str) -> Result<i64, HandlerErr> {
    conn.query_row(
        "SELECT COUNT(*) FROM enrollments WHERE class_id = ? AND status = 'approved'",
        [class_id],
        |r| r.get(0),
    )
    .map_err(HandlerErr::db_query)
}

fn enroll(conn: &Connection, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let class_id = get_required_str(params, "classId")?;
    let Some(student_id) = get_opt_str(params, "studentId") else {
        return Err(HandlerErr::new("unauthorized", "missing caller identity"));
    };

    let Some(cls) = load_class(conn, &class_id)? else {
        return Err(HandlerErr::not_found("class not found"));
    };
    match user_role(conn, &student_id)? {
        Some(role) if role == "student" => {}
        _ => return Err(HandlerErr::bad_params("studentId is not a student")),
    }

    // A repeat attempt must surface as a duplicate, not as whatever the
    // capacity or conflict checks would say about the student's own seat.
    let already: Option<i64> = conn
        .query_row(
            "SELECT 1 FROM enrollments WHERE student_id = ? AND class_id = ?",
            (&student_id, &class_id),
            |r| r.get(0),
        )
        .optional()
        .map_err(HandlerErr::db_query)?;
    if already.is_some() {
        return Err(HandlerErr::new(
            "already_enrolled",
            "student is already enrolled in this class",
        ));
    }

    // Friendly pre-check; the guarded insert below is the decision that
    // actually holds under concurrency.
    if approved_count(conn, &class_id)? >= cls.max_students {
        return Err(HandlerErr::new("class_full", "class is full"));
    }

    let candidate = load_class_slots(conn, &class_id)?;
    let existing = load_student_slots(conn, &student_id)?;
    let conflicts = find_conflicts(&candidate, &existing);
    if !conflicts.is_empty() {
        return Err(HandlerErr::with_details(
            "schedule_conflict",
            format!(
                "enrollment conflicts with the student's schedule:\n{}",
                conflict_report(&conflicts)
            ),
            json!({ "conflictCount": conflicts.len() }),
        ));
    }

    // Capacity check and insert in one statement: zero rows written means
    // the class filled up between the pre-check and here. The unique
    // (student_id, class_id) index is the last line of defence against a
    // duplicate enrollment racing past the checks.
    let enrollment_id = Uuid::new_v4().to_string();
    let created_at = Utc::now().to_rfc3339();
    let inserted = conn
        .execute(
            "INSERT INTO enrollments(id, student_id, class_id, status, created_at)
             SELECT ?1, ?2, ?3, 'approved', ?4
             WHERE (SELECT COUNT(*) FROM enrollments
                    WHERE class_id = ?3 AND status = 'approved') < ?5",
            (
                &enrollment_id,
                &student_id,
                &class_id,
                &created_at,
                cls.max_students,
            ),
        )
        .map_err(|e| {
            if is_constraint_violation(&e) {
                HandlerErr::new("already_enrolled", "student is already enrolled in this class")
            } else {
                HandlerErr::db_update(e)
            }
        })?;
    if inserted == 0 {
        return Err(HandlerErr::new("class_full", "class is full"));
    }

    Ok(json!({ "message": "enrolled", "enrollmentId": enrollment_id }))
}

fn parse_now(params: &serde_json::Value) -> Result<NaiveDateTime, HandlerErr> {
    let Some(raw) = get_opt_str(params, "now") else {
        return Ok(Utc::now().naive_utc());
    };
    if let Ok(dt) = DateTime::parse_from_rfc3339(raw.trim()) {
        return Ok(dt.naive_utc());
    }
    NaiveDateTime::parse_from_str(raw.trim(), "%Y-%m-%dT%H:%M:%S")
        .map_err(|_| HandlerErr::bad_params("now must be an ISO datetime"))
}

fn cancel(
    conn: &Connection,
    config: &Config,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let class_id = get_required_str(params, "classId")?;
    let Some(student_id) = get_opt_str(params, "studentId") else {
        return Err(HandlerErr::new("unauthorized", "missing caller identity"));
    };
    let is_admin = params
        .get("isAdmin")
        .and_then(|v| v.as_bool())
        .unwrap_or(false);
    let now = parse_now(params)?;

    let enrollment_id: Option<String> = conn
        .query_row(
            "SELECT id FROM enrollments WHERE student_id = ? AND class_id = ?",
            (&student_id, &class_id),
            |r| r.get(0),
        )
        .optional()
        .map_err(HandlerErr::db_query)?;
    let Some(enrollment_id) = enrollment_id else {
        return Err(HandlerErr::not_found("no enrollment for this student and class"));
    };

    let Some(cls) = load_class(conn, &class_id)? else {
        return Err(HandlerErr::not_found("class not found"));
    };
    let slots = load_class_slots(conn, &class_id)?;

    // The projection runs from the stored start-of-term anchor when the
    // class has one, else from now. A class with no slots has no first
    // session, so the cutoff check is skipped and cancellation goes through.
    let reference = match cls.start_date.as_deref() {
        Some(raw) => NaiveDate::parse_from_str(raw, "%Y-%m-%d")
            .map_err(|_| HandlerErr::new("db_query_failed", "invalid start_date on class"))?
            .and_hms_opt(0, 0, 0)
            .unwrap_or(now),
        None => now,
    };
    if !is_admin {
        if let Some(first_session) = first_session_after(&slots, reference) {
            let deadline = first_session - Duration::hours(config.cancel_cutoff_hours);
            if now > deadline {
                return Err(HandlerErr::with_details(
                    "too_late_to_cancel",
                    format!(
                        "cancellation must be at least {} hours before the first session",
                        config.cancel_cutoff_hours
                    ),
                    json!({ "firstSession": first_session.format("%Y-%m-%dT%H:%M:%S").to_string() }),
                ));
            }
        }
    }

    conn.execute("DELETE FROM enrollments WHERE id = ?", [&enrollment_id])
        .map_err(HandlerErr::db_update)?;

    Ok(json!({ "message": "enrollment cancelled" }))
}

fn student_schedule(
    conn: &Connection,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let student_id = get_required_str(params, "studentId")?;
    let mut stmt = conn
        .prepare(
            "SELECT c.id, c.name, c.subject, c.teacher_id, u.name
             FROM enrollments e
             JOIN classes c ON c.id = e.class_id
             LEFT JOIN users u ON u.id = c.teacher_id
             WHERE e.student_id = ? AND e.status = 'approved'
             ORDER BY c.name",
        )
        .map_err(HandlerErr::db_query)?;
    let rows = stmt
        .query_map([&student_id], |r| {
            Ok((
                r.get::<_, String>(0)?,
                r.get::<_, String>(1)?,
                r.get::<_, String>(2)?,
                r.get::<_, String>(3)?,
                r.get::<_, Option<String>>(4)?,
            ))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(HandlerErr::db_query)?;

    let mut items = Vec::with_capacity(rows.len());
    for (class_id, name, subject, teacher_id, teacher_name) in rows {
        let slots = load_class_slots(conn, &class_id)?;
        items.push(json!({
            "classId": class_id,
            "className": name,
            "subject": subject,
            "teacherId": teacher_id,
            "teacherName": teacher_name,
            "timeSlots": slots_json(&slots),
        }));
    }
    Ok(json!({ "items": items }))
}

fn roster(conn: &Connection, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let class_id = get_required_str(params, "classId")?;
    if load_class(conn, &class_id)?.is_none() {
        return Err(HandlerErr::not_found("class not found"));
    }
    let mut stmt = conn
        .prepare(
            "SELECT u.id, u.name, u.email, e.status
             FROM enrollments e
             JOIN users u ON u.id = e.student_id
             WHERE e.class_id = ?
             ORDER BY u.name",
        )
        .map_err(HandlerErr::db_query)?;
    let students = stmt
        .query_map([&class_id], |r| {
            let id: String = r.get(0)?;
            let name: String = r.get(1)?;
            let email: String = r.get(2)?;
            let status: String = r.get(3)?;
            Ok(json!({ "id": id, "name": name, "email": email, "status": status }))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(HandlerErr::db_query)?;
    Ok(json!({ "students": students }))
}

fn handle_enroll(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    match enroll(conn, &req.params) {
        Ok(result) => ok(&req.id, result),
        Err(error) => error.response(&req.id),
    }
}

fn handle_cancel(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    match cancel(conn, &state.config, &req.params) {
        Ok(result) => ok(&req.id, result),
        Err(error) => error.response(&req.id),
    }
}

fn handle_student_schedule(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    match student_schedule(conn, &req.params) {
        Ok(result) => ok(&req.id, result),
        Err(error) => error.response(&req.id),
    }
}

fn handle_roster(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    match roster(conn, &req.params) {
        Ok(result) => ok(&req.id, result),
        Err(error) => error.response(&req.id),
    }
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "enrollments.enroll" => Some(handle_enroll(state, req)),
        "enrollments.cancel" => Some(handle_cancel(state, req)),
        "enrollments.studentSchedule" => Some(handle_student_schedule(state, req)),
        "enrollments.roster" => Some(handle_roster(state, req)),
        _ => None,
    }
}
