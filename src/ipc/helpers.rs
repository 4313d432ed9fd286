use rusqlite::{Connection, OptionalExtension};
use serde_json::json;

use crate::ipc::error::HandlerErr;
use crate::schedule::{parse_day_label, parse_slot_label, Weekday, WeeklySlot};

pub fn get_required_str(params: &serde_json::Value, key: &str) -> Result<String, HandlerErr> {
    params
        .get(key)
        .and_then(|v| v.as_str())
        .map(|s| s.to_string())
        .ok_or_else(|| HandlerErr::bad_params(format!("missing {}", key)))
}

pub fn get_opt_str(params: &serde_json::Value, key: &str) -> Option<String> {
    params
        .get(key)
        .and_then(|v| v.as_str())
        .map(|s| s.to_string())
}

#[derive(Debug, Clone)]
pub struct ClassRow {
    pub id: String,
    pub name: String,
    pub subject: String,
    pub teacher_id: String,
    pub max_students: i64,
    pub start_date: Option<String>,
}

pub fn load_class(conn: &Connection, class_id: &str) -> Result<Option<ClassRow>, HandlerErr> {
    conn.query_row(
        "SELECT id, name, subject, teacher_id, max_students, start_date
         FROM classes WHERE id = ?",
        [class_id],
        |r| {
            Ok(ClassRow {
                id: r.get(0)?,
                name: r.get(1)?,
                subject: r.get(2)?,
                teacher_id: r.get(3)?,
                max_students: r.get(4)?,
                start_date: r.get(5)?,
            })
        },
    )
    .optional()
    .map_err(HandlerErr::db_query)
}

pub fn user_role(conn: &Connection, user_id: &str) -> Result<Option<String>, HandlerErr> {
    conn.query_row("SELECT role FROM users WHERE id = ?", [user_id], |r| {
        r.get(0)
    })
    .optional()
    .map_err(HandlerErr::db_query)
}

fn slot_from_row(day_of_week: i64, start_min: i64, end_min: i64) -> Result<WeeklySlot, HandlerErr> {
    let day = Weekday::from_number(day_of_week).ok_or_else(|| {
        HandlerErr::new("db_query_failed", "invalid day_of_week in class_slots")
    })?;
    Ok(WeeklySlot {
        day,
        start_min: start_min as u16,
        end_min: end_min as u16,
    })
}

pub fn load_class_slots(conn: &Connection, class_id: &str) -> Result<Vec<WeeklySlot>, HandlerErr> {
    let mut stmt = conn
        .prepare(
            "SELECT day_of_week, start_min, end_min
             FROM class_slots
             WHERE class_id = ?
             ORDER BY day_of_week, start_min",
        )
        .map_err(HandlerErr::db_query)?;
    let rows = stmt
        .query_map([class_id], |r| {
            Ok((r.get::<_, i64>(0)?, r.get::<_, i64>(1)?, r.get::<_, i64>(2)?))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(HandlerErr::db_query)?;
    rows.into_iter()
        .map(|(d, s, e)| slot_from_row(d, s, e))
        .collect()
}

/// Parse the wire-level `timeSlots: [{day, slot}]` array into canonical
/// slots. All label parsing happens here, at the boundary; malformed items
/// are rejected outright instead of being dropped.
pub fn parse_slots_param(params: &serde_json::Value) -> Result<Vec<WeeklySlot>, HandlerErr> {
    let Some(raw) = params.get("timeSlots").and_then(|v| v.as_array()) else {
        return Err(HandlerErr::bad_params("missing timeSlots"));
    };
    if raw.is_empty() {
        return Err(HandlerErr::bad_params("timeSlots must not be empty"));
    }
    let mut slots = Vec::with_capacity(raw.len());
    for (idx, item) in raw.iter().enumerate() {
        let day_label = item
            .get("day")
            .and_then(|v| v.as_str())
            .ok_or_else(|| HandlerErr::bad_params(format!("timeSlots[{}] missing day", idx)))?;
        let day = parse_day_label(day_label).ok_or_else(|| {
            HandlerErr::bad_params(format!("timeSlots[{}] unknown day \"{}\"", idx, day_label))
        })?;
        let slot_label = item
            .get("slot")
            .and_then(|v| v.as_str())
            .ok_or_else(|| HandlerErr::bad_params(format!("timeSlots[{}] missing slot", idx)))?;
        let (start_min, end_min) = parse_slot_label(slot_label).ok_or_else(|| {
            HandlerErr::bad_params(format!(
                "timeSlots[{}] slot must be HH:MM-HH:MM with start before end, got \"{}\"",
                idx, slot_label
            ))
        })?;
        slots.push(WeeklySlot {
            day,
            start_min,
            end_min,
        });
    }
    Ok(slots)
}

pub fn slots_json(slots: &[WeeklySlot]) -> serde_json::Value {
    json!(slots
        .iter()
        .map(|s| {
            json!({
                "day": s.day.label(),
                "dayOfWeek": s.day.number(),
                "slot": s.time_range(),
            })
        })
        .collect::<Vec<_>>())
}

/// True when the underlying SQLite error is a unique/constraint violation,
/// used to reclassify duplicate-key failures as specific conflicts.
pub fn is_constraint_violation(e: &rusqlite::Error) -> bool {
    matches!(
        e,
        rusqlite::Error::SqliteFailure(f, _)
            if f.code == rusqlite::ErrorCode::ConstraintViolation
    )
}
