use crate::ipc::error::{err, ok, HandlerErr};
use crate::ipc::helpers::{get_opt_str, get_required_str, is_constraint_violation};
use crate::ipc::types::{AppState, Request};
use rusqlite::Connection;
use serde_json::json;
use uuid::Uuid;

// Authentication, passwords and sessions live in a separate service; the
// daemon only keeps the identities it needs for role checks and for the weak
// references held by enrollments, attendance and grades.

const ROLES: &[&str] = &["admin", "teacher", "student"];

fn users_create(conn: &Connection, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let name = get_required_str(params, "name")?;
    if name.trim().is_empty() {
        return Err(HandlerErr::bad_params("name must not be empty"));
    }
    let email = get_required_str(params, "email")?;
    if !email.contains('@') {
        return Err(HandlerErr::bad_params("email is not valid"));
    }
    let role = get_required_str(params, "role")?;
    if !ROLES.contains(&role.as_str()) {
        return Err(HandlerErr::bad_params(
            "role must be admin, teacher or student",
        ));
    }

    let user_id = Uuid::new_v4().to_string();
    conn.execute(
        "INSERT INTO users(id, name, email, role) VALUES(?, ?, ?, ?)",
        (&user_id, name.trim(), email.trim(), &role),
    )
    .map_err(|e| {
        if is_constraint_violation(&e) {
            HandlerErr::new("conflict", "email already registered")
        } else {
            HandlerErr::db_update(e)
        }
    })?;

    Ok(json!({ "userId": user_id, "name": name.trim(), "email": email.trim(), "role": role }))
}

fn users_list(conn: &Connection, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let role = get_opt_str(params, "role");
    let mut out = Vec::new();
    let mut push_row = |id: String, name: String, email: String, role: String| {
        out.push(json!({ "id": id, "name": name, "email": email, "role": role }));
    };
    match role {
        Some(role) => {
            let mut stmt = conn
                .prepare("SELECT id, name, email, role FROM users WHERE role = ? ORDER BY name")
                .map_err(HandlerErr::db_query)?;
            let rows = stmt
                .query_map([&role], |r| {
                    Ok((r.get(0)?, r.get(1)?, r.get(2)?, r.get(3)?))
                })
                .and_then(|it| it.collect::<Result<Vec<_>, _>>())
                .map_err(HandlerErr::db_query)?;
            for (id, name, email, role) in rows {
                push_row(id, name, email, role);
            }
        }
        None => {
            let mut stmt = conn
                .prepare("SELECT id, name, email, role FROM users ORDER BY name")
                .map_err(HandlerErr::db_query)?;
            let rows = stmt
                .query_map([], |r| Ok((r.get(0)?, r.get(1)?, r.get(2)?, r.get(3)?)))
                .and_then(|it| it.collect::<Result<Vec<_>, _>>())
                .map_err(HandlerErr::db_query)?;
            for (id, name, email, role) in rows {
                push_row(id, name, email, role);
            }
        }
    }
    Ok(json!({ "users": out }))
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
        "users.create" => Some(with_db(state, req, users_create)),
        "users.list" => Some(with_db(state, req, users_list)),
        _ => None,
    }
}
