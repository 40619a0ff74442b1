use crate::calc;
use crate::db;
use crate::ipc::error::{err, ok};
use crate::ipc::helpers::{self, Role};
use crate::ipc::types::{AppState, Request};
use crate::notify;
use rusqlite::OptionalExtension;
use serde_json::json;
use uuid::Uuid;

const EMAIL_MAX_LEN: usize = 254;

fn validate_email(email: &str) -> Vec<String> {
    let mut errors = Vec::new();
    if email.is_empty() {
        errors.push("Email can't be blank".to_string());
    } else {
        if !email.contains('@') {
            errors.push("Email is invalid".to_string());
        }
        if email.len() > EMAIL_MAX_LEN {
            errors.push("Email is too long".to_string());
        }
    }
    errors
}

fn email_taken(
    conn: &rusqlite::Connection,
    email: &str,
    exclude_id: Option<&str>,
) -> Result<bool, helpers::HandlerErr> {
    let taken: Option<i64> = match exclude_id {
        Some(id) => conn
            .query_row(
                "SELECT 1 FROM users WHERE email = ? AND id != ?",
                (email, id),
                |r| r.get(0),
            )
            .optional(),
        None => conn
            .query_row("SELECT 1 FROM users WHERE email = ?", [email], |r| r.get(0))
            .optional(),
    }
    .map_err(|e| helpers::HandlerErr::new("db_query_failed", e.to_string()))?;
    Ok(taken.is_some())
}

fn user_json(
    id: &str,
    email: &str,
    first_name: &str,
    last_name: &str,
    role: Role,
    created_at: &str,
    updated_at: &str,
) -> serde_json::Value {
    let full_name = format!("{} {}", first_name, last_name).trim().to_string();
    json!({
        "id": id,
        "email": email,
        "firstName": first_name,
        "lastName": last_name,
        "fullName": full_name,
        "role": role.as_str(),
        "createdAt": created_at,
        "updatedAt": updated_at
    })
}

fn handle_users_create(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };

    let user_count: i64 = match conn.query_row("SELECT COUNT(*) FROM users", [], |r| r.get(0)) {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    let bootstrap = user_count == 0;

    if !bootstrap {
        let actor = match helpers::authenticate(conn, &req.params) {
            Ok(u) => u,
            Err(e) => return e.response(&req.id),
        };
        if let Err(e) = helpers::require_admin(&actor) {
            return e.response(&req.id);
        }
    }

    let email = helpers::opt_str(&req.params, "email").unwrap_or_default();
    let first_name = helpers::opt_str(&req.params, "firstName").unwrap_or_default();
    let last_name = helpers::opt_str(&req.params, "lastName").unwrap_or_default();

    let role = if bootstrap {
        // The very first account must be able to administer the workspace.
        Role::Admin
    } else {
        match req.params.get("role").and_then(|v| v.as_str()) {
            None => Role::Student,
            Some(raw) => match Role::parse(raw) {
                Some(r) => r,
                None => {
                    return err(
                        &req.id,
                        "bad_params",
                        "role must be one of student, teacher, admin",
                        None,
                    )
                }
            },
        }
    };

    let mut errors = validate_email(&email);
    match email_taken(conn, &email, None) {
        Ok(true) => errors.push("Email has already been taken".to_string()),
        Ok(false) => {}
        Err(e) => return e.response(&req.id),
    }
    if !errors.is_empty() {
        return err(
            &req.id,
            "validation_failed",
            "user is invalid",
            Some(json!({ "errors": errors })),
        );
    }

    let user_id = Uuid::new_v4().to_string();
    let api_token = Uuid::new_v4().to_string();
    let now = db::now_utc();
    if let Err(e) = conn.execute(
        "INSERT INTO users(id, email, first_name, last_name, role, api_token, created_at, updated_at)
         VALUES(?, ?, ?, ?, ?, ?, ?, ?)",
        (
            &user_id,
            &email,
            &first_name,
            &last_name,
            role.as_db(),
            &api_token,
            &now,
            &now,
        ),
    ) {
        return err(
            &req.id,
            "db_insert_failed",
            e.to_string(),
            Some(json!({ "table": "users" })),
        );
    }
    if bootstrap {
        log::info!("bootstrap admin account created for {}", email);
    }

    let recipient = notify::Recipient {
        user_id: user_id.clone(),
        email: email.clone(),
    };
    if let Err(e) = notify::welcome(conn, &state.mailer, &recipient) {
        return err(&req.id, "db_insert_failed", format!("{e:#}"), None);
    }

    let mut user = user_json(&user_id, &email, &first_name, &last_name, role, &now, &now);
    user["apiToken"] = json!(api_token);
    ok(&req.id, json!({ "user": user }))
}

fn handle_users_list(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    let actor = match helpers::authenticate(conn, &req.params) {
        Ok(u) => u,
        Err(e) => return e.response(&req.id),
    };
    if let Err(e) = helpers::require_admin(&actor) {
        return e.response(&req.id);
    }

    let (page, per_page) = helpers::page_params(&req.params, 10);

    let total_count: i64 = match conn.query_row("SELECT COUNT(*) FROM users", [], |r| r.get(0)) {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };

    let mut stmt = match conn.prepare(
        "SELECT u.id, u.email, u.first_name, u.last_name, u.role, u.created_at, u.updated_at,
                (SELECT COUNT(*) FROM students s WHERE s.user_id = u.id) AS student_count,
                (SELECT COUNT(*) FROM notes n WHERE n.user_id = u.id) AS note_count
         FROM users u
         ORDER BY u.role, u.last_name, u.first_name
         LIMIT ? OFFSET ?",
    ) {
        Ok(s) => s,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };

    let rows = stmt
        .query_map((per_page, (page - 1) * per_page), |r| {
            let id: String = r.get(0)?;
            let email: String = r.get(1)?;
            let first_name: String = r.get(2)?;
            let last_name: String = r.get(3)?;
            let role: i64 = r.get(4)?;
            let created_at: String = r.get(5)?;
            let updated_at: String = r.get(6)?;
            let student_count: i64 = r.get(7)?;
            let note_count: i64 = r.get(8)?;
            Ok((
                id,
                email,
                first_name,
                last_name,
                role,
                created_at,
                updated_at,
                student_count,
                note_count,
            ))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>());

    let rows = match rows {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };

    let mut users = Vec::with_capacity(rows.len());
    for (id, email, first_name, last_name, role, created_at, updated_at, student_count, note_count) in
        rows
    {
        let role = match Role::from_db(role) {
            Ok(r) => r,
            Err(e) => return e.response(&req.id),
        };
        let mut u = user_json(
            &id,
            &email,
            &first_name,
            &last_name,
            role,
            &created_at,
            &updated_at,
        );
        u["studentCount"] = json!(student_count);
        u["noteCount"] = json!(note_count);
        users.push(u);
    }

    ok(
        &req.id,
        json!({
            "users": users,
            "pagination": {
                "currentPage": page,
                "totalPages": helpers::total_pages(total_count, per_page),
                "totalCount": total_count,
                "perPage": per_page
            }
        }),
    )
}

fn fetch_user_row(
    conn: &rusqlite::Connection,
    user_id: &str,
) -> Result<Option<(String, String, String, i64, String, String)>, helpers::HandlerErr> {
    conn.query_row(
        "SELECT email, first_name, last_name, role, created_at, updated_at
         FROM users WHERE id = ?",
        [user_id],
        |r| {
            Ok((
                r.get(0)?,
                r.get(1)?,
                r.get(2)?,
                r.get(3)?,
                r.get(4)?,
                r.get(5)?,
            ))
        },
    )
    .optional()
    .map_err(|e| helpers::HandlerErr::new("db_query_failed", e.to_string()))
}

fn handle_users_get(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    let actor = match helpers::authenticate(conn, &req.params) {
        Ok(u) => u,
        Err(e) => return e.response(&req.id),
    };
    if let Err(e) = helpers::require_admin(&actor) {
        return e.response(&req.id);
    }
    let user_id = match helpers::require_str(&req.params, "userId") {
        Ok(v) => v,
        Err(e) => return e.response(&req.id),
    };

    let row = match fetch_user_row(conn, &user_id) {
        Ok(v) => v,
        Err(e) => return e.response(&req.id),
    };
    let Some((email, first_name, last_name, role, created_at, updated_at)) = row else {
        return err(&req.id, "not_found", "user not found", None);
    };
    let role = match Role::from_db(role) {
        Ok(r) => r,
        Err(e) => return e.response(&req.id),
    };

    let mut stmt = match conn.prepare(
        "SELECT id, name, total_score, percentage FROM students
         WHERE user_id = ? ORDER BY name",
    ) {
        Ok(s) => s,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    let students = stmt
        .query_map([&user_id], |r| {
            let pct: f64 = r.get(3)?;
            Ok(json!({
                "id": r.get::<_, String>(0)?,
                "name": r.get::<_, String>(1)?,
                "totalScore": r.get::<_, i64>(2)?,
                "percentage": pct
            }))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>());
    let mut students = match students {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    for s in &mut students {
        if let Some(p) = s["percentage"].as_f64() {
            s["percentage"] = json!(calc::round2(p));
        }
    }

    let mut stmt = match conn.prepare(
        "SELECT n.id, n.content, n.created_at, s.name
         FROM notes n
         JOIN students s ON s.id = n.student_id
         WHERE n.user_id = ?
         ORDER BY n.created_at DESC, n.rowid DESC
         LIMIT 10",
    ) {
        Ok(s) => s,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    let recent_notes = stmt
        .query_map([&user_id], |r| {
            Ok(json!({
                "id": r.get::<_, String>(0)?,
                "content": r.get::<_, String>(1)?,
                "createdAt": r.get::<_, String>(2)?,
                "studentName": r.get::<_, String>(3)?
            }))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>());
    let recent_notes = match recent_notes {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };

    ok(
        &req.id,
        json!({
            "user": user_json(&user_id, &email, &first_name, &last_name, role, &created_at, &updated_at),
            "students": students,
            "recentNotes": recent_notes
        }),
    )
}

fn handle_users_update(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    let actor = match helpers::authenticate(conn, &req.params) {
        Ok(u) => u,
        Err(e) => return e.response(&req.id),
    };
    if let Err(e) = helpers::require_admin(&actor) {
        return e.response(&req.id);
    }
    let user_id = match helpers::require_str(&req.params, "userId") {
        Ok(v) => v,
        Err(e) => return e.response(&req.id),
    };
    let Some(patch) = req.params.get("patch").and_then(|v| v.as_object()) else {
        return err(&req.id, "bad_params", "missing/invalid patch", None);
    };

    let exists = match fetch_user_row(conn, &user_id) {
        Ok(v) => v,
        Err(e) => return e.response(&req.id),
    };
    if exists.is_none() {
        return err(&req.id, "not_found", "user not found", None);
    }

    let mut set_parts: Vec<String> = Vec::new();
    let mut binds: Vec<rusqlite::types::Value> = Vec::new();

    if let Some(v) = patch.get("email") {
        let Some(email) = v.as_str().map(str::trim) else {
            return err(&req.id, "bad_params", "patch.email must be a string", None);
        };
        let mut errors = validate_email(email);
        match email_taken(conn, email, Some(&user_id)) {
            Ok(true) => errors.push("Email has already been taken".to_string()),
            Ok(false) => {}
            Err(e) => return e.response(&req.id),
        }
        if !errors.is_empty() {
            return err(
                &req.id,
                "validation_failed",
                "user is invalid",
                Some(json!({ "errors": errors })),
            );
        }
        set_parts.push("email = ?".to_string());
        binds.push(rusqlite::types::Value::Text(email.to_string()));
    }
    if let Some(v) = patch.get("firstName") {
        let Some(s) = v.as_str() else {
            return err(&req.id, "bad_params", "patch.firstName must be a string", None);
        };
        set_parts.push("first_name = ?".to_string());
        binds.push(rusqlite::types::Value::Text(s.trim().to_string()));
    }
    if let Some(v) = patch.get("lastName") {
        let Some(s) = v.as_str() else {
            return err(&req.id, "bad_params", "patch.lastName must be a string", None);
        };
        set_parts.push("last_name = ?".to_string());
        binds.push(rusqlite::types::Value::Text(s.trim().to_string()));
    }
    if let Some(v) = patch.get("role") {
        let role = v.as_str().and_then(Role::parse);
        let Some(role) = role else {
            return err(
                &req.id,
                "bad_params",
                "patch.role must be one of student, teacher, admin",
                None,
            );
        };
        set_parts.push("role = ?".to_string());
        binds.push(rusqlite::types::Value::Integer(role.as_db()));
    }

    if set_parts.is_empty() {
        return err(&req.id, "bad_params", "patch has no recognized fields", None);
    }

    set_parts.push("updated_at = ?".to_string());
    binds.push(rusqlite::types::Value::Text(db::now_utc()));
    binds.push(rusqlite::types::Value::Text(user_id.clone()));

    let sql = format!("UPDATE users SET {} WHERE id = ?", set_parts.join(", "));
    if let Err(e) = conn.execute(&sql, rusqlite::params_from_iter(binds)) {
        return err(
            &req.id,
            "db_update_failed",
            e.to_string(),
            Some(json!({ "table": "users" })),
        );
    }

    let row = match fetch_user_row(conn, &user_id) {
        Ok(v) => v,
        Err(e) => return e.response(&req.id),
    };
    let Some((email, first_name, last_name, role, created_at, updated_at)) = row else {
        return err(&req.id, "not_found", "user not found", None);
    };
    let role = match Role::from_db(role) {
        Ok(r) => r,
        Err(e) => return e.response(&req.id),
    };
    ok(
        &req.id,
        json!({
            "user": user_json(&user_id, &email, &first_name, &last_name, role, &created_at, &updated_at)
        }),
    )
}

fn handle_users_delete(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    let actor = match helpers::authenticate(conn, &req.params) {
        Ok(u) => u,
        Err(e) => return e.response(&req.id),
    };
    if let Err(e) = helpers::require_admin(&actor) {
        return e.response(&req.id);
    }
    let user_id = match helpers::require_str(&req.params, "userId") {
        Ok(v) => v,
        Err(e) => return e.response(&req.id),
    };
    if user_id == actor.id {
        return err(&req.id, "forbidden", "you cannot delete your own account", None);
    }

    let exists = match fetch_user_row(conn, &user_id) {
        Ok(v) => v,
        Err(e) => return e.response(&req.id),
    };
    if exists.is_none() {
        return err(&req.id, "not_found", "user not found", None);
    }

    let owned: i64 = match conn.query_row(
        "SELECT (SELECT COUNT(*) FROM students WHERE user_id = ?1)
              + (SELECT COUNT(*) FROM notes WHERE user_id = ?1)",
        [&user_id],
        |r| r.get(0),
    ) {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };

    // Owned records survive their user: reassign to another admin first.
    let mut heir: Option<String> = None;
    if owned > 0 {
        heir = match conn
            .query_row(
                "SELECT id FROM users WHERE role = 2 AND id != ? ORDER BY created_at LIMIT 1",
                [&user_id],
                |r| r.get(0),
            )
            .optional()
        {
            Ok(v) => v,
            Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
        };
        if heir.is_none() {
            return err(
                &req.id,
                "conflict",
                "cannot delete user with associated data; no other admin to reassign to",
                None,
            );
        }
    }

    let tx = match conn.unchecked_transaction() {
        Ok(t) => t,
        Err(e) => return err(&req.id, "db_tx_failed", e.to_string(), None),
    };

    if let Some(heir) = &heir {
        if let Err(e) = tx.execute(
            "UPDATE students SET user_id = ? WHERE user_id = ?",
            (heir, &user_id),
        ) {
            let _ = tx.rollback();
            return err(&req.id, "db_update_failed", e.to_string(), None);
        }
        if let Err(e) = tx.execute(
            "UPDATE notes SET user_id = ? WHERE user_id = ?",
            (heir, &user_id),
        ) {
            let _ = tx.rollback();
            return err(&req.id, "db_update_failed", e.to_string(), None);
        }
    }

    if let Err(e) = tx.execute("DELETE FROM notifications WHERE user_id = ?", [&user_id]) {
        let _ = tx.rollback();
        return err(
            &req.id,
            "db_delete_failed",
            e.to_string(),
            Some(json!({ "table": "notifications" })),
        );
    }
    if let Err(e) = tx.execute("DELETE FROM users WHERE id = ?", [&user_id]) {
        let _ = tx.rollback();
        return err(
            &req.id,
            "db_delete_failed",
            e.to_string(),
            Some(json!({ "table": "users" })),
        );
    }
    if let Err(e) = tx.commit() {
        return err(&req.id, "db_tx_failed", e.to_string(), None);
    }

    ok(
        &req.id,
        json!({ "deleted": true, "reassignedTo": heir }),
    )
}

fn handle_users_regenerate_token(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    let actor = match helpers::authenticate(conn, &req.params) {
        Ok(u) => u,
        Err(e) => return e.response(&req.id),
    };
    let target_id = helpers::opt_str(&req.params, "userId").unwrap_or_else(|| actor.id.clone());
    if target_id != actor.id {
        if let Err(e) = helpers::require_admin(&actor) {
            return e.response(&req.id);
        }
    }

    let api_token = Uuid::new_v4().to_string();
    let changed = match conn.execute(
        "UPDATE users SET api_token = ?, updated_at = ? WHERE id = ?",
        (&api_token, &db::now_utc(), &target_id),
    ) {
        Ok(n) => n,
        Err(e) => return err(&req.id, "db_update_failed", e.to_string(), None),
    };
    if changed == 0 {
        return err(&req.id, "not_found", "user not found", None);
    }

    ok(&req.id, json!({ "userId": target_id, "apiToken": api_token }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "users.create" => Some(handle_users_create(state, req)),
        "users.list" => Some(handle_users_list(state, req)),
        "users.get" => Some(handle_users_get(state, req)),
        "users.update" => Some(handle_users_update(state, req)),
        "users.delete" => Some(handle_users_delete(state, req)),
        "users.regenerateToken" => Some(handle_users_regenerate_token(state, req)),
        _ => None,
    }
}
