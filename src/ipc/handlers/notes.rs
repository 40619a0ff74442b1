use crate::db;
use crate::ipc::error::{err, ok};
use crate::ipc::helpers::{self, Role};
use crate::ipc::types::{AppState, Request};
use crate::notify;
use rusqlite::OptionalExtension;
use serde_json::json;
use uuid::Uuid;

const CONTENT_MIN: usize = 1;
const CONTENT_MAX: usize = 1000;

fn validate_content(content: &str) -> Vec<String> {
    let len = content.chars().count();
    let mut errors = Vec::new();
    if len < CONTENT_MIN {
        errors.push("Content can't be blank".to_string());
    } else if len > CONTENT_MAX {
        errors.push(format!(
            "Content is too long (maximum is {} characters)",
            CONTENT_MAX
        ));
    }
    errors
}

struct NoteRow {
    id: String,
    student_id: String,
    user_id: String,
    content: String,
    created_at: String,
    updated_at: String,
}

fn fetch_note(
    conn: &rusqlite::Connection,
    note_id: &str,
) -> Result<Option<NoteRow>, helpers::HandlerErr> {
    conn.query_row(
        "SELECT id, student_id, user_id, content, created_at, updated_at
         FROM notes WHERE id = ?",
        [note_id],
        |r| {
            Ok(NoteRow {
                id: r.get(0)?,
                student_id: r.get(1)?,
                user_id: r.get(2)?,
                content: r.get(3)?,
                created_at: r.get(4)?,
                updated_at: r.get(5)?,
            })
        },
    )
    .optional()
    .map_err(|e| helpers::HandlerErr::new("db_query_failed", e.to_string()))
}

fn author_json(
    conn: &rusqlite::Connection,
    user_id: &str,
) -> Result<serde_json::Value, helpers::HandlerErr> {
    let row: Option<(String, String, String)> = conn
        .query_row(
            "SELECT email, first_name, last_name FROM users WHERE id = ?",
            [user_id],
            |r| Ok((r.get(0)?, r.get(1)?, r.get(2)?)),
        )
        .optional()
        .map_err(|e| helpers::HandlerErr::new("db_query_failed", e.to_string()))?;
    Ok(match row {
        Some((email, first, last)) => json!({
            "id": user_id,
            "name": format!("{} {}", first, last).trim(),
            "email": email
        }),
        None => json!({ "id": user_id }),
    })
}

fn note_json(conn: &rusqlite::Connection, row: &NoteRow) -> Result<serde_json::Value, helpers::HandlerErr> {
    Ok(json!({
        "id": row.id,
        "studentId": row.student_id,
        "content": row.content,
        "createdAt": row.created_at,
        "updatedAt": row.updated_at,
        "createdBy": author_json(conn, &row.user_id)?
    }))
}

fn student_exists(
    conn: &rusqlite::Connection,
    student_id: &str,
) -> Result<bool, helpers::HandlerErr> {
    let found: Option<i64> = conn
        .query_row("SELECT 1 FROM students WHERE id = ?", [student_id], |r| {
            r.get(0)
        })
        .optional()
        .map_err(|e| helpers::HandlerErr::new("db_query_failed", e.to_string()))?;
    Ok(found.is_some())
}

fn handle_notes_list(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    let actor = match helpers::authenticate(conn, &req.params) {
        Ok(u) => u,
        Err(e) => return e.response(&req.id),
    };
    let student_id = match helpers::require_str(&req.params, "studentId") {
        Ok(v) => v,
        Err(e) => return e.response(&req.id),
    };
    match student_exists(conn, &student_id) {
        Ok(true) => {}
        Ok(false) => return err(&req.id, "not_found", "student not found", None),
        Err(e) => return e.response(&req.id),
    }

    let mut where_parts = vec!["n.student_id = ?".to_string()];
    let mut binds: Vec<rusqlite::types::Value> =
        vec![rusqlite::types::Value::Text(student_id.clone())];

    if let Some(search_term) = helpers::opt_str(&req.params, "search") {
        where_parts.push("n.content LIKE ? ESCAPE '\\'".to_string());
        let escaped = search_term
            .replace('\\', "\\\\")
            .replace('%', "\\%")
            .replace('_', "\\_");
        binds.push(rusqlite::types::Value::Text(format!("%{}%", escaped)));
    }
    if req.params.get("myNotes").and_then(|v| v.as_bool()) == Some(true) {
        where_parts.push("n.user_id = ?".to_string());
        binds.push(rusqlite::types::Value::Text(actor.id.clone()));
    }
    let where_clause = where_parts.join(" AND ");

    let count_sql = format!("SELECT COUNT(*) FROM notes n WHERE {}", where_clause);
    let total_count: i64 = match conn.query_row(
        &count_sql,
        rusqlite::params_from_iter(binds.iter()),
        |r| r.get(0),
    ) {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };

    let (page, per_page) = helpers::page_params(&req.params, 10);
    let sql = format!(
        "SELECT n.id, n.student_id, n.user_id, n.content, n.created_at, n.updated_at
         FROM notes n
         WHERE {}
         ORDER BY n.created_at DESC, n.rowid DESC
         LIMIT ? OFFSET ?",
        where_clause
    );
    binds.push(rusqlite::types::Value::Integer(per_page));
    binds.push(rusqlite::types::Value::Integer((page - 1) * per_page));

    let mut stmt = match conn.prepare(&sql) {
        Ok(s) => s,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    let rows = stmt
        .query_map(rusqlite::params_from_iter(binds), |r| {
            Ok(NoteRow {
                id: r.get(0)?,
                student_id: r.get(1)?,
                user_id: r.get(2)?,
                content: r.get(3)?,
                created_at: r.get(4)?,
                updated_at: r.get(5)?,
            })
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>());
    let rows = match rows {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };

    let mut notes = Vec::with_capacity(rows.len());
    for row in &rows {
        match note_json(conn, row) {
            Ok(v) => notes.push(v),
            Err(e) => return e.response(&req.id),
        }
    }

    ok(
        &req.id,
        json!({
            "notes": notes,
            "pagination": {
                "currentPage": page,
                "totalPages": helpers::total_pages(total_count, per_page),
                "totalCount": total_count,
                "perPage": per_page
            }
        }),
    )
}

fn handle_notes_get(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    if let Err(e) = helpers::authenticate(conn, &req.params) {
        return e.response(&req.id);
    }
    let note_id = match helpers::require_str(&req.params, "noteId") {
        Ok(v) => v,
        Err(e) => return e.response(&req.id),
    };

    let row = match fetch_note(conn, &note_id) {
        Ok(v) => v,
        Err(e) => return e.response(&req.id),
    };
    let Some(row) = row else {
        return err(&req.id, "not_found", "note not found", None);
    };
    match note_json(conn, &row) {
        Ok(v) => ok(&req.id, json!({ "note": v })),
        Err(e) => e.response(&req.id),
    }
}

fn handle_notes_create(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    let actor = match helpers::authenticate(conn, &req.params) {
        Ok(u) => u,
        Err(e) => return e.response(&req.id),
    };
    if let Err(e) = helpers::require_record_access(&actor) {
        return e.response(&req.id);
    }
    let student_id = match helpers::require_str(&req.params, "studentId") {
        Ok(v) => v,
        Err(e) => return e.response(&req.id),
    };

    let student: Option<(String, Option<String>)> = match conn
        .query_row(
            "SELECT name, user_id FROM students WHERE id = ?",
            [&student_id],
            |r| Ok((r.get(0)?, r.get(1)?)),
        )
        .optional()
    {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    let Some((student_name, owner_id)) = student else {
        return err(&req.id, "not_found", "student not found", None);
    };

    let content = req
        .params
        .get("content")
        .and_then(|v| v.as_str())
        .unwrap_or("")
        .to_string();
    let errors = validate_content(&content);
    if !errors.is_empty() {
        return err(
            &req.id,
            "validation_failed",
            "note is invalid",
            Some(json!({ "errors": errors })),
        );
    }

    let note_id = Uuid::new_v4().to_string();
    let now = db::now_utc();
    if let Err(e) = conn.execute(
        "INSERT INTO notes(id, student_id, user_id, content, created_at, updated_at)
         VALUES(?, ?, ?, ?, ?, ?)",
        (&note_id, &student_id, &actor.id, &content, &now, &now),
    ) {
        return err(
            &req.id,
            "db_insert_failed",
            e.to_string(),
            Some(json!({ "table": "notes" })),
        );
    }

    if let Some(owner_id) = owner_id {
        let email: Option<String> = match conn
            .query_row("SELECT email FROM users WHERE id = ?", [&owner_id], |r| {
                r.get(0)
            })
            .optional()
        {
            Ok(v) => v,
            Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
        };
        if let Some(email) = email {
            let recipient = notify::Recipient {
                user_id: owner_id,
                email,
            };
            if let Err(e) =
                notify::note_added(conn, &state.mailer, &recipient, &student_name, &content)
            {
                return err(&req.id, "db_insert_failed", format!("{e:#}"), None);
            }
        }
    }

    let row = NoteRow {
        id: note_id,
        student_id,
        user_id: actor.id,
        content,
        created_at: now.clone(),
        updated_at: now,
    };
    match note_json(conn, &row) {
        Ok(v) => ok(&req.id, json!({ "note": v })),
        Err(e) => e.response(&req.id),
    }
}

/// Note mutation is limited to the note's author; admins may act on any note.
fn may_mutate_note(actor: &helpers::CurrentUser, author_id: &str) -> Result<(), helpers::HandlerErr> {
    match actor.role {
        Role::Admin => Ok(()),
        Role::Teacher | Role::Student => {
            if actor.id == author_id {
                Ok(())
            } else {
                Err(helpers::HandlerErr::new(
                    "forbidden",
                    "only the author may modify this note",
                ))
            }
        }
    }
}

fn handle_notes_update(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    let actor = match helpers::authenticate(conn, &req.params) {
        Ok(u) => u,
        Err(e) => return e.response(&req.id),
    };
    let note_id = match helpers::require_str(&req.params, "noteId") {
        Ok(v) => v,
        Err(e) => return e.response(&req.id),
    };

    let row = match fetch_note(conn, &note_id) {
        Ok(v) => v,
        Err(e) => return e.response(&req.id),
    };
    let Some(mut row) = row else {
        return err(&req.id, "not_found", "note not found", None);
    };
    if let Err(e) = may_mutate_note(&actor, &row.user_id) {
        return e.response(&req.id);
    }

    let content = match req.params.get("content").and_then(|v| v.as_str()) {
        Some(v) => v.to_string(),
        None => return err(&req.id, "bad_params", "missing content", None),
    };
    let errors = validate_content(&content);
    if !errors.is_empty() {
        return err(
            &req.id,
            "validation_failed",
            "note is invalid",
            Some(json!({ "errors": errors })),
        );
    }

    let now = db::now_utc();
    if let Err(e) = conn.execute(
        "UPDATE notes SET content = ?, updated_at = ? WHERE id = ?",
        (&content, &now, &note_id),
    ) {
        return err(
            &req.id,
            "db_update_failed",
            e.to_string(),
            Some(json!({ "table": "notes" })),
        );
    }

    row.content = content;
    row.updated_at = now;
    match note_json(conn, &row) {
        Ok(v) => ok(&req.id, json!({ "note": v })),
        Err(e) => e.response(&req.id),
    }
}

fn handle_notes_delete(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    let actor = match helpers::authenticate(conn, &req.params) {
        Ok(u) => u,
        Err(e) => return e.response(&req.id),
    };
    let note_id = match helpers::require_str(&req.params, "noteId") {
        Ok(v) => v,
        Err(e) => return e.response(&req.id),
    };

    let row = match fetch_note(conn, &note_id) {
        Ok(v) => v,
        Err(e) => return e.response(&req.id),
    };
    let Some(row) = row else {
        return err(&req.id, "not_found", "note not found", None);
    };
    if let Err(e) = may_mutate_note(&actor, &row.user_id) {
        return e.response(&req.id);
    }

    if let Err(e) = conn.execute("DELETE FROM notes WHERE id = ?", [&note_id]) {
        return err(
            &req.id,
            "db_delete_failed",
            e.to_string(),
            Some(json!({ "table": "notes" })),
        );
    }
    ok(&req.id, json!({ "deleted": true }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "notes.list" => Some(handle_notes_list(state, req)),
        "notes.get" => Some(handle_notes_get(state, req)),
        "notes.create" => Some(handle_notes_create(state, req)),
        "notes.update" => Some(handle_notes_update(state, req)),
        "notes.delete" => Some(handle_notes_delete(state, req)),
        _ => None,
    }
}
