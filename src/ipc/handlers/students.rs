use crate::calc;
use crate::db;
use crate::ipc::error::{err, ok};
use crate::ipc::helpers::{self, Role};
use crate::ipc::types::{AppState, Request};
use crate::notify;
use crate::search;
use rusqlite::OptionalExtension;
use serde_json::json;
use uuid::Uuid;

struct StudentRow {
    id: String,
    user_id: Option<String>,
    name: String,
    reading: i64,
    writing: i64,
    listening: i64,
    speaking: i64,
    total_score: i64,
    percentage: f64,
    created_at: String,
    updated_at: String,
}

fn fetch_student(
    conn: &rusqlite::Connection,
    student_id: &str,
) -> Result<Option<StudentRow>, helpers::HandlerErr> {
    conn.query_row(
        "SELECT id, user_id, name, reading, writing, listening, speaking,
                total_score, percentage, created_at, updated_at
         FROM students WHERE id = ?",
        [student_id],
        |r| {
            Ok(StudentRow {
                id: r.get(0)?,
                user_id: r.get(1)?,
                name: r.get(2)?,
                reading: r.get(3)?,
                writing: r.get(4)?,
                listening: r.get(5)?,
                speaking: r.get(6)?,
                total_score: r.get(7)?,
                percentage: r.get(8)?,
                created_at: r.get(9)?,
                updated_at: r.get(10)?,
            })
        },
    )
    .optional()
    .map_err(|e| helpers::HandlerErr::new("db_query_failed", e.to_string()))
}

fn student_row_json(row: &StudentRow, notes_count: i64) -> serde_json::Value {
    json!({
        "id": row.id,
        "userId": row.user_id,
        "name": row.name,
        "reading": row.reading,
        "writing": row.writing,
        "listening": row.listening,
        "speaking": row.speaking,
        "totalScore": row.total_score,
        "percentage": calc::round2(row.percentage),
        "notesCount": notes_count,
        "createdAt": row.created_at,
        "updatedAt": row.updated_at
    })
}

fn student_hit_json(hit: &search::StudentHit) -> serde_json::Value {
    json!({
        "id": hit.id,
        "userId": hit.user_id,
        "name": hit.name,
        "reading": hit.reading,
        "writing": hit.writing,
        "listening": hit.listening,
        "speaking": hit.speaking,
        "totalScore": hit.total_score,
        "percentage": calc::round2(hit.percentage),
        "notesCount": hit.notes_count,
        "createdAt": hit.created_at,
        "updatedAt": hit.updated_at
    })
}

fn owner_recipient(
    conn: &rusqlite::Connection,
    owner_id: Option<&str>,
) -> Result<Option<notify::Recipient>, helpers::HandlerErr> {
    let Some(owner_id) = owner_id else {
        return Ok(None);
    };
    let email: Option<String> = conn
        .query_row("SELECT email FROM users WHERE id = ?", [owner_id], |r| {
            r.get(0)
        })
        .optional()
        .map_err(|e| helpers::HandlerErr::new("db_query_failed", e.to_string()))?;
    Ok(email.map(|email| notify::Recipient {
        user_id: owner_id.to_string(),
        email,
    }))
}

fn parse_skills(params: &serde_json::Value) -> [(&'static str, Option<i64>); 4] {
    [
        ("Reading", helpers::opt_i64(params, "reading")),
        ("Writing", helpers::opt_i64(params, "writing")),
        ("Listening", helpers::opt_i64(params, "listening")),
        ("Speaking", helpers::opt_i64(params, "speaking")),
    ]
}

fn handle_students_list(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    if let Err(e) = helpers::authenticate(conn, &req.params) {
        return e.response(&req.id);
    }

    let query = req.params.get("q").and_then(|v| v.as_str()).unwrap_or("");
    let filters = search::SearchFilters::from_params(req.params.get("filters"));
    let sort = search::SortKey::parse(req.params.get("sort").and_then(|v| v.as_str()));
    let page = search::PageParams::from_params(&req.params);

    let (hits, pagination) = match search::search_students(conn, query, &filters, sort, page) {
        Ok(v) => v,
        Err(e) => return err(&req.id, &e.code, e.message, e.details),
    };

    let students: Vec<serde_json::Value> = hits.iter().map(student_hit_json).collect();
    ok(
        &req.id,
        json!({
            "students": students,
            "pagination": {
                "currentPage": pagination.current_page,
                "totalPages": pagination.total_pages,
                "totalCount": pagination.total_count,
                "perPage": pagination.per_page
            }
        }),
    )
}

fn handle_students_suggestions(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    if let Err(e) = helpers::authenticate(conn, &req.params) {
        return e.response(&req.id);
    }

    let query = req.params.get("q").and_then(|v| v.as_str()).unwrap_or("");
    match search::suggestions(conn, query) {
        Ok(list) => ok(&req.id, json!({ "suggestions": list })),
        Err(e) => err(&req.id, &e.code, e.message, e.details),
    }
}

fn handle_students_get(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    if let Err(e) = helpers::authenticate(conn, &req.params) {
        return e.response(&req.id);
    }
    let student_id = match helpers::require_str(&req.params, "studentId") {
        Ok(v) => v,
        Err(e) => return e.response(&req.id),
    };

    let row = match fetch_student(conn, &student_id) {
        Ok(v) => v,
        Err(e) => return e.response(&req.id),
    };
    let Some(row) = row else {
        return err(&req.id, "not_found", "student not found", None);
    };

    // Notes are loaded eagerly with their authors in one query.
    let mut stmt = match conn.prepare(
        "SELECT n.id, n.content, n.created_at, n.updated_at,
                u.id, u.first_name || ' ' || u.last_name
         FROM notes n
         JOIN users u ON u.id = n.user_id
         WHERE n.student_id = ?
         ORDER BY n.created_at DESC, n.rowid DESC",
    ) {
        Ok(s) => s,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    let notes = stmt
        .query_map([&student_id], |r| {
            Ok(json!({
                "id": r.get::<_, String>(0)?,
                "content": r.get::<_, String>(1)?,
                "createdAt": r.get::<_, String>(2)?,
                "updatedAt": r.get::<_, String>(3)?,
                "createdBy": {
                    "id": r.get::<_, String>(4)?,
                    "name": r.get::<_, String>(5)?
                }
            }))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>());
    let notes = match notes {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };

    let mut student = student_row_json(&row, notes.len() as i64);
    student["notes"] = json!(notes);
    ok(&req.id, json!({ "student": student }))
}

fn handle_students_stats(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    let actor = match helpers::authenticate(conn, &req.params) {
        Ok(u) => u,
        Err(e) => return e.response(&req.id),
    };

    match calc::compute_user_stats(conn, &actor.id) {
        Ok(stats) => ok(&req.id, json!({ "stats": stats })),
        Err(e) => err(&req.id, &e.code, e.message, e.details),
    }
}

fn handle_students_create(state: &mut AppState, req: &Request) -> serde_json::Value {
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

    let name = helpers::opt_str(&req.params, "name").unwrap_or_default();
    let skills = parse_skills(&req.params);
    let errors = calc::validate_student(&name, &skills);
    if !errors.is_empty() {
        return err(
            &req.id,
            "validation_failed",
            "student is invalid",
            Some(json!({ "errors": errors })),
        );
    }

    // Ownership defaults to the creator; an admin may assign someone else,
    // or pass an explicit null to leave the student unassigned.
    let owner_id: Option<String> = match actor.role {
        Role::Admin => match req.params.get("userId") {
            Some(v) if v.is_null() => None,
            None => Some(actor.id.clone()),
            Some(_) => match helpers::opt_str(&req.params, "userId") {
                Some(explicit) => {
                    let exists: Option<i64> = match conn
                        .query_row("SELECT 1 FROM users WHERE id = ?", [&explicit], |r| r.get(0))
                        .optional()
                    {
                        Ok(v) => v,
                        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
                    };
                    if exists.is_none() {
                        return err(&req.id, "not_found", "assigned user not found", None);
                    }
                    Some(explicit)
                }
                None => return err(&req.id, "bad_params", "userId must be a string or null", None),
            },
        },
        Role::Teacher => Some(actor.id.clone()),
        Role::Student => unreachable!("record access is gated above"),
    };

    let scores = calc::SkillScores {
        reading: skills[0].1.unwrap_or(0),
        writing: skills[1].1.unwrap_or(0),
        listening: skills[2].1.unwrap_or(0),
        speaking: skills[3].1.unwrap_or(0),
    };
    let derived = calc::derive_scores(scores);
    let student_id = Uuid::new_v4().to_string();
    let now = db::now_utc();

    if let Err(e) = conn.execute(
        "INSERT INTO students(
           id, user_id, name, reading, writing, listening, speaking,
           total_score, percentage, created_at, updated_at
         ) VALUES(?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        (
            &student_id,
            owner_id.as_deref(),
            &name,
            scores.reading,
            scores.writing,
            scores.listening,
            scores.speaking,
            derived.total_score,
            derived.percentage,
            &now,
            &now,
        ),
    ) {
        return err(
            &req.id,
            "db_insert_failed",
            e.to_string(),
            Some(json!({ "table": "students" })),
        );
    }

    let recipient = match owner_recipient(conn, owner_id.as_deref()) {
        Ok(v) => v,
        Err(e) => return e.response(&req.id),
    };
    if let Some(recipient) = recipient {
        if let Err(e) =
            notify::student_created(conn, &state.mailer, &recipient, &name, derived.total_score)
        {
            return err(&req.id, "db_insert_failed", format!("{e:#}"), None);
        }
    }

    let row = StudentRow {
        id: student_id,
        user_id: owner_id,
        name,
        reading: scores.reading,
        writing: scores.writing,
        listening: scores.listening,
        speaking: scores.speaking,
        total_score: derived.total_score,
        percentage: derived.percentage,
        created_at: now.clone(),
        updated_at: now,
    };
    ok(&req.id, json!({ "student": student_row_json(&row, 0) }))
}

fn handle_students_update(state: &mut AppState, req: &Request) -> serde_json::Value {
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
    let Some(patch) = req.params.get("patch").and_then(|v| v.as_object()) else {
        return err(&req.id, "bad_params", "missing/invalid patch", None);
    };

    let row = match fetch_student(conn, &student_id) {
        Ok(v) => v,
        Err(e) => return e.response(&req.id),
    };
    let Some(current) = row else {
        return err(&req.id, "not_found", "student not found", None);
    };
    if let Err(e) = helpers::may_mutate_student(&actor, current.user_id.as_deref()) {
        return e.response(&req.id);
    }

    let patch_value = serde_json::Value::Object(patch.clone());
    let name = match patch.get("name") {
        Some(v) => match v.as_str() {
            Some(s) => s.trim().to_string(),
            None => return err(&req.id, "bad_params", "patch.name must be a string", None),
        },
        None => current.name.clone(),
    };
    let merged = [
        (
            "Reading",
            Some(helpers::opt_i64(&patch_value, "reading").unwrap_or(current.reading)),
        ),
        (
            "Writing",
            Some(helpers::opt_i64(&patch_value, "writing").unwrap_or(current.writing)),
        ),
        (
            "Listening",
            Some(helpers::opt_i64(&patch_value, "listening").unwrap_or(current.listening)),
        ),
        (
            "Speaking",
            Some(helpers::opt_i64(&patch_value, "speaking").unwrap_or(current.speaking)),
        ),
    ];
    // A key that is present but non-numeric must fail validation rather
    // than silently keep the old value.
    let merged: Vec<(&str, Option<i64>)> = merged
        .iter()
        .map(|(label, v)| {
            let key = label.to_lowercase();
            if patch.contains_key(&key) && helpers::opt_i64(&patch_value, &key).is_none() {
                (*label, None)
            } else {
                (*label, *v)
            }
        })
        .collect();

    let errors = calc::validate_student(&name, &merged);
    if !errors.is_empty() {
        return err(
            &req.id,
            "validation_failed",
            "student is invalid",
            Some(json!({ "errors": errors })),
        );
    }

    let scores = calc::SkillScores {
        reading: merged[0].1.unwrap_or(0),
        writing: merged[1].1.unwrap_or(0),
        listening: merged[2].1.unwrap_or(0),
        speaking: merged[3].1.unwrap_or(0),
    };
    let derived = calc::derive_scores(scores);
    let now = db::now_utc();

    if let Err(e) = conn.execute(
        "UPDATE students
         SET name = ?, reading = ?, writing = ?, listening = ?, speaking = ?,
             total_score = ?, percentage = ?, updated_at = ?
         WHERE id = ?",
        (
            &name,
            scores.reading,
            scores.writing,
            scores.listening,
            scores.speaking,
            derived.total_score,
            derived.percentage,
            &now,
            &student_id,
        ),
    ) {
        return err(
            &req.id,
            "db_update_failed",
            e.to_string(),
            Some(json!({ "table": "students" })),
        );
    }

    let recipient = match owner_recipient(conn, current.user_id.as_deref()) {
        Ok(v) => v,
        Err(e) => return e.response(&req.id),
    };
    if let Some(recipient) = recipient {
        if let Err(e) =
            notify::student_updated(conn, &state.mailer, &recipient, &name, derived.total_score)
        {
            return err(&req.id, "db_insert_failed", format!("{e:#}"), None);
        }
    }

    let notes_count: i64 = match conn.query_row(
        "SELECT COUNT(*) FROM notes WHERE student_id = ?",
        [&student_id],
        |r| r.get(0),
    ) {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    let row = StudentRow {
        id: student_id,
        user_id: current.user_id,
        name,
        reading: scores.reading,
        writing: scores.writing,
        listening: scores.listening,
        speaking: scores.speaking,
        total_score: derived.total_score,
        percentage: derived.percentage,
        created_at: current.created_at,
        updated_at: now,
    };
    ok(&req.id, json!({ "student": student_row_json(&row, notes_count) }))
}

fn handle_students_delete(state: &mut AppState, req: &Request) -> serde_json::Value {
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

    let row = match fetch_student(conn, &student_id) {
        Ok(v) => v,
        Err(e) => return e.response(&req.id),
    };
    let Some(current) = row else {
        return err(&req.id, "not_found", "student not found", None);
    };
    if let Err(e) = helpers::may_mutate_student(&actor, current.user_id.as_deref()) {
        return e.response(&req.id);
    }

    let tx = match conn.unchecked_transaction() {
        Ok(t) => t,
        Err(e) => return err(&req.id, "db_tx_failed", e.to_string(), None),
    };

    // Notes go with their student; delete in dependency order.
    if let Err(e) = tx.execute("DELETE FROM notes WHERE student_id = ?", [&student_id]) {
        let _ = tx.rollback();
        return err(
            &req.id,
            "db_delete_failed",
            e.to_string(),
            Some(json!({ "table": "notes" })),
        );
    }
    if let Err(e) = tx.execute("DELETE FROM students WHERE id = ?", [&student_id]) {
        let _ = tx.rollback();
        return err(
            &req.id,
            "db_delete_failed",
            e.to_string(),
            Some(json!({ "table": "students" })),
        );
    }
    if let Err(e) = tx.commit() {
        return err(&req.id, "db_tx_failed", e.to_string(), None);
    }

    ok(&req.id, json!({ "deleted": true }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "students.list" => Some(handle_students_list(state, req)),
        "students.suggestions" => Some(handle_students_suggestions(state, req)),
        "students.get" => Some(handle_students_get(state, req)),
        "students.stats" => Some(handle_students_stats(state, req)),
        "students.create" => Some(handle_students_create(state, req)),
        "students.update" => Some(handle_students_update(state, req)),
        "students.delete" => Some(handle_students_delete(state, req)),
        _ => None,
    }
}
