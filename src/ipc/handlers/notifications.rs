use crate::ipc::error::{err, ok};
use crate::ipc::helpers;
use crate::ipc::types::{AppState, Request};
use crate::notify;
use serde_json::json;

fn handle_notifications_list(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    let actor = match helpers::authenticate(conn, &req.params) {
        Ok(u) => u,
        Err(e) => return e.response(&req.id),
    };

    let total_count: i64 = match conn.query_row(
        "SELECT COUNT(*) FROM notifications WHERE user_id = ?",
        [&actor.id],
        |r| r.get(0),
    ) {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };

    let (page, per_page) = helpers::page_params(&req.params, 20);
    let mut stmt = match conn.prepare(
        "SELECT id, title, message, notification_type, read, created_at, updated_at
         FROM notifications
         WHERE user_id = ?
         ORDER BY created_at DESC, rowid DESC
         LIMIT ? OFFSET ?",
    ) {
        Ok(s) => s,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    let rows = stmt
        .query_map((&actor.id, per_page, (page - 1) * per_page), |r| {
            let read: i64 = r.get(4)?;
            Ok(json!({
                "id": r.get::<_, String>(0)?,
                "title": r.get::<_, String>(1)?,
                "message": r.get::<_, String>(2)?,
                "notificationType": r.get::<_, String>(3)?,
                "read": read != 0,
                "createdAt": r.get::<_, String>(5)?,
                "updatedAt": r.get::<_, String>(6)?
            }))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>());
    let notifications = match rows {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };

    let unread = match notify::unread_count(conn, &actor.id) {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", format!("{e:#}"), None),
    };

    ok(
        &req.id,
        json!({
            "notifications": notifications,
            "unreadCount": unread,
            "pagination": {
                "currentPage": page,
                "totalPages": helpers::total_pages(total_count, per_page),
                "totalCount": total_count,
                "perPage": per_page
            }
        }),
    )
}

fn handle_mark_as_read(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    let actor = match helpers::authenticate(conn, &req.params) {
        Ok(u) => u,
        Err(e) => return e.response(&req.id),
    };
    let notification_id = match helpers::require_str(&req.params, "notificationId") {
        Ok(v) => v,
        Err(e) => return e.response(&req.id),
    };

    match notify::mark_as_read(conn, &actor.id, &notification_id) {
        Ok(true) => ok(&req.id, json!({ "read": true })),
        Ok(false) => err(&req.id, "not_found", "notification not found", None),
        Err(e) => err(&req.id, "db_update_failed", format!("{e:#}"), None),
    }
}

fn handle_mark_all_as_read(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    let actor = match helpers::authenticate(conn, &req.params) {
        Ok(u) => u,
        Err(e) => return e.response(&req.id),
    };

    match notify::mark_all_as_read(conn, &actor.id) {
        Ok(updated) => ok(&req.id, json!({ "updated": updated })),
        Err(e) => err(&req.id, "db_update_failed", format!("{e:#}"), None),
    }
}

fn handle_unread_count(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    let actor = match helpers::authenticate(conn, &req.params) {
        Ok(u) => u,
        Err(e) => return e.response(&req.id),
    };

    match notify::unread_count(conn, &actor.id) {
        Ok(count) => ok(&req.id, json!({ "count": count })),
        Err(e) => err(&req.id, "db_query_failed", format!("{e:#}"), None),
    }
}

fn handle_notifications_delete(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    let actor = match helpers::authenticate(conn, &req.params) {
        Ok(u) => u,
        Err(e) => return e.response(&req.id),
    };
    let notification_id = match helpers::require_str(&req.params, "notificationId") {
        Ok(v) => v,
        Err(e) => return e.response(&req.id),
    };

    let deleted = match conn.execute(
        "DELETE FROM notifications WHERE id = ? AND user_id = ?",
        (&notification_id, &actor.id),
    ) {
        Ok(n) => n,
        Err(e) => {
            return err(
                &req.id,
                "db_delete_failed",
                e.to_string(),
                Some(json!({ "table": "notifications" })),
            )
        }
    };
    if deleted == 0 {
        return err(&req.id, "not_found", "notification not found", None);
    }
    ok(&req.id, json!({ "deleted": true }))
}

fn handle_weekly_reports(state: &mut AppState, req: &Request) -> serde_json::Value {
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

    match notify::weekly_reports(conn, &state.mailer) {
        Ok(notified) => ok(&req.id, json!({ "notified": notified })),
        Err(e) => err(&req.id, "db_insert_failed", format!("{e:#}"), None),
    }
}

fn handle_announce(state: &mut AppState, req: &Request) -> serde_json::Value {
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

    let title = match helpers::opt_str(&req.params, "title") {
        Some(v) => v,
        None => return err(&req.id, "bad_params", "missing title", None),
    };
    let message = match helpers::opt_str(&req.params, "message") {
        Some(v) => v,
        None => return err(&req.id, "bad_params", "missing message", None),
    };

    let target_user_ids: Option<Vec<String>> = req
        .params
        .get("targetUserIds")
        .and_then(|v| v.as_array())
        .map(|arr| {
            arr.iter()
                .filter_map(|v| v.as_str().map(str::to_string))
                .collect()
        });

    match notify::system_announcement(
        conn,
        &state.mailer,
        &title,
        &message,
        target_user_ids.as_deref(),
    ) {
        Ok(notified) => ok(&req.id, json!({ "notified": notified })),
        Err(e) => err(&req.id, "db_insert_failed", format!("{e:#}"), None),
    }
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "notifications.list" => Some(handle_notifications_list(state, req)),
        "notifications.markAsRead" => Some(handle_mark_as_read(state, req)),
        "notifications.markAllAsRead" => Some(handle_mark_all_as_read(state, req)),
        "notifications.unreadCount" => Some(handle_unread_count(state, req)),
        "notifications.delete" => Some(handle_notifications_delete(state, req)),
        "notifications.weeklyReports" => Some(handle_weekly_reports(state, req)),
        "notifications.announce" => Some(handle_announce(state, req)),
        _ => None,
    }
}
