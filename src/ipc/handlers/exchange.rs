use crate::exchange;
use crate::ipc::error::{err, ok};
use crate::ipc::helpers;
use crate::ipc::types::{AppState, Request};
use serde_json::json;
use std::path::PathBuf;

fn gated<'a>(
    state: &'a AppState,
    req: &Request,
) -> Result<(&'a rusqlite::Connection, helpers::CurrentUser), serde_json::Value> {
    let Some(conn) = state.db.as_ref() else {
        return Err(err(&req.id, "no_workspace", "select a workspace first", None));
    };
    let actor = match helpers::authenticate(conn, &req.params) {
        Ok(u) => u,
        Err(e) => return Err(e.response(&req.id)),
    };
    if let Err(e) = helpers::require_reporting_access(&actor) {
        return Err(e.response(&req.id));
    }
    Ok((conn, actor))
}

fn out_path(req: &Request) -> Result<PathBuf, serde_json::Value> {
    match req.params.get("outPath").and_then(|v| v.as_str()) {
        Some(p) => Ok(PathBuf::from(p)),
        None => Err(err(&req.id, "bad_params", "missing outPath", None)),
    }
}

fn handle_export_students_csv(state: &mut AppState, req: &Request) -> serde_json::Value {
    let (conn, _actor) = match gated(state, req) {
        Ok(v) => v,
        Err(resp) => return resp,
    };
    let out = match out_path(req) {
        Ok(p) => p,
        Err(resp) => return resp,
    };

    match exchange::export_students_csv(conn, &out) {
        Ok(summary) => ok(
            &req.id,
            json!({ "outPath": out.to_string_lossy(), "rows": summary.rows }),
        ),
        Err(e) => err(&req.id, "io_failed", format!("{e:#}"), None),
    }
}

fn handle_export_notes_csv(state: &mut AppState, req: &Request) -> serde_json::Value {
    let (conn, _actor) = match gated(state, req) {
        Ok(v) => v,
        Err(resp) => return resp,
    };
    let out = match out_path(req) {
        Ok(p) => p,
        Err(resp) => return resp,
    };

    match exchange::export_notes_csv(conn, &out) {
        Ok(summary) => ok(
            &req.id,
            json!({ "outPath": out.to_string_lossy(), "rows": summary.rows }),
        ),
        Err(e) => err(&req.id, "io_failed", format!("{e:#}"), None),
    }
}

fn handle_students_template_csv(state: &mut AppState, req: &Request) -> serde_json::Value {
    let (_conn, _actor) = match gated(state, req) {
        Ok(v) => v,
        Err(resp) => return resp,
    };
    let out = match out_path(req) {
        Ok(p) => p,
        Err(resp) => return resp,
    };

    match exchange::write_students_template_csv(&out) {
        Ok(()) => ok(&req.id, json!({ "outPath": out.to_string_lossy() })),
        Err(e) => err(&req.id, "io_failed", format!("{e:#}"), None),
    }
}

fn handle_import_students_csv(state: &mut AppState, req: &Request) -> serde_json::Value {
    let (conn, actor) = match gated(state, req) {
        Ok(v) => v,
        Err(resp) => return resp,
    };
    let in_path = match req.params.get("inPath").and_then(|v| v.as_str()) {
        Some(p) => PathBuf::from(p),
        None => return err(&req.id, "bad_params", "missing inPath", None),
    };

    match exchange::import_students_csv(conn, &in_path, Some(&actor.id)) {
        Ok(summary) => ok(
            &req.id,
            json!({ "imported": summary.imported, "errors": summary.errors }),
        ),
        Err(e) => err(&req.id, "io_failed", format!("{e:#}"), None),
    }
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "exchange.exportStudentsCsv" => Some(handle_export_students_csv(state, req)),
        "exchange.exportNotesCsv" => Some(handle_export_notes_csv(state, req)),
        "exchange.studentsTemplateCsv" => Some(handle_students_template_csv(state, req)),
        "exchange.importStudentsCsv" => Some(handle_import_students_csv(state, req)),
        _ => None,
    }
}
