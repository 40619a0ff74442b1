use crate::calc;
use crate::ipc::error::{err, ok};
use crate::ipc::helpers;
use crate::ipc::types::{AppState, Request};
use serde_json::json;

fn gated<'a>(
    state: &'a AppState,
    req: &Request,
) -> Result<&'a rusqlite::Connection, serde_json::Value> {
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
    Ok(conn)
}

fn handle_overview(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match gated(state, req) {
        Ok(c) => c,
        Err(resp) => return resp,
    };
    match calc::compute_overview(conn) {
        Ok(model) => ok(&req.id, json!(model)),
        Err(e) => err(&req.id, &e.code, e.message, e.details),
    }
}

fn handle_skills(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match gated(state, req) {
        Ok(c) => c,
        Err(resp) => return resp,
    };
    match calc::compute_skills(conn) {
        Ok(model) => ok(&req.id, json!({ "averageSkills": model })),
        Err(e) => err(&req.id, &e.code, e.message, e.details),
    }
}

fn handle_distribution(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match gated(state, req) {
        Ok(c) => c,
        Err(resp) => return resp,
    };
    match calc::compute_distribution(conn) {
        Ok(model) => ok(&req.id, json!(model)),
        Err(e) => err(&req.id, &e.code, e.message, e.details),
    }
}

fn handle_score_ranges(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match gated(state, req) {
        Ok(c) => c,
        Err(resp) => return resp,
    };
    match calc::compute_score_ranges(conn) {
        Ok(model) => ok(&req.id, json!(model)),
        Err(e) => err(&req.id, &e.code, e.message, e.details),
    }
}

fn handle_performance(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match gated(state, req) {
        Ok(c) => c,
        Err(resp) => return resp,
    };
    match calc::compute_performance(conn) {
        Ok(model) => ok(&req.id, json!(model)),
        Err(e) => err(&req.id, &e.code, e.message, e.details),
    }
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "analytics.overview" => Some(handle_overview(state, req)),
        "analytics.skills" => Some(handle_skills(state, req)),
        "analytics.distribution" => Some(handle_distribution(state, req)),
        "analytics.scoreRanges" => Some(handle_score_ranges(state, req)),
        "analytics.performance" => Some(handle_performance(state, req)),
        _ => None,
    }
}
