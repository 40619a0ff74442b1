use crate::ipc::error::err;
use rusqlite::{Connection, OptionalExtension};

pub struct HandlerErr {
    pub code: &'static str,
    pub message: String,
    pub details: Option<serde_json::Value>,
}

impl HandlerErr {
    pub fn new(code: &'static str, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            details: None,
        }
    }

    pub fn response(self, id: &str) -> serde_json::Value {
        err(id, self.code, self.message, self.details)
    }
}

/// The closed role set. Gates match on this exhaustively; a stored value
/// outside 0..=2 is refused outright rather than defaulting either way.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Student,
    Teacher,
    Admin,
}

impl Role {
    pub fn from_db(v: i64) -> Result<Self, HandlerErr> {
        match v {
            0 => Ok(Role::Student),
            1 => Ok(Role::Teacher),
            2 => Ok(Role::Admin),
            other => Err(HandlerErr::new(
                "invalid_role",
                format!("stored role {} is outside the known set", other),
            )),
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "student" => Some(Role::Student),
            "teacher" => Some(Role::Teacher),
            "admin" => Some(Role::Admin),
            _ => None,
        }
    }

    pub fn as_db(self) -> i64 {
        match self {
            Role::Student => 0,
            Role::Teacher => 1,
            Role::Admin => 2,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Role::Student => "student",
            Role::Teacher => "teacher",
            Role::Admin => "admin",
        }
    }
}

#[derive(Debug, Clone)]
pub struct CurrentUser {
    pub id: String,
    pub role: Role,
}

/// Resolve `params.apiToken` to a user. Every data method goes through this;
/// only `health`, `workspace.select`, and first-user bootstrap skip it.
pub fn authenticate(
    conn: &Connection,
    params: &serde_json::Value,
) -> Result<CurrentUser, HandlerErr> {
    let token = params
        .get("apiToken")
        .and_then(|v| v.as_str())
        .map(str::trim)
        .filter(|t| !t.is_empty())
        .ok_or_else(|| HandlerErr::new("unauthorized", "missing apiToken"))?;

    let row: Option<(String, i64)> = conn
        .query_row(
            "SELECT id, role FROM users WHERE api_token = ?",
            [token],
            |r| Ok((r.get(0)?, r.get(1)?)),
        )
        .optional()
        .map_err(|e| HandlerErr::new("db_query_failed", e.to_string()))?;

    let Some((id, role)) = row else {
        return Err(HandlerErr::new("unauthorized", "invalid apiToken"));
    };

    Ok(CurrentUser {
        id,
        role: Role::from_db(role)?,
    })
}

pub fn require_record_access(user: &CurrentUser) -> Result<(), HandlerErr> {
    match user.role {
        Role::Teacher | Role::Admin => Ok(()),
        Role::Student => Err(HandlerErr::new(
            "forbidden",
            "your role may not modify records",
        )),
    }
}

pub fn require_reporting_access(user: &CurrentUser) -> Result<(), HandlerErr> {
    match user.role {
        Role::Teacher | Role::Admin => Ok(()),
        Role::Student => Err(HandlerErr::new(
            "forbidden",
            "your role may not access reporting features",
        )),
    }
}

pub fn require_admin(user: &CurrentUser) -> Result<(), HandlerErr> {
    match user.role {
        Role::Admin => Ok(()),
        Role::Teacher | Role::Student => {
            Err(HandlerErr::new("forbidden", "administrator access required"))
        }
    }
}

/// May this user mutate the given student record?
pub fn may_mutate_student(user: &CurrentUser, owner_id: Option<&str>) -> Result<(), HandlerErr> {
    match user.role {
        Role::Admin => Ok(()),
        Role::Teacher => {
            if owner_id == Some(user.id.as_str()) {
                Ok(())
            } else {
                Err(HandlerErr::new(
                    "forbidden",
                    "teachers may only modify their own students",
                ))
            }
        }
        Role::Student => Err(HandlerErr::new(
            "forbidden",
            "your role may not modify records",
        )),
    }
}

pub fn require_str(params: &serde_json::Value, key: &str) -> Result<String, HandlerErr> {
    params
        .get(key)
        .and_then(|v| v.as_str())
        .map(|s| s.to_string())
        .ok_or_else(|| HandlerErr::new("bad_params", format!("missing {}", key)))
}

pub fn opt_str(params: &serde_json::Value, key: &str) -> Option<String> {
    params
        .get(key)
        .and_then(|v| v.as_str())
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
}

/// Numeric params arrive as JSON numbers or as form-style strings.
pub fn opt_i64(params: &serde_json::Value, key: &str) -> Option<i64> {
    let v = params.get(key)?;
    v.as_i64()
        .or_else(|| v.as_str().and_then(|s| s.trim().parse::<i64>().ok()))
}

/// page/perPage with a caller-chosen default page size, capped at 100.
pub fn page_params(params: &serde_json::Value, default_per_page: i64) -> (i64, i64) {
    let page = opt_i64(params, "page").unwrap_or(1).max(1);
    let per_page = opt_i64(params, "perPage")
        .unwrap_or(default_per_page)
        .clamp(1, crate::search::PER_PAGE_MAX);
    (page, per_page)
}

pub fn total_pages(total_count: i64, per_page: i64) -> i64 {
    if total_count == 0 {
        0
    } else {
        (total_count + per_page - 1) / per_page
    }
}
